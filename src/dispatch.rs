//! Bounded worker pool running blocking protocol calls.
//!
//! The service's public interface is async, but every LDAP call blocks on
//! network I/O, so each one is shipped to one of these workers as a boxed
//! job and the caller awaits a oneshot completion. The pool is explicitly
//! owned: [`WorkerPool::start`] before first use, [`WorkerPool::stop`] to
//! drain and join. Abandoning a caller does not cancel an in-progress job;
//! the completed result is simply discarded.

use std::{
	sync::{
		atomic::{AtomicUsize, Ordering},
		mpsc, Arc, Mutex, PoisonError,
	},
	thread::JoinHandle,
};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;

/// A unit of blocking work shipped to a worker thread.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle state of the pool: present while running.
#[derive(Debug)]
struct Running {
	/// Submission side of the job channel.
	sender: mpsc::Sender<Job>,
	/// The worker threads.
	workers: Vec<JoinHandle<()>>,
}

/// A fixed-size pool of OS threads executing blocking jobs.
#[derive(Debug)]
pub(crate) struct WorkerPool {
	/// Number of worker threads.
	size: usize,
	/// Channel and thread handles while running, `None` otherwise.
	running: Mutex<Option<Running>>,
	/// Jobs submitted but not yet picked up by a worker.
	pending: Arc<AtomicUsize>,
}

impl WorkerPool {
	/// Create a pool with `size` workers. No threads run until
	/// [`WorkerPool::start`].
	pub(crate) fn new(size: usize) -> Self {
		WorkerPool {
			size: size.max(1),
			running: Mutex::new(None),
			pending: Arc::new(AtomicUsize::new(0)),
		}
	}

	/// Spawn the worker threads. Idempotent while running.
	pub(crate) fn start(&self) {
		let mut running = self.lock();
		if running.is_some() {
			return;
		}
		let (sender, receiver) = mpsc::channel::<Job>();
		let receiver = Arc::new(Mutex::new(receiver));
		let workers = (0..self.size)
			.map(|_| {
				let receiver = Arc::clone(&receiver);
				let pending = Arc::clone(&self.pending);
				std::thread::spawn(move || loop {
					let job = {
						let receiver =
							receiver.lock().unwrap_or_else(PoisonError::into_inner);
						receiver.recv()
					};
					match job {
						Ok(job) => {
							pending.fetch_sub(1, Ordering::Relaxed);
							job();
						}
						// All senders gone: the pool stopped.
						Err(mpsc::RecvError) => return,
					}
				})
			})
			.collect();
		debug!(size = self.size, "Started worker pool");
		*running = Some(Running { sender, workers });
	}

	/// Drain queued jobs and join the worker threads. Dispatching after
	/// this fails with [`Error::WorkerPoolStopped`].
	pub(crate) fn stop(&self) {
		let Some(Running { sender, workers }) = self.lock().take() else {
			return;
		};
		drop(sender);
		for worker in workers {
			// A worker that panicked already has its job's oneshot
			// dropped; nothing further to unwind here.
			let _ = worker.join();
		}
		debug!("Stopped worker pool");
	}

	/// Jobs submitted but not yet picked up by a worker. A nonzero value
	/// at submission time means every worker is busy.
	pub(crate) fn queue_depth(&self) -> usize {
		self.pending.load(Ordering::Relaxed)
	}

	/// Submit a blocking job, returning a receiver for its result.
	///
	/// # Errors
	/// [`Error::WorkerPoolStopped`] if the pool is not running.
	pub(crate) fn dispatch<T, F>(&self, job: F) -> Result<oneshot::Receiver<T>, Error>
	where
		T: Send + 'static,
		F: FnOnce() -> T + Send + 'static,
	{
		let running = self.lock();
		let Some(Running { sender, .. }) = running.as_ref() else {
			return Err(Error::WorkerPoolStopped);
		};
		let (result_sender, result_receiver) = oneshot::channel();
		self.pending.fetch_add(1, Ordering::Relaxed);
		let submitted = sender.send(Box::new(move || {
			// The caller may have gone away; the result is then dropped.
			let _ = result_sender.send(job());
		}));
		if submitted.is_err() {
			self.pending.fetch_sub(1, Ordering::Relaxed);
			return Err(Error::WorkerPoolStopped);
		}
		Ok(result_receiver)
	}

	/// Lock the lifecycle state, tolerating poisoning.
	fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
		self.running.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Drop for WorkerPool {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::{
		sync::{
			atomic::{AtomicUsize, Ordering},
			mpsc, Arc,
		},
		time::Duration,
	};

	use super::WorkerPool;
	use crate::error::Error;

	#[tokio::test]
	async fn dispatch_returns_results() {
		let pool = WorkerPool::new(2);
		pool.start();
		let receiver = pool.dispatch(|| 6 * 7).unwrap();
		assert_eq!(receiver.await.unwrap(), 42);
		pool.stop();
	}

	#[tokio::test]
	async fn queue_depth_visible_while_workers_are_busy() {
		let pool = WorkerPool::new(1);
		pool.start();

		let (block_sender, block_receiver) = mpsc::channel::<()>();
		let busy = pool
			.dispatch(move || {
				block_receiver.recv().unwrap();
			})
			.unwrap();
		// Give the worker a moment to pick the blocking job up.
		tokio::time::sleep(Duration::from_millis(50)).await;

		let queued = pool.dispatch(|| ()).unwrap();
		assert_eq!(pool.queue_depth(), 1, "the second job waits behind the busy worker");

		block_sender.send(()).unwrap();
		busy.await.unwrap();
		queued.await.unwrap();
		assert_eq!(pool.queue_depth(), 0);
		pool.stop();
	}

	#[tokio::test]
	async fn stop_drains_queued_jobs() {
		let pool = WorkerPool::new(1);
		pool.start();
		let counter = Arc::new(AtomicUsize::new(0));
		let receivers: Vec<_> = (0..4)
			.map(|_| {
				let counter = Arc::clone(&counter);
				pool.dispatch(move || {
					counter.fetch_add(1, Ordering::SeqCst);
				})
				.unwrap()
			})
			.collect();
		pool.stop();
		assert_eq!(counter.load(Ordering::SeqCst), 4);
		for receiver in receivers {
			receiver.await.unwrap();
		}
		assert!(matches!(pool.dispatch(|| ()), Err(Error::WorkerPoolStopped)));
	}
}
