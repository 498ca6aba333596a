//! Retrying execution of blocking protocol operations.
//!
//! Wraps each bind or search in a fixed retry budget and ships it to the
//! worker pool. Only the transient "server unavailable" signal is retried;
//! any other failure is terminal on the first occurrence. Attempts within
//! one budget run strictly sequentially, with no delay between them.

use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::Duration,
};

use tracing::error;

use crate::{dispatch::WorkerPool, error::Error};

/// Longest filter string reproduced in a slow-query diagnostic.
const FILTER_LOG_LIMIT: usize = 500;

/// Run `op` up to `tries` times, retrying only transient failures.
///
/// # Errors
/// The first non-transient error unchanged, or [`Error::Query`] wrapping
/// the last transient cause once the budget is exhausted.
pub(crate) fn run_with_retries<T>(
	tries: u32,
	mut op: impl FnMut() -> Result<T, Error>,
) -> Result<T, Error> {
	let tries = tries.max(1);
	let mut last = None;
	for attempt in 1..=tries {
		match op() {
			Ok(value) => return Ok(value),
			Err(err) if err.is_transient() => {
				error!("LDAP server unavailable");
				if attempt < tries {
					error!("LDAP connection failure; retrying");
				}
				last = Some(err);
			}
			Err(err) => return Err(err),
		}
	}
	Err(Error::Query {
		message: "LDAP server down".to_owned(),
		source: last.and_then(|err| match err {
			Error::Connection(source) => Some(source),
			Error::Query { source, .. } => source,
			_ => None,
		}),
	})
}

/// Dispatches retried protocol operations onto the worker pool and keeps
/// the related diagnostics.
#[derive(Debug)]
pub(crate) struct QueryExecutor {
	/// The worker pool executing the blocking calls.
	workers: Arc<WorkerPool>,
	/// Retry budget per operation.
	tries: u32,
	/// Searches slower than this are logged.
	slow_query_threshold: Duration,
	/// Number of submissions that found the dispatch queue nonempty.
	saturation: AtomicU64,
}

impl QueryExecutor {
	/// Create an executor over the given worker pool.
	pub(crate) fn new(workers: Arc<WorkerPool>, tries: u32, slow_query_threshold: Duration) -> Self {
		QueryExecutor { workers, tries, slow_query_threshold, saturation: AtomicU64::new(0) }
	}

	/// Run a blocking operation on a worker with the retry budget
	/// applied, suspending the caller until it completes.
	///
	/// The dispatch queue depth is sampled at submission; a nonzero depth
	/// means every worker is busy, which is logged and counted as
	/// possible saturation.
	pub(crate) async fn execute<T>(
		&self,
		op: impl FnMut() -> Result<T, Error> + Send + 'static,
	) -> Result<T, Error>
	where
		T: Send + 'static,
	{
		let depth = self.workers.queue_depth();
		if depth > 0 {
			error!(depth, "LDAP worker pool overflowing");
			self.saturation.fetch_add(1, Ordering::Relaxed);
		}
		let tries = self.tries;
		let receiver = self.workers.dispatch(move || run_with_retries(tries, op))?;
		receiver.await.map_err(|_| Error::WorkerPoolStopped)?
	}

	/// Number of submissions that found all workers busy.
	pub(crate) fn saturation_count(&self) -> u64 {
		self.saturation.load(Ordering::Relaxed)
	}

	/// Searches slower than this should be reported via
	/// [`log_slow_search`].
	pub(crate) fn slow_query_threshold(&self) -> Duration {
		self.slow_query_threshold
	}
}

/// Emit a diagnostic for a search that exceeded the slow-query threshold,
/// truncating long filters.
pub(crate) fn log_slow_search(
	threshold: Duration,
	base: &str,
	filter: &str,
	elapsed: Duration,
	result_count: usize,
) {
	if elapsed <= threshold {
		return;
	}
	let mut filter = filter.to_owned();
	if filter.len() > FILTER_LOG_LIMIT {
		let mut cut = FILTER_LOG_LIMIT;
		while !filter.is_char_boundary(cut) {
			cut -= 1;
		}
		filter.truncate(cut);
		filter.push_str("...");
	}
	error!(
		base,
		filter,
		elapsed_secs = elapsed.as_secs_f64(),
		result_count,
		"LDAP query exceeded slow-query threshold"
	);
}
