//! Bounded connection pooling with failure eviction.
//!
//! Each pool owns up to `max` protocol sessions for one role (query or
//! auth). Checkout pops an idle session, creating a new one while below
//! the limit, and otherwise blocks until a session is returned. Checkout
//! and every protocol call on a pooled session happen on worker threads,
//! so blocking here never stalls an async caller.
//!
//! A session on which an operation failed is permanently evicted rather
//! than requeued; a blocked acquirer is then woken so it can create a
//! clean replacement.

use std::{
	collections::VecDeque,
	sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		Condvar, Mutex, MutexGuard, PoisonError,
	},
};

use ldap3::LdapConn;
use tracing::{debug, error};

use crate::{
	config::{ConnectionConfig, Credentials},
	error::{Error, RC_INVALID_CREDENTIALS, RC_INVALID_DN_SYNTAX},
};

/// Creates protocol sessions for a pool. The seam exists so the pool's
/// checkout and eviction logic can be exercised without a server.
pub(crate) trait Connector: Send + Sync + 'static {
	/// The session type produced.
	type Conn: Send + 'static;

	/// Establish a new session. Runs on a worker thread and may block on
	/// network I/O.
	fn connect(&self) -> Result<Self::Conn, Error>;
}

/// A session checked out of a pool, tagged with its slot for per-slot
/// statistics.
#[derive(Debug)]
pub(crate) struct PooledConn<T> {
	/// Index of this session in the pool's slot table.
	slot: usize,
	/// The session itself.
	pub(crate) conn: T,
}

/// State shared under the pool lock.
#[derive(Debug)]
struct PoolInner<T> {
	/// Idle sessions ready for checkout.
	idle: VecDeque<PooledConn<T>>,
	/// Sessions currently tracked (idle plus checked out), including
	/// creation slots reserved while a connect is in flight.
	live: usize,
	/// Checkout count per created slot.
	slot_checkouts: Vec<u64>,
}

/// Best-effort usage counters, readable without the pool lock.
#[derive(Debug, Default)]
struct PoolCounters {
	/// Total successful checkouts.
	checkouts: AtomicU64,
	/// Checkouts that had to wait for a release.
	blocked: AtomicU64,
	/// Sessions evicted after a failure.
	errors: AtomicU64,
	/// Sessions created over the pool's lifetime.
	created: AtomicU64,
	/// Sessions currently checked out.
	active: AtomicUsize,
	/// Highest observed active count.
	high_water: AtomicUsize,
}

/// A point-in-time snapshot of one pool's usage statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
	/// The pool's role name.
	pub role: &'static str,
	/// Total successful checkouts.
	pub checkouts: u64,
	/// Checkouts that had to wait for a release.
	pub blocked: u64,
	/// Sessions evicted after a failure.
	pub errors: u64,
	/// Sessions created over the pool's lifetime.
	pub created: u64,
	/// Sessions checked out right now.
	pub active: usize,
	/// Highest observed active count.
	pub high_water: usize,
	/// Checkout count per created slot.
	pub slot_checkouts: Vec<u64>,
}

/// A bounded pool of protocol sessions for one role.
pub(crate) struct ConnectionPool<C: Connector> {
	/// Role name used in logs and statistics.
	role: &'static str,
	/// Maximum number of live sessions.
	max: usize,
	/// Session factory.
	connector: C,
	/// Lock-protected pool state.
	inner: Mutex<PoolInner<C::Conn>>,
	/// Signaled when a session is returned or a slot frees up.
	available: Condvar,
	/// Usage counters.
	counters: PoolCounters,
}

// Not derived: protocol sessions are not Debug.
impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConnectionPool")
			.field("role", &self.role)
			.field("max", &self.max)
			.finish_non_exhaustive()
	}
}

impl<C: Connector> ConnectionPool<C> {
	/// Create an empty pool. Sessions are established lazily on checkout.
	pub(crate) fn new(role: &'static str, connector: C, max: usize) -> Self {
		debug!(role, max, "Created LDAP connection pool");
		ConnectionPool {
			role,
			max: max.max(1),
			connector,
			inner: Mutex::new(PoolInner {
				idle: VecDeque::new(),
				live: 0,
				slot_checkouts: Vec::new(),
			}),
			available: Condvar::new(),
			counters: PoolCounters::default(),
		}
	}

	/// Lock the pool state, tolerating poisoning from a panicked worker.
	fn lock(&self) -> MutexGuard<'_, PoolInner<C::Conn>> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Check a session out of the pool, blocking until one is available
	/// or a new one may be created.
	///
	/// # Errors
	/// [`Error::Connection`] or [`Error::Bind`] if a new session had to
	/// be created and establishing it failed. The reserved slot is given
	/// back so another caller may retry.
	pub(crate) fn acquire(&self) -> Result<PooledConn<C::Conn>, Error> {
		let mut inner = self.lock();
		loop {
			if let Some(conn) = inner.idle.pop_front() {
				self.note_checkout(&mut inner, conn.slot);
				return Ok(conn);
			}
			if inner.live < self.max {
				// Reserve the slot under the lock so two concurrent
				// acquirers cannot both create when one slot remains,
				// then connect without holding the lock.
				inner.live += 1;
				inner.slot_checkouts.push(0);
				let slot = inner.slot_checkouts.len() - 1;
				drop(inner);
				match self.connector.connect() {
					Ok(conn) => {
						self.counters.created.fetch_add(1, Ordering::Relaxed);
						let mut inner = self.lock();
						self.note_checkout(&mut inner, slot);
						return Ok(PooledConn { slot, conn });
					}
					Err(err) => {
						let mut inner = self.lock();
						inner.live -= 1;
						self.available.notify_one();
						return Err(err);
					}
				}
			}
			self.counters.blocked.fetch_add(1, Ordering::Relaxed);
			debug!(role = self.role, "Connection pool exhausted; waiting for a release");
			inner = self.available.wait(inner).unwrap_or_else(PoisonError::into_inner);
		}
	}

	/// Record a successful checkout and update the gauges.
	fn note_checkout(&self, inner: &mut PoolInner<C::Conn>, slot: usize) {
		if let Some(count) = inner.slot_checkouts.get_mut(slot) {
			*count += 1;
		}
		self.counters.checkouts.fetch_add(1, Ordering::Relaxed);
		let active = inner.live - inner.idle.len();
		self.counters.active.store(active, Ordering::Relaxed);
		self.counters.high_water.fetch_max(active, Ordering::Relaxed);
		if active > self.max {
			error!(
				role = self.role,
				active,
				max = self.max,
				"Active LDAP connections exceed the pool maximum"
			);
		}
	}

	/// Return a session to the pool after successful use.
	pub(crate) fn release(&self, conn: PooledConn<C::Conn>) {
		let mut inner = self.lock();
		inner.idle.push_back(conn);
		let active = inner.live - inner.idle.len();
		self.counters.active.store(active, Ordering::Relaxed);
		drop(inner);
		self.available.notify_one();
	}

	/// Permanently evict a failed session. It is never requeued; freeing
	/// its slot lets a blocked acquirer create a replacement.
	pub(crate) fn fail(&self, conn: PooledConn<C::Conn>) {
		self.counters.errors.fetch_add(1, Ordering::Relaxed);
		let mut inner = self.lock();
		inner.live -= 1;
		let active = inner.live - inner.idle.len();
		self.counters.active.store(active, Ordering::Relaxed);
		drop(inner);
		drop(conn);
		self.available.notify_one();
	}

	/// Scoped checkout: acquire a session, run `op` on it, and release it
	/// back on success or evict it on any error before propagating.
	pub(crate) fn with_conn<R>(
		&self,
		op: impl FnOnce(&mut C::Conn) -> Result<R, Error>,
	) -> Result<R, Error> {
		let mut pooled = self.acquire()?;
		match op(&mut pooled.conn) {
			Ok(value) => {
				self.release(pooled);
				Ok(value)
			}
			Err(err) => {
				self.fail(pooled);
				Err(err)
			}
		}
	}

	/// Snapshot the pool's usage statistics.
	pub(crate) fn stats(&self) -> PoolStats {
		let inner = self.lock();
		PoolStats {
			role: self.role,
			checkouts: self.counters.checkouts.load(Ordering::Relaxed),
			blocked: self.counters.blocked.load(Ordering::Relaxed),
			errors: self.counters.errors.load(Ordering::Relaxed),
			created: self.counters.created.load(Ordering::Relaxed),
			active: self.counters.active.load(Ordering::Relaxed),
			high_water: self.counters.high_water.load(Ordering::Relaxed),
			slot_checkouts: inner.slot_checkouts.clone(),
		}
	}
}

/// Production [`Connector`] establishing LDAP sessions, optionally bound
/// with the configured service credentials.
#[derive(Debug)]
pub(crate) struct LdapConnector {
	/// The server URL.
	url: String,
	/// Transport and TLS settings.
	connection: ConnectionConfig,
	/// Service credentials to bind with, or `None` for an unbound pool.
	credentials: Option<Credentials>,
}

impl LdapConnector {
	/// Create a connector for the given server and credentials.
	pub(crate) fn new(
		url: String,
		connection: ConnectionConfig,
		credentials: Option<Credentials>,
	) -> Self {
		LdapConnector { url, connection, credentials }
	}
}

impl Connector for LdapConnector {
	type Conn = LdapConn;

	fn connect(&self) -> Result<LdapConn, Error> {
		debug!(url = self.url, "Connecting to LDAP server");
		let settings = self.connection.to_settings()?;
		let mut conn =
			LdapConn::with_settings(settings, &self.url).map_err(Error::Connection)?;
		if let Some(credentials) = &self.credentials {
			let result = conn
				.simple_bind(&credentials.bind_dn, &credentials.bind_password)
				.map_err(Error::Connection)?;
			match result.rc {
				0 => debug!(bind_dn = credentials.bind_dn, "Bound to LDAP server"),
				RC_INVALID_CREDENTIALS | RC_INVALID_DN_SYNTAX => {
					error!(bind_dn = credentials.bind_dn, "Service bind rejected");
					return Err(Error::Bind(credentials.bind_dn.clone()));
				}
				_ => {
					return Err(Error::Connection(ldap3::LdapError::LdapResult {
						result,
					}));
				}
			}
		}
		Ok(conn)
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
		thread,
		time::Duration,
	};

	use super::{ConnectionPool, Connector};
	use crate::error::Error;

	/// Hands out sequentially numbered fake sessions.
	#[derive(Debug, Default)]
	struct FakeConnector {
		/// Next session id.
		next_id: AtomicUsize,
	}

	impl Connector for FakeConnector {
		type Conn = usize;

		fn connect(&self) -> Result<usize, Error> {
			Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
		}
	}

	/// A connector whose first `failures` connect attempts fail.
	#[derive(Debug)]
	struct FlakyConnector {
		/// Remaining connect attempts that will fail.
		failures: AtomicUsize,
	}

	impl Connector for FlakyConnector {
		type Conn = usize;

		fn connect(&self) -> Result<usize, Error> {
			if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
			{
				Err(Error::query("connect refused"))
			} else {
				Ok(7)
			}
		}
	}

	#[test]
	fn extra_acquire_blocks_until_release() {
		let pool = Arc::new(ConnectionPool::new("query", FakeConnector::default(), 2));
		let first = pool.acquire().unwrap();
		let second = pool.acquire().unwrap();

		let (sender, receiver) = mpsc::channel();
		let waiter = {
			let pool = Arc::clone(&pool);
			thread::spawn(move || {
				let conn = pool.acquire().unwrap();
				sender.send(conn.conn).unwrap();
				pool.release(conn);
			})
		};

		// The third acquire must wait; no session arrives while both are
		// checked out.
		assert!(receiver.recv_timeout(Duration::from_millis(200)).is_err());
		let stats = pool.stats();
		assert_eq!(stats.active, 2);
		assert!(stats.high_water <= 2);

		let released_id = first.conn;
		pool.release(first);
		let handed_over = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
		assert_eq!(handed_over, released_id, "the released session is reused");
		waiter.join().unwrap();

		pool.release(second);
		assert_eq!(pool.stats().created, 2, "never more than max sessions created");
	}

	#[test]
	fn failed_session_is_never_reissued() {
		let pool = ConnectionPool::new("query", FakeConnector::default(), 1);
		let conn = pool.acquire().unwrap();
		let failed_id = conn.conn;
		pool.fail(conn);

		let replacement = pool.acquire().unwrap();
		assert_ne!(replacement.conn, failed_id);
		let stats = pool.stats();
		assert_eq!(stats.errors, 1);
		assert_eq!(stats.created, 2);
		pool.release(replacement);
	}

	#[test]
	fn with_conn_releases_on_success_and_evicts_on_error() {
		let pool = ConnectionPool::new("query", FakeConnector::default(), 1);
		let used = pool.with_conn(|conn| Ok(*conn)).unwrap();
		assert_eq!(pool.stats().active, 0);

		let result: Result<(), Error> = pool.with_conn(|_| Err(Error::query("boom")));
		assert!(result.is_err());
		let stats = pool.stats();
		assert_eq!(stats.errors, 1);

		// The evicted session's replacement is a fresh one.
		let replacement = pool.with_conn(|conn| Ok(*conn)).unwrap();
		assert_ne!(replacement, used);
	}

	#[test]
	fn connect_failure_frees_the_reservation() {
		let pool = ConnectionPool::new("query", FlakyConnector { failures: AtomicUsize::new(1) }, 1);
		assert!(pool.acquire().is_err());
		// The failed reservation is returned, so the next acquire may
		// create again.
		let conn = pool.acquire().unwrap();
		assert_eq!(conn.conn, 7);
		pool.release(conn);
	}

	#[test]
	fn per_slot_checkouts_are_counted() {
		let pool = ConnectionPool::new("query", FakeConnector::default(), 2);
		for _ in 0..3 {
			let conn = pool.acquire().unwrap();
			pool.release(conn);
		}
		let stats = pool.stats();
		assert_eq!(stats.slot_checkouts.len(), 1, "a single reused session suffices");
		assert_eq!(stats.slot_checkouts[0], 3);
		assert_eq!(stats.checkouts, 3);
	}
}
