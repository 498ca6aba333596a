//! The directory service: async identity queries over pooled LDAP
//! connections.

use std::{sync::Arc, time::Instant};

use ldap3::{LdapError, Scope, SearchEntry, SearchOptions, SearchResult};
use tracing::{debug, error, info, warn};

use crate::{
	config::Config,
	dispatch::WorkerPool,
	entry::{record_from_entry, resolve_record_type, Record},
	error::{
		ldap_error_is_transient, Error, RC_CONSTRAINT_VIOLATION, RC_INAPPROPRIATE_AUTH,
		RC_INVALID_CREDENTIALS, RC_INVALID_DN_SYNTAX, RC_INVALID_SYNTAX, RC_NO_SUCH_OBJECT,
		RC_SIZE_LIMIT_EXCEEDED, RC_TIME_LIMIT_EXCEEDED,
	},
	executor::{log_slow_search, QueryExecutor},
	filter::{apply_extra_filter, compile, CompiledFilter, Expression},
	pool::{ConnectionPool, LdapConnector, PoolStats},
	schema::{FieldName, RecordType, Schema},
};

/// Point-in-time usage statistics of the service.
#[derive(Debug, Clone)]
pub struct ServiceStats {
	/// Statistics of the query connection pool.
	pub query_pool: PoolStats,
	/// Statistics of the authentication connection pool.
	pub auth_pool: PoolStats,
	/// Submissions that found every worker busy.
	pub dispatch_saturation: u64,
}

/// Answers identity queries against an LDAP directory.
///
/// All public operations are async; the blocking protocol calls they
/// trigger run on the service's own worker pool, which must be started
/// with [`DirectoryService::start`] before the first query and stopped
/// with [`DirectoryService::stop`] to drain it.
#[derive(Debug)]
pub struct DirectoryService {
	/// The base DN under which all record subtrees live.
	base_dn: Arc<str>,
	/// The validated schema.
	schema: Arc<Schema>,
	/// Worker pool for blocking protocol calls.
	workers: Arc<WorkerPool>,
	/// Retrying dispatcher over the worker pool.
	executor: QueryExecutor,
	/// Pooled connections for searches, bound with service credentials.
	query_pool: Arc<ConnectionPool<LdapConnector>>,
	/// Pooled connections for credential verification, never bound with
	/// service credentials.
	auth_pool: Arc<ConnectionPool<LdapConnector>>,
}

impl DirectoryService {
	/// Create a service from the given configuration. The worker pool is
	/// not yet running; call [`DirectoryService::start`].
	///
	/// # Errors
	/// [`Error::Configuration`] if the schema is invalid.
	pub fn new(config: Config) -> Result<Self, Error> {
		let schema = Arc::new(Schema::new(config.schema.clone())?);

		let worker_threads = config.worker_threads();
		let pooled_connections =
			config.pool.query_connection_max + config.pool.auth_connection_max;
		if worker_threads <= pooled_connections {
			// One-off auth binds share the workers with pooled queries;
			// an undersized worker pool serializes them.
			warn!(
				worker_threads,
				pooled_connections,
				"Worker pool is not larger than the combined connection pools"
			);
		}

		let url = config.url.as_str().trim_end_matches('/').to_owned();
		let query_pool = Arc::new(ConnectionPool::new(
			"query",
			LdapConnector::new(url.clone(), config.connection.clone(), config.credentials),
			config.pool.query_connection_max,
		));
		let auth_pool = Arc::new(ConnectionPool::new(
			"auth",
			LdapConnector::new(url, config.connection, None),
			config.pool.auth_connection_max,
		));

		let workers = Arc::new(WorkerPool::new(worker_threads));
		let executor =
			QueryExecutor::new(Arc::clone(&workers), config.tries, config.slow_query_threshold);

		Ok(DirectoryService {
			base_dn: config.base_dn.into(),
			schema,
			workers,
			executor,
			query_pool,
			auth_pool,
		})
	}

	/// Start the worker pool. Must run before the first query.
	pub fn start(&self) {
		self.workers.start();
	}

	/// Stop the worker pool, draining queued protocol calls.
	pub fn stop(&self) {
		self.workers.stop();
	}

	/// Snapshot the service's usage statistics.
	#[must_use]
	pub fn stats(&self) -> ServiceStats {
		ServiceStats {
			query_pool: self.query_pool.stats(),
			auth_pool: self.auth_pool.stats(),
			dispatch_saturation: self.executor.saturation_count(),
		}
	}

	/// The validated schema in use.
	pub(crate) fn schema(&self) -> &Arc<Schema> {
		&self.schema
	}

	/// The configured base DN.
	pub(crate) fn base_dn(&self) -> &str {
		&self.base_dn
	}

	/// Find records matching an expression.
	///
	/// `record_types` restricts which subtrees are searched; `None`
	/// queries all configured types in preferred order. `limit_results`
	/// caps the total number of records across types and
	/// `timeout` bounds each protocol search. Exceeding either truncates
	/// the result with a diagnostic rather than failing.
	///
	/// # Errors
	/// [`Error::Query`] for a malformed expression or an exhausted retry
	/// budget, [`Error::Connection`]/[`Error::Bind`] if no connection
	/// could be established.
	pub async fn find_records(
		&self,
		expression: &Expression,
		record_types: Option<&[RecordType]>,
		limit_results: Option<i32>,
		timeout: Option<std::time::Duration>,
	) -> Result<Vec<Record>, Error> {
		let query = match compile(expression, &self.schema)? {
			CompiledFilter::Query(query) => query,
			// An unsatisfiable expression short-circuits without any
			// protocol dispatch.
			CompiledFilter::Empty => return Ok(Vec::new()),
		};
		let record_types = match record_types {
			Some(types) => types.to_vec(),
			None => self.schema.preferred_record_types(),
		};

		let schema = Arc::clone(&self.schema);
		let pool = Arc::clone(&self.query_pool);
		let base_dn = Arc::clone(&self.base_dn);
		let slow_threshold = self.executor.slow_query_threshold();
		self.executor
			.execute(move || {
				search_once(
					&pool,
					&schema,
					&base_dn,
					&query,
					&record_types,
					limit_results,
					timeout,
					slow_threshold,
				)
			})
			.await
	}

	/// Find all records of one type.
	///
	/// # Errors
	/// As for [`DirectoryService::find_records`].
	pub async fn records_with_record_type(
		&self,
		record_type: RecordType,
		limit_results: Option<i32>,
		timeout: Option<std::time::Duration>,
	) -> Result<Vec<Record>, Error> {
		self.find_records(
			&Expression::Exists(FieldName::Uid),
			Some(&[record_type]),
			limit_results,
			timeout,
		)
		.await
	}

	/// Fetch the record at a DN, if it exists and maps to a known record
	/// type.
	///
	/// # Errors
	/// As for [`DirectoryService::find_records`]; an unknown DN is
	/// `Ok(None)`, not an error.
	pub async fn record_with_dn(&self, dn: &str) -> Result<Option<Record>, Error> {
		let schema = Arc::clone(&self.schema);
		let pool = Arc::clone(&self.query_pool);
		let base_dn = Arc::clone(&self.base_dn);
		let dn = dn.to_owned();
		self.executor
			.execute(move || lookup_dn_once(&pool, &schema, &base_dn, &dn))
			.await
	}

	/// Verify a caller's credential by binding a one-off session with it.
	///
	/// Returns `false` for a rejected or locked credential; only
	/// infrastructure failures surface as errors.
	///
	/// # Errors
	/// [`Error::Query`] once the retry budget for an unavailable server
	/// is exhausted, [`Error::Connection`] if no connection could be
	/// established.
	pub async fn verify_credential(&self, dn: &str, password: &str) -> Result<bool, Error> {
		let pool = Arc::clone(&self.auth_pool);
		let dn = dn.to_owned();
		let password = password.to_owned();
		self.executor.execute(move || bind_once(&pool, &dn, &password)).await
	}
}

/// One search attempt over all requested record types on one pooled
/// connection. Transient failures propagate so the caller's retry loop
/// can evict the connection and try again.
#[allow(clippy::too_many_arguments)]
fn search_once(
	pool: &ConnectionPool<LdapConnector>,
	schema: &Schema,
	base_dn: &str,
	query: &str,
	record_types: &[RecordType],
	limit_results: Option<i32>,
	timeout: Option<std::time::Duration>,
	slow_threshold: std::time::Duration,
) -> Result<Vec<Record>, Error> {
	pool.with_conn(|conn| {
		let mut records = Vec::new();
		let mut remaining = limit_results;
		for record_type in record_types {
			if matches!(remaining, Some(left) if left < 1) {
				break;
			}
			let Some(type_schema) = schema.schema_for(*record_type) else {
				continue;
			};
			let base = format!("{},{}", type_schema.relative_dn, base_dn);
			let filter = apply_extra_filter(schema, *record_type, query);
			debug!(base, filter, record_type = %record_type, "Performing LDAP query");

			let mut options = SearchOptions::new();
			if let Some(left) = remaining {
				options = options.sizelimit(left);
			}
			if let Some(timeout) = timeout {
				options =
					options.timelimit(i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX));
			}

			let started = Instant::now();
			let result = conn.with_search_options(options).search(
				&base,
				Scope::Subtree,
				&filter,
				schema.attributes_to_fetch().to_vec(),
			);
			let SearchResult(entries, outcome) = match result {
				Ok(result) => result,
				Err(LdapError::FilterParsing) => {
					error!(filter, "Unable to perform query");
					return Err(Error::Query {
						message: "unable to perform query".to_owned(),
						source: Some(LdapError::FilterParsing),
					});
				}
				Err(err) if ldap_error_is_transient(&err) => {
					return Err(Error::Connection(err));
				}
				Err(err) => {
					error!(filter, error = %err, "LDAP search failed");
					return Err(Error::Query {
						message: "unable to perform query".to_owned(),
						source: Some(err),
					});
				}
			};
			match outcome.rc {
				0 => {}
				RC_SIZE_LIMIT_EXCEEDED => {
					debug!(limit = remaining, "LDAP result limit exceeded; truncating");
				}
				RC_TIME_LIMIT_EXCEEDED => {
					warn!(timeout = ?timeout, "LDAP time limit exceeded; truncating");
				}
				RC_NO_SUCH_OBJECT => continue,
				RC_INVALID_SYNTAX => {
					error!(filter, "LDAP invalid syntax");
					continue;
				}
				rc if ldap_error_is_transient(&LdapError::LdapResult {
					result: outcome.clone(),
				}) =>
				{
					debug!(rc, "LDAP server unavailable during search");
					return Err(Error::Connection(LdapError::LdapResult { result: outcome }));
				}
				rc => {
					error!(filter, rc, "LDAP search failed");
					return Err(Error::Query {
						message: format!("search failed with result code {rc}"),
						source: Some(LdapError::LdapResult { result: outcome }),
					});
				}
			}

			log_slow_search(slow_threshold, &base, &filter, started.elapsed(), entries.len());

			let new_records: Vec<Record> = entries
				.into_iter()
				.map(SearchEntry::construct)
				.filter_map(|entry| record_from_entry(&entry, *record_type, schema))
				.collect();
			debug!(
				base,
				record_type = %record_type,
				count = new_records.len(),
				"Records from LDAP query"
			);
			if let Some(left) = remaining {
				remaining =
					Some(left - i32::try_from(new_records.len()).unwrap_or(i32::MAX));
			}
			records.extend(new_records);
		}
		Ok(records)
	})
}

/// One direct DN lookup attempt on one pooled connection.
fn lookup_dn_once(
	pool: &ConnectionPool<LdapConnector>,
	schema: &Schema,
	base_dn: &str,
	dn: &str,
) -> Result<Option<Record>, Error> {
	pool.with_conn(|conn| {
		debug!(dn, "Performing LDAP DN query");
		let result =
			conn.search(dn, Scope::Subtree, "(objectClass=*)", schema.attributes_to_fetch().to_vec());
		let SearchResult(entries, outcome) = match result {
			Ok(result) => result,
			Err(err) if ldap_error_is_transient(&err) => return Err(Error::Connection(err)),
			Err(err) => {
				error!(dn, error = %err, "LDAP DN lookup failed");
				return Err(Error::Query {
					message: "unable to perform DN lookup".to_owned(),
					source: Some(err),
				});
			}
		};
		match outcome.rc {
			0 => {}
			RC_NO_SUCH_OBJECT => return Ok(None),
			RC_INVALID_DN_SYNTAX => {
				warn!(dn, "Invalid LDAP DN syntax");
				return Ok(None);
			}
			rc if ldap_error_is_transient(&LdapError::LdapResult { result: outcome.clone() }) => {
				debug!(rc, "LDAP server unavailable during DN lookup");
				return Err(Error::Connection(LdapError::LdapResult { result: outcome }));
			}
			rc => {
				error!(dn, rc, "LDAP DN lookup failed");
				return Err(Error::Query {
					message: format!("DN lookup failed with result code {rc}"),
					source: Some(LdapError::LdapResult { result: outcome }),
				});
			}
		}
		let record = entries.into_iter().map(SearchEntry::construct).find_map(|entry| {
			let record_type =
				resolve_record_type(base_dn, schema.record_type_schemas(), &entry)?;
			record_from_entry(&entry, record_type, schema)
		});
		Ok(record)
	})
}

/// One credential-verification attempt on one pooled auth connection.
///
/// A rejected or locked credential is a `false` result, not an error; an
/// unexpected protocol failure is logged and absorbed as `false` too.
/// Only the transient server-down signal propagates, so the retry loop
/// can evict the session and try again.
fn bind_once(
	pool: &ConnectionPool<LdapConnector>,
	dn: &str,
	password: &str,
) -> Result<bool, Error> {
	pool.with_conn(|conn| {
		debug!(dn, "Authenticating");
		let outcome = match conn.simple_bind(dn, password) {
			Ok(outcome) => outcome,
			Err(err) if ldap_error_is_transient(&err) => return Err(Error::Connection(err)),
			Err(err) => {
				error!(dn, error = %err, "Unexpected error trying to authenticate");
				return Ok(false);
			}
		};
		match outcome.rc {
			0 => {
				// Re-bind anonymously so the authenticated session is not
				// left open past this single verification.
				if let Err(err) = conn.simple_bind("", "") {
					warn!(dn, error = %err, "Anonymous re-bind after verification failed");
					return Err(Error::Connection(err));
				}
				debug!(dn, "Authenticated");
				Ok(true)
			}
			RC_INVALID_CREDENTIALS | RC_INAPPROPRIATE_AUTH | RC_INVALID_DN_SYNTAX => {
				debug!(dn, "Unable to authenticate");
				Ok(false)
			}
			RC_CONSTRAINT_VIOLATION => {
				info!(dn, "Account locked");
				Ok(false)
			}
			rc if ldap_error_is_transient(&LdapError::LdapResult { result: outcome.clone() }) => {
				debug!(rc, "LDAP server unavailable during bind");
				Err(Error::Connection(LdapError::LdapResult { result: outcome }))
			}
			rc => {
				error!(dn, rc, "Unexpected result trying to authenticate");
				Ok(false)
			}
		}
	})
}
