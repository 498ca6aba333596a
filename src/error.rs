//! Error taxonomy for the directory service.

use ldap3::LdapError;

/// LDAP result code for `timeLimitExceeded`.
pub(crate) const RC_TIME_LIMIT_EXCEEDED: u32 = 3;
/// LDAP result code for `sizeLimitExceeded`.
pub(crate) const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
/// LDAP result code for `constraintViolation` (commonly a locked account).
pub(crate) const RC_CONSTRAINT_VIOLATION: u32 = 19;
/// LDAP result code for `invalidAttributeSyntax`.
pub(crate) const RC_INVALID_SYNTAX: u32 = 21;
/// LDAP result code for `noSuchObject`.
pub(crate) const RC_NO_SUCH_OBJECT: u32 = 32;
/// LDAP result code for `invalidDNSyntax`.
pub(crate) const RC_INVALID_DN_SYNTAX: u32 = 34;
/// LDAP result code for `inappropriateAuthentication`.
pub(crate) const RC_INAPPROPRIATE_AUTH: u32 = 48;
/// LDAP result code for `invalidCredentials`.
pub(crate) const RC_INVALID_CREDENTIALS: u32 = 49;
/// LDAP result code for `busy`.
const RC_BUSY: u32 = 51;
/// LDAP result code for `unavailable`.
const RC_UNAVAILABLE: u32 = 52;

/// Errors that can occur when using this library.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The schema or service configuration is invalid. Raised at
	/// construction time and never retried.
	#[error("Invalid configuration: {0}")]
	Configuration(String),
	/// Connecting to or negotiating a session with the server failed.
	#[error("Connection failed")]
	Connection(#[source] LdapError),
	/// The server rejected the configured service credentials while a
	/// pooled connection was being established. A rejected *caller*
	/// credential is reported as a `false` verification result instead.
	#[error("Bind rejected for {0}")]
	Bind(String),
	/// A query could not be performed, or the retry budget for a
	/// transiently unavailable server was exhausted.
	#[error("Query failed: {message}")]
	Query {
		/// Description of the failure.
		message: String,
		/// The underlying protocol error, if any.
		#[source]
		source: Option<LdapError>,
	},
	/// The worker pool has been stopped or its threads are gone.
	#[error("Worker pool is not running")]
	WorkerPoolStopped,
}

impl Error {
	/// Shorthand for a [`Error::Query`] without an underlying cause.
	pub(crate) fn query(message: impl Into<String>) -> Self {
		Error::Query { message: message.into(), source: None }
	}

	/// Whether this error is the transient "server unavailable" signal
	/// which the executor may retry. Everything else is terminal.
	#[must_use]
	pub fn is_transient(&self) -> bool {
		match self {
			Error::Connection(source) => ldap_error_is_transient(source),
			Error::Query { source: Some(source), .. } => ldap_error_is_transient(source),
			_ => false,
		}
	}
}

/// Whether a protocol error indicates the server being down or overloaded
/// rather than a problem with the request itself.
pub(crate) fn ldap_error_is_transient(error: &LdapError) -> bool {
	match error {
		LdapError::Io { .. }
		| LdapError::EndOfStream
		| LdapError::OpSend { .. }
		| LdapError::ResultRecv { .. } => true,
		LdapError::LdapResult { result } => {
			matches!(result.rc, RC_BUSY | RC_UNAVAILABLE)
		}
		_ => false,
	}
}
