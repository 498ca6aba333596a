//! Answer identity queries against an LDAP directory server.
//!
//! The library maps a small query language (match, exists, boolean and
//! compound expressions over domain fields) onto LDAP searches, and maps
//! the raw entries coming back into typed records classified as users,
//! groups and so on. Around that sit the pieces that make it usable from
//! an async program against a blocking protocol library: bounded
//! per-role connection pools with failure eviction, a worker pool that
//! keeps protocol calls off the async executor, and a retry budget for
//! transient server unavailability.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate
//! which is used here for interfacing with LDAP is an excellent
//! resource.
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//!
//! # Getting started
//! A minimal example of querying a directory might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ldap_directory::{
//!     config::Config,
//!     filter::Expression,
//!     schema::FieldName,
//!     service::DirectoryService,
//! };
//! use url::Url;
//!
//! // Configuration can also be deserialized with serde. It's
//! // hand-constructed here for demonstration purposes.
//! let config = Config {
//!     url: Url::parse("ldap://localhost")?,
//!     base_dn: "dc=example,dc=com".to_owned(),
//!     credentials: None,
//!     connection: Default::default(),
//!     schema: Default::default(),
//!     pool: Default::default(),
//!     worker_threads: None,
//!     tries: 3,
//!     slow_query_threshold: std::time::Duration::from_secs(5),
//! };
//!
//! let service = DirectoryService::new(config)?;
//! service.start();
//!
//! let records = service
//!     .find_records(&Expression::equals(FieldName::ShortNames, "bob"), None, None, None)
//!     .await?;
//! for record in &records {
//!     println!("{} {}: {}", record.record_type, record.uid(), record.dn);
//! }
//!
//! let valid = service
//!     .verify_credential("uid=bob,ou=people,dc=example,dc=com", "secret")
//!     .await?;
//! println!("Credential valid: {valid}");
//!
//! service.stop();
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * The directory is read-only to this library; there is no record
//!   creation, update or removal.
//! * An abandoned caller does not cancel its in-progress protocol call;
//!   the worker finishes it and the result is discarded.
//! * [secrecy](https://docs.rs/secrecy) is not used for storing bind
//!   passwords, it probably should be.

mod dispatch;
mod dn;
mod executor;
mod groups;
mod pool;

pub mod config;
pub mod entry;
pub mod error;
pub mod filter;
pub mod schema;
pub mod service;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	config::{Config, ConnectionConfig, Credentials, PoolConfig},
	entry::{FieldValue, Record},
	error::Error,
	filter::{compile, CompiledFilter, Expression, MatchType, Operand},
	pool::PoolStats,
	schema::{
		AttributeRule, FieldMapping, FieldName, RecordType, RecordTypeSchema, Schema,
		SchemaConfig, ValueKind,
	},
	service::{DirectoryService, ServiceStats},
};
