//! Configuration for the directory service.
use std::{path::PathBuf, sync::Arc, time::Duration};

use ldap3::LdapConnSettings;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{error::Error, schema::SchemaConfig};

/// Directory service configuration.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
	/// The URL to connect to the server with. Supports ldap and ldaps
	/// schemes.
	pub url: Url,
	/// The base DN under which all record subtrees live.
	pub base_dn: String,
	/// Service credentials used to bind pooled query connections.
	/// Authentication-only connections are always created unbound.
	#[serde(default)]
	pub credentials: Option<Credentials>,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// Field mappings and record type schemas.
	#[serde(default)]
	pub schema: SchemaConfig,
	/// Connection pool limits.
	#[serde(default)]
	pub pool: PoolConfig,
	/// Number of worker threads for blocking protocol calls. Defaults to
	/// the summed pool limits plus headroom, since one-off auth
	/// connections run alongside pooled query connections.
	#[serde(default)]
	pub worker_threads: Option<usize>,
	/// Attempts per operation when the server is transiently unavailable.
	#[serde(default = "default_tries")]
	pub tries: u32,
	/// Searches slower than this are logged as a diagnostic.
	#[serde(default = "default_slow_query_threshold")]
	pub slow_query_threshold: Duration,
}

impl Config {
	/// The effective worker pool size.
	#[must_use]
	pub fn worker_threads(&self) -> usize {
		self.worker_threads.unwrap_or(
			self.pool.query_connection_max + self.pool.auth_connection_max + 2,
		)
	}
}

/// The default retry budget.
const fn default_tries() -> u32 {
	3
}

/// The default slow-query threshold.
const fn default_slow_query_threshold() -> Duration {
	Duration::from_secs(5)
}

/// DN and secret used to bind pooled connections.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Credentials {
	/// The DN to bind as.
	pub bind_dn: String,
	/// The bind password.
	pub bind_password: String,
}

/// Per-role connection pool limits.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PoolConfig {
	/// Maximum pooled connections performing searches.
	pub query_connection_max: usize,
	/// Maximum pooled connections verifying credentials.
	pub auth_connection_max: usize,
}

impl Default for PoolConfig {
	fn default() -> Self {
		PoolConfig { query_connection_max: 5, auth_connection_max: 5 }
	}
}

/// Configuration for how to connect to the LDAP server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection, in seconds.
	pub timeout: u64,

	/// Use the StartTLS extended operation for establishing a secure
	/// connection, rather than TLS on a dedicated port.
	pub starttls: bool,

	/// Disable verification of TLS certificates.
	pub no_tls_verify: bool,

	/// Path of a PEM file with additional trusted root certificates.
	pub root_certificates_path: Option<PathBuf>,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		ConnectionConfig {
			timeout: 30,
			starttls: false,
			no_tls_verify: false,
			root_certificates_path: None,
		}
	}
}

impl ConnectionConfig {
	/// Create [`LdapConnSettings`] based on this configuration. Runs on a
	/// worker thread, so reading the certificate file may block.
	pub(crate) fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new()
			.set_conn_timeout(Duration::from_secs(self.timeout))
			.set_starttls(self.starttls)
			.set_no_tls_verify(self.no_tls_verify);

		if let Some(path) = &self.root_certificates_path {
			let pem = std::fs::read(path).map_err(|err| {
				Error::Configuration(format!(
					"could not read root certificates at {}: {err}",
					path.display()
				))
			})?;
			let certs = rustls_pemfile::certs(&mut pem.as_slice()).map_err(|err| {
				Error::Configuration(format!("could not parse root certificates: {err}"))
			})?;
			if certs.is_empty() {
				return Err(Error::Configuration(
					"root certificate file contains no certificates".to_owned(),
				));
			}
			let mut roots = rustls::RootCertStore::empty();
			for cert in certs {
				roots.add(&rustls::Certificate(cert)).map_err(|err| {
					Error::Configuration(format!("invalid root certificate: {err}"))
				})?;
			}
			let tls_config = rustls::ClientConfig::builder()
				.with_safe_defaults()
				.with_root_certificates(roots)
				.with_no_client_auth();
			settings = settings.set_config(Arc::new(tls_config));
		}
		Ok(settings)
	}
}
