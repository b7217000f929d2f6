//! Configuration types for tablelocal
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `TABLELOCAL__<SECTION>__<KEY>` environment variables. Command line
//! flags are applied on top by the binary.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Port the table service listens on by default
pub const DEFAULT_TABLE_PORT: u16 = 10002;

/// Well-known development storage account
pub const DEFAULT_ACCOUNT: &str = "devstoreaccount1";

/// Well-known development storage account key
pub const DEFAULT_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "TABLELOCAL";

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub account: AccountConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| Error::Configuration(e.to_string()))
    }
}

/// Listener and request handling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the table endpoint to
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Maximum accepted request body size
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_ms: default_request_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], DEFAULT_TABLE_PORT))
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_max_body_bytes() -> usize {
    // 4 MiB: the service limit for a batch payload
    4 * 1024 * 1024
}

/// Storage account identity exposed through the connection string
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default = "default_account_name")]
    pub name: String,
    /// Base64 account key
    #[serde(default = "default_account_key")]
    pub key: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            name: default_account_name(),
            key: default_account_key(),
        }
    }
}

fn default_account_name() -> String {
    DEFAULT_ACCOUNT.to_string()
}

fn default_account_key() -> String {
    DEFAULT_ACCOUNT_KEY.to_string()
}

/// How requests are authorized
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// No authorization check at all
    Open,
    /// A well-formed signature must be present; its value is not verified
    #[default]
    Dev,
    /// SharedKey / SharedKeyLite signatures are verified against the account key
    SharedKey,
}

impl std::str::FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "dev" => Ok(Self::Dev),
            "shared-key" => Ok(Self::SharedKey),
            other => Err(Error::Configuration(format!("unknown auth mode: {other}"))),
        }
    }
}

/// Authorization configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
}

/// Storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the on-disk database. In-memory only when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Maximum number of entities returned by one query page
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_page_size: default_max_page_size(),
        }
    }
}

const fn default_max_page_size() -> usize {
    1000
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen.port(), DEFAULT_TABLE_PORT);
        assert_eq!(config.account.name, DEFAULT_ACCOUNT);
        assert_eq!(config.auth.mode, AuthMode::Dev);
        assert!(config.storage.data_dir.is_none());
        assert_eq!(config.storage.max_page_size, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
listen = "0.0.0.0:20002"

[auth]
mode = "shared-key"

[storage]
max_page_size = 50
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.server.listen.port(), 20002);
        assert_eq!(config.server.request_timeout_ms, 30_000);
        assert_eq!(config.auth.mode, AuthMode::SharedKey);
        assert_eq!(config.storage.max_page_size, 50);
        assert_eq!(config.account.name, DEFAULT_ACCOUNT);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/tablelocal.toml"))).unwrap();
        assert_eq!(config.server.listen.port(), DEFAULT_TABLE_PORT);
    }

    #[test]
    fn test_auth_mode_from_str() {
        assert_eq!("open".parse::<AuthMode>().unwrap(), AuthMode::Open);
        assert_eq!("shared-key".parse::<AuthMode>().unwrap(), AuthMode::SharedKey);
        assert!("none".parse::<AuthMode>().is_err());
    }
}
