//! Runtime configuration for the ledger, the gateway and the HTTP server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ledger::core::errors::{LedgerError, LedgerResult};

/// Environment variable for the `SQLite` database path.
pub const DB_PATH_ENV: &str = "CHAT_LEDGER_DB";
/// Environment variable for the address the HTTP server binds to.
pub const HOST_ENV: &str = "CHAT_LEDGER_HOST";
/// Environment variable for the HTTP port.
pub const PORT_ENV: &str = "CHAT_LEDGER_PORT";
/// Environment variable for the completion timeout in seconds.
pub const TIMEOUT_ENV: &str = "CHAT_LEDGER_TIMEOUT_SECS";
/// Environment variable overriding every provider base URL.
pub const BASE_URL_ENV: &str = "CHAT_LEDGER_BASE_URL";
/// Environment variable for the `HTTP-Referer` header.
pub const REFERER_ENV: &str = "CHAT_LEDGER_REFERER";
/// Environment variable for the `X-Title` header.
pub const TITLE_ENV: &str = "CHAT_LEDGER_TITLE";

/// Top-level configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Storage settings.
    pub storage: StorageConfig,
    /// Completion gateway settings.
    pub gateway: GatewayConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
}

impl LedgerConfig {
    /// Build the default configuration overridden by environment variables.
    ///
    /// # Errors
    /// Returns an error if a variable holds an unparsable value.
    pub fn from_env() -> LedgerResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            config.storage.sqlite_path = PathBuf::from(path);
        }
        if let Ok(host) = std::env::var(HOST_ENV) {
            config.server.bind_address = host
                .parse()
                .map_err(|_| LedgerError::InvalidConfig(format!("{HOST_ENV}={host}")))?;
        }
        if let Ok(port) = std::env::var(PORT_ENV) {
            config.server.port = port
                .parse()
                .map_err(|_| LedgerError::InvalidConfig(format!("{PORT_ENV}={port}")))?;
        }
        if let Ok(secs) = std::env::var(TIMEOUT_ENV) {
            config.gateway.request_timeout_secs = secs
                .parse()
                .map_err(|_| LedgerError::InvalidConfig(format!("{TIMEOUT_ENV}={secs}")))?;
        }
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            config.gateway.base_url_override = Some(base_url);
        }
        if let Ok(referer) = std::env::var(REFERER_ENV) {
            config.gateway.referer = referer;
        }
        if let Ok(title) = std::env::var(TITLE_ENV) {
            config.gateway.title = title;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any values are out of range or invalid.
    pub fn validate(&self) -> LedgerResult<()> {
        if self.storage.table.trim().is_empty() {
            return Err(LedgerError::InvalidConfig(
                "storage.table must not be empty".to_string(),
            ));
        }

        if !self
            .storage
            .table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(LedgerError::InvalidConfig(format!(
                "storage.table must be alphanumeric: {}",
                self.storage.table
            )));
        }

        if self.gateway.request_timeout_secs == 0 {
            return Err(LedgerError::InvalidConfig(
                "gateway.request_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.gateway.connect_timeout_secs == 0 {
            return Err(LedgerError::InvalidConfig(
                "gateway.connect_timeout_secs must be > 0".to_string(),
            ));
        }

        if let Some(base_url) = &self.gateway.base_url_override {
            Url::parse(base_url)?;
        }

        Url::parse(&self.gateway.referer)?;

        Ok(())
    }
}

/// Storage configuration for the ledger document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `SQLite` database path.
    pub sqlite_path: PathBuf,
    /// Document table name.
    pub table: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("chat_ledger.sqlite"),
            table: "ledger_documents".to_string(),
        }
    }
}

/// Completion gateway settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upper bound for one completion call, in seconds.
    pub request_timeout_secs: u64,
    /// Connection timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Value of the `HTTP-Referer` header.
    pub referer: String,
    /// Value of the `X-Title` header.
    pub title: String,
    /// Replaces every provider base URL when set.
    pub base_url_override: Option<String>,
}

impl GatewayConfig {
    /// Completion timeout as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Connection timeout as a `Duration`.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 120,
            connect_timeout_secs: 10,
            referer: "http://localhost:3000".to_string(),
            title: "Chat App".to_string(),
            base_url_override: None,
        }
    }
}

/// HTTP server settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind, loopback by default.
    pub bind_address: IpAddr,
    /// Listening port.
    pub port: u16,
    /// Directory served as the browser front-end.
    pub static_dir: PathBuf,
}

impl ServerConfig {
    /// Socket address the server listens on.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3000,
            static_dir: PathBuf::from("static"),
        }
    }
}
