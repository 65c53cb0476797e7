//! Error types for the conversation ledger.

use thiserror::Error;

/// Ledger error type shared by the store, the gateway and the controller.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Bad user input (empty name, malformed import).
    #[error("validation failed: {0}")]
    Validation(String),
    /// An operation referenced an unknown folder, chat, key or prompt.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of resource that was looked up.
        kind: &'static str,
        /// Identifier that was not found.
        id: String,
    },
    /// Attempt to delete or rename the default folder.
    #[error("protected resource: {0}")]
    Protected(String),
    /// No API key or model selected before a request.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A request for this chat is already in flight.
    #[error("chat {0} already has a request in flight")]
    Busy(String),
    /// Provider rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Provider rate limit hit.
    #[error("rate limit exceeded: {0}")]
    RateLimit(String),
    /// Transport failure or timeout while talking to the provider.
    #[error("network error: {0}")]
    Network(String),
    /// Provider answered with an error or an unusable payload.
    #[error("provider error: {0}")]
    Provider(String),
    /// Invalid runtime configuration values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// `SQLite` storage error (async).
    #[error("storage error: {0}")]
    Storage(#[from] tokio_rusqlite::Error),
    /// `SQLite` storage error (sync).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Build a `NotFound` error for the given resource kind.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Whether the error came from the completion gateway.
    #[must_use]
    pub const fn is_gateway_error(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::RateLimit(_) | Self::Network(_) | Self::Provider(_)
        )
    }

    /// Stable, machine-readable error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Protected(_) => "protected",
            Self::Configuration(_) => "configuration",
            Self::Busy(_) => "busy",
            Self::Auth(_) => "auth",
            Self::RateLimit(_) => "rate_limit",
            Self::Network(_) => "network",
            Self::Provider(_) => "provider",
            Self::InvalidConfig(_)
            | Self::Storage(_)
            | Self::Sqlite(_)
            | Self::Serialization(_)
            | Self::Url(_)
            | Self::Io(_) => "internal",
        }
    }
}

/// Convenience result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
