//! Error types for the channel bridge.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Classify a libsql error raised by a write, separating unique-key
    /// violations from everything else.
    pub fn from_write(context: &str, err: libsql::Error) -> Self {
        let text = err.to_string();
        if text.contains("UNIQUE constraint failed") {
            DatabaseError::Constraint(format!("{context}: {text}"))
        } else {
            DatabaseError::Query(format!("{context}: {text}"))
        }
    }
}

/// Failures talking to the chat provider's Bot API.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Connection refused, DNS failure, timeout. The message never contains
    /// the request URL (it embeds the bot token).
    #[error("transport failure: {0}")]
    Transport(String),

    /// The provider rejected the bot credentials (HTTP 401).
    #[error("bot token unauthorized")]
    Unauthorized,

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// HTTP success but the envelope says `ok=false`.
    #[error("provider rejected request: {0}")]
    Rejected(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),

    /// The local file meant for upload could not be opened.
    #[error("local file unavailable: {0}")]
    LocalFile(String),
}

impl ProviderError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ProviderError::Unauthorized)
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.without_url().to_string())
    }
}

/// Errors surfaced by bridge operations to synchronous callers.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// Bad input or unusable channel configuration (disabled, wrong
    /// provider, no credentials).
    #[error("{0}")]
    Validation(String),

    /// The provider reported the stored bot token as unauthorized; the
    /// channel has been marked `error` and needs reconnecting.
    #[error("Telegram bot token unauthorized. Reconnect integration.")]
    ReconnectRequired,

    /// The provider call failed for any other reason.
    #[error("{0}")]
    Provider(String),

    /// A local file could not be written, read, or found.
    #[error("{0}")]
    LocalResource(String),

    #[error("Channel {id}: cannot transition from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the bridge.
pub type Result<T> = std::result::Result<T, Error>;
