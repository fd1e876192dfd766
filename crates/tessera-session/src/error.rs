//! Error types for session engine operations.

/// Error type for session engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Session creation refused because the active-session limit was reached.
    #[error("Too many active sessions (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// A caller-supplied id is already in use by a resident session.
    #[error("Session id already in use: {0}")]
    DuplicateId(String),

    /// A persisted record exists but cannot be decoded.
    #[error("Unreadable session record {id}: {reason}")]
    Deserialization { id: String, reason: String },

    /// Attribute value cannot be encoded while the context is distributable.
    #[error("Attribute '{name}' is not serializable")]
    NotSerializable { name: String },

    /// The session has already been invalidated.
    #[error("Session already invalidated: {0}")]
    Invalidated(String),

    /// The id cannot be used as a storage key.
    #[error("Invalid session id: {0:?}")]
    InvalidId(String),

    /// The durable store could not be reached after retrying.
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Engine misconfiguration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn deserialization(id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Deserialization {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for session engine operations.
pub type Result<T> = std::result::Result<T, Error>;
