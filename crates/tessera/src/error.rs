//! Engine assembly errors.

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] tessera_config::ConfigError),

    #[error(transparent)]
    Session(#[from] tessera_session::Error),

    /// Background maintenance needs a tokio runtime.
    #[error("no tokio runtime available to run session maintenance")]
    NoRuntime,

    #[error("engine already started")]
    AlreadyStarted,

    /// A global tracing subscriber was already installed.
    #[error("failed to initialize logging: {0}")]
    Logging(String),
}
