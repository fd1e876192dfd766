//! Tessera - server-side session management.
//!
//! Wires [`tessera_config`] into a running [`tessera_session`] engine:
//! load a [`TesseraConfig`], install logging, build a [`SessionEngine`] and
//! start it inside a tokio runtime.
//!
//! ```rust,ignore
//! let loaded = tessera::load_config(None)?;
//! let _guard = tessera::init_tracing(&loaded.config.logging())?;
//! let mut engine = tessera::SessionEngine::builder(loaded.config).build()?;
//! engine.start()?;
//!
//! let session = engine.create_session(None)?;
//! session.set_attribute("user", "alice")?;
//!
//! engine.shutdown().await;
//! ```

pub mod bootstrap;
pub mod error;
pub mod logging;

pub use bootstrap::{EngineBuilder, SessionEngine, open_store, persistence_config, registry_config};
pub use error::{EngineError, Result};
pub use logging::{LoggingGuard, init_tracing};

pub use tessera_config::{LoadedConfig, TesseraConfig, load_config, load_config_with_options};
pub use tessera_config as config;
pub use tessera_session as session;
