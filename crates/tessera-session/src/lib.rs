//! Session lifecycle and persistence engine.
//!
//! This crate manages server-side sessions for many concurrent clients:
//! - [`SessionRegistry`] owns resident sessions, generates ids and runs
//!   throttled expiration sweeps
//! - [`Session`] carries attributes, timestamps and the lifecycle state
//!   machine (new, active, passive, expired)
//! - [`StoreBackend`] persists encoded session records, with
//!   [`FileStore`] and [`SqlStore`] implementations
//! - [`PersistenceCoordinator`] applies swap-out, backup and capacity
//!   policies and swaps sessions back in on lookup
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tessera_session::{
//!     FileStore, FileStoreConfig, PersistenceConfig, PersistenceCoordinator,
//!     RegistryConfig, SessionContext, SessionRegistry,
//! };
//!
//! let registry = SessionRegistry::new(RegistryConfig::default(), Arc::new(SessionContext::new("shop")));
//! let store = FileStore::new(FileStoreConfig::new("sessions"))?;
//! let coordinator = PersistenceCoordinator::new(
//!     registry,
//!     Arc::new(store),
//!     PersistenceConfig::new().with_max_idle_swap(Duration::from_secs(600)),
//! );
//!
//! let session = coordinator.create_session(None)?;
//! session.set_attribute("count", 1i64)?;
//! ```

mod clock;
pub mod codec;
mod config;
mod context;
mod coordinator;
mod error;
mod id;
mod maintenance;
mod registry;
mod session;
pub mod store;
mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    DEFAULT_MAX_INACTIVE_SECS, DEFAULT_POOL_SIZE, DEFAULT_PROCESS_EXPIRES_FREQUENCY,
    DEFAULT_TICK_INTERVAL, EvictionOrder, PersistenceConfig, RegistryConfig,
};
pub use context::{
    AttributeListener, ListenerObserver, Notification, SessionContext, SessionLifecycleListener,
};
pub use coordinator::{PersistenceCoordinator, TickReport};
pub use error::{Error, Result};
pub use id::{DEFAULT_ID_LENGTH_BYTES, DigestAlgorithm, IdConfig, IdGenerator};
pub use maintenance::MaintenanceTask;
pub use registry::{ExpiryHook, RegistryStats, SessionRegistry};
pub use session::{AccessGuard, Session, SessionEvent, SessionEventListener, SessionState};
pub use store::{
    FileStore, FileStoreConfig, RecordMeta, SqlColumns, SqlStore, SqlStoreConfig, StoreBackend,
};
pub use value::{AttributeValue, SessionObject, TypeRegistry, ValueResolver, encode_payload};
