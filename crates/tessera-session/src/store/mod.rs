//! Durable session storage.
//!
//! A [`StoreBackend`] moves encoded session records in and out of durable
//! storage. Backends implement the raw byte operations; decoding, encoding
//! and the expiration sweep over stored records are shared defaults.

mod file;
mod sql;

pub use file::{FileStore, FileStoreConfig};
pub use sql::{SqlColumns, SqlStore, SqlStoreConfig};

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{self, SessionRecord};
use crate::error::{Error, Result};
use crate::registry::SessionRegistry;
use crate::session::Session;

/// Indexable fields stored alongside the encoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMeta {
    pub id: String,
    pub valid: bool,
    pub max_inactive_secs: i32,
    pub last_accessed_ms: i64,
}

impl From<&SessionRecord> for RecordMeta {
    fn from(record: &SessionRecord) -> Self {
        Self {
            id: record.id.clone(),
            valid: record.is_valid,
            max_inactive_secs: record.max_inactive_interval,
            last_accessed_ms: record.this_accessed_time,
        }
    }
}

/// Durable storage for swapped-out and backed-up sessions.
///
/// Implementations serialize their own operations; callers may share one
/// backend between threads.
pub trait StoreBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Ids of all stored records, sorted.
    fn keys(&self) -> Result<Vec<String>>;

    /// Number of stored records.
    fn size(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    /// Remove every record.
    fn clear(&self) -> Result<()>;

    /// Remove the record for `id`. Removing a missing record is not an error.
    fn remove(&self, id: &str) -> Result<()>;

    /// Raw record bytes for `id`, if present.
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>>;

    /// Store raw record bytes, replacing any existing record for the id.
    fn write(&self, meta: &RecordMeta, data: &[u8]) -> Result<()>;

    /// Read and decode the record for `id` into a new, unregistered
    /// session owned by `registry`.
    ///
    /// Fails with [`Error::Deserialization`](crate::Error::Deserialization)
    /// when a record exists but cannot be decoded.
    fn load(&self, id: &str, registry: &SessionRegistry) -> Result<Option<Arc<Session>>> {
        let Some(bytes) = self.read(id)? else {
            return Ok(None);
        };
        let record = codec::decode(id, &bytes)?;
        if record.id != id {
            return Err(Error::deserialization(
                id,
                format!("record belongs to session {}", record.id),
            ));
        }
        let session = registry.create_empty_session();
        session.restore(record)?;
        debug!(store = self.name(), session_id = %id, "Loaded session");
        Ok(Some(session))
    }

    /// Encode and store `session`.
    fn save(&self, session: &Session) -> Result<()> {
        let record = session.to_record();
        let data = codec::encode_record(&record)?;
        self.write(&RecordMeta::from(&record), &data)?;
        debug!(store = self.name(), session_id = %record.id, bytes = data.len(), "Saved session");
        Ok(())
    }

    /// Remove stored records whose sessions have timed out.
    ///
    /// A stored copy of a resident session is discarded; a swapped-out
    /// session is expired with notifications. Unreadable records are
    /// removed. Returns the number of records removed.
    fn sweep_expired(&self, registry: &SessionRegistry) -> usize {
        let keys = match self.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(store = self.name(), error = %e, "Cannot list stored sessions");
                return 0;
            }
        };
        let now = registry.context().clock().now();
        let mut removed = 0;
        for id in keys {
            let session = match self.load(&id, registry) {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(e) => {
                    warn!(store = self.name(), session_id = %id, error = %e, "Discarding unreadable stored session");
                    if let Err(e) = self.remove(&id) {
                        warn!(store = self.name(), session_id = %id, error = %e, "Failed to remove stored session");
                    } else {
                        removed += 1;
                    }
                    continue;
                }
            };
            if !session.is_expired_at(now) {
                continue;
            }
            if registry.is_resident(&id) {
                registry.recycle(session);
            } else {
                session.expire();
            }
            match self.remove(&id) {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(store = self.name(), session_id = %id, error = %e, "Failed to remove stored session")
                }
            }
        }
        if removed > 0 {
            debug!(store = self.name(), removed, "Store expiration sweep complete");
        }
        removed
    }
}
