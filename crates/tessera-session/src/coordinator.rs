//! Swap, backup and capacity policies over a registry and a store.
//!
//! The coordinator decides when a resident session is written through to
//! the store (backup), moved out of memory (swap-out) or brought back in on
//! lookup (swap-in). Policies run from [`PersistenceCoordinator::tick`];
//! lookups and creation run on request threads.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::{EvictionOrder, PersistenceConfig};
use crate::error::{Error, Result};
use crate::registry::{RegistryStats, SessionRegistry};
use crate::session::{AccessGuard, Session, SessionState};
use crate::store::StoreBackend;

/// Note holding the access time of the last backup, in epoch millis.
const BACKUP_NOTE: &str = "tessera.backup_accessed";

/// Lookups retried when the session leaves memory mid-lookup.
const FIND_ATTEMPTS: usize = 3;

/// What one [`PersistenceCoordinator::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub idle_swapped: usize,
    pub capacity_swapped: usize,
    pub backed_up: usize,
    /// Whether the registry's throttled expiration sweep ran.
    pub swept: bool,
    pub store_expired: usize,
}

struct CoordinatorInner {
    registry: SessionRegistry,
    store: Arc<dyn StoreBackend>,
    config: PersistenceConfig,
    swap_in_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Session manager that persists sessions to a [`StoreBackend`].
///
/// Cloning is cheap and clones share state.
#[derive(Clone)]
pub struct PersistenceCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PersistenceCoordinator {
    /// Wrap `registry` and `store`.
    ///
    /// Installs the registry's expiry hook so that a session expiring in
    /// memory also loses its stored record.
    pub fn new(
        registry: SessionRegistry,
        store: Arc<dyn StoreBackend>,
        config: PersistenceConfig,
    ) -> Self {
        let hook_store = Arc::clone(&store);
        registry.set_expiry_hook(Arc::new(move |id: &str| {
            if let Err(e) = hook_store.remove(id) {
                warn!(session_id = %id, error = %e, "Failed to remove stored record of expired session");
            }
        }));
        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                store,
                config,
                swap_in_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registry holding the resident sessions.
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Durable store for swapped-out sessions.
    pub fn store(&self) -> &Arc<dyn StoreBackend> {
        &self.inner.store
    }

    /// Policy thresholds.
    pub fn config(&self) -> &PersistenceConfig {
        &self.inner.config
    }

    /// Registry counters.
    pub fn stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    /// Create a resident session, see [`SessionRegistry::create_session`].
    pub fn create_session(&self, id: Option<&str>) -> Result<Arc<Session>> {
        self.inner.registry.create_session(id)
    }

    /// Whether `id` is resident in memory.
    pub fn is_loaded(&self, id: &str) -> bool {
        self.inner.registry.is_resident(id)
    }

    /// Look up a session in memory, then in the store.
    ///
    /// Missing, invalid and unreadable stored sessions are all reported as
    /// `None`; unreadable records are removed from the store.
    pub fn find_session(&self, id: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.inner.registry.find(id) {
            return Some(session);
        }
        self.swap_in(id, false)
    }

    /// Look up a session and begin a request on it.
    ///
    /// The access count is raised while the session is known to be resident
    /// and active, so a concurrent tick cannot swap it out or expire it
    /// before the caller uses it. Dropping the guard ends the request.
    pub fn find_and_access(&self, id: &str) -> Option<AccessGuard> {
        for _ in 0..FIND_ATTEMPTS {
            let session = self.find_session(id)?;
            let guard = session.begin_access();
            let active = matches!(guard.state(), SessionState::New | SessionState::Active);
            let resident = self
                .inner
                .registry
                .find(id)
                .is_some_and(|current| Arc::ptr_eq(&current, &session));
            if active && resident {
                return Some(guard);
            }
            trace!(session_id = %id, "Session left memory during lookup, retrying");
        }
        None
    }

    /// Remove a session from memory and from the store.
    pub fn remove(&self, session: &Session) {
        let id = session.id();
        self.inner.registry.remove(session);
        if let Err(e) = self.inner.store.remove(&id) {
            warn!(session_id = %id, error = %e, "Failed to remove stored session");
        }
    }

    fn swap_in(&self, id: &str, bulk: bool) -> Option<Arc<Session>> {
        let lock = {
            let mut locks = self.inner.swap_in_locks.lock();
            Arc::clone(locks.entry(id.to_owned()).or_default())
        };
        let found = {
            let _held = lock.lock();
            self.swap_in_locked(id, bulk)
        };
        drop(lock);
        let mut locks = self.inner.swap_in_locks.lock();
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
        found
    }

    fn swap_in_locked(&self, id: &str, bulk: bool) -> Option<Arc<Session>> {
        let inner = &self.inner;
        // Another caller may have swapped it in while we waited.
        if let Some(session) = inner.registry.find(id) {
            return Some(session);
        }

        let session = match inner.store.load(id, &inner.registry) {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(e @ Error::Deserialization { .. }) => {
                if bulk {
                    warn!(session_id = %id, error = %e, "Skipping unreadable stored session");
                } else {
                    warn!(session_id = %id, error = %e, "Discarding unreadable stored session");
                    self.remove_record(id);
                }
                return None;
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to load stored session");
                return None;
            }
        };

        if !session.is_valid() {
            debug!(session_id = %id, "Stored session is no longer valid");
            session.expire();
            self.remove_record(id);
            return None;
        }

        inner.registry.add(Arc::clone(&session));
        session.tell_new();
        session.activate();
        session.access();
        session.end_access();
        self.remove_record(id);
        debug!(session_id = %id, "Swapped in session");
        Some(session)
    }

    /// Write `session` to the store and drop it from memory.
    ///
    /// Returns `Ok(false)` without touching the store when the session is in
    /// use by a request or no longer valid. If the write fails the session is
    /// reactivated and stays resident.
    pub fn swap_out(&self, session: Arc<Session>) -> Result<bool> {
        if session.access_count() > 0 || !session.is_valid() {
            return Ok(false);
        }
        let id = session.id();
        session.passivate();
        // A request may have begun before the phase changed.
        if session.access_count() > 0 {
            session.activate();
            return Ok(false);
        }
        if let Err(e) = self.inner.store.save(&session) {
            session.activate();
            return Err(e);
        }
        self.inner.registry.remove(&session);
        self.inner.registry.recycle(session);
        debug!(session_id = %id, "Swapped out session");
        Ok(true)
    }

    fn remove_record(&self, id: &str) {
        if let Err(e) = self.inner.store.remove(id) {
            warn!(session_id = %id, error = %e, "Failed to remove stored session");
        }
    }

    fn try_swap_out(&self, session: Arc<Session>) -> bool {
        let id = session.id();
        match self.swap_out(session) {
            Ok(swapped) => swapped,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Swap-out failed, session stays resident");
                false
            }
        }
    }

    /// Swap out sessions idle at least `max_idle_swap`.
    pub fn process_max_idle_swaps(&self) -> usize {
        let config = &self.inner.config;
        let Some(max_idle) = config.max_idle_swap else {
            return 0;
        };
        let mut swapped = 0;
        for session in self.inner.registry.all() {
            if session.access_count() > 0 || !session.is_valid() {
                continue;
            }
            let idle = session.idle_time();
            if idle >= max_idle && config.above_swap_floor(idle) {
                trace!(session_id = %session.id(), idle_secs = idle.as_secs(), "Swapping out idle session");
                if self.try_swap_out(session) {
                    swapped += 1;
                }
            }
        }
        if swapped > 0 {
            debug!(count = swapped, "Swapped out idle sessions");
        }
        swapped
    }

    /// Swap out sessions while more than `max_active_sessions` are resident.
    ///
    /// Only sessions idle longer than `min_idle_swap` are eligible, so fewer
    /// than the excess may be evicted.
    pub fn process_max_active_swaps(&self) -> usize {
        let config = &self.inner.config;
        let Some(limit) = config.max_active_sessions else {
            return 0;
        };
        let mut sessions = self.inner.registry.all();
        if sessions.len() <= limit {
            return 0;
        }
        let mut excess = sessions.len() - limit;
        if config.eviction_order == EvictionOrder::Lru {
            sessions.sort_by_key(|s| s.this_accessed_time());
        }

        let mut swapped = 0;
        for session in sessions {
            if excess == 0 {
                break;
            }
            if session.access_count() > 0 || !config.above_swap_floor(session.idle_time()) {
                continue;
            }
            if self.try_swap_out(session) {
                swapped += 1;
                excess -= 1;
            }
        }
        if swapped > 0 {
            debug!(count = swapped, limit, "Evicted sessions over capacity");
        }
        swapped
    }

    /// Write through sessions idle at least `max_idle_backup`.
    ///
    /// A session not accessed since its last backup is skipped.
    pub fn process_max_idle_backups(&self) -> usize {
        let Some(max_idle) = self.inner.config.max_idle_backup else {
            return 0;
        };
        let mut backed_up = 0;
        for session in self.inner.registry.all() {
            if session.access_count() > 0 || !session.is_valid() {
                continue;
            }
            if session.idle_time() < max_idle {
                continue;
            }
            let accessed = session.this_accessed_time().timestamp_millis();
            if session.note(BACKUP_NOTE).and_then(|v| v.as_i64()) == Some(accessed) {
                continue;
            }
            match self.inner.store.save(&session) {
                Ok(()) => {
                    session.set_note(BACKUP_NOTE, accessed.into());
                    backed_up += 1;
                }
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "Session backup failed");
                }
            }
        }
        if backed_up > 0 {
            debug!(count = backed_up, "Backed up idle sessions");
        }
        backed_up
    }

    /// Run one maintenance pass.
    ///
    /// Idle swap, capacity eviction and backup run every tick in that order.
    /// Every Nth tick the registry sweep runs, followed by the store sweep.
    /// Failures are logged and never abort the pass.
    pub fn tick(&self) -> TickReport {
        let idle_swapped = self.process_max_idle_swaps();
        let capacity_swapped = self.process_max_active_swaps();
        let backed_up = self.process_max_idle_backups();
        let swept = self.inner.registry.tick();
        let store_expired = if swept {
            self.inner.store.sweep_expired(&self.inner.registry)
        } else {
            0
        };
        let report = TickReport {
            idle_swapped,
            capacity_swapped,
            backed_up,
            swept,
            store_expired,
        };
        trace!(?report, "Maintenance tick");
        report
    }

    /// Restore every stored session into memory. Returns how many were
    /// restored.
    pub fn load(&self) -> usize {
        let keys = match self.inner.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                error!(store = self.inner.store.name(), error = %e, "Cannot list stored sessions");
                return 0;
            }
        };
        let total = keys.len();
        let loaded = keys
            .iter()
            .filter(|id| self.swap_in(id, true).is_some())
            .count();
        info!(loaded, total, store = self.inner.store.name(), "Loaded persisted sessions");
        loaded
    }

    /// Persist every resident session, then expire it without notification
    /// and recycle it. Returns how many were saved.
    pub fn unload(&self) -> usize {
        let mut saved = 0;
        for session in self.inner.registry.all() {
            if !session.is_valid() {
                continue;
            }
            session.passivate();
            match self.inner.store.save(&session) {
                Ok(()) => saved += 1,
                Err(e) => {
                    error!(session_id = %session.id(), error = %e, "Failed to persist session on unload");
                }
            }
            session.expire_with(false);
            self.inner.registry.recycle(session);
        }
        info!(saved, store = self.inner.store.name(), "Persisted sessions on unload");
        saved
    }

    /// Container start: restore stored sessions if `save_on_restart` is set.
    pub fn start(&self) -> usize {
        if self.inner.config.save_on_restart {
            self.load()
        } else {
            0
        }
    }

    /// Container stop: persist resident sessions if `save_on_restart` is
    /// set, otherwise expire them.
    pub fn stop(&self) {
        if self.inner.config.save_on_restart {
            self.unload();
        } else {
            for session in self.inner.registry.all() {
                session.expire();
            }
        }
    }
}

impl std::fmt::Debug for PersistenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceCoordinator")
            .field("registry", &self.inner.registry)
            .field("store", &self.inner.store.name())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RegistryConfig;
    use crate::context::{SessionContext, SessionLifecycleListener};
    use crate::id::IdConfig;
    use crate::store::{FileStore, FileStoreConfig, RecordMeta};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Created(AtomicUsize);

    impl SessionLifecycleListener for Created {
        fn session_created(&self, _session: &Session) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        created: Arc<Created>,
        coordinator: PersistenceCoordinator,
    }

    fn fixture(config: PersistenceConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let created = Arc::new(Created::default());
        let context = SessionContext::new("test")
            .with_clock(clock.clone())
            .with_lifecycle_listener(created.clone());
        let registry = SessionRegistry::new(
            RegistryConfig::new().with_ids(IdConfig::default().with_random_file(None)),
            Arc::new(context),
        );
        let store = FileStore::new(FileStoreConfig::new(dir.path())).unwrap();
        let coordinator = PersistenceCoordinator::new(registry, Arc::new(store), config);
        Fixture {
            _dir: dir,
            clock,
            created,
            coordinator,
        }
    }

    /// Store whose writes always fail.
    struct ReadOnlyStore;

    impl StoreBackend for ReadOnlyStore {
        fn name(&self) -> &str {
            "read-only"
        }
        fn keys(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn clear(&self) -> Result<()> {
            Ok(())
        }
        fn remove(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        fn read(&self, _id: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn write(&self, _meta: &RecordMeta, _data: &[u8]) -> Result<()> {
            Err(Error::StoreUnavailable("read-only".into()))
        }
    }

    #[test]
    fn test_idle_swap_respects_floor_and_access() {
        let f = fixture(
            PersistenceConfig::new()
                .with_max_idle_swap(Duration::from_secs(50))
                .with_min_idle_swap(Duration::from_secs(10)),
        );
        let c = &f.coordinator;
        let idle = c.create_session(Some("idle")).unwrap();
        let busy = c.create_session(Some("busy")).unwrap();
        let _guard = busy.begin_access();
        drop(idle);

        f.clock.advance(Duration::from_secs(100));
        assert_eq!(c.process_max_idle_swaps(), 1);
        assert!(!c.is_loaded("idle"));
        assert!(c.is_loaded("busy"));
        assert_eq!(c.store().keys().unwrap(), vec!["idle".to_string()]);
    }

    #[test]
    fn test_capacity_eviction_lru() {
        let f = fixture(PersistenceConfig::new().with_max_active_sessions(2));
        let c = &f.coordinator;
        for id in ["a", "b", "c", "d"] {
            c.create_session(Some(id)).unwrap();
            f.clock.advance(Duration::from_secs(1));
        }
        c.find_session("a").unwrap().access();
        c.find_session("a").unwrap().end_access();

        assert_eq!(c.process_max_active_swaps(), 2);
        assert!(c.is_loaded("a"));
        assert!(c.is_loaded("d"));
        assert_eq!(c.store().keys().unwrap(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_capacity_eviction_only_takes_eligible_sessions() {
        let f = fixture(
            PersistenceConfig::new()
                .with_max_active_sessions(1)
                .with_min_idle_swap(Duration::from_secs(30)),
        );
        let c = &f.coordinator;
        c.create_session(Some("old")).unwrap();
        f.clock.advance(Duration::from_secs(60));
        c.create_session(Some("new1")).unwrap();
        c.create_session(Some("new2")).unwrap();

        assert_eq!(c.process_max_active_swaps(), 1);
        assert_eq!(c.registry().active_count(), 2);
        assert!(!c.is_loaded("old"));
    }

    #[test]
    fn test_backup_is_write_through_and_deduplicated() {
        let f = fixture(PersistenceConfig::new().with_max_idle_backup(Duration::from_secs(5)));
        let c = &f.coordinator;
        let session = c.create_session(Some("s")).unwrap();

        f.clock.advance(Duration::from_secs(10));
        assert_eq!(c.process_max_idle_backups(), 1);
        assert!(c.is_loaded("s"));
        assert_eq!(c.store().size().unwrap(), 1);
        assert_eq!(c.process_max_idle_backups(), 0);

        session.access();
        session.end_access();
        f.clock.advance(Duration::from_secs(10));
        assert_eq!(c.process_max_idle_backups(), 1);
    }

    #[test]
    fn test_failed_swap_out_keeps_session_resident() {
        let registry = SessionRegistry::new(
            RegistryConfig::new().with_ids(IdConfig::default().with_random_file(None)),
            Arc::new(SessionContext::new("test")),
        );
        let c = PersistenceCoordinator::new(registry, Arc::new(ReadOnlyStore), PersistenceConfig::new());
        let session = c.create_session(Some("s")).unwrap();
        session.set_attribute("k", "v").unwrap();

        let err = c.swap_out(Arc::clone(&session)).unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(c.is_loaded("s"));
        assert!(session.is_valid());
        assert!(session.get_attribute("k").unwrap().is_some());
    }

    #[test]
    fn test_tick_swaps_before_backing_up() {
        let f = fixture(
            PersistenceConfig::new()
                .with_max_idle_swap(Duration::from_secs(10))
                .with_max_idle_backup(Duration::from_secs(5)),
        );
        let c = &f.coordinator;
        c.create_session(Some("s")).unwrap();
        f.clock.advance(Duration::from_secs(20));

        let report = c.tick();
        assert_eq!(report.idle_swapped, 1);
        assert_eq!(report.backed_up, 0);
        assert!(!c.is_loaded("s"));
        assert_eq!(c.store().keys().unwrap(), vec!["s".to_string()]);
    }

    #[test]
    fn test_find_and_access_holds_session_against_swap() {
        let f = fixture(PersistenceConfig::new().with_max_idle_swap(Duration::from_secs(10)));
        let c = &f.coordinator;
        let session = c.create_session(Some("s")).unwrap();
        assert!(c.swap_out(session).unwrap());

        let guard = c.find_and_access("s").unwrap();
        assert_eq!(guard.access_count(), 1);
        assert_eq!(guard.state(), SessionState::Active);

        f.clock.advance(Duration::from_secs(60));
        assert_eq!(c.tick().idle_swapped, 0);
        assert!(!c.swap_out(Arc::clone(guard.session())).unwrap());
        assert!(c.is_loaded("s"));

        drop(guard);
        assert_eq!(c.tick().idle_swapped, 1);
        assert!(c.find_and_access("missing").is_none());
    }

    #[test]
    fn test_swap_in_makes_session_resident_and_not_new() {
        let f = fixture(PersistenceConfig::new());
        let c = &f.coordinator;
        let session = c.create_session(Some("s")).unwrap();
        session.set_attribute("count", 1i64).unwrap();
        assert!(c.swap_out(session).unwrap());
        assert!(!c.is_loaded("s"));

        let restored = c.find_session("s").unwrap();
        assert!(restored.is_valid());
        assert!(!restored.is_new());
        assert_eq!(restored.access_count(), 0);
        assert!(c.is_loaded("s"));
        assert!(c.store().keys().unwrap().is_empty());
        assert_eq!(f.created.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_expired_stored_session_is_discarded() {
        let f = fixture(PersistenceConfig::new());
        let c = &f.coordinator;
        let session = c.create_session(Some("s")).unwrap();
        session.set_max_inactive_interval(60);
        c.swap_out(session).unwrap();

        f.clock.advance(Duration::from_secs(120));
        assert!(c.find_session("s").is_none());
        assert!(c.store().keys().unwrap().is_empty());
        assert_eq!(c.stats().expired, 1);
    }

    #[test]
    fn test_corrupt_record_is_removed_on_lookup() {
        let f = fixture(PersistenceConfig::new());
        let c = &f.coordinator;
        let meta = RecordMeta {
            id: "bad".into(),
            valid: true,
            max_inactive_secs: 60,
            last_accessed_ms: 0,
        };
        c.store().write(&meta, b"{not json").unwrap();

        assert!(c.find_session("bad").is_none());
        assert!(c.store().keys().unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_lookups_swap_in_once() {
        let f = fixture(PersistenceConfig::new());
        let c = f.coordinator.clone();
        let session = c.create_session(Some("s")).unwrap();
        c.swap_out(session).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || c.find_session("s").unwrap())
            })
            .collect();
        let found: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(found.iter().all(|s| Arc::ptr_eq(s, &found[0])));
        assert_eq!(f.created.0.load(Ordering::SeqCst), 2);
        assert!(c.inner.swap_in_locks.lock().is_empty());
    }

    #[test]
    fn test_expiring_resident_session_removes_backup() {
        let f = fixture(PersistenceConfig::new().with_max_idle_backup(Duration::ZERO));
        let c = &f.coordinator;
        let session = c.create_session(Some("s")).unwrap();
        c.process_max_idle_backups();
        assert_eq!(c.store().size().unwrap(), 1);

        session.invalidate().unwrap();
        assert_eq!(c.store().size().unwrap(), 0);
        assert!(!c.is_loaded("s"));
    }

    #[test]
    fn test_stop_without_save_expires_everything() {
        let f = fixture(PersistenceConfig::new().with_save_on_restart(false));
        let c = &f.coordinator;
        c.create_session(None).unwrap();
        c.create_session(None).unwrap();

        c.stop();
        assert_eq!(c.registry().active_count(), 0);
        assert_eq!(c.store().size().unwrap(), 0);
        assert_eq!(c.stats().expired, 2);
    }

    #[test]
    fn test_tick_runs_policies_and_throttled_sweeps() {
        let f = fixture(
            PersistenceConfig::new()
                .with_max_idle_swap(Duration::from_secs(50))
                .with_max_idle_backup(Duration::from_secs(20)),
        );
        let c = &f.coordinator;
        let swapped = c.create_session(Some("swapped")).unwrap();
        drop(swapped);
        f.clock.advance(Duration::from_secs(30));
        c.create_session(Some("backed")).unwrap();
        f.clock.advance(Duration::from_secs(25));

        let report = c.tick();
        assert_eq!(report.idle_swapped, 1);
        assert_eq!(report.capacity_swapped, 0);
        assert_eq!(report.backed_up, 1);
        assert!(!report.swept);

        for _ in 0..4 {
            assert!(!c.tick().swept);
        }
        assert!(c.tick().swept);
    }
}
