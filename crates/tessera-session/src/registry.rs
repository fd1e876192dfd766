//! Registry of resident sessions.
//!
//! The registry owns the id→session map, generates identifiers, tracks
//! aggregate statistics and runs throttled expiration sweeps. It is cheap
//! to clone; clones share the same state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::RegistryConfig;
use crate::context::SessionContext;
use crate::error::{Error, Result};
use crate::id::IdGenerator;
use crate::session::Session;

/// Callback invoked with the id of every session that expires with
/// notifications enabled.
pub type ExpiryHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Snapshot of registry counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Currently resident sessions.
    pub active: usize,
    /// Highest resident count observed.
    pub peak_active: usize,
    /// Sessions created by this registry.
    pub created: u64,
    /// Sessions that have expired.
    pub expired: u64,
    /// Creations refused by the session limit.
    pub rejected: u64,
    /// Generated ids that collided with a live session and were re-rolled.
    pub duplicates: u64,
    /// Longest lifetime among expired sessions.
    pub max_alive: Duration,
    /// Mean lifetime of expired sessions.
    pub average_alive: Duration,
    /// Wall time spent in the most recent expiration sweep.
    pub last_sweep: Duration,
}

#[derive(Debug, Default)]
struct Aggregates {
    peak_active: usize,
    created: u64,
    expired: u64,
    rejected: u64,
    duplicates: u64,
    max_alive: Duration,
    average_alive_ms: u128,
    last_sweep: Duration,
}

/// Map and id generator share a lock so a generated id cannot race a
/// concurrent insert of the same id.
struct Resident {
    sessions: HashMap<String, Arc<Session>>,
    ids: IdGenerator,
}

impl Resident {
    fn unique_id(&mut self, duplicates: &mut u64) -> String {
        loop {
            let candidate = self.ids.generate();
            if !self.sessions.contains_key(&candidate) {
                return candidate;
            }
            *duplicates += 1;
        }
    }
}

pub(crate) struct RegistryShared {
    this: Weak<RegistryShared>,
    config: RegistryConfig,
    default_max_inactive: AtomicI32,
    resident: Mutex<Resident>,
    stats: Mutex<Aggregates>,
    ticks: AtomicU64,
    pool: Mutex<Vec<Arc<Session>>>,
    expiry_hook: Mutex<Option<ExpiryHook>>,
    context: Arc<SessionContext>,
}

impl RegistryShared {
    /// Called by a session part-way through its own expiration.
    pub(crate) fn session_expired(&self, id: &str, session: &Session, alive: Duration, notify: bool) {
        {
            let mut stats = self.stats.lock();
            stats.expired += 1;
            let n = u128::from(stats.expired);
            if alive > stats.max_alive {
                stats.max_alive = alive;
            }
            stats.average_alive_ms = (stats.average_alive_ms * (n - 1) + alive.as_millis()) / n;
        }
        self.remove_if_same(id, session);
        if notify {
            let hook = self.expiry_hook.lock().clone();
            if let Some(hook) = hook {
                hook(id);
            }
        }
    }

    /// Remove `id` only if it maps to this exact session object.
    pub(crate) fn remove_if_same(&self, id: &str, session: &Session) -> bool {
        let mut resident = self.resident.lock();
        let same = resident
            .sessions
            .get(id)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session));
        if same {
            resident.sessions.remove(id);
        }
        same
    }

    fn allocate(&self) -> Arc<Session> {
        if let Some(session) = self.pool.lock().pop() {
            return session;
        }
        Arc::new(Session::new(Arc::clone(&self.context), self.this.clone()))
    }
}

/// Registry of resident sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl SessionRegistry {
    /// Create an empty registry owning its own id generator.
    pub fn new(config: RegistryConfig, context: Arc<SessionContext>) -> Self {
        let shared = Arc::new_cyclic(|this| RegistryShared {
            this: this.clone(),
            default_max_inactive: AtomicI32::new(config.max_inactive_secs),
            resident: Mutex::new(Resident {
                sessions: HashMap::new(),
                ids: IdGenerator::new(config.ids.clone()),
            }),
            stats: Mutex::new(Aggregates::default()),
            ticks: AtomicU64::new(0),
            pool: Mutex::new(Vec::new()),
            expiry_hook: Mutex::new(None),
            context,
            config,
        });
        Self { shared }
    }

    /// Configuration the registry was built with.
    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    /// Context shared with every session.
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.shared.context
    }

    /// Timeout assigned to sessions created from now on, in seconds.
    pub fn default_max_inactive(&self) -> i32 {
        self.shared.default_max_inactive.load(Ordering::Acquire)
    }

    /// Apply a changed session-timeout setting from the container.
    ///
    /// Only sessions created afterwards are affected.
    pub fn set_default_max_inactive(&self, secs: i32) {
        let previous = self.shared.default_max_inactive.swap(secs, Ordering::AcqRel);
        if previous != secs {
            debug!(previous, current = secs, "Session timeout changed");
        }
    }

    /// Install the callback run when a session expires with notifications.
    pub fn set_expiry_hook(&self, hook: ExpiryHook) {
        *self.shared.expiry_hook.lock() = Some(hook);
    }

    /// Generate an id not currently used by a resident session.
    pub fn generate_id(&self) -> String {
        let mut duplicates = 0;
        let id = self.shared.resident.lock().unique_id(&mut duplicates);
        if duplicates > 0 {
            self.shared.stats.lock().duplicates += duplicates;
        }
        id
    }

    /// Create and register a new session.
    ///
    /// A generated id is used when `id` is `None`. Fails with
    /// [`Error::CapacityExceeded`] when a session limit is configured and
    /// reached.
    pub fn create_session(&self, id: Option<&str>) -> Result<Arc<Session>> {
        let shared = &self.shared;
        let mut duplicates = 0;
        let (session, active) = {
            let mut resident = shared.resident.lock();
            if let Some(limit) = shared.config.session_limit
                && resident.sessions.len() >= limit
            {
                drop(resident);
                shared.stats.lock().rejected += 1;
                debug!(limit, "Session creation refused");
                return Err(Error::CapacityExceeded { limit });
            }
            let id = match id {
                Some(id) if resident.sessions.contains_key(id) => {
                    return Err(Error::DuplicateId(id.to_string()));
                }
                Some(id) => id.to_string(),
                None => resident.unique_id(&mut duplicates),
            };
            let session = shared.allocate();
            session.initialize(id.clone(), self.default_max_inactive());
            resident.sessions.insert(id, Arc::clone(&session));
            (session, resident.sessions.len())
        };
        {
            let mut stats = shared.stats.lock();
            stats.created += 1;
            stats.duplicates += duplicates;
            stats.peak_active = stats.peak_active.max(active);
        }
        trace!(session_id = %session.id(), active, "Session created");
        session.tell_new();
        Ok(session)
    }

    /// A blank, unregistered session bound to this registry, to be filled
    /// from a stored record.
    pub fn create_empty_session(&self) -> Arc<Session> {
        self.shared.allocate()
    }

    /// Register an existing session under its id.
    pub fn add(&self, session: Arc<Session>) {
        let active = {
            let mut resident = self.shared.resident.lock();
            resident.sessions.insert(session.id(), session);
            resident.sessions.len()
        };
        let mut stats = self.shared.stats.lock();
        stats.peak_active = stats.peak_active.max(active);
    }

    /// Resident session by id. Never consults a store.
    pub fn find(&self, id: &str) -> Option<Arc<Session>> {
        self.shared.resident.lock().sessions.get(id).cloned()
    }

    /// Whether a session with `id` is in memory.
    pub fn is_resident(&self, id: &str) -> bool {
        self.shared.resident.lock().sessions.contains_key(id)
    }

    /// Remove `session` from the map. Another session object registered
    /// under the same id is left alone.
    pub fn remove(&self, session: &Session) -> bool {
        self.shared.remove_if_same(&session.id(), session)
    }

    /// Snapshot of all resident sessions.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.shared.resident.lock().sessions.values().cloned().collect()
    }

    /// Number of resident sessions.
    pub fn active_count(&self) -> usize {
        self.shared.resident.lock().sessions.len()
    }

    /// Re-key a resident session under a freshly generated id.
    pub fn change_session_id(&self, session: &Arc<Session>) -> String {
        let old_id = session.id();
        let mut duplicates = 0;
        let new_id = {
            let mut resident = self.shared.resident.lock();
            let new_id = resident.unique_id(&mut duplicates);
            if resident
                .sessions
                .get(&old_id)
                .is_some_and(|s| Arc::ptr_eq(s, session))
            {
                resident.sessions.remove(&old_id);
            }
            session.set_id(new_id.clone());
            resident.sessions.insert(new_id.clone(), Arc::clone(session));
            new_id
        };
        if duplicates > 0 {
            self.shared.stats.lock().duplicates += duplicates;
        }
        debug!(old_id = %old_id, new_id = %new_id, "Session id changed");
        new_id
    }

    /// Clear a session and keep it for reuse if nothing else references it.
    pub fn recycle(&self, session: Arc<Session>) {
        session.recycle();
        if Arc::strong_count(&session) == 1 {
            let mut pool = self.shared.pool.lock();
            if pool.len() < self.shared.config.pool_size {
                pool.push(session);
            }
        }
    }

    /// Check every resident session for expiry. Returns how many expired.
    pub fn sweep_expired(&self) -> usize {
        let started = Instant::now();
        let sessions = self.all();
        let checked = sessions.len();
        let expired = sessions.iter().filter(|s| !s.is_valid()).count();
        let elapsed = started.elapsed();
        self.shared.stats.lock().last_sweep = elapsed;
        debug!(
            checked,
            expired,
            elapsed_ms = elapsed.as_millis() as u64,
            "Expiration sweep complete"
        );
        expired
    }

    /// Advance the tick counter; every Nth tick runs [`sweep_expired`].
    ///
    /// Returns whether a sweep ran.
    ///
    /// [`sweep_expired`]: Self::sweep_expired
    pub fn tick(&self) -> bool {
        let frequency = u64::from(self.shared.config.process_expires_frequency.max(1));
        let count = self.shared.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        if count % frequency == 0 {
            self.sweep_expired();
            true
        } else {
            false
        }
    }

    /// Snapshot of the counters and aggregates.
    pub fn stats(&self) -> RegistryStats {
        let active = self.active_count();
        let stats = self.shared.stats.lock();
        RegistryStats {
            active,
            peak_active: stats.peak_active,
            created: stats.created,
            expired: stats.expired,
            rejected: stats.rejected,
            duplicates: stats.duplicates,
            max_alive: stats.max_alive,
            average_alive: Duration::from_millis(stats.average_alive_ms as u64),
            last_sweep: stats.last_sweep,
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("context", &self.shared.context.name())
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::id::IdConfig;
    use std::collections::HashSet;
    use std::thread;

    fn registry_with(config: RegistryConfig) -> (Arc<ManualClock>, SessionRegistry) {
        let clock = Arc::new(ManualClock::starting_now());
        let context = SessionContext::new("test").with_clock(clock.clone());
        let config = config.with_ids(IdConfig::default().with_random_file(None));
        (clock, SessionRegistry::new(config, Arc::new(context)))
    }

    #[test]
    fn test_create_and_find() {
        let (_clock, registry) = registry_with(RegistryConfig::new());
        let session = registry.create_session(None).unwrap();
        let id = session.id();

        assert_eq!(id.len(), 32);
        assert!(session.is_new());
        assert!(session.is_valid());
        assert_eq!(session.max_inactive_secs(), 1800);
        assert!(Arc::ptr_eq(&registry.find(&id).unwrap(), &session));
        assert_eq!(registry.stats().created, 1);
    }

    #[test]
    fn test_create_with_explicit_id() {
        let (_clock, registry) = registry_with(RegistryConfig::new());
        let session = registry.create_session(Some("s1")).unwrap();
        assert_eq!(session.id(), "s1");

        let err = registry.create_session(Some("s1")).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(_)));
    }

    #[test]
    fn test_session_limit_rejects() {
        let (_clock, registry) = registry_with(RegistryConfig::new().with_session_limit(2));
        registry.create_session(None).unwrap();
        registry.create_session(None).unwrap();

        let err = registry.create_session(None).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 2 }));
        assert_eq!(registry.stats().rejected, 1);
        assert_eq!(registry.active_count(), 2);
    }

    #[test]
    fn test_concurrent_creation_yields_unique_ids() {
        let (_clock, registry) = registry_with(RegistryConfig::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| registry.create_session(None).unwrap().id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(ids.insert(id));
            }
        }
        assert_eq!(ids.len(), 400);
        assert_eq!(registry.active_count(), 400);
        assert_eq!(registry.stats().peak_active, 400);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let (_clock, registry) = registry_with(RegistryConfig::new());
        registry.create_session(None).unwrap();
        let snapshot = registry.all();
        registry.create_session(None).unwrap();
        for session in &snapshot {
            registry.remove(session);
        }
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_remove_ignores_other_object_with_same_id() {
        let (_clock, registry) = registry_with(RegistryConfig::new());
        let resident = registry.create_session(Some("dup")).unwrap();
        let stranger = registry.create_empty_session();
        stranger.set_id("dup".to_string());

        assert!(!registry.remove(&stranger));
        assert!(registry.is_resident("dup"));
        assert!(registry.remove(&resident));
        assert!(!registry.is_resident("dup"));
    }

    #[test]
    fn test_sweep_expires_idle_sessions_and_tracks_alive_time() {
        let (clock, registry) = registry_with(RegistryConfig::new().with_max_inactive_secs(60));
        let idle = registry.create_session(None).unwrap();
        let forever = registry.create_session(None).unwrap();
        forever.set_max_inactive_interval(-1);

        clock.advance(Duration::from_secs(61));
        assert_eq!(registry.sweep_expired(), 1);

        assert!(!idle.is_valid());
        assert!(registry.find(&forever.id()).is_some());
        let stats = registry.stats();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.max_alive, Duration::from_secs(61));
        assert_eq!(stats.average_alive, Duration::from_secs(61));
    }

    #[test]
    fn test_average_alive_is_incremental() {
        let (clock, registry) = registry_with(RegistryConfig::new());
        let first = registry.create_session(None).unwrap();
        clock.advance(Duration::from_secs(10));
        first.expire();
        let second = registry.create_session(None).unwrap();
        clock.advance(Duration::from_secs(30));
        second.expire();

        let stats = registry.stats();
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.max_alive, Duration::from_secs(30));
        assert_eq!(stats.average_alive, Duration::from_secs(20));
    }

    #[test]
    fn test_tick_throttles_sweeps() {
        let (clock, registry) = registry_with(
            RegistryConfig::new()
                .with_max_inactive_secs(1)
                .with_process_expires_frequency(3),
        );
        registry.create_session(None).unwrap();
        clock.advance(Duration::from_secs(5));

        assert!(!registry.tick());
        assert!(!registry.tick());
        assert_eq!(registry.active_count(), 1);
        assert!(registry.tick());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_recycled_sessions_are_reused() {
        let (_clock, registry) = registry_with(RegistryConfig::new().with_pool_size(4));
        let session = registry.create_session(None).unwrap();
        let ptr = Arc::as_ptr(&session);
        registry.remove(&session);
        registry.recycle(session);

        let reused = registry.create_session(None).unwrap();
        assert_eq!(Arc::as_ptr(&reused), ptr);
        assert!(reused.is_valid());
        assert!(reused.is_new());
    }

    #[test]
    fn test_change_session_id() {
        let (_clock, registry) = registry_with(RegistryConfig::new());
        let session = registry.create_session(None).unwrap();
        let old_id = session.id();

        let new_id = registry.change_session_id(&session);
        assert_ne!(old_id, new_id);
        assert_eq!(session.id(), new_id);
        assert!(registry.find(&old_id).is_none());
        assert!(registry.find(&new_id).is_some());
    }

    #[test]
    fn test_timeout_change_applies_to_new_sessions() {
        let (_clock, registry) = registry_with(RegistryConfig::new());
        let before = registry.create_session(None).unwrap();
        registry.set_default_max_inactive(120);
        let after = registry.create_session(None).unwrap();

        assert_eq!(before.max_inactive_secs(), 1800);
        assert_eq!(after.max_inactive_secs(), 120);
    }
}
