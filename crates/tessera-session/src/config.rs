//! Configuration for the session registry and persistence policies.

use std::time::Duration;

use crate::id::IdConfig;

/// Default session timeout in seconds (30 minutes).
pub const DEFAULT_MAX_INACTIVE_SECS: i32 = 1800;

/// Default number of ticks between expiration sweeps.
pub const DEFAULT_PROCESS_EXPIRES_FREQUENCY: u32 = 6;

/// Default number of recycled sessions kept for reuse.
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Default interval between maintenance ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for the session registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Timeout assigned to new sessions, in seconds. Negative values mean
    /// sessions never time out.
    pub max_inactive_secs: i32,

    /// Only every Nth call to `tick()` runs an expiration sweep.
    pub process_expires_frequency: u32,

    /// Refuse new sessions once this many are resident.
    pub session_limit: Option<usize>,

    /// Maximum number of recycled sessions kept for reuse.
    pub pool_size: usize,

    /// Identifier generation settings.
    pub ids: IdConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_inactive_secs: DEFAULT_MAX_INACTIVE_SECS,
            process_expires_frequency: DEFAULT_PROCESS_EXPIRES_FREQUENCY,
            session_limit: None,
            pool_size: DEFAULT_POOL_SIZE,
            ids: IdConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_inactive_secs(mut self, secs: i32) -> Self {
        self.max_inactive_secs = secs;
        self
    }

    pub fn with_process_expires_frequency(mut self, frequency: u32) -> Self {
        self.process_expires_frequency = frequency;
        self
    }

    pub fn with_session_limit(mut self, limit: usize) -> Self {
        self.session_limit = Some(limit);
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_ids(mut self, ids: IdConfig) -> Self {
        self.ids = ids;
        self
    }
}

/// Order in which capacity eviction considers resident sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionOrder {
    /// Least recently accessed first.
    #[default]
    Lru,
    /// Registry enumeration order, unsorted.
    Enumeration,
}

/// Thresholds for the swap, backup and capacity policies.
///
/// Every threshold is optional; `None` disables the policy.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Write idle sessions through to the store without evicting them.
    pub max_idle_backup: Option<Duration>,

    /// Swap out sessions idle at least this long.
    pub max_idle_swap: Option<Duration>,

    /// Sessions must be idle longer than this to be swapped for any reason.
    pub min_idle_swap: Option<Duration>,

    /// Swap out sessions while more than this many are resident.
    pub max_active_sessions: Option<usize>,

    /// Ordering used by capacity eviction.
    pub eviction_order: EvictionOrder,

    /// Restore all stored sessions on start and persist all resident ones on stop.
    pub save_on_restart: bool,

    /// Interval for the background maintenance task.
    pub tick_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_idle_backup: None,
            max_idle_swap: None,
            min_idle_swap: None,
            max_active_sessions: None,
            eviction_order: EvictionOrder::default(),
            save_on_restart: true,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl PersistenceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_idle_backup(mut self, idle: Duration) -> Self {
        self.max_idle_backup = Some(idle);
        self
    }

    pub fn with_max_idle_swap(mut self, idle: Duration) -> Self {
        self.max_idle_swap = Some(idle);
        self
    }

    pub fn with_min_idle_swap(mut self, idle: Duration) -> Self {
        self.min_idle_swap = Some(idle);
        self
    }

    pub fn with_max_active_sessions(mut self, max: usize) -> Self {
        self.max_active_sessions = Some(max);
        self
    }

    pub fn with_eviction_order(mut self, order: EvictionOrder) -> Self {
        self.eviction_order = order;
        self
    }

    pub fn with_save_on_restart(mut self, enabled: bool) -> Self {
        self.save_on_restart = enabled;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Whether a session idle for `idle` is past the swap floor.
    pub(crate) fn above_swap_floor(&self, idle: Duration) -> bool {
        match self.min_idle_swap {
            Some(min) => idle > min,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_policies() {
        let config = PersistenceConfig::default();
        assert!(config.max_idle_backup.is_none());
        assert!(config.max_idle_swap.is_none());
        assert!(config.max_active_sessions.is_none());
        assert_eq!(config.eviction_order, EvictionOrder::Lru);
    }

    #[test]
    fn test_swap_floor_is_strict() {
        let config = PersistenceConfig::new().with_min_idle_swap(Duration::from_secs(10));
        assert!(!config.above_swap_floor(Duration::from_secs(10)));
        assert!(config.above_swap_floor(Duration::from_secs(11)));
        assert!(PersistenceConfig::new().above_swap_floor(Duration::ZERO));
    }

    #[test]
    fn test_registry_builder() {
        let config = RegistryConfig::new()
            .with_max_inactive_secs(-1)
            .with_session_limit(5)
            .with_pool_size(0);
        assert_eq!(config.max_inactive_secs, -1);
        assert_eq!(config.session_limit, Some(5));
        assert_eq!(config.pool_size, 0);
    }
}
