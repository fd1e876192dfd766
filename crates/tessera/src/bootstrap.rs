//! Assemble a running session engine from [`TesseraConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tessera_config::{
    EvictionOrder as ConfigEvictionOrder, IdAlgorithm, IdConfig as ConfigIds,
    PersistenceConfig as ConfigPersistence, SessionConfig, StoreConfig, StoreKind, TesseraConfig,
};
use tessera_session::{
    AccessGuard, DigestAlgorithm, EvictionOrder, FileStore, FileStoreConfig, IdConfig,
    MaintenanceTask, PersistenceConfig, PersistenceCoordinator, RegistryConfig, Session,
    SessionContext, SessionRegistry, SqlColumns, SqlStore, SqlStoreConfig, StoreBackend,
};
use tracing::{info, warn};

use crate::error::{EngineError, Result};

/// Registry settings from `[session]`.
pub fn registry_config(session: &SessionConfig) -> RegistryConfig {
    let mut config = RegistryConfig::new()
        .with_max_inactive_secs(session.max_inactive_interval_secs)
        .with_process_expires_frequency(session.process_expires_frequency)
        .with_pool_size(session.pool_size)
        .with_ids(id_config(&session.ids));
    if let Some(limit) = session.session_limit {
        config = config.with_session_limit(limit);
    }
    config
}

fn id_config(ids: &ConfigIds) -> IdConfig {
    let algorithm = match ids.algorithm {
        IdAlgorithm::Sha224 => DigestAlgorithm::Sha224,
        IdAlgorithm::Sha256 => DigestAlgorithm::Sha256,
        IdAlgorithm::Sha384 => DigestAlgorithm::Sha384,
        IdAlgorithm::Sha512 => DigestAlgorithm::Sha512,
    };
    let mut config = IdConfig::default()
        .with_algorithm(algorithm)
        .with_length_bytes(ids.length_bytes);
    // Unset keeps the platform random device.
    if let Some(path) = &ids.random_file {
        config = config.with_random_file(Some(path.clone()));
    }
    if let Some(entropy) = &ids.entropy {
        config = config.with_entropy(entropy.clone());
    }
    if let Some(route) = &ids.route {
        config = config.with_route(route.clone());
    }
    config
}

/// Policy thresholds from `[persistence]`.
pub fn persistence_config(persistence: &ConfigPersistence) -> PersistenceConfig {
    let mut config = PersistenceConfig::new()
        .with_save_on_restart(persistence.save_on_restart)
        .with_tick_interval(persistence.tick_interval())
        .with_eviction_order(match persistence.eviction_order {
            ConfigEvictionOrder::Lru => EvictionOrder::Lru,
            ConfigEvictionOrder::Enumeration => EvictionOrder::Enumeration,
        });
    if let Some(idle) = persistence.max_idle_backup() {
        config = config.with_max_idle_backup(idle);
    }
    if let Some(idle) = persistence.max_idle_swap() {
        config = config.with_max_idle_swap(idle);
    }
    if let Some(idle) = persistence.min_idle_swap() {
        config = config.with_min_idle_swap(idle);
    }
    if let Some(max) = persistence.max_active_sessions() {
        config = config.with_max_active_sessions(max);
    }
    config
}

/// Open the configured store. Relative paths resolve against `work_dir`,
/// or the current directory when it is `None`.
pub fn open_store(store: &StoreConfig, work_dir: Option<&Path>) -> Result<Arc<dyn StoreBackend>> {
    match store.kind {
        StoreKind::File => {
            let mut config =
                FileStoreConfig::new(&store.file.directory).with_extension(&store.file.extension);
            if let Some(dir) = work_dir {
                config = config.with_work_dir(dir);
            }
            Ok(Arc::new(FileStore::new(config)?))
        }
        StoreKind::Sql => {
            let sql = &store.sql;
            let path = match work_dir {
                Some(dir) if sql.path.is_relative() => dir.join(&sql.path),
                _ => sql.path.clone(),
            };
            let mut config = SqlStoreConfig::new(path, &sql.app_name)
                .with_table(&sql.table)
                .with_columns(SqlColumns {
                    id: sql.id_column.clone(),
                    app: sql.app_column.clone(),
                    data: sql.data_column.clone(),
                    valid: sql.valid_column.clone(),
                    max_inactive: sql.max_inactive_column.clone(),
                    last_access: sql.last_access_column.clone(),
                })
                .with_create_schema(sql.create_schema);
            config.busy_timeout = std::time::Duration::from_millis(sql.busy_timeout_ms);
            Ok(Arc::new(SqlStore::new(config)?))
        }
    }
}

/// Builder for [`SessionEngine`].
pub struct EngineBuilder {
    config: TesseraConfig,
    context: SessionContext,
    work_dir: Option<PathBuf>,
}

impl EngineBuilder {
    /// Context carrying listeners, the value resolver and the clock.
    /// `[session].distributable` is applied on top of it.
    pub fn context(mut self, context: SessionContext) -> Self {
        self.context = context;
        self
    }

    /// Base directory for relative store paths.
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<SessionEngine> {
        self.config.validate()?;

        let session = self.config.session();
        let distributable = self.context.is_distributable() || session.distributable;
        let context = Arc::new(self.context.with_distributable(distributable));
        let registry = SessionRegistry::new(registry_config(&session), context);

        let store = open_store(&self.config.store(), self.work_dir.as_deref())?;
        let coordinator =
            PersistenceCoordinator::new(registry, store, persistence_config(&self.config.persistence()));

        Ok(SessionEngine {
            coordinator,
            task: None,
        })
    }
}

/// A session registry, its store and the background maintenance driver.
///
/// Call [`SessionEngine::start`] from inside a tokio runtime, and
/// [`SessionEngine::shutdown`] to persist resident sessions on the way out.
pub struct SessionEngine {
    coordinator: PersistenceCoordinator,
    task: Option<MaintenanceTask>,
}

impl SessionEngine {
    pub fn builder(config: TesseraConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            context: SessionContext::default(),
            work_dir: None,
        }
    }

    pub fn coordinator(&self) -> &PersistenceCoordinator {
        &self.coordinator
    }

    pub fn registry(&self) -> &SessionRegistry {
        self.coordinator.registry()
    }

    pub fn create_session(&self, id: Option<&str>) -> Result<Arc<Session>> {
        Ok(self.coordinator.create_session(id)?)
    }

    /// Resident or stored session by id.
    pub fn find_session(&self, id: &str) -> Option<Arc<Session>> {
        self.coordinator.find_session(id)
    }

    /// Look up a session and hold it for the duration of a request.
    pub fn find_and_access(&self, id: &str) -> Option<AccessGuard> {
        self.coordinator.find_and_access(id)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Restore stored sessions and spawn the maintenance driver.
    ///
    /// Returns the number of sessions restored.
    pub fn start(&mut self) -> Result<usize> {
        if self.task.is_some() {
            return Err(EngineError::AlreadyStarted);
        }
        tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let restored = self.coordinator.start();
        let interval = self.coordinator.config().tick_interval;
        self.task = Some(MaintenanceTask::spawn(self.coordinator.clone(), interval));
        info!(
            restored,
            store = self.coordinator.store().name(),
            "Session engine started"
        );
        Ok(restored)
    }

    /// Stop the driver, then persist or expire resident sessions.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.shutdown().await;
        }
        let coordinator = self.coordinator.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || coordinator.stop()).await {
            warn!(error = %e, "Session engine stop failed");
        }
        info!("Session engine stopped");
    }
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("coordinator", &self.coordinator)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_negative_thresholds_stay_disabled() {
        let config = TesseraConfig::from_toml(
            "[persistence]\nmax_idle_swap_secs = 120\nmax_active_sessions = 0",
        )
        .unwrap();
        let mapped = persistence_config(&config.persistence());
        assert_eq!(mapped.max_idle_swap, Some(Duration::from_secs(120)));
        assert_eq!(mapped.max_idle_backup, None);
        assert_eq!(mapped.min_idle_swap, None);
        assert_eq!(mapped.max_active_sessions, Some(0));
        assert_eq!(mapped.tick_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_session_section_maps_to_registry() {
        let config = TesseraConfig::from_toml(
            r#"
[session]
max_inactive_interval_secs = -1
session_limit = 3

[session.ids]
algorithm = "sha384"
length_bytes = 8
route = "a1"
"#,
        )
        .unwrap();
        let mapped = registry_config(&config.session());
        assert_eq!(mapped.max_inactive_secs, -1);
        assert_eq!(mapped.session_limit, Some(3));
        assert_eq!(mapped.ids.algorithm, DigestAlgorithm::Sha384);
        assert_eq!(mapped.ids.length_bytes, 8);
        assert_eq!(mapped.ids.route.as_deref(), Some("a1"));
        assert_eq!(mapped.ids.random_file, IdConfig::default().random_file);
    }

    #[test]
    fn test_start_requires_runtime() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut engine = SessionEngine::builder(TesseraConfig::new())
            .work_dir(dir.path())
            .build()
            .unwrap();
        assert!(matches!(engine.start(), Err(EngineError::NoRuntime)));
        assert!(!engine.is_running());
    }
}
