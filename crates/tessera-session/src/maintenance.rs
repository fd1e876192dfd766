//! Background driver for periodic maintenance ticks.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::coordinator::PersistenceCoordinator;

/// Runs [`PersistenceCoordinator::tick`] on a fixed interval.
///
/// Each tick runs on the blocking pool and the next one is not scheduled
/// until it returns, so ticks never overlap.
pub struct MaintenanceTask {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MaintenanceTask {
    /// Spawn the driver on the current tokio runtime.
    pub fn spawn(coordinator: PersistenceCoordinator, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // pass happens one interval after start.
            ticker.tick().await;
            debug!(interval_ms = interval.as_millis() as u64, "Session maintenance started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let coordinator = coordinator.clone();
                        match tokio::task::spawn_blocking(move || coordinator.tick()).await {
                            Ok(report) => {
                                if report != Default::default() {
                                    debug!(?report, "Session maintenance tick");
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "Session maintenance tick panicked");
                            }
                        }
                    }
                }
            }
            debug!("Session maintenance stopped");
        });
        Self {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// Stop the driver and wait for an in-flight tick to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Session maintenance task failed");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for MaintenanceTask {
    fn drop(&mut self) {
        if self.shutdown.is_some() {
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{PersistenceConfig, RegistryConfig};
    use crate::context::SessionContext;
    use crate::id::IdConfig;
    use crate::registry::SessionRegistry;
    use crate::store::{FileStore, FileStoreConfig, StoreBackend};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_driver_swaps_idle_sessions() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let context = SessionContext::new("test").with_clock(clock.clone());
        let registry = SessionRegistry::new(
            RegistryConfig::new().with_ids(IdConfig::default().with_random_file(None)),
            Arc::new(context),
        );
        let store: Arc<dyn StoreBackend> =
            Arc::new(FileStore::new(FileStoreConfig::new(dir.path())).unwrap());
        let coordinator = PersistenceCoordinator::new(
            registry,
            Arc::clone(&store),
            PersistenceConfig::new().with_max_idle_swap(Duration::from_secs(60)),
        );
        coordinator.create_session(Some("s1")).unwrap();
        clock.advance(Duration::from_secs(120));

        let task = MaintenanceTask::spawn(coordinator.clone(), Duration::from_millis(10));
        for _ in 0..200 {
            if !coordinator.is_loaded("s1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.shutdown().await;

        assert!(!coordinator.is_loaded("s1"));
        assert_eq!(store.keys().unwrap(), vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_task() {
        let registry = SessionRegistry::new(RegistryConfig::new(), Arc::new(SessionContext::default()));
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileStore::new(FileStoreConfig::new(dir.path())).unwrap());
        let coordinator = PersistenceCoordinator::new(registry, store, PersistenceConfig::new());

        let task = MaintenanceTask::spawn(coordinator, Duration::from_secs(3600));
        assert!(!task.is_finished());
        task.shutdown().await;
    }
}
