//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [session]                # registry defaults and limits
//! [session.ids]            # identifier generation
//! [persistence]            # swap, backup and capacity thresholds
//! [store]                  # durable store selection
//! [store.file]
//! [store.sql]
//! [logging]                # tracing output
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Session registry configuration.
    pub session: Option<SessionConfig>,

    /// Swap, backup and capacity policy configuration.
    pub persistence: Option<PersistenceConfig>,

    /// Durable store configuration.
    pub store: Option<StoreConfig>,

    /// Logging configuration.
    pub logging: Option<LoggingConfig>,
}

impl TesseraConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced whole.
    pub fn merge(&mut self, other: TesseraConfig) {
        if other.session.is_some() {
            self.session = other.session;
        }
        if other.persistence.is_some() {
            self.persistence = other.persistence;
        }
        if other.store.is_some() {
            self.store = other.store;
        }
        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Session section, or defaults when absent.
    pub fn session(&self) -> SessionConfig {
        self.session.clone().unwrap_or_default()
    }

    pub fn persistence(&self) -> PersistenceConfig {
        self.persistence.clone().unwrap_or_default()
    }

    pub fn store(&self) -> StoreConfig {
        self.store.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Check values that the schema alone cannot constrain.
    pub fn validate(&self) -> crate::Result<()> {
        let session = self.session();
        if session.process_expires_frequency == 0 {
            return Err(ConfigError::invalid(
                "session.process_expires_frequency",
                "must be at least 1",
            ));
        }
        if session.ids.length_bytes == 0 {
            return Err(ConfigError::invalid(
                "session.ids.length_bytes",
                "must be at least 1",
            ));
        }

        let persistence = self.persistence();
        if persistence.tick_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "persistence.tick_interval_secs",
                "must be at least 1",
            ));
        }
        if let (Some(min), Some(max)) = (persistence.min_idle_swap(), persistence.max_idle_swap())
            && min > max
        {
            return Err(ConfigError::invalid(
                "persistence.min_idle_swap_secs",
                "must not exceed max_idle_swap_secs",
            ));
        }

        let store = self.store();
        if store.kind == StoreKind::Sql && store.sql.app_name.is_empty() {
            return Err(ConfigError::invalid("store.sql.app_name", "must not be empty"));
        }
        if store.kind == StoreKind::File && store.file.extension.is_empty() {
            return Err(ConfigError::invalid("store.file.extension", "must not be empty"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// Session registry configuration.
///
/// ```toml
/// [session]
/// max_inactive_interval_secs = 1800   # negative: never time out
/// process_expires_frequency = 6        # sweep every 6th tick
/// session_limit = 10000                # refuse creation beyond this
/// pool_size = 64
/// distributable = false
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timeout for new sessions in seconds; negative means never.
    pub max_inactive_interval_secs: i32,
    /// Only every Nth maintenance tick runs the expiration sweep.
    pub process_expires_frequency: u32,
    /// Maximum resident sessions before creation is refused.
    pub session_limit: Option<usize>,
    /// Recycled session objects kept for reuse.
    pub pool_size: usize,
    /// Require every attribute value to be serializable.
    pub distributable: bool,
    /// Identifier generation.
    pub ids: IdConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_inactive_interval_secs: 1800,
            process_expires_frequency: 6,
            session_limit: None,
            pool_size: 64,
            distributable: false,
            ids: IdConfig::default(),
        }
    }
}

/// Digest used for session ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdAlgorithm {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

/// Identifier generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    pub algorithm: IdAlgorithm,
    /// Digest bytes per id; the id has twice as many hex characters.
    pub length_bytes: usize,
    /// Randomness source. Defaults to `/dev/urandom` on unix.
    pub random_file: Option<PathBuf>,
    /// Mixed into the fallback generator's seed.
    pub entropy: Option<String>,
    /// Routing suffix appended as `.<route>`.
    pub route: Option<String>,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            algorithm: IdAlgorithm::default(),
            length_bytes: 16,
            random_file: None,
            entropy: None,
            route: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

/// Order in which capacity eviction considers sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionOrder {
    /// Least recently accessed first.
    #[default]
    Lru,
    /// Registry enumeration order.
    Enumeration,
}

/// Swap, backup and capacity thresholds.
///
/// Negative values disable a threshold.
///
/// ```toml
/// [persistence]
/// max_idle_backup_secs = 60
/// max_idle_swap_secs = 600
/// min_idle_swap_secs = 30
/// max_active_sessions = 5000
/// tick_interval_secs = 10
/// save_on_restart = true
/// eviction_order = "lru"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_idle_backup_secs: i64,
    pub max_idle_swap_secs: i64,
    pub min_idle_swap_secs: i64,
    pub max_active_sessions: i64,
    /// Interval between maintenance ticks.
    pub tick_interval_secs: u64,
    /// Restore stored sessions on start and persist resident ones on stop.
    pub save_on_restart: bool,
    pub eviction_order: EvictionOrder,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_idle_backup_secs: -1,
            max_idle_swap_secs: -1,
            min_idle_swap_secs: -1,
            max_active_sessions: -1,
            tick_interval_secs: 10,
            save_on_restart: true,
            eviction_order: EvictionOrder::default(),
        }
    }
}

fn enabled_secs(secs: i64) -> Option<Duration> {
    u64::try_from(secs).ok().map(Duration::from_secs)
}

impl PersistenceConfig {
    pub fn max_idle_backup(&self) -> Option<Duration> {
        enabled_secs(self.max_idle_backup_secs)
    }

    pub fn max_idle_swap(&self) -> Option<Duration> {
        enabled_secs(self.max_idle_swap_secs)
    }

    pub fn min_idle_swap(&self) -> Option<Duration> {
        enabled_secs(self.min_idle_swap_secs)
    }

    pub fn max_active_sessions(&self) -> Option<usize> {
        usize::try_from(self.max_active_sessions).ok()
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// One file per session.
    #[default]
    File,
    /// One row per session in SQLite.
    Sql,
}

/// Durable store configuration.
///
/// ```toml
/// [store]
/// kind = "sql"
///
/// [store.sql]
/// path = "/var/lib/tessera/sessions.db"
/// app_name = "shop"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub file: FileStoreConfig,
    pub sql: SqlStoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreConfig {
    /// Directory for session files, relative to the working directory
    /// unless absolute.
    pub directory: PathBuf,
    pub extension: String,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("sessions"),
            extension: "session".to_string(),
        }
    }
}

/// SQLite store configuration. Table and column names are configurable so
/// an existing schema can be reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlStoreConfig {
    pub path: PathBuf,
    /// Scopes every row; several deployments may share a table.
    pub app_name: String,
    pub table: String,
    pub id_column: String,
    pub app_column: String,
    pub data_column: String,
    pub valid_column: String,
    pub max_inactive_column: String,
    pub last_access_column: String,
    /// Create the table if it does not exist.
    pub create_schema: bool,
    pub busy_timeout_ms: u64,
}

impl Default for SqlStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sessions.db"),
            app_name: "tessera".to_string(),
            table: "sessions".to_string(),
            id_column: "id".to_string(),
            app_column: "app".to_string(),
            data_column: "data".to_string(),
            valid_column: "valid".to_string(),
            max_inactive_column: "maxinactive".to_string(),
            last_access_column: "lastaccess".to_string(),
            create_schema: true,
            busy_timeout_ms: 5000,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Logging configuration.
///
/// ```toml
/// [logging]
/// level = "tessera_session=debug,info"
/// json = true
/// directory = "/var/log/tessera"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Write daily rolling log files here instead of stderr.
    pub directory: Option<PathBuf>,
    /// File name prefix for rolling log files.
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
            file_prefix: "tessera.log".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config = TesseraConfig::from_toml("").unwrap();
        assert_eq!(config, TesseraConfig::default());
        assert_eq!(config.session().max_inactive_interval_secs, 1800);
        assert_eq!(config.store().kind, StoreKind::File);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
[session]
max_inactive_interval_secs = -1
session_limit = 100
distributable = true

[session.ids]
algorithm = "sha512"
length_bytes = 24
route = "node1"

[persistence]
max_idle_swap_secs = 600
min_idle_swap_secs = 30
max_active_sessions = 50
eviction_order = "enumeration"

[store]
kind = "sql"

[store.sql]
path = "/tmp/sessions.db"
app_name = "shop"
table = "web_sessions"

[logging]
level = "debug"
json = true
"#;
        let config = TesseraConfig::from_toml(toml).unwrap();
        let session = config.session();
        assert_eq!(session.max_inactive_interval_secs, -1);
        assert_eq!(session.session_limit, Some(100));
        assert!(session.distributable);
        assert_eq!(session.ids.algorithm, IdAlgorithm::Sha512);
        assert_eq!(session.ids.route.as_deref(), Some("node1"));
        assert_eq!(session.pool_size, 64);

        let persistence = config.persistence();
        assert_eq!(persistence.max_idle_swap(), Some(Duration::from_secs(600)));
        assert_eq!(persistence.max_idle_backup(), None);
        assert_eq!(persistence.max_active_sessions(), Some(50));
        assert_eq!(persistence.eviction_order, EvictionOrder::Enumeration);
        assert!(persistence.save_on_restart);

        let store = config.store();
        assert_eq!(store.kind, StoreKind::Sql);
        assert_eq!(store.sql.table, "web_sessions");
        assert_eq!(store.sql.id_column, "id");

        assert!(config.logging().json);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_store_kind_rejected() {
        let err = TesseraConfig::from_toml("[store]\nkind = \"redis\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_merge_replaces_sections() {
        let mut base = TesseraConfig::from_toml(
            "[session]\nmax_inactive_interval_secs = 60\n[logging]\nlevel = \"warn\"",
        )
        .unwrap();
        let overlay = TesseraConfig::from_toml("[session]\npool_size = 8").unwrap();
        base.merge(overlay);

        assert_eq!(base.session().pool_size, 8);
        assert_eq!(base.session().max_inactive_interval_secs, 1800);
        assert_eq!(base.logging().level, "warn");
    }

    #[test]
    fn test_roundtrip() {
        let mut config = TesseraConfig::new();
        config.persistence = Some(PersistenceConfig {
            max_idle_backup_secs: 5,
            ..Default::default()
        });
        let text = config.to_toml().unwrap();
        assert_eq!(TesseraConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_inverted_swap_window() {
        let config = TesseraConfig::from_toml(
            "[persistence]\nmax_idle_swap_secs = 10\nmin_idle_swap_secs = 20",
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field, .. } if field == "persistence.min_idle_swap_secs"));
    }

    #[test]
    fn test_validate_rejects_zero_frequency() {
        let config =
            TesseraConfig::from_toml("[session]\nprocess_expires_frequency = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
