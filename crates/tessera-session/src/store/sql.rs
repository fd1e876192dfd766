//! One row per session in a SQLite table.
//!
//! Rows are keyed by `(id, app)` so several deployments can share a table.
//! The store keeps a single connection whose prepared-statement cache holds
//! one statement per operation. Every operation is attempted twice: a
//! failure drops the connection with its cached statements and reconnects.

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, error, warn};

use super::{RecordMeta, StoreBackend};
use crate::error::{Error, Result};

const ATTEMPTS: usize = 2;

/// Column names for the session table.
#[derive(Debug, Clone)]
pub struct SqlColumns {
    pub id: String,
    pub app: String,
    pub data: String,
    pub valid: String,
    pub max_inactive: String,
    pub last_access: String,
}

impl Default for SqlColumns {
    fn default() -> Self {
        Self {
            id: "id".to_string(),
            app: "app".to_string(),
            data: "data".to_string(),
            valid: "valid".to_string(),
            max_inactive: "maxinactive".to_string(),
            last_access: "lastaccess".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlStoreConfig {
    /// Database file.
    pub path: PathBuf,
    /// Value of the application column for every row this store touches.
    pub app_name: String,
    pub table: String,
    pub columns: SqlColumns,
    /// Create the table on connect if it does not exist.
    pub create_schema: bool,
    pub busy_timeout: Duration,
}

impl SqlStoreConfig {
    pub fn new(path: impl Into<PathBuf>, app_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            app_name: app_name.into(),
            table: "sessions".to_string(),
            columns: SqlColumns::default(),
            create_schema: true,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_columns(mut self, columns: SqlColumns) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_create_schema(mut self, create: bool) -> Self {
        self.create_schema = create;
        self
    }
}

/// SQL text for each operation, built once from the configured names.
#[derive(Debug)]
struct Statements {
    schema: String,
    size: String,
    keys: String,
    load: String,
    delete: String,
    insert: String,
    clear: String,
}

impl Statements {
    fn build(config: &SqlStoreConfig) -> Result<Self> {
        let c = &config.columns;
        for name in [
            &config.table,
            &c.id,
            &c.app,
            &c.data,
            &c.valid,
            &c.max_inactive,
            &c.last_access,
        ] {
            check_identifier(name)?;
        }
        let t = &config.table;
        Ok(Self {
            schema: format!(
                "CREATE TABLE IF NOT EXISTS {t} (\
                 {id} TEXT NOT NULL, {app} TEXT NOT NULL, {data} BLOB, \
                 {valid} CHAR(1) NOT NULL, {max} INTEGER NOT NULL, {last} BIGINT NOT NULL, \
                 PRIMARY KEY ({id}, {app}))",
                id = c.id,
                app = c.app,
                data = c.data,
                valid = c.valid,
                max = c.max_inactive,
                last = c.last_access,
            ),
            size: format!("SELECT COUNT({}) FROM {t} WHERE {} = ?1", c.id, c.app),
            keys: format!("SELECT {} FROM {t} WHERE {} = ?1 ORDER BY {}", c.id, c.app, c.id),
            load: format!(
                "SELECT {} FROM {t} WHERE {} = ?1 AND {} = ?2",
                c.data, c.id, c.app
            ),
            delete: format!("DELETE FROM {t} WHERE {} = ?1 AND {} = ?2", c.id, c.app),
            insert: format!(
                "INSERT INTO {t} ({}, {}, {}, {}, {}, {}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                c.id, c.app, c.data, c.valid, c.max_inactive, c.last_access
            ),
            clear: format!("DELETE FROM {t} WHERE {} = ?1", c.app),
        })
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid SQL identifier '{name}'")))
    }
}

/// SQLite-backed session store.
pub struct SqlStore {
    config: SqlStoreConfig,
    statements: Statements,
    /// Opened lazily; dropped after any failed operation.
    conn: Mutex<Option<Connection>>,
}

impl SqlStore {
    /// Create a store. The database is opened on first use.
    pub fn new(config: SqlStoreConfig) -> Result<Self> {
        let statements = Statements::build(&config)?;
        debug!(
            path = %config.path.display(),
            table = %config.table,
            app = %config.app_name,
            "SQL session store configured"
        );
        Ok(Self {
            config,
            statements,
            conn: Mutex::new(None),
        })
    }

    pub fn app_name(&self) -> &str {
        &self.config.app_name
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.config.path)?;
        conn.busy_timeout(self.config.busy_timeout)?;
        if self.config.create_schema {
            conn.execute_batch(&self.statements.schema)?;
        }
        debug!(path = %self.config.path.display(), "Connected to session database");
        Ok(conn)
    }

    /// Run `f` against the connection, reconnecting once on failure.
    fn with_retry<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut slot = self.conn.lock();
        let mut last_error = String::new();
        for attempt in 1..=ATTEMPTS {
            if slot.is_none() {
                match self.connect() {
                    Ok(conn) => *slot = Some(conn),
                    Err(e) => {
                        warn!(op, attempt, error = %e, "Session database connect failed");
                        last_error = e.to_string();
                        continue;
                    }
                }
            }
            let Some(conn) = slot.as_ref() else {
                continue;
            };
            match f(conn) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(op, attempt, error = %e, "Session database operation failed");
                    last_error = e.to_string();
                    *slot = None;
                }
            }
        }
        Err(Error::StoreUnavailable(format!("{op}: {last_error}")))
    }

    /// Log an unavailable store and fall back to `fallback`.
    fn or_empty<T>(&self, op: &str, result: Result<T>, fallback: T) -> T {
        result.unwrap_or_else(|e| {
            error!(op, app = %self.config.app_name, error = %e, "Session store unavailable");
            fallback
        })
    }
}

impl StoreBackend for SqlStore {
    fn name(&self) -> &str {
        "sql"
    }

    fn keys(&self) -> Result<Vec<String>> {
        let app = &self.config.app_name;
        let result = self.with_retry("keys", |conn| {
            let mut stmt = conn.prepare_cached(&self.statements.keys)?;
            let keys = stmt
                .query_map(params![app], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        });
        Ok(self.or_empty("keys", result, Vec::new()))
    }

    fn size(&self) -> Result<usize> {
        let app = &self.config.app_name;
        let result = self.with_retry("size", |conn| {
            let mut stmt = conn.prepare_cached(&self.statements.size)?;
            let count = stmt.query_row(params![app], |row| row.get::<_, i64>(0))?;
            Ok(count as usize)
        });
        Ok(self.or_empty("size", result, 0))
    }

    fn clear(&self) -> Result<()> {
        let app = &self.config.app_name;
        let result = self.with_retry("clear", |conn| {
            conn.prepare_cached(&self.statements.clear)?
                .execute(params![app])?;
            Ok(())
        });
        self.or_empty("clear", result, ());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let app = &self.config.app_name;
        let result = self.with_retry("remove", |conn| {
            conn.prepare_cached(&self.statements.delete)?
                .execute(params![id, app])?;
            Ok(())
        });
        self.or_empty("remove", result, ());
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let app = &self.config.app_name;
        let result = self.with_retry("load", |conn| {
            let mut stmt = conn.prepare_cached(&self.statements.load)?;
            stmt.query_row(params![id, app], |row| row.get::<_, Vec<u8>>(0))
                .optional()
        });
        Ok(self.or_empty("load", result, None))
    }

    /// Replace the row for the session.
    ///
    /// Unlike the read operations, a failure is returned so the caller can
    /// keep the session in memory.
    fn write(&self, meta: &RecordMeta, data: &[u8]) -> Result<()> {
        let app = &self.config.app_name;
        let valid = if meta.valid { "1" } else { "0" };
        self.with_retry("save", |conn| {
            let tx = conn.unchecked_transaction()?;
            tx.prepare_cached(&self.statements.delete)?
                .execute(params![meta.id, app])?;
            tx.prepare_cached(&self.statements.insert)?.execute(params![
                meta.id,
                app,
                data,
                valid,
                meta.max_inactive_secs,
                meta.last_accessed_ms
            ])?;
            tx.commit()
        })
        .inspect_err(|e| {
            error!(session_id = %meta.id, app = %app, error = %e, "Failed to save session");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RegistryConfig;
    use crate::context::SessionContext;
    use crate::id::IdConfig;
    use crate::registry::SessionRegistry;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn registry() -> SessionRegistry {
        let context = SessionContext::new("test").with_clock(Arc::new(ManualClock::starting_now()));
        let config = RegistryConfig::new().with_ids(IdConfig::default().with_random_file(None));
        SessionRegistry::new(config, Arc::new(context))
    }

    fn store(dir: &TempDir, app: &str) -> SqlStore {
        SqlStore::new(SqlStoreConfig::new(dir.path().join("sessions.db"), app)).unwrap()
    }

    #[test]
    fn test_save_twice_keeps_one_row() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "shop");
        let registry = registry();
        let session = registry.create_session(Some("s1")).unwrap();

        store.save(&session).unwrap();
        assert_eq!(store.size().unwrap(), 1);
        session.set_attribute("count", 2i64).unwrap();
        store.save(&session).unwrap();

        assert_eq!(store.keys().unwrap(), vec!["s1".to_string()]);
        assert_eq!(store.size().unwrap(), 1);
        let loaded = store.load("s1", &registry).unwrap().unwrap();
        assert_eq!(
            loaded.get_attribute("count").unwrap().unwrap().as_data(),
            Some(&serde_json::json!(2))
        );
    }

    #[test]
    fn test_rows_are_scoped_by_app() {
        let dir = TempDir::new().unwrap();
        let shop = store(&dir, "shop");
        let blog = store(&dir, "blog");
        let registry = registry();
        let session = registry.create_session(Some("shared-id")).unwrap();

        shop.save(&session).unwrap();
        assert_eq!(shop.size().unwrap(), 1);
        assert!(blog.keys().unwrap().is_empty());
        assert!(blog.read("shared-id").unwrap().is_none());

        blog.save(&session).unwrap();
        shop.clear().unwrap();
        assert_eq!(shop.size().unwrap(), 0);
        assert_eq!(blog.size().unwrap(), 1);
    }

    #[test]
    fn test_remove_and_missing_read() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "shop");
        let registry = registry();
        let session = registry.create_session(Some("gone")).unwrap();
        store.save(&session).unwrap();
        store.remove("gone").unwrap();
        store.remove("gone").unwrap();
        assert!(store.read("gone").unwrap().is_none());
    }

    #[test]
    fn test_reconnects_after_failure() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, "shop");
        let registry = registry();
        store.save(&registry.create_session(Some("a")).unwrap()).unwrap();

        let other = Connection::open(dir.path().join("sessions.db")).unwrap();
        other.execute_batch("DROP TABLE sessions").unwrap();

        // The cached statement fails; the retry reconnects and recreates the table.
        assert!(store.keys().unwrap().is_empty());
        store.save(&registry.create_session(Some("b")).unwrap()).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_unreachable_database() {
        let dir = TempDir::new().unwrap();
        let config = SqlStoreConfig::new(dir.path().join("missing/dir/sessions.db"), "shop");
        let store = SqlStore::new(config).unwrap();
        let registry = registry();

        assert!(store.keys().unwrap().is_empty());
        assert_eq!(store.size().unwrap(), 0);
        assert!(store.read("x").unwrap().is_none());
        let err = store
            .save(&registry.create_session(Some("x")).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
    }

    #[test]
    fn test_custom_names() {
        let dir = TempDir::new().unwrap();
        let columns = SqlColumns {
            id: "session_id".into(),
            app: "app_name".into(),
            data: "session_data".into(),
            valid: "valid_session".into(),
            max_inactive: "max_inactive".into(),
            last_access: "last_access".into(),
        };
        let config = SqlStoreConfig::new(dir.path().join("custom.db"), "shop")
            .with_table("tomcat_sessions")
            .with_columns(columns);
        let store = SqlStore::new(config).unwrap();
        let registry = registry();
        store.save(&registry.create_session(Some("s1")).unwrap()).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let config = SqlStoreConfig::new("unused.db", "shop").with_table("sessions; DROP TABLE x");
        assert!(matches!(SqlStore::new(config), Err(Error::Config(_))));
    }
}
