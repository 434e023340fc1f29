use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use super::host::{HostConnection, StorageHost};
use super::schema::{Collection, UpgradePlan};
use super::StoreError;
use crate::config::StoreConfig;

/// SQLite-backed host: one table per collection, schema version kept in
/// `PRAGMA user_version`.
pub struct SqliteHost {
    path: Option<PathBuf>,
    busy_timeout: Duration,
}

impl SqliteHost {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            busy_timeout: Duration::from_millis(StoreConfig::default().busy_timeout_ms),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            busy_timeout: Duration::from_millis(StoreConfig::default().busy_timeout_ms),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            path: config.database_path.clone(),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }

    fn open_connection(&self) -> rusqlite::Result<Connection> {
        let conn = match &self.path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(self.busy_timeout)?;
        if self.path.is_some() {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        }
        Ok(conn)
    }
}

#[async_trait::async_trait]
impl StorageHost for SqliteHost {
    #[instrument(skip(self), fields(path = ?self.path))]
    async fn connect(&self) -> Result<Arc<dyn HostConnection>, StoreError> {
        let conn = self.open_connection().map_err(|e| StoreError::Open {
            reason: e.to_string(),
        })?;
        debug!("sqlite connection established");
        Ok(Arc::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
}

// Collection names come from the fixed schema table, never from callers, so
// interpolating them into SQL is safe.
fn table(collection: &str) -> Result<&'static str, StoreError> {
    Collection::ALL
        .iter()
        .map(|c| c.name())
        .find(|name| *name == collection)
        .ok_or_else(|| StoreError::transaction(collection, "unknown collection"))
}

impl SqliteConnection {
    /// Runs blocking rusqlite work off the async executor.
    async fn run<T, F>(&self, collection: &str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let label = collection.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::LockFailed)?;
            f(&mut *guard).map_err(|e| StoreError::transaction(label, e.to_string()))
        })
        .await
        .map_err(|e| StoreError::transaction(collection, format!("join error: {e}")))?
    }
}

#[async_trait::async_trait]
impl HostConnection for SqliteConnection {
    async fn version(&self) -> Result<u32, StoreError> {
        self.run("user_version", |conn| {
            conn.query_row("PRAGMA user_version", [], |row| row.get::<_, u32>(0))
        })
        .await
    }

    async fn upgrade(&self, plan: &UpgradePlan) -> Result<(), StoreError> {
        let created: Vec<&'static str> = plan.created().collect();
        let recreated: Vec<&'static str> = plan.recreated().collect();
        let to = plan.to;
        self.run("upgrade", move |conn| {
            let tx = conn.transaction()?;
            for name in &recreated {
                tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{name}\""))?;
            }
            for name in created.iter().chain(recreated.iter()) {
                tx.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS \"{name}\" (
                        key TEXT PRIMARY KEY,
                        value BLOB NOT NULL
                    )"
                ))?;
            }
            tx.pragma_update(None, "user_version", to)?;
            tx.commit()
        })
        .await
    }

    async fn put(&self, collection: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let name = table(collection)?;
        let key = key.to_string();
        self.run(collection, move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO \"{name}\" (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value"
                ),
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let name = table(collection)?;
        let key = key.to_string();
        self.run(collection, move |conn| {
            conn.query_row(
                &format!("SELECT value FROM \"{name}\" WHERE key = ?1"),
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
        })
        .await
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        let name = table(collection)?;
        self.run(collection, move |conn| {
            let mut stmt = conn.prepare(&format!("SELECT value FROM \"{name}\" ORDER BY rowid"))?;
            let values = stmt
                .query_map([], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(values)
        })
        .await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        let name = table(collection)?;
        let key = key.to_string();
        self.run(collection, move |conn| {
            conn.execute(&format!("DELETE FROM \"{name}\" WHERE key = ?1"), params![key])
                .map(|_| ())
        })
        .await
    }

    async fn clear(&self, collection: &str) -> Result<(), StoreError> {
        let name = table(collection)?;
        self.run(collection, move |conn| {
            conn.execute(&format!("DELETE FROM \"{name}\""), []).map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemOrigin, ProblemSolution, SolutionSet, UploadedItem};
    use crate::store::{DurableStore, SCHEMA_VERSION};
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapsolve.db");

        let item = UploadedItem::new(vec![1, 2, 3], "image/png", ItemOrigin::Upload, "a.png");
        {
            let store = DurableStore::new(Arc::new(SqliteHost::new(&path)));
            store.put(&item).await.unwrap();
        }

        let store = DurableStore::new(Arc::new(SqliteHost::new(&path)));
        let loaded: Option<UploadedItem> = store.get(item.id.as_str()).await.unwrap();
        assert_eq!(loaded, Some(item));
    }

    #[tokio::test]
    async fn get_all_preserves_insertion_order() {
        let store = DurableStore::new(Arc::new(SqliteHost::in_memory()));
        let names = ["z.png", "a.png", "m.png"];
        for name in names {
            let item = UploadedItem::new(vec![0], "image/png", ItemOrigin::Upload, name);
            store.put(&item).await.unwrap();
        }
        let all: Vec<UploadedItem> = store.get_all().await.unwrap();
        let got: Vec<_> = all.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(got, names);
    }

    #[tokio::test]
    async fn upgrading_v1_database_discards_old_solutions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE files (key TEXT PRIMARY KEY, value BLOB NOT NULL);
                 CREATE TABLE solutions (key TEXT PRIMARY KEY, value BLOB NOT NULL);
                 INSERT INTO solutions (key, value) VALUES ('1', x'00');
                 PRAGMA user_version = 1;",
            )
            .unwrap();
        }

        let store = DurableStore::new(Arc::new(SqliteHost::new(&path)));
        let solutions: Vec<SolutionSet> = store.get_all().await.unwrap();
        assert!(solutions.is_empty());

        let fresh = SolutionSet {
            file_item_id: crate::model::ItemId::new("x"),
            success: true,
            problems: vec![ProblemSolution::new("1+1", "2", "sum")],
        };
        store.put(&fresh).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let version: u32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
