mod host;
mod schema;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

pub use self::host::{HostConnection, MemoryHost, StorageHost};
pub use self::schema::{Collection, UpgradePlan, UpgradeStep, SCHEMA_VERSION};
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteHost;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {reason}")]
    Open { reason: String },

    #[error("transaction failed on '{collection}': {reason}")]
    Transaction { collection: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("clear failed for {failed:?} (cleared: {cleared:?})")]
    PartialClear {
        cleared: Vec<Collection>,
        failed: Vec<(Collection, String)>,
    },

    #[error("lock acquisition failed")]
    LockFailed,
}

impl StoreError {
    pub fn transaction(collection: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transaction {
            collection: collection.into(),
            reason: reason.into(),
        }
    }

    /// The store could not be reached at all; callers may carry on in memory.
    pub fn is_open_error(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::FutureSchema { .. })
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// A value stored in one of the fixed collections.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn key(&self) -> String;
}

fn encode<R: Record>(record: &R) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes)?;
    Ok(bytes)
}

fn decode<R: Record>(bytes: &[u8]) -> Result<R, StoreError> {
    Ok(ciborium::from_reader(bytes)?)
}

/// Versioned record store over a host database.
///
/// The connection is established lazily by the first operation and shared by
/// every later one.
pub struct DurableStore {
    host: Arc<dyn StorageHost>,
    conn: OnceCell<Arc<dyn HostConnection>>,
}

impl DurableStore {
    pub fn new(host: Arc<dyn StorageHost>) -> Self {
        Self {
            host,
            conn: OnceCell::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryHost::new()))
    }

    pub fn is_open(&self) -> bool {
        self.conn.initialized()
    }

    /// Connects and migrates. Concurrent callers share one in-flight setup; a
    /// failed setup is attempted again by the next caller.
    #[instrument(skip(self))]
    pub async fn open(&self) -> Result<Arc<dyn HostConnection>, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let conn = self.host.connect().await.map_err(|e| match e {
                    StoreError::Open { .. } => e,
                    other => StoreError::Open {
                        reason: other.to_string(),
                    },
                })?;
                Self::migrate(conn.as_ref()).await?;
                info!(version = SCHEMA_VERSION, "durable store opened");
                Ok::<_, StoreError>(conn)
            })
            .await;

        match conn {
            Ok(conn) => Ok(Arc::clone(conn)),
            Err(e) => {
                error!(error = %e, "failed to open durable store");
                Err(e)
            }
        }
    }

    async fn migrate(conn: &dyn HostConnection) -> Result<(), StoreError> {
        let found = conn.version().await?;
        if found > SCHEMA_VERSION {
            return Err(StoreError::FutureSchema {
                found,
                max: SCHEMA_VERSION,
            });
        }
        if found == SCHEMA_VERSION {
            return Ok(());
        }

        let plan = UpgradePlan::between(found, SCHEMA_VERSION);
        for name in plan.recreated() {
            // Records under the old key layout are discarded, not converted.
            warn!(collection = name, from = found, "key layout changed, dropping records");
        }
        conn.upgrade(&plan).await?;
        info!(from = found, to = SCHEMA_VERSION, "schema upgraded");
        Ok(())
    }

    #[instrument(skip(self, record), fields(collection = %R::COLLECTION))]
    pub async fn put<R: Record>(&self, record: &R) -> Result<(), StoreError> {
        let conn = self.open().await?;
        let bytes = encode(record)?;
        conn.put(R::COLLECTION.name(), &record.key(), bytes).await
    }

    pub async fn get<R: Record>(&self, key: &str) -> Result<Option<R>, StoreError> {
        let conn = self.open().await?;
        match conn.get(R::COLLECTION.name(), key).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every record of the collection. Records that no longer decode are
    /// skipped with a warning instead of failing the whole read.
    pub async fn get_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let conn = self.open().await?;
        let rows = conn.get_all(R::COLLECTION.name()).await?;
        let mut records = Vec::with_capacity(rows.len());
        for bytes in rows {
            match decode::<R>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(collection = %R::COLLECTION, error = %e, "skipping undecodable record"),
            }
        }
        Ok(records)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, collection: Collection, key: &str) -> Result<(), StoreError> {
        let conn = self.open().await?;
        conn.delete(collection.name(), key).await
    }

    pub async fn clear(&self, collection: Collection) -> Result<(), StoreError> {
        let conn = self.open().await?;
        conn.clear(collection.name()).await
    }

    /// One independent clear per collection. Not atomic: a failure leaves the
    /// collections that did clear empty.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let (files, solutions, app_state) = tokio::join!(
            self.clear(Collection::Files),
            self.clear(Collection::Solutions),
            self.clear(Collection::AppState),
        );

        let mut cleared = Vec::new();
        let mut failed = Vec::new();
        for (collection, result) in [
            (Collection::Files, files),
            (Collection::Solutions, solutions),
            (Collection::AppState, app_state),
        ] {
            match result {
                Ok(()) => cleared.push(collection),
                Err(e) => failed.push((collection, e.to_string())),
            }
        }

        if failed.is_empty() {
            debug!("all collections cleared");
            Ok(())
        } else {
            error!(?failed, ?cleared, "clear_all partially failed");
            Err(StoreError::PartialClear { cleared, failed })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AppStateRecord, ItemId, ItemOrigin, ProblemSolution, ProcessingStatus, SolutionSet,
        UploadedItem,
    };
    use proptest::prelude::*;

    fn sample_item(id: &str) -> UploadedItem {
        let mut item = UploadedItem::new(
            vec![0xFF, 0xD8, 0xFF, 0xE0],
            "image/jpeg",
            ItemOrigin::Upload,
            "page-1.jpg",
        );
        item.id = ItemId::new(id);
        item
    }

    fn sample_solution(id: &str, problems: usize) -> SolutionSet {
        SolutionSet {
            file_item_id: ItemId::new(id),
            success: true,
            problems: (0..problems)
                .map(|i| ProblemSolution::new(format!("q{i}"), format!("a{i}"), "because"))
                .collect(),
        }
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let store = DurableStore::in_memory();
        let found: Option<UploadedItem> = store.get("nope").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn put_overwrites_by_key() {
        let store = DurableStore::in_memory();
        let mut item = sample_item("a");
        store.put(&item).await.unwrap();
        item.status = ProcessingStatus::Success;
        store.put(&item).await.unwrap();

        let all: Vec<UploadedItem> = store.get_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, ProcessingStatus::Success);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = DurableStore::in_memory();
        store.put(&sample_item("a")).await.unwrap();
        store.delete(Collection::Files, "a").await.unwrap();
        store.delete(Collection::Files, "a").await.unwrap();
        let found: Option<UploadedItem> = store.get("a").await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn concurrent_opens_share_one_connection() {
        let host = MemoryHost::new();
        let store = DurableStore::new(Arc::new(host.clone()));
        let (a, b, c) = tokio::join!(store.open(), store.open(), store.open());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(host.connect_count(), 1);
        assert_eq!(host.version(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn open_failure_is_retried_later() {
        let host = MemoryHost::new();
        host.refuse_connections(true);
        let store = DurableStore::new(Arc::new(host.clone()));

        let err = store.open().await.err().unwrap();
        assert!(err.is_open_error());
        assert!(!store.is_open());

        host.refuse_connections(false);
        store.open().await.unwrap();
        assert!(store.is_open());
    }

    #[tokio::test]
    async fn newer_schema_refuses_to_open() {
        let host = MemoryHost::with_schema(SCHEMA_VERSION + 1, &["files"]);
        let store = DurableStore::new(Arc::new(host));
        let err = store.open().await.err().unwrap();
        assert!(matches!(err, StoreError::FutureSchema { .. }));
    }

    #[tokio::test]
    async fn migration_drops_rekeyed_collection_only() {
        let host = MemoryHost::with_schema(1, &["files", "solutions"]);
        let legacy_item = encode(&sample_item("kept")).unwrap();
        host.insert_raw("files", "kept", legacy_item);
        host.insert_raw("solutions", "0", b"legacy per-problem row".to_vec());
        host.insert_raw("solutions", "1", b"legacy per-problem row".to_vec());

        let store = DurableStore::new(Arc::new(host.clone()));
        store.open().await.unwrap();

        assert_eq!(host.version(), 2);
        let solutions: Vec<SolutionSet> = store.get_all().await.unwrap();
        assert!(solutions.is_empty());
        let files: Vec<UploadedItem> = store.get_all().await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id.as_str(), "kept");
        assert_eq!(host.row_count("app_state"), Some(0));
    }

    #[tokio::test]
    async fn clear_all_empties_every_collection() {
        let store = DurableStore::in_memory();
        for id in ["a", "b", "c"] {
            store.put(&sample_item(id)).await.unwrap();
        }
        store.put(&sample_solution("a", 2)).await.unwrap();
        store.put(&sample_solution("b", 1)).await.unwrap();
        store.put(&AppStateRecord::default()).await.unwrap();

        store.clear_all().await.unwrap();

        assert!(store.get_all::<UploadedItem>().await.unwrap().is_empty());
        assert!(store.get_all::<SolutionSet>().await.unwrap().is_empty());
        assert!(store.get_all::<AppStateRecord>().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_all_partial_failure_keeps_other_clears() {
        let host = MemoryHost::new();
        let store = DurableStore::new(Arc::new(host.clone()));
        store.put(&sample_item("a")).await.unwrap();
        store.put(&sample_solution("a", 1)).await.unwrap();
        host.fail_collection("solutions");

        let err = store.clear_all().await.err().unwrap();
        match err {
            StoreError::PartialClear { cleared, failed } => {
                assert!(cleared.contains(&Collection::Files));
                assert_eq!(failed.len(), 1);
                assert_eq!(failed[0].0, Collection::Solutions);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(host.row_count("files"), Some(0));
        assert_eq!(host.row_count("solutions"), Some(1));
    }

    fn arb_status() -> impl Strategy<Value = ProcessingStatus> {
        prop_oneof![
            Just(ProcessingStatus::Pending),
            Just(ProcessingStatus::Success),
            Just(ProcessingStatus::Failed),
        ]
    }

    proptest! {
        #[test]
        fn records_survive_put_then_get(
            id in "[a-z0-9-]{1,24}",
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            name in ".{0,40}",
            status in arb_status(),
            problems in proptest::collection::vec((".{0,20}", ".{0,20}", ".{0,20}"), 0..5),
            index in 0usize..8,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = DurableStore::in_memory();

                let mut item = UploadedItem::new(payload, "image/png", ItemOrigin::Camera, name);
                item.id = ItemId::new(id.clone());
                item.status = status;
                store.put(&item).await.unwrap();

                let solution = SolutionSet {
                    file_item_id: ItemId::new(id.clone()),
                    success: !problems.is_empty(),
                    problems: problems
                        .into_iter()
                        .map(|(p, a, e)| ProblemSolution::new(p, a, e))
                        .collect(),
                };
                store.put(&solution).await.unwrap();

                let app_state = AppStateRecord {
                    selected_item: Some(ItemId::new(id.clone())),
                    selected_problem_index: index,
                };
                store.put(&app_state).await.unwrap();

                let got: Option<UploadedItem> = store.get(&id).await.unwrap();
                prop_assert_eq!(got.as_ref(), Some(&item));
                let got: Vec<SolutionSet> = store.get_all().await.unwrap();
                prop_assert_eq!(got, vec![solution]);
                let got: Option<AppStateRecord> = store.get(crate::model::APP_STATE_KEY).await.unwrap();
                prop_assert_eq!(got, Some(app_state));
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
