use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::schema::UpgradePlan;
use super::StoreError;

/// Embedded database provided by the host platform.
#[async_trait::async_trait]
pub trait StorageHost: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn HostConnection>, StoreError>;
}

/// One live connection. Values are opaque encoded records addressed by key.
#[async_trait::async_trait]
pub trait HostConnection: Send + Sync {
    async fn version(&self) -> Result<u32, StoreError>;

    /// Applies every step of `plan` and stamps `plan.to` as the new version,
    /// all-or-nothing.
    async fn upgrade(&self, plan: &UpgradePlan) -> Result<(), StoreError>;

    async fn put(&self, collection: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All values in insertion order.
    async fn get_all(&self, collection: &str) -> Result<Vec<Vec<u8>>, StoreError>;
    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError>;
    async fn clear(&self, collection: &str) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory host
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    version: u32,
    collections: HashMap<String, Vec<(String, Vec<u8>)>>,
    failing: HashSet<String>,
}

impl MemoryState {
    fn collection_mut(&mut self, name: &str) -> Result<&mut Vec<(String, Vec<u8>)>, StoreError> {
        if self.failing.contains(name) {
            return Err(StoreError::transaction(name, "injected host failure"));
        }
        self.collections
            .get_mut(name)
            .ok_or_else(|| StoreError::transaction(name, "no such collection"))
    }

    fn collection(&self, name: &str) -> Result<&Vec<(String, Vec<u8>)>, StoreError> {
        self.collections
            .get(name)
            .ok_or_else(|| StoreError::transaction(name, "no such collection"))
    }
}

/// Process-local host. Backs memory-only builds and tests; every connection
/// shares the same underlying data so a "reload" sees earlier writes.
#[derive(Debug, Default, Clone)]
pub struct MemoryHost {
    state: Arc<Mutex<MemoryState>>,
    refuse_connect: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host whose data was laid down by an earlier schema version.
    pub fn with_schema(version: u32, collections: &[&str]) -> Self {
        let host = Self::default();
        if let Ok(mut state) = host.state.lock() {
            state.version = version;
            for name in collections {
                state.collections.insert((*name).to_string(), Vec::new());
            }
        }
        host
    }

    /// Writes raw bytes underneath the store, bypassing schema checks.
    pub fn insert_raw(&self, collection: &str, key: &str, value: Vec<u8>) {
        if let Ok(mut state) = self.state.lock() {
            let rows = state.collections.entry(collection.to_string()).or_default();
            upsert(rows, key, value);
        }
    }

    pub fn row_count(&self, collection: &str) -> Option<usize> {
        let state = self.state.lock().ok()?;
        state.collections.get(collection).map(Vec::len)
    }

    pub fn version(&self) -> u32 {
        self.state.lock().map(|s| s.version).unwrap_or_default()
    }

    /// Makes every write, delete and clear against `collection` fail.
    pub fn fail_collection(&self, collection: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(collection.to_string());
        }
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

fn upsert(rows: &mut Vec<(String, Vec<u8>)>, key: &str, value: Vec<u8>) {
    match rows.iter_mut().find(|(k, _)| k == key) {
        Some(row) => row.1 = value,
        None => rows.push((key.to_string(), value)),
    }
}

#[async_trait::async_trait]
impl StorageHost for MemoryHost {
    async fn connect(&self) -> Result<Arc<dyn HostConnection>, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        // Let concurrent openers pile up behind the first one.
        tokio::task::yield_now().await;
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(StoreError::Open {
                reason: "host storage unavailable".into(),
            });
        }
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnection {
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut state = self.state.lock().map_err(|_| StoreError::LockFailed)?;
        f(&mut state)
    }
}

#[async_trait::async_trait]
impl HostConnection for MemoryConnection {
    async fn version(&self) -> Result<u32, StoreError> {
        self.with_state(|s| Ok(s.version))
    }

    async fn upgrade(&self, plan: &UpgradePlan) -> Result<(), StoreError> {
        self.with_state(|s| {
            for name in plan.created() {
                s.collections.entry(name.to_string()).or_default();
            }
            for name in plan.recreated() {
                s.collections.insert(name.to_string(), Vec::new());
            }
            s.version = plan.to;
            Ok(())
        })
    }

    async fn put(&self, collection: &str, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.with_state(|s| {
            upsert(s.collection_mut(collection)?, key, value);
            Ok(())
        })
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_state(|s| {
            Ok(s.collection(collection)?
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone()))
        })
    }

    async fn get_all(&self, collection: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_state(|s| {
            Ok(s.collection(collection)?
                .iter()
                .map(|(_, v)| v.clone())
                .collect())
        })
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.collection_mut(collection)?.retain(|(k, _)| k != key);
            Ok(())
        })
    }

    async fn clear(&self, collection: &str) -> Result<(), StoreError> {
        // Yield first so independent clears genuinely interleave.
        tokio::task::yield_now().await;
        self.with_state(|s| {
            s.collection_mut(collection)?.clear();
            Ok(())
        })
    }
}
