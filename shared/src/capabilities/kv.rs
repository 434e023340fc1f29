use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be only whitespace".to_string(),
            });
        }

        if key.contains("..") || key.contains('/') || key.contains('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path separators or traversal sequences".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_debug().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

/// Slot families. Registry documents live under `settings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Settings,
}

impl KeyNamespace {
    pub fn prefix(self) -> &'static str {
        match self {
            KeyNamespace::Settings => "settings",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

// ============================================================================
// Slot stores
// ============================================================================

/// Synchronous named-slot storage for small settings documents.
pub trait SlotStore: Send + Sync {
    fn read(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    fn write(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError>;
    fn remove(&self, key: &KvKey) -> Result<(), KvError>;
}

fn check_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct MemorySlots {
    slots: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: Mutex<bool>,
}

impl MemorySlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail until turned off again.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_writes.lock() {
            *flag = fail;
        }
    }

    pub fn contains(&self, key: &KvKey) -> bool {
        self.slots
            .lock()
            .map(|s| s.contains_key(&key.raw()))
            .unwrap_or(false)
    }
}

impl SlotStore for MemorySlots {
    fn read(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        let slots = self
            .slots
            .lock()
            .map_err(|_| KvError::storage("slot lock poisoned"))?;
        Ok(slots.get(&key.raw()).cloned())
    }

    fn write(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_size(value)?;
        if self.fail_writes.lock().map(|f| *f).unwrap_or(false) {
            return Err(KvError::storage("writes disabled"));
        }
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| KvError::storage("slot lock poisoned"))?;
        slots.insert(key.raw(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &KvKey) -> Result<(), KvError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| KvError::storage("slot lock poisoned"))?;
        slots.remove(&key.raw());
        Ok(())
    }
}

/// One file per slot under a directory. Writes go through a temp file and a
/// rename so a crash never leaves a torn document.
#[derive(Debug, Clone)]
pub struct FileSlots {
    dir: PathBuf,
}

impl FileSlots {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, KvError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| KvError::storage(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &KvKey) -> PathBuf {
        self.dir
            .join(format!("{}__{}.json", key.namespace().prefix(), key.key()))
    }
}

impl SlotStore for FileSlots {
    fn read(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KvError::storage(e.to_string())),
        }
    }

    fn write(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_size(value)?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let io = |e: std::io::Error| KvError::storage(e.to_string());

        let mut file = fs::File::create(&tmp).map_err(io)?;
        file.write_all(value).map_err(io)?;
        file.sync_all().map_err(io)?;
        fs::rename(&tmp, &path).map_err(io)?;
        debug!(slot = %key.raw(), bytes = value.len(), "slot written");
        Ok(())
    }

    fn remove(&self, key: &KvKey) -> Result<(), KvError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KvError::storage(e.to_string())),
        }
    }
}

/// JSON-typed view of a single slot.
pub struct TypedSlot<T> {
    key: KvKey,
    _phantom: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> TypedSlot<T> {
    pub fn new(key: KvKey) -> Self {
        Self {
            key,
            _phantom: PhantomData,
        }
    }

    pub fn key(&self) -> &KvKey {
        &self.key
    }

    pub fn load(&self, store: &dyn SlotStore) -> Result<Option<T>, KvError> {
        match store.read(&self.key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KvError::Serialization {
                    message: e.to_string(),
                    key: Some(self.key.raw()),
                }),
            None => Ok(None),
        }
    }

    pub fn save(&self, store: &dyn SlotStore, value: &T) -> Result<(), KvError> {
        let data = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(self.key.raw()),
        })?;
        store.write(&self.key, &data)
    }

    pub fn clear(&self, store: &dyn SlotStore) -> Result<(), KvError> {
        store.remove(&self.key)
    }
}
