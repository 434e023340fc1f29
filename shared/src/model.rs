use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::store::{Collection, Record};

/// Fixed key of the single AppState record.
pub const APP_STATE_KEY: &str = "app_state";

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

typed_id!(ItemId);
typed_id!(SourceId);

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
        )
    }
}

// --- Credential: redacts Debug, zeroized on drop by `secrecy` ---

/// API credential of an external source. Persisted as plain text.
pub struct Credential(SecretString);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_blank(&self) -> bool {
        self.expose().trim().is_empty()
    }
}

impl Clone for Credential {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_string())
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.expose())
    }
}

impl<'de> Deserialize<'de> for Credential {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemOrigin {
    Upload,
    Camera,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Success,
    Failed,
}

/// Revocable preview reference for an item's payload. Lives only in memory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DisplayHandle(String);

impl DisplayHandle {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct UploadedItem {
    pub id: ItemId,
    pub payload: Bytes,
    pub mime_type: String,
    pub origin: ItemOrigin,
    pub status: ProcessingStatus,
    pub name: String,
    pub last_modified: UnixTimeMs,
    /// Partial model output shown while the item is still being processed.
    #[serde(default)]
    pub streaming_text: Option<String>,

    #[serde(skip)]
    pub display_handle: Option<DisplayHandle>,
}

impl UploadedItem {
    pub fn new(
        payload: impl Into<Bytes>,
        mime_type: impl Into<String>,
        origin: ItemOrigin,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: ItemId::generate(),
            payload: payload.into(),
            mime_type: mime_type.into(),
            origin,
            status: ProcessingStatus::Pending,
            name: name.into(),
            last_modified: UnixTimeMs::now(),
            streaming_text: None,
            display_handle: None,
        }
    }
}

// Payload bytes are user content; keep them out of logs.
impl fmt::Debug for UploadedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadedItem")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("mime_type", &self.mime_type)
            .field("origin", &self.origin)
            .field("status", &self.status)
            .field("name", &self.name)
            .field("last_modified", &self.last_modified)
            .field("streaming_text_len", &self.streaming_text.as_ref().map(String::len))
            .field("display_handle", &self.display_handle)
            .finish()
    }
}

impl Record for UploadedItem {
    const COLLECTION: Collection = Collection::Files;

    fn key(&self) -> String {
        self.id.as_str().to_string()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProblemSolution {
    pub problem: String,
    pub answer: String,
    pub explanation: String,
}

impl ProblemSolution {
    pub fn new(
        problem: impl Into<String>,
        answer: impl Into<String>,
        explanation: impl Into<String>,
    ) -> Self {
        Self {
            problem: problem.into(),
            answer: answer.into(),
            explanation: explanation.into(),
        }
    }
}

/// All solutions produced for one uploaded item. `file_item_id` may point at
/// an item that no longer exists.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SolutionSet {
    pub file_item_id: ItemId,
    pub success: bool,
    pub problems: Vec<ProblemSolution>,
}

impl SolutionSet {
    pub fn new(file_item_id: ItemId, success: bool, problems: Vec<ProblemSolution>) -> Self {
        Self {
            file_item_id,
            success,
            problems,
        }
    }

    pub fn failed(file_item_id: ItemId) -> Self {
        Self::new(file_item_id, false, Vec::new())
    }
}

impl Record for SolutionSet {
    const COLLECTION: Collection = Collection::Solutions;

    fn key(&self) -> String {
        self.file_item_id.as_str().to_string()
    }
}

/// Persisted selection pair. Always written whole.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct AppStateRecord {
    pub selected_item: Option<ItemId>,
    pub selected_problem_index: usize,
}

impl Record for AppStateRecord {
    const COLLECTION: Collection = Collection::AppState;

    fn key(&self) -> String {
        APP_STATE_KEY.to_string()
    }
}

/// Clamps a requested problem index into `[0, len - 1]`, or 0 when empty.
pub fn clamp_problem_index(requested: i64, len: usize) -> usize {
    if len == 0 || requested <= 0 {
        return 0;
    }
    usize::try_from(requested)
        .unwrap_or(usize::MAX)
        .min(len - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_handles_empty_and_out_of_range() {
        assert_eq!(clamp_problem_index(5, 0), 0);
        assert_eq!(clamp_problem_index(-3, 0), 0);
        assert_eq!(clamp_problem_index(-1, 4), 0);
        assert_eq!(clamp_problem_index(2, 4), 2);
        assert_eq!(clamp_problem_index(4, 4), 3);
        assert_eq!(clamp_problem_index(i64::MAX, 4), 3);
    }

    #[test]
    fn now_is_a_plausible_millisecond_timestamp() {
        let now = UnixTimeMs::now();
        // 2020-01-01 in ms; seconds would be three orders smaller.
        assert!(now.0 > 1_577_836_800_000);
        assert!(now <= UnixTimeMs::now());
    }

    #[test]
    fn display_handle_is_not_serialized() {
        let mut item = UploadedItem::new(vec![1u8, 2], "image/png", ItemOrigin::Camera, "c.png");
        item.display_handle = Some(DisplayHandle::new("blob:abc"));

        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("display_handle").is_none());

        let back: UploadedItem = serde_json::from_value(json).unwrap();
        assert!(back.display_handle.is_none());
    }

    #[test]
    fn debug_redacts_payload() {
        let item = UploadedItem::new(b"secret-bytes".to_vec(), "image/png", ItemOrigin::Upload, "x");
        let dbg = format!("{item:?}");
        assert!(dbg.contains("payload_len"));
        assert!(!dbg.contains("secret-bytes"));
    }

    #[test]
    fn new_items_start_pending_with_unique_ids() {
        let a = UploadedItem::new(vec![0u8], "image/png", ItemOrigin::Upload, "a");
        let b = UploadedItem::new(vec![0u8], "image/png", ItemOrigin::Upload, "b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.status, ProcessingStatus::Pending);
    }

    #[test]
    fn credential_debug_is_redacted_but_serializes() {
        let cred = Credential::new("sk-live-123");
        assert_eq!(format!("{cred:?}"), "[REDACTED]");
        assert_eq!(serde_json::to_string(&cred).unwrap(), "\"sk-live-123\"");
        assert!(Credential::new("  ").is_blank());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ProcessingStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        let json = serde_json::to_string(&ItemOrigin::Camera).unwrap();
        assert_eq!(json, "\"camera\"");
    }
}
