use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tracing::warn;
use uuid::Uuid;

use crate::model::DisplayHandle;

/// Host facility that turns a payload into a previewable handle and revokes it
/// again. Revoking the same handle twice is undefined on real hosts, so
/// callers must guarantee a single revoke.
pub trait DisplayHandleHost: Send + Sync {
    fn create(&self, payload: &Bytes, mime_type: &str) -> DisplayHandle;
    fn revoke(&self, handle: &DisplayHandle);
}

/// Host stand-in that tracks live handles and counts misuse.
#[derive(Debug, Default)]
pub struct MemoryHandleHost {
    live: Mutex<HashSet<DisplayHandle>>,
    created: AtomicUsize,
    revoked: AtomicUsize,
    double_revokes: AtomicUsize,
}

impl MemoryHandleHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }

    pub fn is_live(&self, handle: &DisplayHandle) -> bool {
        self.live.lock().map(|l| l.contains(handle)).unwrap_or(false)
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }

    pub fn double_revoke_count(&self) -> usize {
        self.double_revokes.load(Ordering::SeqCst)
    }
}

impl DisplayHandleHost for MemoryHandleHost {
    fn create(&self, _payload: &Bytes, _mime_type: &str) -> DisplayHandle {
        let handle = DisplayHandle::new(format!("blob:memory/{}", Uuid::new_v4()));
        if let Ok(mut live) = self.live.lock() {
            live.insert(handle.clone());
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        handle
    }

    fn revoke(&self, handle: &DisplayHandle) {
        let was_live = self
            .live
            .lock()
            .map(|mut l| l.remove(handle))
            .unwrap_or(false);
        if was_live {
            self.revoked.fetch_add(1, Ordering::SeqCst);
        } else {
            warn!(handle = handle.as_str(), "revoke of a handle that is not live");
            self.double_revokes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_revoke() {
        let host = MemoryHandleHost::new();
        let h = host.create(&Bytes::from_static(b"x"), "image/png");
        assert!(host.is_live(&h));
        host.revoke(&h);
        assert!(!host.is_live(&h));
        assert_eq!(host.revoked_count(), 1);
        assert_eq!(host.double_revoke_count(), 0);
    }

    #[test]
    fn second_revoke_is_counted_as_misuse() {
        let host = MemoryHandleHost::new();
        let h = host.create(&Bytes::new(), "image/png");
        host.revoke(&h);
        host.revoke(&h);
        assert_eq!(host.revoked_count(), 1);
        assert_eq!(host.double_revoke_count(), 1);
    }
}
