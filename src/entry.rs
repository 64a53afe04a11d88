//! Ref-counted entry handles.
//!
//! All handles for one generation of an entry share a single [`EntryShared`]
//! allocation. The backend keeps only a weak reference, so the drop of the
//! last handle is the "close" event: bookkeeping is unregistered and, when
//! the entry was doomed, the persisted row is finally deleted.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};

use crate::backend::BackendInner;
use crate::key::CacheKey;
use crate::store::EntryInfo;
use crate::token::EntryToken;

/// A handle to one live-or-doomed generation of a cache entry.
///
/// Handles are cheap to clone; clones refer to the same entry. A doomed
/// entry stays fully usable through existing handles and is deleted from
/// disk when the last one is dropped.
#[derive(Clone)]
pub struct CacheEntryHandle {
    shared: Arc<EntryShared>,
}

impl CacheEntryHandle {
    pub(crate) fn new(shared: Arc<EntryShared>) -> Self {
        Self { shared }
    }

    /// The entry's key.
    pub fn key(&self) -> &CacheKey {
        &self.shared.key
    }

    /// Identity token of this generation.
    pub fn token(&self) -> EntryToken {
        self.shared.token
    }

    /// Last-used time as of the most recent open or touch.
    pub fn last_used(&self) -> DateTime<Utc> {
        self.shared.last_used()
    }

    /// End offset of the body, in bytes.
    pub fn body_end(&self) -> i64 {
        self.shared.body_end.load(Ordering::Relaxed)
    }

    /// Copy of the serialized response head.
    pub fn head(&self) -> Vec<u8> {
        lock_ignore_poison(&self.shared.head).clone()
    }

    /// Override the in-memory last-used time.
    pub fn set_last_used(&self, last_used: DateTime<Utc>) {
        *lock_ignore_poison(&self.shared.last_used) = last_used;
    }

    /// Set the body end offset.
    pub fn set_body_end(&self, body_end: i64) {
        self.shared.body_end.store(body_end, Ordering::Relaxed);
    }

    /// Replace the serialized response head.
    pub fn set_head(&self, head: Vec<u8>) {
        *lock_ignore_poison(&self.shared.head) = head;
    }

    /// Whether this entry has been doomed.
    pub fn is_doomed(&self) -> bool {
        self.shared.is_doomed()
    }

    /// Release this reference. Equivalent to dropping the handle; when it is
    /// the last one and the entry is doomed, the row is deleted.
    pub fn close(self) {
        drop(self);
    }

    /// Doom this entry: it disappears from lookups immediately and its row
    /// is deleted once the last handle is dropped. Idempotent.
    pub fn doom(&self) {
        self.shared.doom_detached();
    }

    #[cfg(test)]
    pub(crate) fn shares_entry_with(&self, other: &CacheEntryHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl std::fmt::Debug for CacheEntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntryHandle")
            .field("key", &self.shared.key)
            .field("token", &self.shared.token)
            .field("doomed", &self.is_doomed())
            .finish()
    }
}

/// State shared by every handle of one entry generation.
pub(crate) struct EntryShared {
    backend: Weak<BackendInner>,
    key: CacheKey,
    token: EntryToken,
    last_used: Mutex<DateTime<Utc>>,
    body_end: AtomicI64,
    head: Mutex<Vec<u8>>,
    doomed: AtomicBool,
}

impl EntryShared {
    pub(crate) fn new(backend: Weak<BackendInner>, key: CacheKey, info: &EntryInfo) -> Self {
        Self {
            backend,
            key,
            token: info.token,
            last_used: Mutex::new(info.last_used),
            body_end: AtomicI64::new(info.body_end),
            head: Mutex::new(info.head.clone()),
            doomed: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn token(&self) -> EntryToken {
        self.token
    }

    pub(crate) fn last_used(&self) -> DateTime<Utc> {
        *lock_ignore_poison(&self.last_used)
    }

    pub(crate) fn is_doomed(&self) -> bool {
        self.doomed.load(Ordering::Relaxed)
    }

    /// Flip the doomed flag. Returns `false` when the entry was already
    /// doomed, so callers can make dooming idempotent.
    pub(crate) fn mark_doomed(&self) -> bool {
        !self.doomed.swap(true, Ordering::Relaxed)
    }

    fn doom_detached(&self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.doom_shared_detached(self);
        } else {
            self.doomed.store(true, Ordering::Relaxed);
        }
    }
}

impl Drop for EntryShared {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.release_entry(&self.key, self.token, self.is_doomed());
        }
    }
}

/// A poisoned lock only means another thread panicked mid-access; the
/// guarded data is still structurally valid.
pub(crate) fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
