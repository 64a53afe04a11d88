//! Cache backend: handle bookkeeping on top of the persistent store.
//!
//! The store only knows rows; the backend adds the in-memory view that makes
//! handles behave like a disk cache. Per key it tracks at most one of three
//! states: *active* (a live generation with outstanding handles), *pending*
//! (an open or create in flight on the worker) and, keyed by token,
//! *doomed* generations awaiting their last handle. Dooms that arrive while
//! an operation is pending are queued and applied the moment the operation
//! lands, so a caller can never observe an entry that survived a doom it
//! ordered.
//!
//! Callers must not start a second open or create for a key while one is
//! already pending; dooming a pending key is allowed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::StoreConfig;
use crate::entry::{lock_ignore_poison, CacheEntryHandle, EntryShared};
use crate::error::{Result, StoreError};
use crate::key::CacheKey;
use crate::store::{EntryInfo, PersistentStore};
use crate::token::EntryToken;

/// How [`CacheBackend::open_or_create_entry`] satisfied the request.
#[derive(Debug)]
pub enum OpenOutcome {
    /// An existing entry was opened.
    Opened(CacheEntryHandle),
    /// No entry existed; a new one was created.
    Created(CacheEntryHandle),
}

impl OpenOutcome {
    /// The handle, regardless of how it was obtained.
    pub fn into_handle(self) -> CacheEntryHandle {
        match self {
            OpenOutcome::Opened(handle) | OpenOutcome::Created(handle) => handle,
        }
    }

    /// Whether the entry pre-existed.
    pub fn was_opened(&self) -> bool {
        matches!(self, OpenOutcome::Opened(_))
    }
}

/// A doom that arrived while the key had an operation in flight.
struct QueuedDoom {
    /// `None` dooms unconditionally; `Some` only when the entry's last-used
    /// time falls inside the half-open range.
    range: Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)>,
    tx: oneshot::Sender<Result<()>>,
}

impl QueuedDoom {
    fn matches(&self, last_used: DateTime<Utc>) -> bool {
        match self.range {
            None => true,
            Some((initial, end)) => in_range(last_used, initial, end),
        }
    }
}

fn in_range(
    t: DateTime<Utc>,
    initial: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> bool {
    initial.is_none_or(|lo| t >= lo) && end.is_none_or(|hi| t < hi)
}

#[derive(Default)]
struct PendingOp {
    queued_dooms: Vec<QueuedDoom>,
}

#[derive(Default)]
struct BackendState {
    /// Live generations with outstanding handles, by key.
    active: HashMap<CacheKey, Weak<EntryShared>>,
    /// Doomed generations awaiting their last handle, by token.
    doomed: HashMap<EntryToken, CacheKey>,
    /// Keys with an open or create in flight.
    pending: HashMap<CacheKey, PendingOp>,
}

pub(crate) struct BackendInner {
    store: Arc<PersistentStore>,
    state: Mutex<BackendState>,
}

/// The disk cache backend. Cloneable; clones share all state.
#[derive(Clone)]
pub struct CacheBackend {
    inner: Arc<BackendInner>,
}

impl CacheBackend {
    /// Create a backend and its store. No I/O happens until
    /// [`initialize`](Self::initialize).
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                store: Arc::new(PersistentStore::new(config)),
                state: Mutex::new(BackendState::default()),
            }),
        }
    }

    /// Open or recover the database.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.store.initialize().await
    }

    /// Total byte budget of the cache.
    pub fn max_size(&self) -> i64 {
        self.inner.store.max_size()
    }

    /// Largest size a single entry may reach.
    pub fn max_file_size(&self) -> i64 {
        self.inner.store.max_file_size()
    }

    /// Number of live entries.
    pub async fn entry_count(&self) -> i32 {
        self.inner.store.entry_count().await
    }

    /// Estimated total on-disk footprint of all live entries.
    pub async fn size_of_all_entries(&self) -> i64 {
        self.inner.store.size_of_all_entries().await
    }

    /// Open the entry for `key`, or `None` when there is none. When handles
    /// for the key are already outstanding, the same entry is returned
    /// without touching the store.
    pub async fn open_entry(&self, key: &CacheKey) -> Result<Option<CacheEntryHandle>> {
        if let Some(handle) = self.inner.active_handle(key) {
            return Ok(Some(handle));
        }
        let guard = self.inner.begin_operation(key);
        match self.inner.store.open_entry(key).await {
            Ok(Some(info)) => {
                let handle = self.inner.finish_operation(guard, key, info).await;
                Ok(Some(handle))
            }
            Ok(None) => {
                self.inner.abandon_operation(guard, key).await;
                Ok(None)
            }
            Err(e) => {
                self.inner.abandon_operation(guard, key).await;
                Err(e)
            }
        }
    }

    /// Create a new entry for `key`. Fails with `AlreadyExists` when a live
    /// entry exists, whether active in memory or only on disk.
    pub async fn create_entry(&self, key: &CacheKey) -> Result<CacheEntryHandle> {
        if self.inner.active_handle(key).is_some() {
            return Err(StoreError::AlreadyExists);
        }
        let guard = self.inner.begin_operation(key);
        match self.inner.store.create_entry(key).await {
            Ok(info) => Ok(self.inner.finish_operation(guard, key, info).await),
            Err(e) => {
                self.inner.abandon_operation(guard, key).await;
                Err(e)
            }
        }
    }

    /// Open the entry for `key`, creating it when absent.
    pub async fn open_or_create_entry(&self, key: &CacheKey) -> Result<OpenOutcome> {
        if let Some(handle) = self.inner.active_handle(key) {
            return Ok(OpenOutcome::Opened(handle));
        }
        let guard = self.inner.begin_operation(key);
        let info = match self.inner.store.open_or_create_entry(key).await {
            Ok(info) => info,
            Err(e) => {
                self.inner.abandon_operation(guard, key).await;
                return Err(e);
            }
        };
        let opened = info.opened;
        let handle = self.inner.finish_operation(guard, key, info).await;
        Ok(if opened {
            OpenOutcome::Opened(handle)
        } else {
            OpenOutcome::Created(handle)
        })
    }

    /// Doom the entry for `key`.
    ///
    /// An active entry is marked doomed and deleted when its last handle
    /// drops. A key with an operation pending has the doom queued until the
    /// operation lands. A quiescent entry is deleted outright. Absence is
    /// not an error.
    pub async fn doom_entry(&self, key: &CacheKey) -> Result<()> {
        enum Path {
            Active(Arc<EntryShared>),
            Queued(oneshot::Receiver<Result<()>>),
            Quiescent,
        }

        let path = {
            let mut state = self.inner.lock_state();
            if let Some(shared) = state.active.get(key).and_then(Weak::upgrade) {
                self.inner.doom_active_locked(&mut state, &shared);
                Path::Active(shared)
            } else if let Some(op) = state.pending.get_mut(key) {
                let (tx, rx) = oneshot::channel();
                op.queued_dooms.push(QueuedDoom { range: None, tx });
                Path::Queued(rx)
            } else {
                Path::Quiescent
            }
        };

        match path {
            Path::Active(shared) => {
                ignore_not_found(self.inner.store.doom_entry(key, shared.token()).await)
            }
            Path::Queued(rx) => rx.await.unwrap_or(Ok(())),
            Path::Quiescent => ignore_not_found(self.inner.store.delete_live_entry(key).await),
        }
    }

    /// Doom every entry.
    pub async fn doom_all_entries(&self) -> Result<()> {
        self.doom_entries_between(None, None).await
    }

    /// Doom every entry last used at `initial_time` or later.
    pub async fn doom_entries_since(&self, initial_time: DateTime<Utc>) -> Result<()> {
        self.doom_entries_between(Some(initial_time), None).await
    }

    /// Doom every entry whose last-used time falls in
    /// `[initial_time, end_time)`. `None` bounds are unbounded.
    ///
    /// Active entries in the range are doomed through their handles, pending
    /// keys get a range-conditional doom queued, and everything else is
    /// deleted by the store in one pass.
    pub async fn doom_entries_between(
        &self,
        initial_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // The locked block only decides what to do; every await happens
        // after the guard's scope has closed, keeping the future Send.
        enum Plan {
            Wipe,
            Selective {
                to_doom: Vec<Arc<EntryShared>>,
                queued: Vec<oneshot::Receiver<Result<()>>>,
                excluded: HashSet<CacheKey>,
            },
        }

        let plan = {
            let mut state = self.inner.lock_state();

            // With no bookkeeping and no time bounds this is a full wipe.
            if initial_time.is_none()
                && end_time.is_none()
                && state.active.is_empty()
                && state.pending.is_empty()
                && state.doomed.is_empty()
            {
                Plan::Wipe
            } else {
                let mut excluded = HashSet::new();
                let mut to_doom = Vec::new();
                let shared: Vec<_> = state
                    .active
                    .iter()
                    .filter_map(|(_, weak)| weak.upgrade())
                    .collect();
                for entry in shared {
                    excluded.insert(entry.key().clone());
                    if in_range(entry.last_used(), initial_time, end_time) {
                        self.inner.doom_active_locked(&mut state, &entry);
                        to_doom.push(entry);
                    }
                }

                let mut queued = Vec::new();
                for (key, op) in state.pending.iter_mut() {
                    excluded.insert(key.clone());
                    let (tx, rx) = oneshot::channel();
                    op.queued_dooms.push(QueuedDoom {
                        range: Some((initial_time, end_time)),
                        tx,
                    });
                    queued.push(rx);
                }

                Plan::Selective {
                    to_doom,
                    queued,
                    excluded,
                }
            }
        };

        let (to_doom, queued, excluded) = match plan {
            Plan::Wipe => {
                debug!("dooming all entries via full wipe");
                return self.inner.store.delete_all_entries().await;
            }
            Plan::Selective {
                to_doom,
                queued,
                excluded,
            } => (to_doom, queued, excluded),
        };

        // Dooms go to the worker before the range delete, so their rows are
        // no longer live by the time the delete scans.
        let store = &self.inner.store;
        let doom_results = join_all(
            to_doom
                .iter()
                .map(|entry| store.doom_entry(entry.key(), entry.token())),
        )
        .await;
        let delete_result = store
            .delete_live_entries_between(initial_time, end_time, excluded)
            .await;
        let queued_results = join_all(queued).await;

        let mut result = Ok(());
        for r in doom_results {
            collect_error(&mut result, ignore_not_found(r));
        }
        collect_error(&mut result, delete_result);
        for r in queued_results {
            collect_error(&mut result, r.unwrap_or(Ok(())));
        }
        result
    }

    /// Iterator over all entries, newest first. Entries created after the
    /// iterator are not returned; doomed entries are skipped.
    pub fn iter(&self) -> EntryIterator {
        EntryIterator {
            inner: Arc::clone(&self.inner),
            cursor: i64::MAX,
        }
    }
}

impl BackendInner {
    fn lock_state(&self) -> MutexGuard<'_, BackendState> {
        lock_ignore_poison(&self.state)
    }

    /// Fast path: a handle for `key` is already outstanding.
    fn active_handle(&self, key: &CacheKey) -> Option<CacheEntryHandle> {
        self.lock_state()
            .active
            .get(key)
            .and_then(Weak::upgrade)
            .map(CacheEntryHandle::new)
    }

    /// Register `key` as pending. Callers hold the returned guard across the
    /// store round trip and end it through `finish_operation` or
    /// `abandon_operation`; the guard's own drop only covers caller-side
    /// cancellation, where the whole operation chain is torn down together.
    fn begin_operation(self: &Arc<Self>, key: &CacheKey) -> PendingGuard {
        let mut state = self.lock_state();
        debug_assert!(
            !state.pending.contains_key(key),
            "second operation started for key {key} while one is pending"
        );
        state.pending.insert(key.clone(), PendingOp::default());
        PendingGuard {
            inner: Arc::clone(self),
            key: key.clone(),
            armed: true,
        }
    }

    /// Turn a completed store operation into a registered handle, applying
    /// any dooms queued while it was in flight.
    async fn finish_operation(
        self: &Arc<Self>,
        mut guard: PendingGuard,
        key: &CacheKey,
        info: EntryInfo,
    ) -> CacheEntryHandle {
        let shared = Arc::new(EntryShared::new(
            Arc::downgrade(self),
            key.clone(),
            &info,
        ));

        let (queued, doomed_now) = {
            let mut state = self.lock_state();
            guard.armed = false;
            let queued = state
                .pending
                .remove(key)
                .map(|op| op.queued_dooms)
                .unwrap_or_default();
            let doomed_now = queued.iter().any(|doom| doom.matches(info.last_used));
            if doomed_now {
                shared.mark_doomed();
                state.doomed.insert(info.token, key.clone());
            } else {
                state.active.insert(key.clone(), Arc::downgrade(&shared));
            }
            (queued, doomed_now)
        };

        let result = if doomed_now {
            ignore_not_found(self.store.doom_entry(key, info.token).await)
        } else {
            Ok(())
        };
        for doom in queued {
            let _ = doom.tx.send(result);
        }

        CacheEntryHandle::new(shared)
    }

    /// A pending operation ended without producing a handle (store miss or
    /// failure). Dooms queued behind it must still land: the key is
    /// quiescent again, so they are applied against whatever row is on disk
    /// via the quiescent delete path.
    async fn abandon_operation(self: &Arc<Self>, mut guard: PendingGuard, key: &CacheKey) {
        let queued = {
            let mut state = self.lock_state();
            guard.armed = false;
            state
                .pending
                .remove(key)
                .map(|op| op.queued_dooms)
                .unwrap_or_default()
        };
        if queued.is_empty() {
            return;
        }

        let last_used = match self.store.open_entry(key).await {
            Ok(Some(info)) => Some(info.last_used),
            Ok(None) | Err(_) => None,
        };
        let matched = queued.iter().any(|doom| match (doom.range, last_used) {
            (None, _) => true,
            (Some((initial, end)), Some(t)) => in_range(t, initial, end),
            (Some(_), None) => false,
        });
        let result = if matched {
            ignore_not_found(self.store.delete_live_entry(key).await)
        } else {
            Ok(())
        };
        for doom in queued {
            let _ = doom.tx.send(result);
        }
    }

    /// Move an active entry into the doomed set. The store-side doom is the
    /// caller's responsibility.
    fn doom_active_locked(&self, state: &mut BackendState, shared: &EntryShared) {
        if shared.mark_doomed() {
            state.active.remove(shared.key());
            state.doomed.insert(shared.token(), shared.key().clone());
        }
    }

    /// Handle-initiated doom, from a context that cannot await.
    pub(crate) fn doom_shared_detached(&self, shared: &EntryShared) {
        {
            let mut state = self.lock_state();
            if !shared.mark_doomed() {
                return;
            }
            state.active.remove(shared.key());
            state.doomed.insert(shared.token(), shared.key().clone());
        }
        self.store
            .doom_entry_detached(shared.key().clone(), shared.token());
    }

    /// Last handle of an entry dropped: unregister it and, for doomed
    /// entries, delete the row.
    pub(crate) fn release_entry(&self, key: &CacheKey, token: EntryToken, doomed: bool) {
        {
            let mut state = self.lock_state();
            if doomed {
                state.doomed.remove(&token);
            } else if state
                .active
                .get(key)
                .is_some_and(|weak| weak.upgrade().is_none())
            {
                state.active.remove(key);
            }
        }
        if doomed {
            self.store.delete_doomed_entry_detached(key.clone(), token);
        }
    }
}

/// Removes the pending record when an operation is abandoned mid-flight.
struct PendingGuard {
    inner: Arc<BackendInner>,
    key: CacheKey,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock_state().pending.remove(&self.key);
        }
    }
}

/// Cursor over all live entries, newest creation first.
pub struct EntryIterator {
    inner: Arc<BackendInner>,
    cursor: i64,
}

impl EntryIterator {
    /// The next entry, or `None` when exhausted. Keys with outstanding
    /// handles yield the already-active entry.
    pub async fn next(&mut self) -> Result<Option<CacheEntryHandle>> {
        loop {
            let Some(entry) = self
                .inner
                .store
                .open_latest_entry_before_res_id(self.cursor)
                .await?
            else {
                return Ok(None);
            };
            self.cursor = entry.res_id;

            let mut state = self.inner.lock_state();
            if let Some(handle) = state.active.get(&entry.key).and_then(Weak::upgrade) {
                return Ok(Some(CacheEntryHandle::new(handle)));
            }
            // A doom or create may have raced the enumeration step for this
            // key; skip rather than hand out a handle for a row in motion.
            if state.pending.contains_key(&entry.key) {
                continue;
            }
            let shared = Arc::new(EntryShared::new(
                Arc::downgrade(&self.inner),
                entry.key.clone(),
                &entry.info,
            ));
            state
                .active
                .insert(entry.key.clone(), Arc::downgrade(&shared));
            return Ok(Some(CacheEntryHandle::new(shared)));
        }
    }
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(StoreError::NotFound) => Ok(()),
        other => other,
    }
}

fn collect_error(acc: &mut Result<()>, result: Result<()>) {
    if acc.is_ok() {
        if let Err(e) = result {
            *acc = Err(e);
        }
    }
}
