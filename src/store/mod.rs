//! Asynchronous façade over the serialized SQLite-backed store.
//!
//! All database work runs on one dedicated worker thread that owns the
//! connection; callers submit closures over a channel and await the reply on
//! a oneshot. Dropping a returned future cancels delivery of its result but
//! never the operation itself, which still runs to completion on the worker.
//! Once the store (and with it the job channel) is gone, submitted
//! operations never resolve; callers observe a future that stays pending
//! rather than a spurious error.

mod schema;
pub(crate) mod worker;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::config::StoreConfig;
use crate::error::Result;
use crate::key::CacheKey;
use crate::token::EntryToken;

pub use worker::{MAX_FILE_RATIO_DENOMINATOR, MIN_FILE_SIZE_LIMIT};

/// A unit of work executed on the worker thread.
pub(crate) type Job = Box<dyn FnOnce(&mut worker::Worker) + Send>;

/// Size limits computed during initialization, readable without a round trip
/// to the worker.
pub(crate) struct Limits {
    pub(crate) max_size: AtomicI64,
    pub(crate) max_file_size: AtomicI64,
}

/// Metadata of one entry generation as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    /// Identity token of this generation.
    pub token: EntryToken,
    /// Last-used time recorded for the entry.
    pub last_used: DateTime<Utc>,
    /// End offset of the body, in bytes.
    pub body_end: i64,
    /// Serialized response head.
    pub head: Vec<u8>,
    /// Whether the entry pre-existed (`true`) or was just created (`false`).
    pub opened: bool,
}

/// One entry yielded by enumeration, with its cursor position.
#[derive(Debug, Clone)]
pub struct EnumeratedEntry {
    pub key: CacheKey,
    pub info: EntryInfo,
    /// Internal row id; pass back as the cursor for the next call.
    pub res_id: i64,
}

/// Handle to the store. Cloneable via `Arc` by callers; dropping the last
/// handle shuts the worker thread down once its queue drains.
pub struct PersistentStore {
    jobs: mpsc::UnboundedSender<Job>,
    limits: Arc<Limits>,
}

impl PersistentStore {
    /// Create a store and spawn its worker thread. No I/O happens until
    /// [`initialize`](Self::initialize).
    pub fn new(config: StoreConfig) -> Self {
        let limits = Arc::new(Limits {
            max_size: AtomicI64::new(0),
            max_file_size: AtomicI64::new(0),
        });
        let (jobs, rx) = mpsc::unbounded_channel();
        let worker_limits = Arc::clone(&limits);
        std::thread::Builder::new()
            .name("cache-store".into())
            .spawn(move || worker::run(config, worker_limits, rx))
            .ok();
        Self { jobs, limits }
    }

    /// Open or recover the database and compute the size limits.
    pub async fn initialize(&self) -> Result<()> {
        self.run(|w| w.initialize()).await
    }

    /// Total byte budget of the cache. Zero before initialization.
    pub fn max_size(&self) -> i64 {
        self.limits.max_size.load(Ordering::Relaxed)
    }

    /// Largest size a single entry may reach. Zero before initialization.
    pub fn max_file_size(&self) -> i64 {
        self.limits.max_file_size.load(Ordering::Relaxed)
    }

    /// Number of live entries.
    pub async fn entry_count(&self) -> i32 {
        self.run(|w| w.entry_count()).await
    }

    /// Estimated total on-disk footprint of all live entries.
    pub async fn size_of_all_entries(&self) -> i64 {
        self.run(|w| w.size_of_all_entries()).await
    }

    /// Create a new entry. Fails with `AlreadyExists` when a live entry for
    /// the key is present.
    pub async fn create_entry(&self, key: &CacheKey) -> Result<EntryInfo> {
        let key = key.clone();
        self.run(move |w| w.create_entry(&key)).await
    }

    /// Open the live entry for `key`, or `None` when there is none.
    pub async fn open_entry(&self, key: &CacheKey) -> Result<Option<EntryInfo>> {
        let key = key.clone();
        self.run(move |w| w.open_entry(&key)).await
    }

    /// Open the live entry for `key`, creating it when absent. The returned
    /// `opened` flag says which happened.
    pub async fn open_or_create_entry(&self, key: &CacheKey) -> Result<EntryInfo> {
        let key = key.clone();
        self.run(move |w| w.open_or_create_entry(&key)).await
    }

    /// Mark the live entry matching `key` and `token` as doomed. The row
    /// stays on disk until [`delete_doomed_entry`](Self::delete_doomed_entry)
    /// but no longer counts as live.
    pub async fn doom_entry(&self, key: &CacheKey, token: EntryToken) -> Result<()> {
        let key = key.clone();
        self.run(move |w| w.doom_entry(&key, token)).await
    }

    /// Fire-and-forget variant of [`doom_entry`](Self::doom_entry), for
    /// contexts that cannot await.
    pub(crate) fn doom_entry_detached(&self, key: CacheKey, token: EntryToken) {
        self.submit(move |w| {
            let _ = w.doom_entry(&key, token);
        });
    }

    /// Physically delete a previously doomed row.
    pub async fn delete_doomed_entry(&self, key: &CacheKey, token: EntryToken) -> Result<()> {
        let key = key.clone();
        self.run(move |w| w.delete_doomed_entry(&key, token)).await
    }

    /// Fire-and-forget variant of
    /// [`delete_doomed_entry`](Self::delete_doomed_entry).
    pub(crate) fn delete_doomed_entry_detached(&self, key: CacheKey, token: EntryToken) {
        self.submit(move |w| {
            let _ = w.delete_doomed_entry(&key, token);
        });
    }

    /// Delete the live entry for `key` outright, without a doom phase.
    pub async fn delete_live_entry(&self, key: &CacheKey) -> Result<()> {
        let key = key.clone();
        self.run(move |w| w.delete_live_entry(&key)).await
    }

    /// Delete every row, live and doomed, and reset the aggregates.
    pub async fn delete_all_entries(&self) -> Result<()> {
        self.run(|w| w.delete_all_entries()).await
    }

    /// Delete live entries whose last-used time falls in
    /// `[initial_time, end_time)`. `None` bounds are unbounded. Entries whose
    /// key is in `excluded_keys` are left alone.
    pub async fn delete_live_entries_between(
        &self,
        initial_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        excluded_keys: HashSet<CacheKey>,
    ) -> Result<()> {
        self.run(move |w| w.delete_live_entries_between(initial_time, end_time, &excluded_keys))
            .await
    }

    /// Enumeration step: the live entry with the largest row id strictly
    /// below `res_id`, or `None` when exhausted. Start with `i64::MAX`.
    /// Rows with malformed tokens are skipped.
    pub async fn open_latest_entry_before_res_id(
        &self,
        res_id: i64,
    ) -> Result<Option<EnumeratedEntry>> {
        self.run(move |w| w.open_latest_entry_before_res_id(res_id))
            .await
    }

    /// Wait until every previously submitted operation has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |_| {
            let _ = tx.send(());
        });
        if self.jobs.send(job).is_ok() {
            let _ = rx.await;
        }
    }

    /// Submit a job and ignore whether it was accepted.
    pub(crate) fn submit(&self, f: impl FnOnce(&mut worker::Worker) + Send + 'static) {
        let _ = self.jobs.send(Box::new(f));
    }

    async fn run<R, F>(&self, f: F) -> R
    where
        R: Send + 'static,
        F: FnOnce(&mut worker::Worker) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |w| {
            let _ = tx.send(f(w));
        });
        if self.jobs.send(job).is_err() {
            // Worker gone: by contract the completion never fires.
            return std::future::pending().await;
        }
        match rx.await {
            Ok(value) => value,
            Err(_) => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use rusqlite::params;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const TEST_MAX_BYTES: i64 = 10 * 1024 * 1024;

    async fn create_store(dir: &Path) -> PersistentStore {
        let store = PersistentStore::new(
            StoreConfig::new(dir).with_max_bytes(TEST_MAX_BYTES),
        );
        store.initialize().await.expect("initialize");
        store
    }

    /// Direct connection to the store's database, for fault injection.
    fn raw_conn(dir: &Path) -> rusqlite::Connection {
        let conn = rusqlite::Connection::open(dir.join(schema::DATABASE_FILE_NAME))
            .expect("open raw connection");
        conn.busy_timeout(Duration::from_secs(5)).expect("busy timeout");
        conn
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s)
    }

    #[tokio::test]
    async fn test_initialize_creates_database() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;

        assert!(dir.path().join(schema::DATABASE_FILE_NAME).exists());
        assert_eq!(store.entry_count().await, 0);
        assert_eq!(store.size_of_all_entries().await, 0);
        assert_eq!(store.max_size(), TEST_MAX_BYTES);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        store.initialize().await.expect("second initialize");
        assert_eq!(store.max_size(), TEST_MAX_BYTES);
    }

    #[tokio::test]
    async fn test_reopen_preserves_entries() {
        let dir = TempDir::new().unwrap();
        let k = key("http://example.com/");
        let token = {
            let store = create_store(dir.path()).await;
            let info = store.create_entry(&k).await.expect("create");
            store.flush().await;
            info.token
        };

        let store = create_store(dir.path()).await;
        assert_eq!(store.entry_count().await, 1);
        let info = store.open_entry(&k).await.expect("open").expect("present");
        assert_eq!(info.token, token);
        assert!(info.opened);
    }

    #[tokio::test]
    async fn test_initialize_razes_newer_version() {
        let dir = TempDir::new().unwrap();
        let k = key("a");
        {
            let store = create_store(dir.path()).await;
            store.create_entry(&k).await.expect("create");
            store.flush().await;
        }
        {
            let conn = raw_conn(dir.path());
            conn.execute(
                "UPDATE meta SET value = 999
                 WHERE key IN ('version', 'last_compatible_version')",
                [],
            )
            .unwrap();
        }

        let store = create_store(dir.path()).await;
        assert_eq!(store.entry_count().await, 0);
        assert!(store.open_entry(&k).await.expect("open").is_none());
    }

    #[tokio::test]
    async fn test_initialize_recovers_from_garbage_file() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            dir.path().join(schema::DATABASE_FILE_NAME),
            b"this is not a database",
        )
        .unwrap();

        let store = create_store(dir.path()).await;
        assert_eq!(store.entry_count().await, 0);
        store.create_entry(&key("a")).await.expect("create after raze");
    }

    #[tokio::test]
    async fn test_initialize_fails_on_obstructed_directory() {
        let dir = TempDir::new().unwrap();
        let obstructed = dir.path().join("cache");
        std::fs::write(&obstructed, b"file in the way").unwrap();

        let store = PersistentStore::new(
            StoreConfig::new(&obstructed).with_max_bytes(TEST_MAX_BYTES),
        );
        assert_eq!(
            store.initialize().await,
            Err(StoreError::FailedToCreateDirectory)
        );
    }

    #[tokio::test]
    async fn test_max_file_size_is_an_eighth_of_the_budget() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::new(
            StoreConfig::new(dir.path()).with_max_bytes(80 * 1024 * 1024),
        );
        store.initialize().await.unwrap();
        assert_eq!(store.max_file_size(), 10 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_max_file_size_has_a_floor() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        // 10 MiB / 8 would be below the floor.
        assert_eq!(store.max_file_size(), MIN_FILE_SIZE_LIMIT);
    }

    #[tokio::test]
    async fn test_max_file_size_never_exceeds_budget() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::new(
            StoreConfig::new(dir.path()).with_max_bytes(2 * 1024 * 1024),
        );
        store.initialize().await.unwrap();
        assert_eq!(store.max_file_size(), 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_zero_budget_auto_sizes_from_disk_space() {
        let dir = TempDir::new().unwrap();
        let store = PersistentStore::new(StoreConfig::new(dir.path()));
        store.initialize().await.unwrap();

        let max = store.max_size();
        assert!(max >= 20 * 1024 * 1024);
        assert!(max <= 320 * 1024 * 1024);
        assert!(store.max_file_size() >= MIN_FILE_SIZE_LIMIT);
        assert!(store.max_file_size() <= max);
    }

    #[tokio::test]
    async fn test_negative_persisted_entry_count_is_clamped() {
        let dir = TempDir::new().unwrap();
        {
            let store = create_store(dir.path()).await;
            store.flush().await;
        }
        {
            let conn = raw_conn(dir.path());
            schema::set_meta_i64(&conn, schema::META_KEY_ENTRY_COUNT, -5).unwrap();
            schema::set_meta_i64(&conn, schema::META_KEY_TOTAL_SIZE, -123).unwrap();
        }

        let store = create_store(dir.path()).await;
        assert_eq!(store.entry_count().await, 0);
        assert_eq!(store.size_of_all_entries().await, 0);
    }

    #[tokio::test]
    async fn test_oversized_persisted_entry_count_is_clamped() {
        let dir = TempDir::new().unwrap();
        {
            let store = create_store(dir.path()).await;
            store.flush().await;
        }
        {
            let conn = raw_conn(dir.path());
            schema::set_meta_i64(
                &conn,
                schema::META_KEY_ENTRY_COUNT,
                i64::from(i32::MAX) + 1,
            )
            .unwrap();
        }

        let store = create_store(dir.path()).await;
        assert_eq!(store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_size_of_all_entries_saturates() {
        let dir = TempDir::new().unwrap();
        {
            let store = create_store(dir.path()).await;
            store.create_entry(&key("a")).await.unwrap();
            store.flush().await;
        }
        {
            let conn = raw_conn(dir.path());
            schema::set_meta_i64(&conn, schema::META_KEY_TOTAL_SIZE, i64::MAX - 100).unwrap();
        }

        let store = create_store(dir.path()).await;
        assert_eq!(store.size_of_all_entries().await, i64::MAX);
    }

    #[tokio::test]
    async fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("http://example.com/");

        let created = store.create_entry(&k).await.expect("create");
        assert!(!created.opened);
        assert_eq!(created.body_end, 0);
        assert!(created.head.is_empty());

        let opened = store.open_entry(&k).await.expect("open").expect("present");
        assert!(opened.opened);
        assert_eq!(opened.token, created.token);

        assert_eq!(store.entry_count().await, 1);
        assert_eq!(
            store.size_of_all_entries().await,
            k.len() as i64 + crate::config::DEFAULT_STATIC_ENTRY_OVERHEAD
        );
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("a");

        store.create_entry(&k).await.expect("first create");
        assert_eq!(
            store.create_entry(&k).await,
            Err(StoreError::AlreadyExists)
        );
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_open_missing_entry() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        assert!(store.open_entry(&key("missing")).await.expect("open").is_none());
    }

    #[tokio::test]
    async fn test_open_or_create() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("a");

        let first = store.open_or_create_entry(&k).await.expect("create path");
        assert!(!first.opened);

        let second = store.open_or_create_entry(&k).await.expect("open path");
        assert!(second.opened);
        assert_eq!(second.token, first.token);
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_doom_entry() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("a");

        let info = store.create_entry(&k).await.unwrap();
        store.doom_entry(&k, info.token).await.expect("doom");

        assert!(store.open_entry(&k).await.expect("open").is_none());
        assert_eq!(store.entry_count().await, 0);
        assert_eq!(store.size_of_all_entries().await, 0);
    }

    #[tokio::test]
    async fn test_doom_with_wrong_token_fails() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("a");

        store.create_entry(&k).await.unwrap();
        let wrong = EntryToken::generate();
        assert_eq!(store.doom_entry(&k, wrong).await, Err(StoreError::NotFound));
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_doom_missing_entry_fails() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        assert_eq!(
            store.doom_entry(&key("missing"), EntryToken::generate()).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_doomed_entry_does_not_block_recreation() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("a");

        let old = store.create_entry(&k).await.unwrap();
        store.doom_entry(&k, old.token).await.unwrap();

        let new = store.create_entry(&k).await.expect("recreate");
        assert_ne!(new.token, old.token);

        // Deleting the doomed generation leaves the new one untouched.
        store.delete_doomed_entry(&k, old.token).await.expect("delete doomed");
        let opened = store.open_entry(&k).await.unwrap().expect("still present");
        assert_eq!(opened.token, new.token);
    }

    #[tokio::test]
    async fn test_delete_doomed_entry_requires_doomed_row() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("a");

        let info = store.create_entry(&k).await.unwrap();
        // Live, not doomed.
        assert_eq!(
            store.delete_doomed_entry(&k, info.token).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_delete_live_entry() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("a");

        store.create_entry(&k).await.unwrap();
        store.delete_live_entry(&k).await.expect("delete");

        assert!(store.open_entry(&k).await.unwrap().is_none());
        assert_eq!(store.entry_count().await, 0);
        assert_eq!(
            store.delete_live_entry(&k).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_delete_all_entries() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;

        let doomed = store.create_entry(&key("a")).await.unwrap();
        store.doom_entry(&key("a"), doomed.token).await.unwrap();
        store.create_entry(&key("b")).await.unwrap();
        store.create_entry(&key("c")).await.unwrap();

        store.delete_all_entries().await.expect("delete all");
        assert_eq!(store.entry_count().await, 0);
        assert_eq!(store.size_of_all_entries().await, 0);
        assert!(store.open_entry(&key("b")).await.unwrap().is_none());

        // The doomed row is gone too.
        assert_eq!(
            store.delete_doomed_entry(&key("a"), doomed.token).await,
            Err(StoreError::NotFound)
        );
    }

    /// Rewrite an entry's last-used column directly.
    fn set_last_used(dir: &Path, key: &str, micros: i64) {
        let conn = raw_conn(dir);
        let changed = conn
            .execute(
                "UPDATE resources SET last_used = ?1 WHERE cache_key = ?2",
                params![micros, key],
            )
            .unwrap();
        assert_eq!(changed, 1);
    }

    #[tokio::test]
    async fn test_delete_live_entries_between_is_half_open() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        for k in ["a", "b", "c"] {
            store.create_entry(&key(k)).await.unwrap();
        }
        store.flush().await;
        set_last_used(dir.path(), "a", 100);
        set_last_used(dir.path(), "b", 200);
        set_last_used(dir.path(), "c", 300);

        let t = |micros| Some(DateTime::from_timestamp_micros(micros).unwrap());
        store
            .delete_live_entries_between(t(150), t(300), HashSet::new())
            .await
            .expect("range delete");

        // Only b falls inside [150, 300).
        assert!(store.open_entry(&key("a")).await.unwrap().is_some());
        assert!(store.open_entry(&key("b")).await.unwrap().is_none());
        assert!(store.open_entry(&key("c")).await.unwrap().is_some());
        assert_eq!(store.entry_count().await, 2);
    }

    #[tokio::test]
    async fn test_delete_live_entries_between_honors_exclusions() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        for k in ["a", "b", "c"] {
            store.create_entry(&key(k)).await.unwrap();
        }

        let excluded: HashSet<CacheKey> = [key("b")].into_iter().collect();
        store
            .delete_live_entries_between(None, None, excluded)
            .await
            .expect("range delete");

        assert!(store.open_entry(&key("a")).await.unwrap().is_none());
        assert!(store.open_entry(&key("b")).await.unwrap().is_some());
        assert!(store.open_entry(&key("c")).await.unwrap().is_none());
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_live_entries_between_unbounded_deletes_all_live() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let doomed = store.create_entry(&key("doomed")).await.unwrap();
        store.doom_entry(&key("doomed"), doomed.token).await.unwrap();
        store.create_entry(&key("live")).await.unwrap();

        store
            .delete_live_entries_between(None, None, HashSet::new())
            .await
            .unwrap();

        assert_eq!(store.entry_count().await, 0);
        // Doomed rows are untouched by the range delete.
        store
            .delete_doomed_entry(&key("doomed"), doomed.token)
            .await
            .expect("doomed row survived");
    }

    #[tokio::test]
    async fn test_entry_count_overflow_recovers() {
        let dir = TempDir::new().unwrap();
        {
            let store = create_store(dir.path()).await;
            store.create_entry(&key("a")).await.unwrap();
            store.flush().await;
        }
        {
            let conn = raw_conn(dir.path());
            schema::set_meta_i64(
                &conn,
                schema::META_KEY_ENTRY_COUNT,
                i64::from(i32::MAX),
            )
            .unwrap();
        }

        let store = create_store(dir.path()).await;
        assert_eq!(store.entry_count().await, i32::MAX);

        // The increment overflows, which triggers a recount of live rows.
        store.create_entry(&key("b")).await.expect("create");
        assert_eq!(store.entry_count().await, 2);
    }

    #[tokio::test]
    async fn test_entry_count_underflow_recovers() {
        let dir = TempDir::new().unwrap();
        let token;
        {
            let store = create_store(dir.path()).await;
            store.create_entry(&key("a")).await.unwrap();
            token = store.create_entry(&key("b")).await.unwrap().token;
            store.flush().await;
        }
        {
            let conn = raw_conn(dir.path());
            schema::set_meta_i64(&conn, schema::META_KEY_ENTRY_COUNT, 0).unwrap();
        }

        let store = create_store(dir.path()).await;
        store.doom_entry(&key("b"), token).await.expect("doom");
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_total_size_overflow_recovers() {
        let dir = TempDir::new().unwrap();
        {
            let store = create_store(dir.path()).await;
            store.create_entry(&key("a")).await.unwrap();
            store.flush().await;
        }
        {
            let conn = raw_conn(dir.path());
            schema::set_meta_i64(&conn, schema::META_KEY_TOTAL_SIZE, i64::MAX).unwrap();
        }

        let store = create_store(dir.path()).await;
        store.create_entry(&key("b")).await.expect("create");

        // Recomputed from the two live rows.
        let expected = (key("a").len() + key("b").len()) as i64
            + 2 * crate::config::DEFAULT_STATIC_ENTRY_OVERHEAD;
        assert_eq!(store.size_of_all_entries().await, expected);
    }

    #[tokio::test]
    async fn test_open_entry_with_zeroed_token_reports_invalid_data() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        store.create_entry(&key("a")).await.unwrap();
        store.flush().await;
        {
            let conn = raw_conn(dir.path());
            conn.execute(
                "UPDATE resources SET token_high = 0, token_low = 0 WHERE cache_key = 'a'",
                [],
            )
            .unwrap();
        }

        assert_eq!(
            store.open_entry(&key("a")).await,
            Err(StoreError::InvalidData)
        );
    }

    #[tokio::test]
    async fn test_delete_live_entry_with_zeroed_token_recounts() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        store.create_entry(&key("a")).await.unwrap();
        store.create_entry(&key("b")).await.unwrap();
        store.flush().await;
        {
            let conn = raw_conn(dir.path());
            conn.execute(
                "UPDATE resources SET token_high = 0, token_low = 0 WHERE cache_key = 'a'",
                [],
            )
            .unwrap();
        }

        // Deletion does not need the token, and the implausible row forces a
        // recount that lands on the surviving entry.
        store.delete_live_entry(&key("a")).await.expect("delete");
        assert_eq!(store.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_enumeration_walks_newest_to_oldest() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        for k in ["a", "b", "c"] {
            store.create_entry(&key(k)).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = i64::MAX;
        while let Some(entry) = store
            .open_latest_entry_before_res_id(cursor)
            .await
            .expect("enumerate")
        {
            seen.push(entry.key.as_str().to_owned());
            cursor = entry.res_id;
        }
        assert_eq!(seen, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_enumeration_skips_doomed_entries() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        for k in ["a", "b", "c"] {
            store.create_entry(&key(k)).await.unwrap();
        }
        let b = store.open_entry(&key("b")).await.unwrap().unwrap();
        store.doom_entry(&key("b"), b.token).await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = i64::MAX;
        while let Some(entry) = store
            .open_latest_entry_before_res_id(cursor)
            .await
            .unwrap()
        {
            seen.push(entry.key.as_str().to_owned());
            cursor = entry.res_id;
        }
        assert_eq!(seen, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_enumeration_skips_zeroed_tokens() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        for k in ["a", "b", "c"] {
            store.create_entry(&key(k)).await.unwrap();
        }
        store.flush().await;
        {
            let conn = raw_conn(dir.path());
            conn.execute(
                "UPDATE resources SET token_high = 0, token_low = 0 WHERE cache_key = 'b'",
                [],
            )
            .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = i64::MAX;
        while let Some(entry) = store
            .open_latest_entry_before_res_id(cursor)
            .await
            .unwrap()
        {
            seen.push(entry.key.as_str().to_owned());
            cursor = entry.res_id;
        }
        assert_eq!(seen, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_operations_after_worker_shutdown_stay_pending() {
        // A store whose worker is already gone: the job channel is closed.
        let (jobs, rx) = mpsc::unbounded_channel();
        drop(rx);
        let orphan = PersistentStore {
            jobs,
            limits: Arc::new(Limits {
                max_size: AtomicI64::new(0),
                max_file_size: AtomicI64::new(0),
            }),
        };

        let k = key("a");
        let pending = orphan.create_entry(&k);
        let result = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(result.is_err(), "operation resolved after worker shutdown");
    }

    #[tokio::test]
    async fn test_detached_doom_applies() {
        let dir = TempDir::new().unwrap();
        let store = create_store(dir.path()).await;
        let k = key("a");
        let info = store.create_entry(&k).await.unwrap();

        store.doom_entry_detached(k.clone(), info.token);
        store.flush().await;

        assert!(store.open_entry(&k).await.unwrap().is_none());
        assert_eq!(store.entry_count().await, 0);
    }
}
