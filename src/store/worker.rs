//! Serialized execution of store operations against the SQLite database.
//!
//! One worker owns the connection and the in-memory mirror of the two
//! persisted aggregates. Every mutating operation maintains the aggregates
//! with checked arithmetic; when a delta is unrepresentable or a row is
//! structurally implausible, the incremental path is abandoned and both
//! aggregates are recomputed from the live rows inside the same
//! transaction. Recovery is silent from the caller's point of view.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use super::{schema, EntryInfo, EnumeratedEntry, Job, Limits};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::key::CacheKey;
use crate::token::EntryToken;

/// Fraction of the total budget a single entry's file may occupy.
pub const MAX_FILE_RATIO_DENOMINATOR: i64 = 8;
/// Lower clamp for the per-file size limit: 5 MiB.
pub const MIN_FILE_SIZE_LIMIT: i64 = 5 * 1024 * 1024;

/// Fraction of free disk space claimed when the configured budget is zero.
const AUTO_POOL_DIVISOR: i64 = 10;
/// Bounds for the auto-sized pool.
const AUTO_POOL_MIN: i64 = 20 * 1024 * 1024;
const AUTO_POOL_MAX: i64 = 320 * 1024 * 1024;

/// Worker-side state: configuration plus the database once initialized.
pub(crate) struct Worker {
    config: StoreConfig,
    limits: Arc<Limits>,
    db: Option<Database>,
}

/// The open database and the aggregate mirror.
struct Database {
    conn: Connection,
    entry_count: i32,
    total_size: i64,
}

/// Worker thread entry point: drain jobs until every store handle is gone.
pub(crate) fn run(config: StoreConfig, limits: Arc<Limits>, mut jobs: UnboundedReceiver<Job>) {
    let mut worker = Worker {
        config,
        limits,
        db: None,
    };
    while let Some(job) = jobs.blocking_recv() {
        job(&mut worker);
    }
    debug!("store worker exiting");
}

impl Worker {
    /// Open (or recover) the database and compute the size limits.
    pub(crate) fn initialize(&mut self) -> Result<()> {
        if self.db.is_some() {
            return Ok(());
        }

        let (conn, entry_count, total_size) = schema::open_database(&self.config.path)?;

        let max_size = if self.config.max_bytes > 0 {
            self.config.max_bytes
        } else {
            auto_pool_size(&self.config)
        };
        let max_file_size = (max_size / MAX_FILE_RATIO_DENOMINATOR)
            .max(MIN_FILE_SIZE_LIMIT)
            .min(max_size);
        self.limits.max_size.store(max_size, Ordering::Relaxed);
        self.limits
            .max_file_size
            .store(max_file_size, Ordering::Relaxed);

        self.db = Some(Database {
            conn,
            entry_count,
            total_size,
        });
        Ok(())
    }

    fn db(&mut self) -> Result<&mut Database> {
        self.db.as_mut().ok_or(StoreError::FailedToOpenDatabase)
    }

    /// Current entry count; zero when uninitialized.
    pub(crate) fn entry_count(&self) -> i32 {
        self.db.as_ref().map_or(0, |db| db.entry_count.max(0))
    }

    /// Total size of all live entries including the static per-entry
    /// overhead estimate, saturating at `i64::MAX`.
    pub(crate) fn size_of_all_entries(&self) -> i64 {
        let Some(db) = self.db.as_ref() else { return 0 };
        let overhead = (db.entry_count.max(0) as i64)
            .saturating_mul(self.config.static_entry_overhead);
        db.total_size.max(0).saturating_add(overhead)
    }

    pub(crate) fn create_entry(&mut self, key: &CacheKey) -> Result<EntryInfo> {
        let db = self.db()?;
        if live_row(&db.conn, key, "res_id")?.is_some() {
            return Err(StoreError::AlreadyExists);
        }
        db.insert_entry(key)
    }

    pub(crate) fn open_entry(&mut self, key: &CacheKey) -> Result<Option<EntryInfo>> {
        let db = self.db()?;
        db.open_entry(key)
    }

    pub(crate) fn open_or_create_entry(&mut self, key: &CacheKey) -> Result<EntryInfo> {
        let db = self.db()?;
        match db.open_entry(key)? {
            Some(info) => Ok(info),
            None => db.insert_entry(key),
        }
    }

    pub(crate) fn doom_entry(&mut self, key: &CacheKey, token: EntryToken) -> Result<()> {
        let db = self.db()?;
        let row = db
            .conn
            .query_row(
                "SELECT res_id, bytes_usage FROM resources
                 WHERE cache_key = ?1 AND doomed = 0
                   AND token_high = ?2 AND token_low = ?3
                 LIMIT 1",
                params![key.as_str(), token.high() as i64, token.low() as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((res_id, bytes_usage)) = row else {
            return Err(StoreError::NotFound);
        };

        let tx = db.conn.transaction()?;
        tx.execute("UPDATE resources SET doomed = 1 WHERE res_id = ?1", [res_id])?;
        let (entry_count, total_size) =
            apply_delta(&tx, db.entry_count, db.total_size, -1, bytes_usage, false)?;
        write_aggregates(&tx, entry_count, total_size)?;
        tx.commit()?;
        db.entry_count = entry_count;
        db.total_size = total_size;
        Ok(())
    }

    pub(crate) fn delete_doomed_entry(&mut self, key: &CacheKey, token: EntryToken) -> Result<()> {
        let db = self.db()?;
        let changed = db.conn.execute(
            "DELETE FROM resources
             WHERE cache_key = ?1 AND doomed = 1
               AND token_high = ?2 AND token_low = ?3",
            params![key.as_str(), token.high() as i64, token.low() as i64],
        )?;
        if changed == 0 {
            Err(StoreError::NotFound)
        } else {
            Ok(())
        }
    }

    pub(crate) fn delete_live_entry(&mut self, key: &CacheKey) -> Result<()> {
        let db = self.db()?;
        let row = db
            .conn
            .query_row(
                "SELECT res_id, token_high, token_low, bytes_usage FROM resources
                 WHERE cache_key = ?1 AND doomed = 0
                 LIMIT 1",
                [key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((res_id, high, low, bytes_usage)) = row else {
            return Err(StoreError::NotFound);
        };
        let corrupt = EntryToken::from_halves(high as u64, low as u64).is_none();

        let tx = db.conn.transaction()?;
        tx.execute("DELETE FROM resources WHERE res_id = ?1", [res_id])?;
        let (entry_count, total_size) =
            apply_delta(&tx, db.entry_count, db.total_size, -1, bytes_usage, corrupt)?;
        write_aggregates(&tx, entry_count, total_size)?;
        tx.commit()?;
        db.entry_count = entry_count;
        db.total_size = total_size;
        Ok(())
    }

    pub(crate) fn delete_all_entries(&mut self) -> Result<()> {
        let db = self.db()?;
        let tx = db.conn.transaction()?;
        tx.execute("DELETE FROM resources", [])?;
        write_aggregates(&tx, 0, 0)?;
        tx.commit()?;
        db.entry_count = 0;
        db.total_size = 0;
        Ok(())
    }

    pub(crate) fn delete_live_entries_between(
        &mut self,
        initial_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        excluded_keys: &HashSet<CacheKey>,
    ) -> Result<()> {
        let db = self.db()?;
        let lo = initial_time.map_or(i64::MIN, to_micros);
        let hi = end_time.map_or(i64::MAX, to_micros);

        let tx = db.conn.transaction()?;
        let rows: Vec<(i64, String, i64, i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT res_id, cache_key, token_high, token_low, bytes_usage
                 FROM resources
                 WHERE doomed = 0 AND last_used >= ?1 AND last_used < ?2",
            )?;
            let mapped = stmt.query_map(params![lo, hi], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let mut entry_count = db.entry_count;
        let mut total_size = db.total_size;
        let mut corruption_detected = false;
        for (res_id, cache_key, high, low, bytes_usage) in rows {
            if excluded_keys.contains(cache_key.as_str()) {
                continue;
            }
            tx.execute("DELETE FROM resources WHERE res_id = ?1", [res_id])?;
            if EntryToken::from_halves(high as u64, low as u64).is_none() {
                corruption_detected = true;
            }
            match (
                entry_count.checked_sub(1),
                total_size.checked_sub(bytes_usage),
            ) {
                (Some(count), Some(total)) if count >= 0 && total >= 0 => {
                    entry_count = count;
                    total_size = total;
                }
                _ => corruption_detected = true,
            }
        }
        if corruption_detected {
            warn!("inconsistent rows during range deletion; recomputing aggregates");
            (entry_count, total_size) = recompute_aggregates(&tx)?;
        }
        write_aggregates(&tx, entry_count, total_size)?;
        tx.commit()?;
        db.entry_count = entry_count;
        db.total_size = total_size;
        Ok(())
    }

    pub(crate) fn open_latest_entry_before_res_id(
        &mut self,
        res_id: i64,
    ) -> Result<Option<EnumeratedEntry>> {
        let db = self.db()?;
        let mut bound = res_id;
        loop {
            let row = db
                .conn
                .query_row(
                    "SELECT res_id, cache_key, token_high, token_low,
                            last_used, body_end, head
                     FROM resources
                     WHERE doomed = 0 AND res_id < ?1
                     ORDER BY res_id DESC
                     LIMIT 1",
                    [bound],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, Option<Vec<u8>>>(6)?,
                        ))
                    },
                )
                .optional()?;
            let Some((row_id, cache_key, high, low, last_used, body_end, head)) = row else {
                return Ok(None);
            };
            bound = row_id;
            let Some(token) = EntryToken::from_halves(high as u64, low as u64) else {
                warn!(key = %cache_key, "skipping entry with malformed token");
                continue;
            };
            return Ok(Some(EnumeratedEntry {
                key: CacheKey::new(cache_key),
                info: EntryInfo {
                    token,
                    last_used: from_micros(last_used),
                    body_end,
                    head: head.unwrap_or_default(),
                    opened: true,
                },
                res_id: row_id,
            }));
        }
    }
}

impl Database {
    /// Read the live row for `key`, if any.
    fn open_entry(&mut self, key: &CacheKey) -> Result<Option<EntryInfo>> {
        let row = self
            .conn
            .query_row(
                "SELECT token_high, token_low, last_used, body_end, head
                 FROM resources
                 WHERE cache_key = ?1 AND doomed = 0
                 LIMIT 1",
                [key.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<Vec<u8>>>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((high, low, last_used, body_end, head)) = row else {
            return Ok(None);
        };
        // Open is read-only: a malformed token is reported, never repaired.
        let Some(token) = EntryToken::from_halves(high as u64, low as u64) else {
            warn!(key = %key, "stored token is malformed");
            return Err(StoreError::InvalidData);
        };
        Ok(Some(EntryInfo {
            token,
            last_used: from_micros(last_used),
            body_end,
            head: head.unwrap_or_default(),
            opened: true,
        }))
    }

    /// Insert a fresh generation for `key` and account for it.
    fn insert_entry(&mut self, key: &CacheKey) -> Result<EntryInfo> {
        let token = EntryToken::generate();
        let last_used = Utc::now();
        let bytes_usage = key.len() as i64;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO resources(cache_key, token_high, token_low,
                                   last_used, body_end, bytes_usage, doomed)
             VALUES(?1, ?2, ?3, ?4, 0, ?5, 0)",
            params![
                key.as_str(),
                token.high() as i64,
                token.low() as i64,
                to_micros(last_used),
                bytes_usage
            ],
        )?;
        let (entry_count, total_size) =
            apply_delta(&tx, self.entry_count, self.total_size, 1, bytes_usage, false)?;
        write_aggregates(&tx, entry_count, total_size)?;
        tx.commit()?;
        self.entry_count = entry_count;
        self.total_size = total_size;

        Ok(EntryInfo {
            token,
            last_used,
            body_end: 0,
            head: Vec::new(),
            opened: false,
        })
    }
}

/// Look up one column of the live row for `key`.
fn live_row(conn: &Connection, key: &CacheKey, column: &str) -> Result<Option<i64>> {
    let sql =
        format!("SELECT {column} FROM resources WHERE cache_key = ?1 AND doomed = 0 LIMIT 1");
    Ok(conn
        .query_row(&sql, [key.as_str()], |row| row.get(0))
        .optional()?)
}

/// Apply a signed aggregate delta with checked arithmetic.
///
/// `count_delta` is +1 or -1; `bytes_usage` is the affected row's
/// contribution. When the arithmetic is unrepresentable, produces a negative
/// aggregate, or the caller already detected corruption, both aggregates are
/// recomputed from the live rows instead. The mutation that motivated the
/// delta must already be applied inside `tx` so the recomputation sees the
/// post-mutation state.
fn apply_delta(
    tx: &Transaction<'_>,
    entry_count: i32,
    total_size: i64,
    count_delta: i32,
    bytes_usage: i64,
    corruption_detected: bool,
) -> Result<(i32, i64)> {
    if !corruption_detected {
        let count = entry_count.checked_add(count_delta);
        let total = if count_delta >= 0 {
            total_size.checked_add(bytes_usage)
        } else {
            total_size.checked_sub(bytes_usage)
        };
        if let (Some(count), Some(total)) = (count, total) {
            if count >= 0 && total >= 0 {
                return Ok((count, total));
            }
        }
    }
    warn!("aggregate update not representable; recomputing from live rows");
    recompute_aggregates(tx)
}

/// Recompute both aggregates by scanning the live rows.
///
/// Per-row negative byte usages are clamped so one corrupt row cannot poison
/// the sum.
fn recompute_aggregates(tx: &Transaction<'_>) -> Result<(i32, i64)> {
    let (count, total): (i64, i64) = tx.query_row(
        "SELECT COUNT(*), IFNULL(SUM(MAX(bytes_usage, 0)), 0)
         FROM resources WHERE doomed = 0",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((
        i32::try_from(count).unwrap_or(i32::MAX),
        total.max(0),
    ))
}

/// Persist both aggregates into the meta table.
fn write_aggregates(tx: &Transaction<'_>, entry_count: i32, total_size: i64) -> Result<()> {
    schema::set_meta_i64(tx, schema::META_KEY_ENTRY_COUNT, i64::from(entry_count))?;
    schema::set_meta_i64(tx, schema::META_KEY_TOTAL_SIZE, total_size)?;
    Ok(())
}

/// Auto-size the cache pool from the free space of the cache volume.
fn auto_pool_size(config: &StoreConfig) -> i64 {
    match fs2::available_space(&config.path) {
        Ok(available) => {
            let share = i64::try_from(available / AUTO_POOL_DIVISOR as u64).unwrap_or(i64::MAX);
            share.clamp(AUTO_POOL_MIN, AUTO_POOL_MAX)
        }
        Err(e) => {
            warn!(error = %e, "free disk space unavailable; using minimum pool size");
            AUTO_POOL_MIN
        }
    }
}

fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

fn from_micros(v: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(v).unwrap_or_default()
}
