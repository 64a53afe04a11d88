//! Database file lifecycle: open, schema creation, version gating, raze.
//!
//! The on-disk layout is one `resources` table (one row per entry
//! generation, live or doomed) plus a small `meta` key/value table carrying
//! the schema version and the two running aggregates. Unknown meta keys are
//! preserved, so older readers tolerate forward-compatible additions.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Name of the SQLite database file inside the cache directory.
pub(crate) const DATABASE_FILE_NAME: &str = "index.db";

/// Current schema version written by this build.
const CURRENT_DATABASE_VERSION: i64 = 1;
/// Oldest schema version this build can still read. Anything older is razed
/// and rebuilt empty.
const EARLIEST_SUPPORTED_VERSION: i64 = 1;

const META_KEY_VERSION: &str = "version";
const META_KEY_LAST_COMPATIBLE_VERSION: &str = "last_compatible_version";
pub(crate) const META_KEY_ENTRY_COUNT: &str = "entry_count";
pub(crate) const META_KEY_TOTAL_SIZE: &str = "total_size";

/// How an open attempt failed, which decides whether razing may help.
enum OpenFailure {
    /// Structural corruption or an incompatible schema version. Deleting the
    /// file and starting over is expected to succeed.
    Razeable,
    /// Environment problem (unwritable file, locked volume). Razing will not
    /// improve matters.
    Fatal,
}

/// Open or create the database under `dir`, recovering by raze-and-rebuild
/// when the file is corrupt or carries an incompatible schema version.
///
/// Returns the connection and the persisted aggregates, already clamped to
/// their valid ranges.
pub(crate) fn open_database(dir: &Path) -> Result<(Connection, i32, i64)> {
    std::fs::create_dir_all(dir).map_err(|e| {
        warn!(path = %dir.display(), error = %e, "cache directory creation failed");
        StoreError::FailedToCreateDirectory
    })?;

    let db_path = dir.join(DATABASE_FILE_NAME);
    match try_open(&db_path) {
        Ok(conn) => Ok(load_aggregates(conn)),
        Err(OpenFailure::Fatal) => Err(StoreError::FailedToOpenDatabase),
        Err(OpenFailure::Razeable) => {
            warn!(path = %db_path.display(), "razing cache database");
            raze(&db_path)?;
            match try_open(&db_path) {
                Ok(conn) => Ok(load_aggregates(conn)),
                Err(_) => Err(StoreError::FailedToOpenDatabase),
            }
        }
    }
}

/// Single open attempt: connection, pragmas, integrity check, version gate,
/// schema creation.
fn try_open(db_path: &Path) -> std::result::Result<Connection, OpenFailure> {
    let conn = Connection::open(db_path).map_err(classify)?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(classify)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(classify)?;

    // A truncated or overwritten file usually surfaces here rather than on
    // open, which is lazy.
    let check: String = conn
        .query_row("PRAGMA quick_check(1)", [], |row| row.get(0))
        .map_err(classify)?;
    if !check.eq_ignore_ascii_case("ok") {
        warn!(result = %check, "integrity check failed");
        return Err(OpenFailure::Razeable);
    }

    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta(
            key TEXT NOT NULL UNIQUE PRIMARY KEY,
            value)",
        [],
    )
    .map_err(classify)?;

    let version = get_meta_i64(&conn, META_KEY_VERSION).map_err(classify)?;
    let compatible = get_meta_i64(&conn, META_KEY_LAST_COMPATIBLE_VERSION).map_err(classify)?;
    match (version, compatible) {
        (Some(version), compatible) => {
            let compatible = compatible.unwrap_or(version);
            if compatible > CURRENT_DATABASE_VERSION {
                warn!(version, compatible, "database is from a newer build");
                return Err(OpenFailure::Razeable);
            }
            if version < EARLIEST_SUPPORTED_VERSION {
                warn!(version, "database version no longer supported");
                return Err(OpenFailure::Razeable);
            }
        }
        (None, _) => {}
    }

    // Written unconditionally: doubles as the write probe that turns a
    // read-only database file into a clean initialization failure.
    set_meta_i64(&conn, META_KEY_VERSION, CURRENT_DATABASE_VERSION).map_err(classify)?;
    set_meta_i64(
        &conn,
        META_KEY_LAST_COMPATIBLE_VERSION,
        CURRENT_DATABASE_VERSION,
    )
    .map_err(classify)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS resources(
            res_id INTEGER PRIMARY KEY AUTOINCREMENT,
            cache_key TEXT NOT NULL,
            token_high INTEGER NOT NULL,
            token_low INTEGER NOT NULL,
            last_used INTEGER NOT NULL,
            body_end INTEGER NOT NULL DEFAULT 0,
            bytes_usage INTEGER NOT NULL DEFAULT 0,
            doomed INTEGER NOT NULL DEFAULT 0,
            head BLOB);
        CREATE INDEX IF NOT EXISTS index_resources_key_doomed
            ON resources(cache_key, doomed);
        CREATE INDEX IF NOT EXISTS index_resources_last_used
            ON resources(last_used);",
    )
    .map_err(classify)?;

    debug!(path = %db_path.display(), "cache database opened");
    Ok(conn)
}

/// Map a SQLite error to the raze decision.
fn classify(e: rusqlite::Error) -> OpenFailure {
    use rusqlite::ErrorCode;
    match &e {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase
            ) =>
        {
            warn!(error = %e, "database corruption detected");
            OpenFailure::Razeable
        }
        _ => {
            warn!(error = %e, "database open failed");
            OpenFailure::Fatal
        }
    }
}

/// Delete the database file and its WAL/SHM companions.
fn raze(db_path: &Path) -> Result<()> {
    for path in [
        db_path.to_path_buf(),
        companion(db_path, "-wal"),
        companion(db_path, "-shm"),
    ] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "raze failed");
                return Err(StoreError::FailedToOpenDatabase);
            }
        }
    }
    Ok(())
}

fn companion(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Read the persisted aggregates, clamping implausible values to zero.
fn load_aggregates(conn: Connection) -> (Connection, i32, i64) {
    let entry_count = get_meta_i64(&conn, META_KEY_ENTRY_COUNT)
        .ok()
        .flatten()
        .and_then(|v| i32::try_from(v).ok())
        .filter(|v| *v >= 0)
        .unwrap_or(0);
    let total_size = get_meta_i64(&conn, META_KEY_TOTAL_SIZE)
        .ok()
        .flatten()
        .filter(|v| *v >= 0)
        .unwrap_or(0);
    (conn, entry_count, total_size)
}

/// Read one integer meta value.
pub(crate) fn get_meta_i64(conn: &Connection, key: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
        row.get(0)
    })
    .optional()
}

/// Write one integer meta value.
pub(crate) fn set_meta_i64(conn: &Connection, key: &str, value: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta(key, value) VALUES(?1, ?2)",
        rusqlite::params![key, value],
    )?;
    Ok(())
}
