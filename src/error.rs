//! Error surface of the storage engine.

/// Error type for store and backend operations.
///
/// This is a deliberately small, closed enum: expected misses (`NotFound`)
/// and create conflicts (`AlreadyExists`) are ordinary control flow for the
/// caller, `InvalidData` reports corrupted persisted state that could not be
/// interpreted (the store recovers its own aggregates silently, but cannot
/// invent a valid identity token for an opened entry), and the two
/// `FailedTo*` variants report environment failures during initialization
/// that leave the cache unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The entry does not exist, is doomed, or the identity token did not
    /// match.
    #[error("entry not found")]
    NotFound,

    /// A live entry already exists for this key.
    #[error("entry already exists")]
    AlreadyExists,

    /// Persisted data could not be interpreted (malformed identity token or
    /// a database operation failed mid-flight).
    #[error("invalid persisted data")]
    InvalidData,

    /// The cache directory could not be created.
    #[error("failed to create cache directory")]
    FailedToCreateDirectory,

    /// The database file could not be opened, razed, or rebuilt.
    #[error("failed to open cache database")]
    FailedToOpenDatabase,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        tracing::warn!(error = %e, "database operation failed");
        StoreError::InvalidData
    }
}
