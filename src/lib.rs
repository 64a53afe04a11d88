//! sqlstash - Disk-Backed Cache Storage over SQLite
//!
//! A key-value storage engine for HTTP-cache-style workloads. Entry metadata
//! lives in a single SQLite database driven from a dedicated worker thread;
//! an async façade serializes every operation and keeps two running
//! aggregates (entry count, total size) that self-heal when the persisted
//! values turn out corrupt.
//!
//! Layers, bottom up:
//! - [`PersistentStore`]: the database itself. Rows, tokens, aggregates,
//!   raze-and-rebuild recovery.
//! - [`CacheEntryHandle`]: ref-counted handles over one entry generation,
//!   with doom/deferred-delete semantics.
//! - [`CacheBackend`]: the cache-facing API, tracking which entries are
//!   active, pending, or doomed, and merging dooms into in-flight work.

pub mod backend;
pub mod config;
pub mod entry;
pub mod error;
pub mod key;
pub mod store;
pub mod token;

pub use backend::{CacheBackend, EntryIterator, OpenOutcome};
pub use config::{StoreConfig, DEFAULT_STATIC_ENTRY_OVERHEAD};
pub use entry::CacheEntryHandle;
pub use error::{Result, StoreError};
pub use key::CacheKey;
pub use store::{
    EntryInfo, EnumeratedEntry, PersistentStore, MAX_FILE_RATIO_DENOMINATOR, MIN_FILE_SIZE_LIMIT,
};
pub use token::EntryToken;
