//! Content-addressed cache for extracted source symbols.
//!
//! A lookup derives a [`CacheKey`] from the symbol reference, the file path and
//! the exact file bytes, then consults the in-memory LRU and (optionally) the
//! SQLite store shared by every process working on the same segment. Misses
//! run the caller's compute function and write the result back under a
//! cross-process lock. Any cache-internal failure degrades to "compute without
//! caching"; it is never surfaced as a lookup error.
//!
//! ## On-disk layout
//!
//! Segment-scoped data lives under `<cache_root>/<segment_id>/`:
//! - `symbols.sqlite3` (+ `-wal`/`-shm`):
//!   - [`PersistentBackend`] table `symbol_entries`, payloads encoded with `bincode`
//!   - `cache_meta` stamps [`SYMBOL_SCHEMA_VERSION`] and [`STORE_FORMAT_VERSION`]
//! - `symbols.sqlite3.corrupt.<pid>.<millis>`:
//!   - stores that failed to open, moved aside before being rebuilt
//! - `symbols.guard`:
//!   - [`STORE_GUARD_FILE_NAME`], held while a corrupt store is moved aside
//! - `locks/<shard>.lock` + `locks/<shard>.guard`:
//!   - [`FileLock`] records, one per leading key byte
//!
//! `<cache_root>` defaults to `~/.symdex/cache` and is overridden by
//! [`CacheConfig::cache_root_override`].

mod backend;
mod config;
mod entry;
mod error;
mod facade;
mod key;
mod lock;
mod memory;
mod persistent;
mod segment;
mod telemetry;
mod util;

pub use backend::CacheBackend;
pub use config::{
    CacheConfig, DEFAULT_LOCK_TIMEOUT, DEFAULT_LOCK_TTL, ENV_CACHE_DIR, ENV_LOCK_TIMEOUT_MS,
    ENV_LOCK_TTL_MS, ENV_MEMORY_ENTRIES, ENV_PERSIST, ENV_SEGMENT_ID,
};
pub use entry::{CacheEntry, CacheStatus, Symbol, SymbolKind, SYMBOL_SCHEMA_VERSION};
pub use error::{CacheError, Result};
pub use facade::{Lookup, LookupRequest, SymbolCache};
pub use key::CacheKey;
pub use lock::{Acquire, FileLock, LockHolder, WriteLock};
pub use memory::{MemoryBackend, DEFAULT_MEMORY_CAPACITY, MEMORY_BACKEND_NAME};
pub use persistent::{
    PersistentBackend, StoreStats, PERSISTENT_BACKEND_NAME, STORE_FORMAT_VERSION,
    STORE_GUARD_FILE_NAME,
};
pub use segment::{Segment, STORE_FILE_NAME};
pub use telemetry::{
    CacheEvent, RecordingTelemetry, TelemetryEvent, TelemetrySink, TracingTelemetry,
};
pub use util::{normalize_ref, now_millis, BINCODE_PAYLOAD_LIMIT_BYTES};
