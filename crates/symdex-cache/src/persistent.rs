use crate::backend::CacheBackend;
use crate::entry::{CacheEntry, Symbol};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::lock::with_exclusive_guard;
use crate::segment::Segment;
use crate::util::{bincode_deserialize, bincode_serialize, now_millis, remove_file_best_effort};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const PERSISTENT_BACKEND_NAME: &str = "persistent";

/// Version of the table layout and payload encoding in `symbols.sqlite3`.
///
/// Bump when the `symbol_entries` columns or the bincode payload shape change.
/// A store with a different format (or symbol schema) version is treated as
/// empty and rebuilt on the next write.
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Sibling of the store file; serializes moving a corrupt store aside.
pub const STORE_GUARD_FILE_NAME: &str = "symbols.guard";

const BUSY_TIMEOUT: Duration = Duration::from_millis(2_000);

const META_SCHEMA_VERSION: &str = "schema_version";
const META_FORMAT_VERSION: &str = "format_version";

/// SQLite-backed store shared by every process pointed at the same segment.
///
/// Readers never take the cross-process write lock; SQLite's transactional
/// commit guarantees a reader sees either no row or a complete row. Callers are
/// expected to hold the segment's [`crate::FileLock`] around [`CacheBackend::put`].
#[derive(Debug)]
pub struct PersistentBackend {
    path: PathBuf,
    segment_id: String,
    schema_version: u32,
    conn: Mutex<Option<Connection>>,
}

/// Summary of the on-disk store, for `cache status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub path: PathBuf,
    pub segment_id: String,
    pub exists: bool,
    /// `None` when the store is missing, unreadable or stale.
    pub entries: Option<u64>,
    pub compatible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Missing,
    Compatible,
    Stale,
}

impl PersistentBackend {
    pub fn new(segment: &Segment, schema_version: u32) -> Self {
        Self {
            path: segment.store_path(),
            segment_id: segment.id().to_string(),
            schema_version,
            conn: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            path: self.path.clone(),
            segment_id: self.segment_id.clone(),
            exists: self.path.is_file(),
            entries: None,
            compatible: false,
        };
        if !stats.exists {
            return stats;
        }

        let result = self.with_connection(false, |conn| {
            if read_marker(conn, self.schema_version)? != Marker::Compatible {
                return Ok(None);
            }
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM symbol_entries", [], |row| row.get(0))?;
            Ok(Some(count.max(0) as u64))
        });
        match result {
            Ok(Some(count)) => {
                stats.entries = Some(count);
                stats.compatible = true;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(
                    target: "symdex.cache",
                    path = %self.path.display(),
                    error = %err,
                    "failed to read symbol store stats"
                );
            }
        }
        stats
    }

    /// Run `f` against the cached connection, opening it on first use.
    ///
    /// With `create == false` a missing file is never created.
    fn with_connection<T>(
        &self,
        create: bool,
        f: impl FnOnce(&mut Connection) -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let mut slot = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(open_connection(&self.path, create)?);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(std::io::Error::other("symbol store connection unavailable").into());
        };
        let result = f(conn);
        if matches!(&result, Err(err) if err.is_corrupt_store()) {
            *slot = None;
        }
        result
    }

    fn drop_connection(&self) {
        let mut slot = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }

    /// Move an unusable store aside so the next open starts fresh.
    ///
    /// Runs under the store-wide guard, not a shard lock: writers of different
    /// shards may both have seen the damage. The store is re-opened under the
    /// guard and only moved if it is still unreadable, so a store another
    /// writer already rebuilt is left alone.
    fn quarantine(&self) -> Result<(), CacheError> {
        self.drop_connection();
        let guard_path = self.path.with_file_name(STORE_GUARD_FILE_NAME);
        with_exclusive_guard(&guard_path, || {
            if !self.path.is_file() {
                return Ok(());
            }
            match open_connection(&self.path, false)
                .and_then(|conn| read_marker(&conn, self.schema_version))
            {
                Ok(_) => {
                    tracing::debug!(
                        target: "symdex.cache",
                        path = %self.path.display(),
                        "symbol store was rebuilt by another writer; keeping it"
                    );
                    return Ok(());
                }
                Err(err) if err.is_corrupt_store() => {}
                Err(err) => return Err(err),
            }

            let mut name = self
                .path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_default();
            name.push(format!(".corrupt.{}.{}", std::process::id(), now_millis()));
            let aside = self.path.with_file_name(name);
            match std::fs::rename(&self.path, &aside) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            for suffix in ["-wal", "-shm"] {
                let mut sidecar = self.path.clone().into_os_string();
                sidecar.push(suffix);
                remove_file_best_effort(Path::new(&sidecar), "persistent.quarantine_sidecar");
            }
            tracing::warn!(
                target: "symdex.cache",
                path = %self.path.display(),
                moved_to = %aside.display(),
                "symbol store was unreadable; moved aside and rebuilding"
            );
            Ok(())
        })
    }

    fn write_entry(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let payload = bincode_serialize(&entry.symbols)?;
        let schema_version = self.schema_version;
        self.with_connection(true, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_schema(&tx, schema_version)?;
            tx.execute(
                "INSERT OR REPLACE INTO symbol_entries \
                 (cache_key, segment_id, schema_version, created_at_millis, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.key.as_str(),
                    entry.segment_id,
                    entry.schema_version,
                    entry.created_at_millis as i64,
                    payload,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}

impl CacheBackend for PersistentBackend {
    fn name(&self) -> &'static str {
        PERSISTENT_BACKEND_NAME
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        if !self.path.is_file() {
            return Ok(None);
        }

        let schema_version = self.schema_version;
        let row = self.with_connection(false, |conn| {
            if read_marker(conn, schema_version)? != Marker::Compatible {
                return Ok(None);
            }
            let row = conn
                .query_row(
                    "SELECT segment_id, schema_version, created_at_millis, payload \
                     FROM symbol_entries WHERE cache_key = ?1",
                    params![key.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Vec<u8>>(3)?,
                        ))
                    },
                )
                .optional()?;
            Ok(row)
        });

        let row = match row {
            Ok(row) => row,
            Err(err) if err.is_corrupt_store() => {
                tracing::warn!(
                    target: "symdex.cache",
                    path = %self.path.display(),
                    error = %err,
                    "symbol store is unreadable; treating as empty"
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let Some((segment_id, row_schema_version, created_at_millis, payload)) = row else {
            return Ok(None);
        };
        if row_schema_version != schema_version {
            return Ok(None);
        }
        let symbols: Vec<Symbol> = match bincode_deserialize(&payload) {
            Ok(symbols) => symbols,
            Err(err) => {
                tracing::warn!(
                    target: "symdex.cache",
                    cache_key = %key,
                    error = %err,
                    "undecodable symbol payload; treating as cache miss"
                );
                return Ok(None);
            }
        };

        Ok(Some(CacheEntry {
            key: key.clone(),
            symbols,
            backend: PERSISTENT_BACKEND_NAME.to_string(),
            segment_id,
            schema_version: row_schema_version,
            created_at_millis: created_at_millis.max(0) as u64,
        }))
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match self.write_entry(entry) {
            Err(err) if err.is_corrupt_store() => {
                self.quarantine()?;
                self.write_entry(entry)
            }
            other => other,
        }
    }
}

fn open_connection(path: &Path, create: bool) -> Result<Connection, CacheError> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // Also forces SQLite to read the header, surfacing NOTADB here. WAL mode is
    // sticky in the file, so losing the switch to a concurrent opener is fine.
    match conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0)) {
        Ok(_) => {}
        Err(err) => {
            let err = CacheError::from(err);
            if err.is_corrupt_store() {
                return Err(err);
            }
            tracing::debug!(
                target: "symdex.cache",
                path = %path.display(),
                error = %err,
                "could not switch symbol store to WAL mode"
            );
        }
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

fn read_marker(conn: &Connection, schema_version: u32) -> Result<Marker, CacheError> {
    let has_meta: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'cache_meta'",
            [],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !has_meta {
        return Ok(Marker::Missing);
    }

    let read = |name: &str| -> Result<Option<u32>, CacheError> {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM cache_meta WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|value| value.parse().ok()))
    };

    let compatible = read(META_FORMAT_VERSION)? == Some(STORE_FORMAT_VERSION)
        && read(META_SCHEMA_VERSION)? == Some(schema_version);
    Ok(if compatible {
        Marker::Compatible
    } else {
        Marker::Stale
    })
}

/// Create the tables, or drop and recreate them when the markers disagree.
/// Must run inside the write transaction.
fn ensure_schema(conn: &Connection, schema_version: u32) -> Result<(), CacheError> {
    match read_marker(conn, schema_version)? {
        Marker::Compatible => return Ok(()),
        Marker::Stale => {
            tracing::info!(
                target: "symdex.cache",
                schema_version,
                format_version = STORE_FORMAT_VERSION,
                "symbol store has an incompatible version; rebuilding"
            );
            conn.execute_batch(
                "DROP TABLE IF EXISTS symbol_entries;
                 DROP TABLE IF EXISTS cache_meta;",
            )?;
        }
        Marker::Missing => {}
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cache_meta (
             name  TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS symbol_entries (
             cache_key         TEXT PRIMARY KEY,
             segment_id        TEXT NOT NULL,
             schema_version    INTEGER NOT NULL,
             created_at_millis INTEGER NOT NULL,
             payload           BLOB NOT NULL
         );",
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO cache_meta (name, value) VALUES (?1, ?2), (?3, ?4)",
        params![
            META_SCHEMA_VERSION,
            schema_version.to_string(),
            META_FORMAT_VERSION,
            STORE_FORMAT_VERSION.to_string(),
        ],
    )?;
    Ok(())
}
