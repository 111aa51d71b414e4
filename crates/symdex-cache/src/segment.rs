use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::key::sha256_hex;
use std::path::{Path, PathBuf};

pub const STORE_FILE_NAME: &str = "symbols.sqlite3";
const LOCKS_DIR_NAME: &str = "locks";

/// On-disk layout for one segment (workspace root).
///
/// Layout under `<cache_root>/<segment_id>/`:
/// - `symbols.sqlite3` (+ SQLite `-wal`/`-shm` siblings): the persistent store
/// - `locks/<shard>.lock`, `locks/<shard>.guard`: cross-process write locks
///
/// Constructing a `Segment` never touches the filesystem beyond canonicalizing
/// the root; directories are created by [`Segment::ensure_dirs`] on the write
/// path only.
#[derive(Clone, Debug)]
pub struct Segment {
    root: PathBuf,
    id: String,
    dir: PathBuf,
}

impl Segment {
    pub fn resolve(root: impl AsRef<Path>, config: &CacheConfig) -> Result<Self, CacheError> {
        let root = std::fs::canonicalize(root)?;
        let id = match &config.segment_id_override {
            Some(id) => sanitize_segment_id(id),
            None => sha256_hex(root.to_string_lossy().as_bytes()),
        };

        let base = match &config.cache_root_override {
            Some(base) => base.clone(),
            None => default_cache_root().unwrap_or_else(|err| {
                let fallback = std::env::temp_dir().join("symdex-cache");
                tracing::warn!(
                    target: "symdex.cache",
                    error = %err,
                    fallback = %fallback.display(),
                    "no home directory; using temporary cache root"
                );
                fallback
            }),
        };
        let dir = base.join(&id);

        Ok(Self { root, id, dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.join(STORE_FILE_NAME)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.dir.join(LOCKS_DIR_NAME)
    }

    pub fn ensure_dirs(&self) -> Result<(), CacheError> {
        std::fs::create_dir_all(self.locks_dir())?;
        Ok(())
    }
}

/// Segment ids become directory names; keep overrides to a safe character set.
fn sanitize_segment_id(id: &str) -> String {
    let cleaned: String = id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        sha256_hex(id.as_bytes())
    } else {
        cleaned
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".symdex").join("cache"))
}
