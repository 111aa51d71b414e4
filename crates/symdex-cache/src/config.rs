use crate::entry::SYMBOL_SCHEMA_VERSION;
use crate::memory::DEFAULT_MEMORY_CAPACITY;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_PERSIST: &str = "SYMDEX_CACHE_PERSIST";
pub const ENV_CACHE_DIR: &str = "SYMDEX_CACHE_DIR";
pub const ENV_MEMORY_ENTRIES: &str = "SYMDEX_CACHE_MEMORY_ENTRIES";
pub const ENV_LOCK_TIMEOUT_MS: &str = "SYMDEX_CACHE_LOCK_TIMEOUT_MS";
pub const ENV_LOCK_TTL_MS: &str = "SYMDEX_CACHE_LOCK_TTL_MS";
pub const ENV_SEGMENT_ID: &str = "SYMDEX_SEGMENT_ID";

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_millis(30_000);

/// Configuration for a [`crate::SymbolCache`].
///
/// Resolved once per process and passed into the facade; nothing in this crate
/// reads the environment after construction.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Enables the persistent (SQLite) backend layered under the memory backend.
    pub persist: bool,
    /// Override the global cache directory (the segment id is still appended).
    pub cache_root_override: Option<PathBuf>,
    /// Override the derived segment id.
    pub segment_id_override: Option<String>,
    pub memory_capacity: usize,
    /// How long a writer waits for the cross-process lock before degrading.
    pub lock_timeout: Duration,
    /// Age after which a lock record is considered abandoned.
    pub lock_ttl: Duration,
    /// Symbol schema the persistent store is stamped with. Lookups for any
    /// other schema version bypass the persistent layer.
    pub schema_version: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persist: false,
            cache_root_override: None,
            segment_id_override: None,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_ttl: DEFAULT_LOCK_TTL,
            schema_version: SYMBOL_SCHEMA_VERSION,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup. Unset or blank values
    /// keep their defaults; malformed numbers are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        Self {
            persist: get(ENV_PERSIST).is_some_and(|value| parse_flag(&value)),
            cache_root_override: get(ENV_CACHE_DIR).map(PathBuf::from),
            segment_id_override: get(ENV_SEGMENT_ID),
            memory_capacity: parse_number(ENV_MEMORY_ENTRIES, get(ENV_MEMORY_ENTRIES))
                .map(|n| n as usize)
                .unwrap_or(defaults.memory_capacity),
            lock_timeout: parse_number(ENV_LOCK_TIMEOUT_MS, get(ENV_LOCK_TIMEOUT_MS))
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            lock_ttl: parse_number(ENV_LOCK_TTL_MS, get(ENV_LOCK_TTL_MS))
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_ttl),
            schema_version: defaults.schema_version,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_number(name: &str, value: Option<String>) -> Option<u64> {
    let value = value?;
    match value.parse::<u64>() {
        Ok(n) => Some(n),
        Err(err) => {
            tracing::warn!(
                target: "symdex.cache",
                var = name,
                value = %value,
                error = %err,
                "ignoring malformed numeric setting"
            );
            None
        }
    }
}
