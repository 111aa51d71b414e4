use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::key::CacheKey;

/// Storage behind the cache facade.
///
/// Implementations are chosen once, when the facade is constructed from its
/// [`crate::CacheConfig`].
pub trait CacheBackend: Send + Sync {
    /// Stable backend name reported in telemetry and lookup results.
    fn name(&self) -> &'static str;

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError>;
}
