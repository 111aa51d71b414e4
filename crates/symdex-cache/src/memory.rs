use crate::backend::CacheBackend;
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::key::CacheKey;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

pub const MEMORY_BACKEND_NAME: &str = "memory";

/// Default number of entries kept by [`MemoryBackend`].
pub const DEFAULT_MEMORY_CAPACITY: usize = 256;

/// Process-local, bounded LRU map of cache entries.
///
/// Both reads and writes refresh recency. The backend never touches disk and
/// its operations cannot fail.
#[derive(Debug)]
pub struct MemoryBackend {
    lru: Mutex<LruCache<CacheKey, CacheEntry>>,
}

impl MemoryBackend {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            lru: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.lru
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        MEMORY_BACKEND_NAME
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lock().get(key).map(|entry| CacheEntry {
            backend: MEMORY_BACKEND_NAME.to_string(),
            ..entry.clone()
        }))
    }

    fn put(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        self.lock().put(entry.key.clone(), entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Symbol, SymbolKind};

    fn entry(name: &str) -> CacheEntry {
        CacheEntry {
            key: CacheKey::derive(name, name, name.as_bytes(), 1),
            symbols: vec![Symbol::new(name, SymbolKind::Function, 1)],
            backend: MEMORY_BACKEND_NAME.to_string(),
            segment_id: "segment".to_string(),
            schema_version: 1,
            created_at_millis: 0,
        }
    }

    #[test]
    fn get_returns_what_was_put() {
        let backend = MemoryBackend::new(4);
        let e = entry("foo");
        backend.put(&e).unwrap();
        assert_eq!(backend.get(&e.key).unwrap(), Some(e));
    }

    #[test]
    fn evicts_least_recently_used_entry() {
        let backend = MemoryBackend::new(2);
        let a = entry("a");
        let b = entry("b");
        let c = entry("c");
        backend.put(&a).unwrap();
        backend.put(&b).unwrap();

        // Reading `a` makes `b` the eviction candidate.
        assert!(backend.get(&a.key).unwrap().is_some());
        backend.put(&c).unwrap();

        assert_eq!(backend.len(), 2);
        assert!(backend.get(&a.key).unwrap().is_some());
        assert!(backend.get(&b.key).unwrap().is_none());
        assert!(backend.get(&c.key).unwrap().is_some());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let backend = MemoryBackend::new(0);
        assert_eq!(backend.capacity(), 1);
        let a = entry("a");
        backend.put(&a).unwrap();
        assert!(backend.get(&a.key).unwrap().is_some());
    }

    #[test]
    fn concurrent_access_is_serialized() {
        let backend = std::sync::Arc::new(MemoryBackend::new(64));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let backend = backend.clone();
                std::thread::spawn(move || {
                    for j in 0..32 {
                        let e = entry(&format!("t{i}-{j}"));
                        backend.put(&e).unwrap();
                        let _ = backend.get(&e.key).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(backend.len(), 64);
    }
}
