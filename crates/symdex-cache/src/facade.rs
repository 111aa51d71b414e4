use crate::backend::CacheBackend;
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, CacheStatus, Symbol};
use crate::error::CacheError;
use crate::key::CacheKey;
use crate::lock::{Acquire, FileLock};
use crate::memory::{MemoryBackend, MEMORY_BACKEND_NAME};
use crate::persistent::{PersistentBackend, StoreStats, PERSISTENT_BACKEND_NAME};
use crate::segment::Segment;
use crate::telemetry::{CacheEvent, TelemetryEvent, TelemetrySink};
use crate::util::now_millis;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Inputs of one symbol lookup.
#[derive(Debug, Clone, Copy)]
pub struct LookupRequest<'a> {
    pub symbol_ref: &'a str,
    pub file_path: &'a str,
    /// The exact bytes the compute function will parse.
    pub file_bytes: &'a [u8],
    pub schema_version: u32,
}

/// Symbols for a lookup plus how the cache served them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lookup {
    pub symbols: Vec<Symbol>,
    pub status: CacheStatus,
    pub key: CacheKey,
    /// Backend that served a hit, or the outermost backend asked to store a miss.
    pub backend: &'static str,
}

/// Entry point to the symbol cache for one segment.
///
/// Backends are chosen once from the [`CacheConfig`]: memory only, or memory
/// layered over the persistent store. Cache-internal failures never reach the
/// caller; they degrade to computing without the cache's help.
pub struct SymbolCache {
    segment: Segment,
    config: CacheConfig,
    memory: MemoryBackend,
    persistent: Option<PersistentBackend>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for SymbolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolCache")
            .field("segment", &self.segment)
            .field("config", &self.config)
            .field("persistent", &self.persistent.is_some())
            .finish_non_exhaustive()
    }
}

impl SymbolCache {
    /// Fails only when `segment_root` cannot be resolved.
    pub fn open(
        segment_root: impl AsRef<Path>,
        config: CacheConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Result<Self, CacheError> {
        let segment = Segment::resolve(segment_root, &config)?;
        Ok(Self::with_segment(segment, config, telemetry))
    }

    pub fn with_segment(
        segment: Segment,
        config: CacheConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let persistent = if config.persist {
            match segment.ensure_dirs() {
                Ok(()) => Some(PersistentBackend::new(&segment, config.schema_version)),
                Err(err) => {
                    tracing::warn!(
                        target: "symdex.cache",
                        dir = %segment.dir().display(),
                        error = %err,
                        "cannot create cache directory; continuing with in-memory cache only"
                    );
                    None
                }
            }
        } else {
            None
        };

        Self {
            memory: MemoryBackend::new(config.memory_capacity),
            segment,
            config,
            persistent,
            telemetry,
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistent.is_some()
    }

    pub fn memory(&self) -> &MemoryBackend {
        &self.memory
    }

    pub fn store_stats(&self) -> Option<StoreStats> {
        self.persistent.as_ref().map(PersistentBackend::stats)
    }

    /// Return cached symbols for `request`, or run `compute` and cache its result.
    ///
    /// `compute` runs only on a miss. Its error is returned unchanged and nothing
    /// is cached for it.
    pub fn lookup_or_compute<F, E>(
        &self,
        request: LookupRequest<'_>,
        compute: F,
    ) -> Result<Lookup, E>
    where
        F: FnOnce() -> Result<Vec<Symbol>, E>,
    {
        let start = Instant::now();
        let key = CacheKey::derive(
            request.symbol_ref,
            request.file_path,
            request.file_bytes,
            request.schema_version,
        );

        let persistent = self.persistent_for(request.schema_version);

        if let Some(entry) = self.probe(&self.memory, &key) {
            return Ok(self.hit(&request, entry, MEMORY_BACKEND_NAME, start.elapsed()));
        }
        if let Some(store) = persistent {
            if let Some(entry) = self.probe(store, &key) {
                if let Err(err) = self.memory.put(&entry) {
                    tracing::debug!(
                        target: "symdex.cache",
                        error = %err,
                        "memory promotion failed"
                    );
                }
                return Ok(self.hit(&request, entry, PERSISTENT_BACKEND_NAME, start.elapsed()));
            }
        }

        let backend = match persistent {
            Some(store) => store.name(),
            None => self.memory.name(),
        };
        self.emit(
            TelemetryEvent::new(CacheEvent::Miss, start.elapsed()),
            &request,
            &key,
            backend,
        );

        let symbols = compute()?;

        let entry = CacheEntry {
            key: key.clone(),
            symbols,
            backend: backend.to_string(),
            segment_id: self.segment.id().to_string(),
            schema_version: request.schema_version,
            created_at_millis: now_millis(),
        };
        if let Err(err) = self.memory.put(&entry) {
            tracing::debug!(target: "symdex.cache", error = %err, "memory insert failed");
        }

        let status = match persistent {
            Some(store) => self.write_through(store, &request, &entry),
            None => CacheStatus::Miss,
        };

        Ok(Lookup {
            symbols: entry.symbols,
            status,
            key,
            backend,
        })
    }

    fn persistent_for(&self, schema_version: u32) -> Option<&PersistentBackend> {
        let store = self.persistent.as_ref()?;
        if store.schema_version() != schema_version {
            tracing::debug!(
                target: "symdex.cache",
                requested = schema_version,
                store = store.schema_version(),
                "schema version differs from the persistent store; using memory only"
            );
            return None;
        }
        Some(store)
    }

    /// A failing `get` is treated as a miss.
    fn probe(&self, backend: &dyn CacheBackend, key: &CacheKey) -> Option<CacheEntry> {
        match backend.get(key) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(
                    target: "symdex.cache",
                    backend = backend.name(),
                    cache_key = %key,
                    error = %err,
                    "cache read failed; treating as miss"
                );
                None
            }
        }
    }

    fn hit(
        &self,
        request: &LookupRequest<'_>,
        entry: CacheEntry,
        backend: &'static str,
        elapsed: Duration,
    ) -> Lookup {
        self.emit(
            TelemetryEvent::new(CacheEvent::Hit, elapsed)
                .result("symbols", entry.symbols.len() as u64)
                .result("created_at_millis", entry.created_at_millis),
            request,
            &entry.key,
            backend,
        );
        Lookup {
            symbols: entry.symbols,
            status: CacheStatus::Hit,
            key: entry.key,
            backend,
        }
    }

    /// Persist a freshly computed entry under the cross-process lock.
    fn write_through(
        &self,
        store: &PersistentBackend,
        request: &LookupRequest<'_>,
        entry: &CacheEntry,
    ) -> CacheStatus {
        let start = Instant::now();
        let lock = FileLock::for_key(self.segment.locks_dir(), &entry.key);

        let guard = match lock.acquire(self.config.lock_timeout, self.config.lock_ttl) {
            Ok(Acquire::Acquired(guard)) => guard,
            Ok(Acquire::TimedOut { waited, holder }) => {
                tracing::warn!(
                    target: "symdex.cache",
                    cache_key = %entry.key,
                    waited_ms = waited.as_millis() as u64,
                    holder_pid = holder.as_ref().map(|h| h.pid),
                    "timed out waiting for cache write lock; result not persisted"
                );
                self.emit(
                    TelemetryEvent::new(CacheEvent::LockTimeout, waited)
                        .result("holder_pid", holder.map(|h| h.pid))
                        .result("timeout_ms", self.config.lock_timeout.as_millis() as u64),
                    request,
                    &entry.key,
                    store.name(),
                );
                return CacheStatus::Degraded;
            }
            Err(err) => {
                return self.write_failed(store, request, entry, "lock", err, start.elapsed());
            }
        };

        if guard.contended() {
            self.emit(
                TelemetryEvent::new(CacheEvent::LockWait, guard.waited())
                    .result("reclaimed", guard.reclaimed()),
                request,
                &entry.key,
                store.name(),
            );
        }

        let written = store.put(entry);
        if !guard.is_held() {
            tracing::warn!(
                target: "symdex.cache",
                cache_key = %entry.key,
                "cache write lock was reclaimed by another process during the write"
            );
        }
        drop(guard);

        match written {
            Ok(()) => {
                self.emit(
                    TelemetryEvent::new(CacheEvent::Write, start.elapsed())
                        .result("symbols", entry.symbols.len() as u64),
                    request,
                    &entry.key,
                    store.name(),
                );
                CacheStatus::Miss
            }
            Err(err) => self.write_failed(store, request, entry, "store", err, start.elapsed()),
        }
    }

    fn write_failed(
        &self,
        store: &PersistentBackend,
        request: &LookupRequest<'_>,
        entry: &CacheEntry,
        stage: &'static str,
        err: CacheError,
        elapsed: Duration,
    ) -> CacheStatus {
        tracing::warn!(
            target: "symdex.cache",
            cache_key = %entry.key,
            stage,
            error = %err,
            "cache write failed; result not persisted"
        );
        self.emit(
            TelemetryEvent::new(CacheEvent::WriteError, elapsed)
                .result("stage", stage)
                .result("error", err.to_string()),
            request,
            &entry.key,
            store.name(),
        );
        CacheStatus::Degraded
    }

    fn emit(
        &self,
        event: TelemetryEvent,
        request: &LookupRequest<'_>,
        key: &CacheKey,
        backend: &'static str,
    ) {
        let event = event
            .arg("cache_key", key.as_str())
            .arg("symbol_ref", request.symbol_ref)
            .arg("file_path", request.file_path)
            .arg("schema_version", request.schema_version)
            .result("backend", backend)
            .result("segment_id", self.segment.id());
        self.telemetry.emit(&event);
    }
}
