use std::sync::Arc;
use symdex_cache::{
    CacheConfig, CacheEvent, CacheStatus, LookupRequest, RecordingTelemetry, Symbol, SymbolCache,
    SymbolKind, STORE_FILE_NAME, SYMBOL_SCHEMA_VERSION,
};
use tempfile::TempDir;

const TEXT: &[u8] = b"def foo():\n    return 1\n";

fn request() -> LookupRequest<'static> {
    LookupRequest {
        symbol_ref: "sym://target",
        file_path: "target",
        file_bytes: TEXT,
        schema_version: SYMBOL_SCHEMA_VERSION,
    }
}

fn foo() -> Result<Vec<Symbol>, std::io::Error> {
    Ok(vec![Symbol::new("foo", SymbolKind::Function, 1)])
}

fn open(tmp: &TempDir, persist: bool) -> (SymbolCache, Arc<RecordingTelemetry>) {
    let root = tmp.path().join("project");
    std::fs::create_dir_all(&root).unwrap();
    let telemetry = Arc::new(RecordingTelemetry::new());
    let config = CacheConfig {
        persist,
        cache_root_override: Some(tmp.path().join("cache")),
        ..CacheConfig::default()
    };
    (
        SymbolCache::open(&root, config, telemetry.clone()).unwrap(),
        telemetry,
    )
}

#[test]
fn second_instance_hits_without_recomputing() {
    let tmp = TempDir::new().unwrap();

    let (first, _) = open(&tmp, true);
    let cold = first.lookup_or_compute(request(), foo).unwrap();
    assert_eq!(cold.status, CacheStatus::Miss);
    drop(first);

    let (second, telemetry) = open(&tmp, true);
    let warm = second
        .lookup_or_compute(request(), || -> Result<Vec<Symbol>, std::io::Error> {
            panic!("warm start recomputed")
        })
        .unwrap();
    assert_eq!(warm.status, CacheStatus::Hit);
    assert_eq!(warm.key, cold.key);
    assert_eq!(warm.symbols, cold.symbols);
    assert_eq!(telemetry.commands(), vec![CacheEvent::Hit]);

    let store = second.segment().store_path();
    assert_eq!(store.file_name().unwrap(), STORE_FILE_NAME);
    assert!(store.is_file());
}

#[test]
fn persistence_off_touches_no_files() {
    let tmp = TempDir::new().unwrap();

    for _ in 0..2 {
        let (cache, telemetry) = open(&tmp, false);
        let lookup = cache.lookup_or_compute(request(), foo).unwrap();
        assert_eq!(lookup.status, CacheStatus::Miss);
        assert_eq!(telemetry.commands(), vec![CacheEvent::Miss]);
        assert!(cache.store_stats().is_none());
    }
    assert!(!tmp.path().join("cache").exists());
}

#[test]
fn editing_the_file_misses_and_keeps_the_old_entry() {
    let tmp = TempDir::new().unwrap();
    let (cache, _) = open(&tmp, true);

    let before = cache.lookup_or_compute(request(), foo).unwrap();
    let edited = LookupRequest {
        file_bytes: b"def foo():\n    return 2\n",
        ..request()
    };
    let after = cache.lookup_or_compute(edited, foo).unwrap();

    assert_eq!(after.status, CacheStatus::Miss);
    assert_ne!(before.key, after.key);
    assert_eq!(cache.store_stats().unwrap().entries, Some(2));
}
