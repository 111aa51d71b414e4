use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;

fn symdex() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("symdex"));
    for var in [
        "SYMDEX_CACHE_PERSIST",
        "SYMDEX_CACHE_DIR",
        "SYMDEX_CACHE_MEMORY_ENTRIES",
        "SYMDEX_CACHE_LOCK_TIMEOUT_MS",
        "SYMDEX_CACHE_LOCK_TTL_MS",
        "SYMDEX_SEGMENT_ID",
        "SYMDEX_TELEMETRY_FILE",
        "SYMDEX_LOG",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn project() -> TempDir {
    let temp = TempDir::new().unwrap();
    temp.child("target")
        .write_str("def foo():\n    return 1\n")
        .unwrap();
    temp
}

fn symbols_json(root: &Path, cache_root: &Path, persist: bool) -> Value {
    let output = symdex()
        .arg("symbols")
        .arg("sym://target")
        .arg("--root")
        .arg(root)
        .arg("--json")
        .env("SYMDEX_CACHE_PERSIST", if persist { "1" } else { "0" })
        .env("SYMDEX_CACHE_DIR", cache_root)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

fn store_files(cache_root: &Path) -> Vec<std::path::PathBuf> {
    let Ok(segments) = std::fs::read_dir(cache_root) else {
        return Vec::new();
    };
    segments
        .flatten()
        .map(|segment| segment.path().join("symbols.sqlite3"))
        .filter(|path| path.is_file())
        .collect()
}

#[test]
fn help_mentions_core_commands() {
    symdex().arg("--help").assert().success().stdout(
        predicate::str::contains("symbols").and(predicate::str::contains("cache")),
    );
}

#[test]
fn warm_start_returns_identical_symbols_and_key() {
    let root = project();
    let cache_root = TempDir::new().unwrap();

    let first = symbols_json(root.path(), cache_root.path(), true);
    assert_eq!(first["cache_status"], "miss");
    assert_eq!(first["backend"], "persistent");
    assert_eq!(first["file"], "target");
    assert_eq!(
        first["symbols"],
        serde_json::json!([{ "name": "foo", "kind": "function", "line": 1 }])
    );
    assert_eq!(store_files(cache_root.path()).len(), 1);

    let second = symbols_json(root.path(), cache_root.path(), true);
    assert_eq!(second["cache_status"], "hit");
    assert_eq!(second["symbols"], first["symbols"]);
    assert_eq!(second["cache_key"], first["cache_key"]);
    assert_eq!(second["segment_id"], first["segment_id"]);
    assert_eq!(store_files(cache_root.path()).len(), 1);
}

#[test]
fn editing_the_file_invalidates_the_entry() {
    let root = project();
    let cache_root = TempDir::new().unwrap();

    let before = symbols_json(root.path(), cache_root.path(), true);
    root.child("target")
        .write_str("def foo():\n    return 1\n\nclass Bar:\n    pass\n")
        .unwrap();
    let after = symbols_json(root.path(), cache_root.path(), true);

    assert_eq!(after["cache_status"], "miss");
    assert_ne!(after["cache_key"], before["cache_key"]);
    assert_eq!(after["symbols"][1]["name"], "Bar");
}

#[test]
fn persistence_off_creates_no_store() {
    let root = project();
    let cache_root = TempDir::new().unwrap();

    for _ in 0..2 {
        let out = symbols_json(root.path(), cache_root.path(), false);
        assert_eq!(out["cache_status"], "miss");
        assert_eq!(out["backend"], "memory");
    }
    assert!(std::fs::read_dir(cache_root.path()).unwrap().next().is_none());
}

#[test]
fn held_lock_degrades_without_failing() {
    let root = project();
    let cache_root = TempDir::new().unwrap();

    // Learn the key and segment without persisting anything.
    let probe = symbols_json(root.path(), cache_root.path(), false);
    let key = probe["cache_key"].as_str().unwrap();
    let segment_id = probe["segment_id"].as_str().unwrap();

    let lock = cache_root
        .child(segment_id)
        .child("locks")
        .child(format!("{}.lock", &key[..2]));
    // Our own pid is alive for the whole run, so the record is never stale.
    lock.write_str(
        &serde_json::json!({
            "pid": std::process::id(),
            "token": "held-by-test",
            "acquired_at_millis": 4_102_444_800_000u64,
            "ttl_millis": 600_000u64,
        })
        .to_string(),
    )
    .unwrap();

    let output = symdex()
        .arg("symbols")
        .arg("sym://target")
        .arg("--root")
        .arg(root.path())
        .arg("--json")
        .env("SYMDEX_CACHE_PERSIST", "1")
        .env("SYMDEX_CACHE_DIR", cache_root.path())
        .env("SYMDEX_CACHE_LOCK_TIMEOUT_MS", "50")
        .output()
        .unwrap();
    assert!(output.status.success());
    let out: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(out["cache_status"], "degraded");
    assert_eq!(out["symbols"], probe["symbols"]);
    assert_eq!(out["cache_key"], probe["cache_key"]);
    assert!(lock.path().exists());
}

#[test]
fn telemetry_file_records_miss_write_then_hit() {
    let root = project();
    let cache_root = TempDir::new().unwrap();
    let telemetry = cache_root.child("telemetry.jsonl");

    for _ in 0..2 {
        symdex()
            .arg("symbols")
            .arg("target")
            .arg("--root")
            .arg(root.path())
            .env("SYMDEX_CACHE_PERSIST", "true")
            .env("SYMDEX_CACHE_DIR", cache_root.path())
            .env("SYMDEX_TELEMETRY_FILE", telemetry.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("1: function foo"));
    }

    let text = std::fs::read_to_string(telemetry.path()).unwrap();
    let events: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    let commands: Vec<&str> = events
        .iter()
        .map(|event| event["command"].as_str().unwrap())
        .collect();
    assert_eq!(commands, ["cache.miss", "cache.write", "cache.hit"]);
    for event in &events {
        assert_eq!(event["args"]["symbol_ref"], "target");
        assert!(event["args"]["cache_key"].is_string());
        assert_eq!(event["result"]["backend"], "persistent");
        assert!(event["result"]["segment_id"].is_string());
    }
}

#[test]
fn missing_file_exits_with_error() {
    let root = project();
    symdex()
        .arg("symbols")
        .arg("sym://missing.py")
        .arg("--root")
        .arg(root.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing.py"));
}

#[test]
fn binary_file_is_a_compute_error_and_not_cached() {
    let root = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();
    root.child("blob").write_binary(&[0xff, 0xfe, 0x00]).unwrap();

    for _ in 0..2 {
        symdex()
            .arg("symbols")
            .arg("sym://blob")
            .arg("--root")
            .arg(root.path())
            .env("SYMDEX_CACHE_PERSIST", "1")
            .env("SYMDEX_CACHE_DIR", cache_root.path())
            .assert()
            .code(2)
            .stderr(predicate::str::contains("UTF-8"));
    }
    assert!(store_files(cache_root.path()).is_empty());
}

#[test]
fn cache_status_and_clean() {
    let root = project();
    let cache_root = TempDir::new().unwrap();
    symbols_json(root.path(), cache_root.path(), true);

    let output = symdex()
        .args(["cache", "status", "--json", "--root"])
        .arg(root.path())
        .env("SYMDEX_CACHE_PERSIST", "1")
        .env("SYMDEX_CACHE_DIR", cache_root.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    let status: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["persistence_enabled"], true);
    assert_eq!(status["store"]["exists"], true);
    assert_eq!(status["store"]["compatible"], true);
    assert_eq!(status["store"]["entries"], 1);

    symdex()
        .args(["cache", "clean", "--root"])
        .arg(root.path())
        .env("SYMDEX_CACHE_DIR", cache_root.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("cleaned"));
    assert!(store_files(cache_root.path()).is_empty());

    let again = symbols_json(root.path(), cache_root.path(), true);
    assert_eq!(again["cache_status"], "miss");
}
