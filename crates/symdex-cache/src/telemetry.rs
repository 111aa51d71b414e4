//! Structured cache events handed to an external telemetry emitter.
//!
//! The cache only *produces* events; where they are written (and how files are
//! rotated) is the sink's business.

use crate::util::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheEvent {
    #[serde(rename = "cache.hit")]
    Hit,
    #[serde(rename = "cache.miss")]
    Miss,
    #[serde(rename = "cache.write")]
    Write,
    #[serde(rename = "cache.lock_wait")]
    LockWait,
    #[serde(rename = "cache.lock_timeout")]
    LockTimeout,
    #[serde(rename = "cache.write_error")]
    WriteError,
}

impl CacheEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheEvent::Hit => "cache.hit",
            CacheEvent::Miss => "cache.miss",
            CacheEvent::Write => "cache.write",
            CacheEvent::LockWait => "cache.lock_wait",
            CacheEvent::LockTimeout => "cache.lock_timeout",
            CacheEvent::WriteError => "cache.write_error",
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry record.
///
/// `args` always carries `cache_key` and `symbol_ref`; `result` always carries
/// `backend` and `segment_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub command: CacheEvent,
    pub args: Map<String, Value>,
    pub result: Map<String, Value>,
    pub elapsed_ms: u64,
    pub ts_millis: u64,
}

impl TelemetryEvent {
    pub fn new(command: CacheEvent, elapsed: Duration) -> Self {
        Self {
            command,
            args: Map::new(),
            result: Map::new(),
            elapsed_ms: elapsed.as_millis() as u64,
            ts_millis: now_millis(),
        }
    }

    pub fn arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.args.insert(name.to_owned(), value.into());
        self
    }

    pub fn result(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.result.insert(name.to_owned(), value.into());
        self
    }
}

/// Consumer of cache telemetry.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);
}

/// Forwards every event as a structured `tracing` event on `symdex.telemetry`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        let args = Value::Object(event.args.clone());
        let result = Value::Object(event.result.clone());
        tracing::debug!(
            target: "symdex.telemetry",
            command = event.command.as_str(),
            elapsed_ms = event.elapsed_ms,
            args = %args,
            result = %result,
            "cache event"
        );
    }
}

/// Keeps events in memory; used by tests and embedders that batch telemetry.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().clone()
    }

    pub fn commands(&self) -> Vec<CacheEvent> {
        self.lock().iter().map(|event| event.command).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TelemetryEvent>> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        self.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_dotted_command_name() {
        let event = TelemetryEvent::new(CacheEvent::LockTimeout, Duration::from_millis(42))
            .arg("cache_key", "abc")
            .result("backend", "persistent");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["command"], "cache.lock_timeout");
        assert_eq!(json["args"]["cache_key"], "abc");
        assert_eq!(json["result"]["backend"], "persistent");
        assert_eq!(json["elapsed_ms"], 42);
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingTelemetry::new();
        sink.emit(&TelemetryEvent::new(CacheEvent::Miss, Duration::ZERO));
        sink.emit(&TelemetryEvent::new(CacheEvent::Write, Duration::ZERO));
        assert_eq!(sink.commands(), vec![CacheEvent::Miss, CacheEvent::Write]);
        sink.clear();
        assert!(sink.events().is_empty());
    }
}
