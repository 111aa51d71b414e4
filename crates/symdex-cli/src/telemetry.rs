use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use symdex_cache::{TelemetryEvent, TelemetrySink, TracingTelemetry};

pub const ENV_TELEMETRY_FILE: &str = "SYMDEX_TELEMETRY_FILE";

/// Appends one JSON object per event to a file shared by every invocation.
///
/// Each event is written with a single `write_all` on an `O_APPEND` handle so
/// lines from concurrent processes do not interleave. Events are also
/// forwarded to [`TracingTelemetry`].
#[derive(Debug)]
pub struct JsonlTelemetry {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlTelemetry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &TelemetryEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut slot = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            *slot = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        match slot.as_mut() {
            Some(file) => file.write_all(&line),
            None => Ok(()),
        }
    }
}

impl TelemetrySink for JsonlTelemetry {
    fn emit(&self, event: &TelemetryEvent) {
        TracingTelemetry.emit(event);
        if let Err(err) = self.append(event) {
            tracing::debug!(
                target: "symdex.cli",
                path = %self.path.display(),
                error = %err,
                "failed to append telemetry event"
            );
        }
    }
}

/// Telemetry sink for this process: JSONL when `SYMDEX_TELEMETRY_FILE` is set,
/// `tracing` only otherwise.
pub fn sink_from_env() -> Arc<dyn TelemetrySink> {
    match std::env::var_os(ENV_TELEMETRY_FILE).filter(|value| !value.is_empty()) {
        Some(path) => Arc::new(JsonlTelemetry::new(path)),
        None => Arc::new(TracingTelemetry),
    }
}
