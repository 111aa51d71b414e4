//! Library half of the `symdex` CLI.
//!
//! The binary (`src/main.rs`) is a thin argument layer; reference resolution,
//! outline extraction, telemetry and logging setup live here so they can be
//! unit tested with `cargo test -p symdex-cli --lib`.

pub mod logging;
pub mod outline;
pub mod resolve;
pub mod telemetry;
