// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Tracing subscriber setup.
//!
//! Formatting and rendering are out of scope; this module only wires
//! [`crate::config::LogLevel`] to a console layer and, when requested, a
//! newline-delimited JSON layer writing to a separate file.

use std::path::Path;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

use crate::config::LogLevel;

/// Initialize the global `tracing` subscriber for the process.
///
/// The console layer's floor is `level`, further narrowed by `RUST_LOG` if
/// set. When `json_path` is given, a second layer writes one JSON object per
/// event to that file regardless of the console floor, at `debug` or above,
/// so `--stat`/`--json` post-mortems have full detail even when the console
/// is running quiet.
pub fn init(level: LogLevel, json_path: Option<&Path>) {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LevelFilter::from_level(tracing::Level::from(level)).to_string()));
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter);

    let json_layer = json_path.map(|path| {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap_or_else(|e| panic!("open log file {}: {e}", path.display()));
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(file.with_max_level(tracing::Level::DEBUG))
    });

    Registry::default().with(console_layer).with(json_layer).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping_is_monotonic() {
        assert_eq!(tracing::Level::from(LogLevel::Trace), tracing::Level::TRACE);
        assert_eq!(tracing::Level::from(LogLevel::Error), tracing::Level::ERROR);
        assert!(tracing::Level::TRACE > tracing::Level::ERROR);
    }
}
