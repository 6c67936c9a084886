// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Orchestration core for a parallel S3-compatible object store client.
//!
//! This crate turns a stream of user commands (`cp`, `mv`, `rm`, `sync`, `ls`,
//! `select`, ...) into many per-object sub-tasks dispatched concurrently
//! against a storage backend, with retry, cancellation, and aggregated
//! reporting.

pub mod batch;
pub mod cancel;
pub mod commands;
pub mod config;
pub mod engine;
pub mod excludes;
pub mod logging;
pub mod object;
pub mod planner;
pub mod retry;
pub mod stats;
pub mod storage;
pub mod sync;
pub mod url;

pub use cancel::CancellationToken;
pub use config::{CommandRequest, GlobalOptions, SessionOptions};
pub use engine::Engine;
pub use object::{Metadata, Object, StorageClass};
pub use planner::Task;
pub use stats::Stats;
pub use url::Url;

/// Crate version, used as the S3 SDK application name.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
