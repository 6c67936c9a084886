// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Plain-data configuration: the options the CLI layer builds once per
//! invocation and threads down into session acquisition and the engine.
//!
//! [`CommandRequest`] is the formal boundary between the two: everything
//! above this line is argument-parsing policy, out of scope for the
//! orchestration core; everything below consumes only these typed values.

use std::path::PathBuf;

use crate::object::{Metadata, StorageClass};
use crate::url::Url;

/// How many workers the execution engine runs concurrently.
///
/// A negative value is a multiplier of the available CPU count (matching
/// historical tool behaviour); callers resolve this to a concrete count with
/// [`WorkerCount::resolve`].
#[derive(Debug, Clone, Copy)]
pub enum WorkerCount {
    Fixed(usize),
    CpuMultiplier(i64),
}

impl WorkerCount {
    pub fn resolve(self) -> usize {
        match self {
            WorkerCount::Fixed(n) => n.max(2),
            WorkerCount::CpuMultiplier(n) if n < 0 => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1) as i64;
                ((-n) * cpus).max(2) as usize
            }
            WorkerCount::CpuMultiplier(n) => (n.max(2)) as usize,
        }
    }
}

impl Default for WorkerCount {
    fn default() -> Self {
        // Historical default used by earlier versions of this class of
        // tool; `--numworkers` overrides it explicitly either way.
        WorkerCount::Fixed(256)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// Reporting mode selected at exit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportMode {
    #[default]
    Silent,
    Stat,
    Json,
}

/// Flags shared by every command.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub workers: WorkerCount,
    pub retry_count: u32,
    pub endpoint_url: Option<String>,
    pub no_verify_ssl: bool,
    pub no_sign_request: bool,
    pub dry_run: bool,
    pub log_level: LogLevel,
    pub report_mode: ReportMode,
    pub profile: Option<String>,
    pub credentials_file: Option<PathBuf>,
    pub request_payer: bool,
    pub use_list_objects_v1: bool,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        GlobalOptions {
            workers: WorkerCount::default(),
            retry_count: 10,
            endpoint_url: None,
            no_verify_ssl: false,
            no_sign_request: false,
            dry_run: false,
            log_level: LogLevel::Info,
            report_mode: ReportMode::Silent,
            profile: None,
            credentials_file: None,
            request_payer: false,
            use_list_objects_v1: false,
        }
    }
}

/// Key under which the process-wide session cache (§3, "Session cache")
/// looks up an already-constructed session. Equality is structural, as the
/// spec requires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionOptions {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub credentials_file: Option<String>,
    pub no_sign_request: bool,
    pub no_verify_ssl: bool,
    pub retry_count: u32,
}

impl SessionOptions {
    pub fn from_global(global: &GlobalOptions, region: Option<String>) -> Self {
        SessionOptions {
            endpoint: global.endpoint_url.clone(),
            region,
            profile: global.profile.clone(),
            credentials_file: global
                .credentials_file
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            no_sign_request: global.no_sign_request,
            no_verify_ssl: global.no_verify_ssl,
            retry_count: global.retry_count,
        }
    }
}

/// Options for `cp`/`mv`.
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub flatten: bool,
    pub concurrency: usize,
    pub part_size: u64,
    pub metadata: Metadata,
    pub excludes: Vec<String>,
    pub raw: bool,
    pub force_glacier_transfer: bool,
    pub source_region: Option<String>,
    pub destination_region: Option<String>,
    pub no_follow_symlinks: bool,
    pub if_size_differ: bool,
    pub if_source_newer: bool,
}

/// Options for `sync`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub delete: bool,
    pub size_only: bool,
    pub exact_timestamps: bool,
}

/// Options for `select`.
#[derive(Debug, Clone)]
pub struct SelectOptions {
    pub query: String,
    pub compression: Option<String>,
    pub input_format: SelectFormat,
    pub output_format: SelectFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectFormat {
    Json,
    Csv,
    Parquet,
}

/// A fully parsed, typed command request: the contract between the CLI
/// layer and the orchestration core.
#[derive(Debug, Clone)]
pub enum CommandRequest {
    Copy {
        sources: Vec<Url>,
        destination: Url,
        options: CopyOptions,
        delete_source: bool,
    },
    Remove {
        urls: Vec<Url>,
    },
    List {
        url: Option<Url>,
        show_storage_class: bool,
        all_versions: bool,
    },
    DiskUsage {
        url: Url,
        group_by_storage_class: bool,
    },
    Sync {
        source: Url,
        destination: Url,
        options: SyncOptions,
    },
    Select {
        url: Url,
        options: SelectOptions,
    },
    Cat {
        url: Url,
    },
    MakeBucket {
        url: Url,
    },
    RemoveBucket {
        url: Url,
    },
    Run {
        file: Option<PathBuf>,
    },
    BucketVersion {
        url: Url,
        set: Option<bool>,
    },
}

pub fn default_storage_class() -> StorageClass {
    StorageClass::Standard
}
