// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Argument parsing and command dispatch.
//!
//! Argument parsing and flag plumbing are kept out of the orchestration
//! core; this module exists so the binary and the batch driver share
//! exactly one parser and one dispatch table, built on `clap`'s derive API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures::stream::StreamExt;

use crate::cancel::CancellationToken;
use crate::config::{
    CommandRequest, CopyOptions, GlobalOptions, LogLevel, ReportMode, SelectFormat, SelectOptions, SessionOptions,
    SyncOptions, WorkerCount,
};
use crate::engine::Engine;
use crate::object::{Metadata, MetadataDirective, SseMethod, StorageClass};
use crate::planner::{self, TaskError};
use crate::stats::{Op, Stats};
use crate::storage::local::LocalStorage;
use crate::storage::s3::S3Storage;
use crate::storage::{DynStorage, ListOptions};
use crate::url::Url;

/// Top-level argv parser. Also reused, stripped of its program name, to
/// parse one line at a time in batch mode (§4.G).
#[derive(Parser, Debug)]
#[command(name = "s3fleet", version, about = "A high-throughput client for S3-compatible object stores")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Negative values are a multiplier of the available CPU count.
    #[arg(long, allow_hyphen_values = true, global = true)]
    pub numworkers: Option<i64>,
    #[arg(long, default_value_t = 10, global = true)]
    pub retry_count: u32,
    #[arg(long, global = true)]
    pub endpoint_url: Option<String>,
    #[arg(long, global = true)]
    pub no_verify_ssl: bool,
    #[arg(long, global = true)]
    pub no_sign_request: bool,
    #[arg(long, global = true)]
    pub dry_run: bool,
    #[arg(long, value_enum, default_value_t = LogLevelArg::Info, global = true)]
    pub log: LogLevelArg,
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long, global = true)]
    pub stat: bool,
    #[arg(long, global = true)]
    pub profile: Option<String>,
    #[arg(long, global = true)]
    pub credentials_file: Option<PathBuf>,
    #[arg(long, global = true)]
    pub request_payer: bool,
    #[arg(long, global = true)]
    pub use_list_objects_v1: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Error,
}

impl From<LogLevelArg> for LogLevel {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => LogLevel::Trace,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Error => LogLevel::Error,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Copy one or more sources to a destination.
    Cp(CpArgs),
    /// Copy, then delete the source on success.
    Mv(CpArgs),
    /// Remove one or more objects or files. All remote URLs must share one bucket.
    Rm { urls: Vec<String> },
    /// List a bucket's contents, or every bucket if no URL is given.
    Ls {
        url: Option<String>,
        #[arg(short = 's', long)]
        storage_class: bool,
        #[arg(long)]
        all_versions: bool,
        #[arg(long)]
        version_id: Option<String>,
    },
    /// Report aggregate size under a URL.
    Du {
        url: String,
        #[arg(short = 'g', long)]
        group_by_storage_class: bool,
    },
    /// Reconcile a destination tree with a source tree.
    Sync {
        source: String,
        destination: String,
        #[arg(long)]
        delete: bool,
        #[arg(long)]
        size_only: bool,
        #[arg(long)]
        exact_timestamps: bool,
    },
    /// Run an S3 Select query against a single object.
    Select {
        url: String,
        #[arg(long)]
        query: String,
        #[arg(long)]
        compression: Option<String>,
        #[arg(long, value_enum, default_value_t = SelectFormatArg::Json)]
        input_format: SelectFormatArg,
        #[arg(long, value_enum, default_value_t = SelectFormatArg::Json)]
        output_format: SelectFormatArg,
    },
    /// Stream an object's contents to stdout.
    Cat { url: String },
    /// Create a bucket.
    Mb { url: String },
    /// Remove a bucket.
    Rb { url: String },
    /// Read commands from FILE (or stdin) and run each one, in order.
    Run { file: Option<PathBuf> },
    /// Get or set a bucket's versioning state.
    BucketVersion {
        url: String,
        #[arg(long)]
        set: Option<bool>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectFormatArg {
    Json,
    Csv,
    Parquet,
}

impl From<SelectFormatArg> for SelectFormat {
    fn from(f: SelectFormatArg) -> Self {
        match f {
            SelectFormatArg::Json => SelectFormat::Json,
            SelectFormatArg::Csv => SelectFormat::Csv,
            SelectFormatArg::Parquet => SelectFormat::Parquet,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CpArgs {
    /// One or more sources followed by one destination.
    #[arg(required = true, num_args = 2..)]
    pub paths: Vec<String>,
    #[arg(long)]
    pub flatten: bool,
    #[arg(long)]
    pub concurrency: Option<usize>,
    #[arg(long)]
    pub part_size: Option<u64>,
    #[arg(long)]
    pub storage_class: Option<String>,
    #[arg(long)]
    pub acl: Option<String>,
    #[arg(long)]
    pub sse: Option<String>,
    #[arg(long)]
    pub sse_kms_key_id: Option<String>,
    #[arg(long)]
    pub cache_control: Option<String>,
    #[arg(long)]
    pub expires: Option<String>,
    #[arg(long)]
    pub content_type: Option<String>,
    #[arg(long)]
    pub content_encoding: Option<String>,
    #[arg(long)]
    pub exclude: Vec<String>,
    #[arg(long)]
    pub raw: bool,
    #[arg(long)]
    pub force_glacier_transfer: bool,
    #[arg(long)]
    pub source_region: Option<String>,
    #[arg(long)]
    pub destination_region: Option<String>,
    #[arg(long)]
    pub no_follow_symlinks: bool,
    #[arg(long)]
    pub if_size_differ: bool,
    #[arg(long)]
    pub if_source_newer: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Url(#[from] crate::url::Error),
    #[error("cp/mv needs at least one source and one destination")]
    NotEnoughPaths,
    #[error("invalid RFC 3339 timestamp {0:?}: {1}")]
    BadExpires(String, time::error::Parse),
    #[error("--endpoint-url {0:?} is missing a scheme; use http:// or https://")]
    EndpointMissingScheme(String),
}

/// Reject an `--endpoint-url` value with no `http://`/`https://` scheme,
/// per the boundary case: a bare host:port is ambiguous (is this plaintext
/// or TLS?) and the SDK otherwise fails it with a much less actionable
/// error deep inside request signing.
pub fn validate_endpoint_url(endpoint: &str) -> Result<(), BuildError> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(())
    } else {
        Err(BuildError::EndpointMissingScheme(endpoint.to_owned()))
    }
}

pub fn global_options(args: &GlobalArgs) -> GlobalOptions {
    let report_mode = if args.json {
        ReportMode::Json
    } else if args.stat {
        ReportMode::Stat
    } else {
        ReportMode::Silent
    };
    GlobalOptions {
        workers: args.numworkers.map(WorkerCount::CpuMultiplier).unwrap_or_default(),
        retry_count: args.retry_count,
        endpoint_url: args.endpoint_url.clone(),
        no_verify_ssl: args.no_verify_ssl,
        no_sign_request: args.no_sign_request,
        dry_run: args.dry_run,
        log_level: args.log.into(),
        report_mode,
        profile: args.profile.clone(),
        credentials_file: args.credentials_file.clone(),
        request_payer: args.request_payer,
        use_list_objects_v1: args.use_list_objects_v1,
    }
}

/// Turn a parsed [`Command`] into the typed [`CommandRequest`] the
/// orchestration core consumes.
pub fn build_request(command: Command) -> Result<CommandRequest, BuildError> {
    match command {
        Command::Cp(args) => build_copy_request(args, false),
        Command::Mv(args) => build_copy_request(args, true),
        Command::Rm { urls } => {
            let urls = urls.iter().map(|s| Url::parse(s)).collect::<Result<Vec<_>, _>>()?;
            Ok(CommandRequest::Remove { urls })
        }
        Command::Ls { url, storage_class, all_versions, version_id } => {
            let url = match (url, version_id) {
                (Some(u), Some(v)) => Some(Url::parse(&format!("{u}?versionId={v}"))?),
                (Some(u), None) => Some(Url::parse(&u)?),
                (None, _) => None,
            };
            Ok(CommandRequest::List { url, show_storage_class: storage_class, all_versions })
        }
        Command::Du { url, group_by_storage_class } => {
            Ok(CommandRequest::DiskUsage { url: Url::parse(&url)?, group_by_storage_class })
        }
        Command::Sync { source, destination, delete, size_only, exact_timestamps } => Ok(CommandRequest::Sync {
            source: Url::parse(&source)?,
            destination: Url::parse(&destination)?,
            options: SyncOptions { delete, size_only, exact_timestamps },
        }),
        Command::Select { url, query, compression, input_format, output_format } => Ok(CommandRequest::Select {
            url: Url::parse(&url)?,
            options: SelectOptions {
                query,
                compression,
                input_format: input_format.into(),
                output_format: output_format.into(),
            },
        }),
        Command::Cat { url } => Ok(CommandRequest::Cat { url: Url::parse(&url)? }),
        Command::Mb { url } => Ok(CommandRequest::MakeBucket { url: Url::parse(&url)? }),
        Command::Rb { url } => Ok(CommandRequest::RemoveBucket { url: Url::parse(&url)? }),
        Command::Run { file } => Ok(CommandRequest::Run { file }),
        Command::BucketVersion { url, set } => Ok(CommandRequest::BucketVersion { url: Url::parse(&url)?, set }),
    }
}

fn build_copy_request(args: CpArgs, delete_source: bool) -> Result<CommandRequest, BuildError> {
    if args.paths.len() < 2 {
        return Err(BuildError::NotEnoughPaths);
    }
    let mut paths = args.paths;
    let destination = paths.pop().expect("checked len >= 2");
    let sources = paths.iter().map(|s| Url::parse(s)).collect::<Result<Vec<_>, _>>()?;
    let destination = Url::parse(&destination)?;

    let mut metadata = Metadata {
        content_type: args.content_type,
        content_encoding: args.content_encoding,
        cache_control: args.cache_control,
        storage_class: args.storage_class.as_deref().map(StorageClass::from),
        acl: args.acl,
        sse: args.sse.as_deref().map(parse_sse_method),
        sse_kms_key_id: args.sse_kms_key_id,
        ..Default::default()
    };
    if let Some(expires) = &args.expires {
        let parsed = time::OffsetDateTime::parse(expires, &time::format_description::well_known::Rfc3339)
            .map_err(|e| BuildError::BadExpires(expires.clone(), e))?;
        metadata.expires = Some(parsed);
    }
    if metadata.content_type.is_some() || !metadata.user_defined.is_empty() {
        metadata.metadata_directive = MetadataDirective::Replace;
    }

    Ok(CommandRequest::Copy {
        sources,
        destination,
        options: CopyOptions {
            flatten: args.flatten,
            concurrency: args.concurrency.unwrap_or(1),
            part_size: args.part_size.unwrap_or(8 * 1024 * 1024),
            metadata,
            excludes: args.exclude,
            raw: args.raw,
            force_glacier_transfer: args.force_glacier_transfer,
            source_region: args.source_region,
            destination_region: args.destination_region,
            no_follow_symlinks: args.no_follow_symlinks,
            if_size_differ: args.if_size_differ,
            if_source_newer: args.if_source_newer,
        },
        delete_source,
    })
}

fn parse_sse_method(s: &str) -> SseMethod {
    match s {
        "aws:kms" | "kms" => SseMethod::AwsKms,
        _ => SseMethod::Aes256,
    }
}

/// Everything a command dispatch function needs: the engine, its stats
/// handle, the root cancellation token, and the global flags that shape
/// session acquisition.
pub struct Context {
    pub engine: Engine,
    pub cancel: CancellationToken,
    pub global: GlobalOptions,
}

impl Context {
    pub fn new(global: GlobalOptions) -> Self {
        let cancel = CancellationToken::new();
        let stats = Arc::new(Stats::new());
        let engine = Engine::new(global.workers.resolve(), cancel.child(), stats);
        Context { engine, cancel, global }
    }
}

/// Build the right backend for `url`, honoring `--endpoint-url`,
/// `--no-sign-request`, `--use-list-objects-v1`, and friends.
pub fn storage_for(url: &Url, global: &GlobalOptions, region: Option<String>) -> DynStorage {
    if url.is_remote() {
        let session_options = SessionOptions::from_global(global, region);
        Arc::new(
            S3Storage::new(session_options)
                .with_use_list_objects_v1(global.use_list_objects_v1)
                .with_dry_run(global.dry_run),
        ) as DynStorage
    } else {
        Arc::new(LocalStorage::new().with_dry_run(global.dry_run)) as DynStorage
    }
}

/// Dispatch one [`CommandRequest`], returning every per-sub-task error
/// observed (empty on full success). A whole-command failure (bad planner
/// input, mixed buckets, a failed single-object stat) is represented as one
/// synthetic [`TaskError`] with no task descriptor, matching the "user
/// errors"/"planner errors" categories in §7: printed once, no partial
/// retries of sibling tasks.
pub async fn dispatch(ctx: &Context, request: CommandRequest) -> Vec<TaskError> {
    match request {
        CommandRequest::Copy { sources, destination, options, delete_source } => {
            copy_command(ctx, sources, destination, options, delete_source).await
        }
        CommandRequest::Remove { urls } => remove_command(ctx, urls).await,
        CommandRequest::List { url, show_storage_class, all_versions } => {
            list_command(ctx, url, show_storage_class, all_versions).await
        }
        CommandRequest::DiskUsage { url, group_by_storage_class } => {
            disk_usage_command(ctx, url, group_by_storage_class).await
        }
        CommandRequest::Sync { source, destination, options } => sync_command(ctx, source, destination, options).await,
        CommandRequest::Select { url, options } => select_command(ctx, url, options).await,
        CommandRequest::Cat { url } => cat_command(ctx, url).await,
        CommandRequest::MakeBucket { url } => make_bucket_command(ctx, url).await,
        CommandRequest::RemoveBucket { url } => remove_bucket_command(ctx, url).await,
        CommandRequest::Run { file } => crate::batch::run_file(ctx, file.as_deref()).await,
        CommandRequest::BucketVersion { url, set } => bucket_version_command(ctx, url, set).await,
    }
}

fn single_error(message: impl Into<String>) -> Vec<TaskError> {
    vec![TaskError { task: None, message: message.into() }]
}

async fn copy_command(
    ctx: &Context,
    sources: Vec<Url>,
    destination: Url,
    options: CopyOptions,
    delete_source: bool,
) -> Vec<TaskError> {
    // `--dry-run` bypasses mutations at the storage layer (`storage_for`
    // wires it into the backend), not here: planning (matching, naming, the
    // self-expansion guard) still runs so its errors still surface.
    let src_region = options.source_region.clone();
    let dst_region = options.destination_region.clone();
    // A mixed local/remote source list can only happen for `rm`, never
    // `cp`/`mv`: the planner requires one backend per invocation.
    let src_is_remote = sources.first().map(Url::is_remote).unwrap_or(false);
    let src_storage = storage_for(&sources[0], &ctx.global, src_region);
    let _ = src_is_remote;
    let dst_storage = storage_for(&destination, &ctx.global, dst_region);

    if !delete_source {
        let tasks = match planner::plan_copy(src_storage, dst_storage, sources, destination, options) {
            Ok(tasks) => tasks,
            Err(e) => return single_error(e.to_string()),
        };
        return ctx.engine.run_to_completion(Op::Copy, tasks).await;
    }

    let tasks = match planner::plan_copy(src_storage.clone(), dst_storage, sources, destination, options) {
        Ok(tasks) => tasks,
        Err(e) => return single_error(e.to_string()),
    };
    run_move_then_delete(ctx, src_storage, tasks).await
}

/// `mv`'s general case: run every planned copy, and only on a given task's
/// success delete that task's own source. Built on top of [`planner::plan_copy`]
/// so naming, `--exclude`, and glacier filtering stay identical to `cp`;
/// [`planner::run_move`] remains the single-pair building block this
/// generalizes.
async fn run_move_then_delete(ctx: &Context, src_storage: DynStorage, mut tasks: planner::TaskStream) -> Vec<TaskError> {
    let waiter = ctx.engine.new_waiter();
    let mut planning_errors = Vec::new();
    while let Some(item) = tasks.next().await {
        if ctx.cancel.is_cancelled() {
            break;
        }
        match item {
            Ok(task) => {
                let src = task.src.clone();
                let src_storage = src_storage.clone();
                ctx.engine.submit(&waiter, Op::Copy, move || async move {
                    task.run().await?;
                    src_storage.delete(&src).await.map_err(|e| TaskError {
                        task: Some(planner::TaskDescriptor { verb: planner::Verb::Delete, src: src.clone(), dst: None }),
                        message: e.to_string(),
                    })
                });
            }
            Err(e) => {
                ctx.engine.stats().record_error(Op::Copy);
                planning_errors.push(e);
            }
        }
    }
    let mut errors = waiter.wait().await;
    errors.extend(planning_errors);
    errors
}

async fn remove_command(ctx: &Context, urls: Vec<Url>) -> Vec<TaskError> {
    if urls.is_empty() {
        return Vec::new();
    }
    // The mixed-bucket precheck in `plan_remove` must still run under
    // `--dry-run`: it's a planner error (§7), not a mutation, and
    // `storage_for` already makes the backend's own `delete`/`multi_delete`
    // a no-op when `--dry-run` is set.
    let storage = storage_for(&urls[0], &ctx.global, None);
    let tasks = match planner::plan_remove(storage, urls) {
        Ok(tasks) => tasks,
        Err(e) => return single_error(e.to_string()),
    };
    ctx.engine.run_to_completion(Op::Delete, tasks).await
}

async fn list_command(ctx: &Context, url: Option<Url>, show_storage_class: bool, all_versions: bool) -> Vec<TaskError> {
    let Some(url) = url else {
        let storage = Arc::new(S3Storage::new(SessionOptions::from_global(&ctx.global, None))) as DynStorage;
        return match storage.list_buckets("").await {
            Ok(buckets) => {
                for bucket in buckets {
                    println!("{bucket}");
                }
                Vec::new()
            }
            Err(e) => single_error(e.to_string()),
        };
    };
    let storage = storage_for(&url, &ctx.global, None);
    let options = ListOptions { recursive: !url.is_prefix() || url.has_glob(), all_versions, ..Default::default() };
    let mut listing = storage.list(&url, options);
    let mut errors = Vec::new();
    let mut count = 0;
    while let Some(item) = listing.next().await {
        ctx.engine.stats().record_success(Op::List);
        match item {
            Ok(object) => {
                count += 1;
                let name = object.relative_path.clone().unwrap_or_else(|| object.url.base().to_owned());
                if show_storage_class {
                    println!("{:<20} {:>12} {}", object.storage_class.to_string(), object.size, name);
                } else {
                    println!("{name}");
                }
            }
            Err(e) => errors.push(TaskError { task: None, message: e.to_string() }),
        }
    }
    let _ = count;
    errors
}

async fn disk_usage_command(ctx: &Context, url: Url, group_by_storage_class: bool) -> Vec<TaskError> {
    let storage = storage_for(&url, &ctx.global, None);
    let mut listing = storage.list(&url, ListOptions { recursive: true, ..Default::default() });
    let mut totals: std::collections::BTreeMap<String, u64> = std::collections::BTreeMap::new();
    let mut errors = Vec::new();
    while let Some(item) = listing.next().await {
        match item {
            Ok(object) if object.is_dir() => {}
            Ok(object) => {
                let key = if group_by_storage_class { object.storage_class.to_string() } else { "total".to_owned() };
                *totals.entry(key).or_insert(0) += object.size;
            }
            Err(e) => errors.push(TaskError { task: None, message: e.to_string() }),
        }
    }
    for (key, size) in totals {
        println!("{size:>15} {key}");
    }
    errors
}

async fn sync_command(ctx: &Context, source: Url, destination: Url, options: SyncOptions) -> Vec<TaskError> {
    let src_storage = storage_for(&source, &ctx.global, None);
    let dst_storage = storage_for(&destination, &ctx.global, None);

    let source_listing = src_storage.list(&source, ListOptions { recursive: true, ..Default::default() });
    let destination_listing = dst_storage.list(&destination, ListOptions { recursive: true, ..Default::default() });

    let actions = match crate::sync::diff(source_listing, destination_listing, options).await {
        Ok(actions) => actions,
        Err(e) => return single_error(format!("sync: {e}")),
    };

    // `--dry-run` bypasses the copy/delete mutations at the storage layer
    // (`storage_for` wires it into both backends); the diff and submission
    // below still run so the planned actions are still counted in stats.
    let waiter = ctx.engine.new_waiter();
    for action in actions {
        match action {
            crate::sync::SyncAction::Copy { relative_path, source_url } => {
                let dst = destination.join(&relative_path);
                let task = planner::make_copy_task(
                    src_storage.clone(),
                    dst_storage.clone(),
                    source_url,
                    dst,
                    Metadata::default(),
                    1,
                    8 * 1024 * 1024,
                );
                ctx.engine.submit(&waiter, Op::Copy, move || async move { task.run().await });
            }
            crate::sync::SyncAction::Delete { destination_url, .. } => {
                let task = planner::make_delete_task(dst_storage.clone(), destination_url);
                ctx.engine.submit(&waiter, Op::Delete, move || async move { task.run().await });
            }
        }
    }
    waiter.wait().await
}

async fn select_command(ctx: &Context, url: Url, options: SelectOptions) -> Vec<TaskError> {
    let storage = storage_for(&url, &ctx.global, None);
    let (tx, mut rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(16);
    let select = tokio::spawn(async move { storage.select(&url, &options, tx).await });
    use tokio::io::AsyncWriteExt;
    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = rx.recv().await {
        if stdout.write_all(&chunk).await.is_err() {
            break;
        }
    }
    let _ = stdout.flush().await;
    ctx.engine.stats().record_success(Op::Select);
    match select.await {
        Ok(Ok(())) => Vec::new(),
        Ok(Err(e)) => {
            ctx.engine.stats().record_error(Op::Select);
            single_error(e.to_string())
        }
        Err(e) => {
            ctx.engine.stats().record_error(Op::Select);
            single_error(format!("select task panicked: {e}"))
        }
    }
}

async fn cat_command(ctx: &Context, url: Url) -> Vec<TaskError> {
    if !url.is_remote() {
        return single_error(format!("cat only supports remote objects, got {url}"));
    }
    let storage = storage_for(&url, &ctx.global, None);
    let staged = std::env::temp_dir().join(format!(".s3fleet-cat-{}", std::process::id()));
    let result = storage.get(&url, &staged, 1, 8 * 1024 * 1024).await;
    match result {
        Ok(_) if ctx.global.dry_run => {
            // `get` already bypassed the real fetch and returned (0, Ok); no
            // staged file exists to read.
            ctx.engine.stats().record_success(Op::Get);
            Vec::new()
        }
        Ok(_) => {
            ctx.engine.stats().record_success(Op::Get);
            let rendered = match tokio::fs::read(&staged).await {
                Ok(bytes) => {
                    use tokio::io::AsyncWriteExt;
                    let mut stdout = tokio::io::stdout();
                    let _ = stdout.write_all(&bytes).await;
                    let _ = stdout.flush().await;
                    Vec::new()
                }
                Err(e) => single_error(e.to_string()),
            };
            let _ = tokio::fs::remove_file(&staged).await;
            rendered
        }
        Err(e) => {
            ctx.engine.stats().record_error(Op::Get);
            single_error(e.to_string())
        }
    }
}

async fn make_bucket_command(ctx: &Context, url: Url) -> Vec<TaskError> {
    let storage = storage_for(&url, &ctx.global, None);
    match storage.make_bucket(url.bucket()).await {
        Ok(()) => {
            ctx.engine.stats().record_success(Op::MakeBucket);
            Vec::new()
        }
        Err(e) => {
            ctx.engine.stats().record_error(Op::MakeBucket);
            single_error(e.to_string())
        }
    }
}

async fn remove_bucket_command(ctx: &Context, url: Url) -> Vec<TaskError> {
    let storage = storage_for(&url, &ctx.global, None);
    match storage.remove_bucket(url.bucket()).await {
        Ok(()) => {
            ctx.engine.stats().record_success(Op::RemoveBucket);
            Vec::new()
        }
        Err(e) => {
            ctx.engine.stats().record_error(Op::RemoveBucket);
            single_error(e.to_string())
        }
    }
}

async fn bucket_version_command(ctx: &Context, url: Url, set: Option<bool>) -> Vec<TaskError> {
    let storage = storage_for(&url, &ctx.global, None);
    if let Some(enabled) = set {
        // `--dry-run` bypasses the mutation inside `set_bucket_versioning`
        // itself; still record a successful no-op rather than skipping the
        // call site.
        match storage.set_bucket_versioning(url.bucket(), enabled).await {
            Ok(()) => {
                ctx.engine.stats().record_success(Op::BucketVersion);
                Vec::new()
            }
            Err(e) => {
                ctx.engine.stats().record_error(Op::BucketVersion);
                single_error(e.to_string())
            }
        }
    } else {
        match storage.get_bucket_versioning(url.bucket()).await {
            Ok(enabled) => {
                println!("{}", if enabled { "Enabled" } else { "Suspended" });
                ctx.engine.stats().record_success(Op::BucketVersion);
                Vec::new()
            }
            Err(e) => {
                ctx.engine.stats().record_error(Op::BucketVersion);
                single_error(e.to_string())
            }
        }
    }
}

/// Render one line per failed sub-task to stderr, per §7's user-visible
/// failure format: verb, source, destination (if any), message with
/// newlines/tabs collapsed.
pub fn report_errors(errors: &[TaskError]) {
    for error in errors {
        eprintln!("{error}");
    }
}

/// Render the final report selected by `--stat`/`--json`, if any.
pub fn report_stats(mode: ReportMode, stats: &Stats) {
    match mode {
        ReportMode::Silent => {}
        ReportMode::Stat => println!("{stats}"),
        ReportMode::Json => {
            for line in stats.to_json_lines() {
                println!("{line}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cp_parses_multiple_sources_and_one_destination() {
        let cli = Cli::try_parse_from(["s3fleet", "cp", "a.txt", "b.txt", "s3://bucket/dst/"]).unwrap();
        let request = build_request(cli.command).unwrap();
        match request {
            CommandRequest::Copy { sources, destination, .. } => {
                assert_eq!(sources.len(), 2);
                assert_eq!(destination.as_str(), "s3://bucket/dst/");
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn mv_sets_delete_source() {
        let cli = Cli::try_parse_from(["s3fleet", "mv", "a.txt", "s3://bucket/dst/a.txt"]).unwrap();
        let request = build_request(cli.command).unwrap();
        assert!(matches!(request, CommandRequest::Copy { delete_source: true, .. }));
    }

    #[test]
    fn numworkers_negative_is_a_cpu_multiplier() {
        let cli = Cli::try_parse_from(["s3fleet", "--numworkers", "-2", "ls"]).unwrap();
        let global = global_options(&cli.global);
        assert!(matches!(global.workers, WorkerCount::CpuMultiplier(-2)));
    }

    #[test]
    fn ls_with_no_url_lists_buckets() {
        let cli = Cli::try_parse_from(["s3fleet", "ls"]).unwrap();
        let request = build_request(cli.command).unwrap();
        assert!(matches!(request, CommandRequest::List { url: None, .. }));
    }

    #[test]
    fn rm_rejects_mixed_buckets_before_parsing_succeeds() {
        // Parsing always succeeds; the mixed-bucket precheck happens in the
        // planner, not here.
        let cli = Cli::try_parse_from(["s3fleet", "rm", "s3://b1/x", "s3://b2/y"]).unwrap();
        let request = build_request(cli.command).unwrap();
        assert!(matches!(request, CommandRequest::Remove { .. }));
    }

    #[test]
    fn json_and_stat_flags_select_report_mode() {
        let cli = Cli::try_parse_from(["s3fleet", "--json", "ls"]).unwrap();
        assert_eq!(global_options(&cli.global).report_mode, ReportMode::Json);
    }

    #[test]
    fn endpoint_without_scheme_is_a_usage_error_at_build_time() {
        let cli = Cli::try_parse_from(["s3fleet", "--endpoint-url", "localhost:9000", "ls"]).unwrap();
        let endpoint = cli.global.endpoint_url.as_deref().unwrap();
        assert_eq!(endpoint, "localhost:9000");
        assert!(matches!(validate_endpoint_url(endpoint), Err(BuildError::EndpointMissingScheme(_))));
    }

    #[test]
    fn endpoint_with_scheme_is_accepted() {
        assert!(validate_endpoint_url("http://localhost:9000").is_ok());
        assert!(validate_endpoint_url("https://minio.internal:9000").is_ok());
    }

    #[test]
    fn bucket_version_parses_get_and_set_forms() {
        let cli = Cli::try_parse_from(["s3fleet", "bucket-version", "s3://bucket"]).unwrap();
        let request = build_request(cli.command).unwrap();
        assert!(matches!(request, CommandRequest::BucketVersion { set: None, .. }));

        let cli = Cli::try_parse_from(["s3fleet", "bucket-version", "s3://bucket", "--set", "true"]).unwrap();
        let request = build_request(cli.command).unwrap();
        assert!(matches!(request, CommandRequest::BucketVersion { set: Some(true), .. }));
    }
}
