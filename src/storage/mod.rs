// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Storage capability interface shared by the S3 and local-filesystem
//! backends.
//!
//! A small set of operations common across backends, with methods a backend
//! can't support returning [`Error::NotImplemented`] so the planner can
//! pre-check before scheduling work.

pub mod fake;
pub mod local;
pub mod s3;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use thiserror::Error;

use crate::config::SelectOptions;
use crate::object::{Metadata, Object};
use crate::url::Url;

pub type ObjectStream = Pin<Box<dyn Stream<Item = Result<Object>> + Send>>;
pub type DeleteResultStream = Pin<Box<dyn Stream<Item = DeleteResult> + Send>>;

/// Sentinel distinguishing "stream is empty because nothing matched" from a
/// normal end-of-stream. Emitted as the sole value on the stream, per §4.C.
#[derive(Debug, Error, Clone)]
#[error("no object found matching {0}")]
pub struct ErrNoObjectFound(pub Url);

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(Url),

    #[error("{method} is not implemented by this backend")]
    NotImplemented { method: &'static str },

    #[error("no object found matching {0}")]
    NoObjectFound(Url),

    #[error("local I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Retryable(#[from] crate::retry::RetryableError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::NoObjectFound(_))
    }
}

/// One result of a multi-object delete: which URL, and whether it
/// succeeded.
#[derive(Debug, Clone)]
pub struct DeleteResult {
    pub url: Url,
    pub error: Option<String>,
}

/// Options shaping a recursive listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub recursive: bool,
    pub all_versions: bool,
    /// Skip objects whose storage class is Glacier/Deep-Archive unless set.
    pub force_glacier_transfer: bool,
    /// Force `ListObjects` (v1) instead of `ListObjectsV2`; GCS endpoints
    /// require this regardless of the flag, per §4.C.
    pub use_list_objects_v1: bool,
}

/// Capability set common to remote and local backends.
///
/// All methods are `async` because the hot path is network I/O against the
/// S3 SDK; the local backend simply never awaits.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stat a single object/file. Returns `Error::NotFound` if absent.
    async fn stat(&self, url: &Url) -> Result<Object>;

    /// Stream a (possibly large) listing under `url`.
    fn list(&self, url: &Url, options: ListOptions) -> ObjectStream;

    /// Copy within the same backend (S3-to-S3 server-side copy, or a local
    /// file copy).
    async fn copy(&self, src: &Url, dst: &Url, metadata: &Metadata) -> Result<()>;

    /// Download remote bytes to a local path. Backends that aren't remote
    /// return `NotImplemented`.
    async fn get(&self, src: &Url, dst_path: &std::path::Path, concurrency: usize, part_size: u64) -> Result<u64> {
        let _ = (src, dst_path, concurrency, part_size);
        Err(Error::NotImplemented { method: "get" })
    }

    /// Upload local bytes to a remote object.
    async fn put(
        &self,
        src_path: &std::path::Path,
        dst: &Url,
        metadata: &Metadata,
        concurrency: usize,
        part_size: u64,
    ) -> Result<()> {
        let _ = (src_path, dst, metadata, concurrency, part_size);
        Err(Error::NotImplemented { method: "put" })
    }

    /// Delete a single object or file.
    async fn delete(&self, url: &Url) -> Result<()>;

    /// Delete many objects, reporting one [`DeleteResult`] per input URL.
    fn multi_delete(&self, urls: ObjectStream) -> DeleteResultStream;

    async fn list_buckets(&self, prefix: &str) -> Result<Vec<String>> {
        let _ = prefix;
        Err(Error::NotImplemented { method: "list_buckets" })
    }

    async fn make_bucket(&self, name: &str) -> Result<()> {
        let _ = name;
        Err(Error::NotImplemented { method: "make_bucket" })
    }

    async fn remove_bucket(&self, name: &str) -> Result<()> {
        let _ = name;
        Err(Error::NotImplemented { method: "remove_bucket" })
    }

    /// Whether versioning is enabled on `name`, per §4.C's direct-passthrough
    /// bucket operations.
    async fn get_bucket_versioning(&self, name: &str) -> Result<bool> {
        let _ = name;
        Err(Error::NotImplemented { method: "get_bucket_versioning" })
    }

    /// Enable or suspend versioning on `name`.
    async fn set_bucket_versioning(&self, name: &str, enabled: bool) -> Result<()> {
        let _ = (name, enabled);
        Err(Error::NotImplemented { method: "set_bucket_versioning" })
    }

    /// Run an S3 Select query against a single object, pushing each decoded
    /// output record to `sink` as it arrives on the event stream.
    async fn select(&self, url: &Url, options: &SelectOptions, sink: tokio::sync::mpsc::Sender<bytes::Bytes>) -> Result<()> {
        let _ = (url, options, sink);
        Err(Error::NotImplemented { method: "select" })
    }
}

pub type DynStorage = Arc<dyn Storage>;

/// Append [`Error::NoObjectFound`] as the sole trailing item when `stream`
/// completes without yielding any object, per §4.C's listing contract.
/// Bucket-root listings are exempt: an empty bucket is a normal result, not
/// a failed match.
pub fn emit_no_object_found_if_empty(stream: ObjectStream, url: Url) -> ObjectStream {
    if url.is_bucket() {
        return stream;
    }
    let matched = Arc::new(AtomicBool::new(false));
    let tap = matched.clone();
    let body = stream.inspect(move |item| {
        if item.is_ok() {
            tap.store(true, Ordering::Relaxed);
        }
    });
    let tail = futures::stream::once(async move {
        if matched.load(Ordering::Relaxed) {
            None
        } else {
            Some(Err(Error::NoObjectFound(url)))
        }
    })
    .filter_map(futures::future::ready);
    Box::pin(body.chain(tail))
}
