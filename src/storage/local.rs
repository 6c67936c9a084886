// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Local filesystem backend.
//!
//! Plain `std::fs` for reads/stat/delete, and atomic writes via a `tempfile`
//! in the destination directory followed by `persist`. Directory walks use
//! `walkdir`, with symlink-following off by default and a `--raw`
//! single-stat mode alongside the walk.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use time::OffsetDateTime;
use tracing::trace;

use crate::object::{EntryType, Metadata, Object, StorageClass};
use crate::url::Url;

use super::{DeleteResult, DeleteResultStream, Error, ListOptions, ObjectStream, Result, Storage};

pub struct LocalStorage {
    dry_run: bool,
}

impl LocalStorage {
    pub fn new() -> Self {
        LocalStorage { dry_run: false }
    }

    /// Bypass `copy`/`delete`/`multi_delete`'s filesystem mutations, per
    /// `--dry-run` (§4.C applies the same bypass to the S3 backend).
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn io_err(path: &Path, source: io::Error) -> Error {
        if source.kind() == io::ErrorKind::NotFound {
            Error::NotFound(Url::parse(&path.to_string_lossy()).unwrap_or_else(|_| {
                Url::parse(".").expect(". is always a valid local URL")
            }))
        } else {
            Error::Io {
                path: path.to_string_lossy().into_owned(),
                source,
            }
        }
    }

    fn stat_path(path: &Path) -> Result<Object> {
        let meta = std::fs::metadata(path).map_err(|e| Self::io_err(path, e))?;
        let url = Url::parse(&path.to_string_lossy()).expect("filesystem path is a valid local URL");
        let mtime = meta.modified().ok().map(OffsetDateTime::from);
        Ok(Object {
            url,
            size: meta.len(),
            mtime,
            etag: None,
            storage_class: StorageClass::Standard,
            entry_type: if meta.is_dir() { EntryType::Dir } else { EntryType::File },
            relative_path: None,
            error: None,
            retry_id: None,
        })
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn stat(&self, url: &Url) -> Result<Object> {
        Self::stat_path(url.as_local_path())
    }

    fn list(&self, url: &Url, options: ListOptions) -> ObjectStream {
        let root = url.as_local_path().to_path_buf();
        let base = root.clone();
        // Selection between the three sub-behaviours named in §4.B:
        // directory walk, glob expansion, or a single stat.
        let items: Vec<Result<Object>> = if url.has_glob() {
            list_glob(url, &root)
        } else {
            match std::fs::metadata(&root) {
                Ok(m) if m.is_dir() => list_walk(&root, &base, options.recursive),
                Ok(_) => vec![Self::stat_path(&root)],
                Err(e) => vec![Err(Self::io_err(&root, e))],
            }
        };
        Box::pin(stream::iter(items))
    }

    async fn copy(&self, src: &Url, dst: &Url, _metadata: &Metadata) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let src_path = src.as_local_path();
        let dst_path = dst.as_local_path();
        let dir = dst_path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(|e| Self::io_err(dir, e))?;

        // Write through a tempfile in the destination directory and persist,
        // so a reader never observes a partially-written object.
        let mut content = std::fs::File::open(src_path).map_err(|e| Self::io_err(src_path, e))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".s3fleet-tmp-")
            .tempfile_in(dir)
            .map_err(|e| Self::io_err(dir, e))?;
        io::copy(&mut content, temp.as_file_mut()).map_err(|e| Self::io_err(src_path, e))?;
        temp.persist(dst_path).map_err(|persist_err| Error::Io {
            path: dst_path.to_string_lossy().into_owned(),
            source: persist_err.error,
        })?;
        trace!(?src_path, ?dst_path, "local copy complete");
        Ok(())
    }

    async fn delete(&self, url: &Url) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let path = url.as_local_path();
        let meta = std::fs::metadata(path).map_err(|e| Self::io_err(path, e))?;
        if meta.is_dir() {
            std::fs::remove_dir(path).map_err(|e| Self::io_err(path, e))
        } else {
            std::fs::remove_file(path).map_err(|e| Self::io_err(path, e))
        }
    }

    fn multi_delete(&self, urls: ObjectStream) -> DeleteResultStream {
        if self.dry_run {
            let synthesized = urls.map(|item| match item {
                Ok(object) => DeleteResult { url: object.url, error: None },
                Err(e) => DeleteResult { url: Url::parse(".").expect(". is always valid"), error: Some(e.to_string()) },
            });
            return Box::pin(synthesized);
        }
        // Sequential, one result per URL, as specified for the filesystem
        // backend (no batched delete API to exploit locally).
        let dry_run = self.dry_run;
        let results = urls.then(move |item| async move {
            match item {
                Ok(object) => match (LocalStorage { dry_run }).delete(&object.url).await {
                    Ok(()) => DeleteResult { url: object.url, error: None },
                    Err(e) => DeleteResult { url: object.url, error: Some(e.to_string()) },
                },
                Err(e) => DeleteResult {
                    url: Url::parse(".").expect(". is always valid"),
                    error: Some(e.to_string()),
                },
            }
        });
        Box::pin(results)
    }
}

fn list_walk(root: &Path, base: &Path, recursive: bool) -> Vec<Result<Object>> {
    let mut walker = walkdir::WalkDir::new(root).follow_links(false).min_depth(1);
    if !recursive {
        walker = walker.max_depth(1);
    }
    walker
        .into_iter()
        .map(|entry| match entry {
            Ok(entry) => {
                let path = entry.path();
                match entry.metadata() {
                    Ok(meta) => {
                        let relative = crate::url::relative_local_path(base, path);
                        let url = Url::parse(&path.to_string_lossy())
                            .expect("walked path is a valid local URL");
                        Ok(Object {
                            url,
                            size: meta.len(),
                            mtime: meta.modified().ok().map(OffsetDateTime::from),
                            etag: None,
                            storage_class: StorageClass::Standard,
                            entry_type: if meta.is_dir() { EntryType::Dir } else { EntryType::File },
                            relative_path: Some(relative.to_string_lossy().into_owned()),
                            error: None,
                            retry_id: None,
                        })
                    }
                    Err(e) => Err(Error::Io {
                        path: path.to_string_lossy().into_owned(),
                        source: e.into(),
                    }),
                }
            }
            Err(e) => {
                let path = e.path().unwrap_or(root).to_path_buf();
                Err(Error::Io {
                    path: path.to_string_lossy().into_owned(),
                    source: io::Error::new(io::ErrorKind::Other, e.to_string()),
                })
            }
        })
        .collect()
}

fn list_glob(url: &Url, prefix_path: &Path) -> Vec<Result<Object>> {
    // `prefix_path` is the literal prefix portion of a glob URL (the part
    // before the first wildcard); walk its parent directory recursively and
    // keep only the entries the URL's compiled matcher accepts, the same way
    // the S3 and in-memory backends apply `match_key` over their listings.
    let parent = url_parent_dir(prefix_path);
    list_walk(&parent, &parent, true)
        .into_iter()
        .filter_map(|result| match result {
            Ok(mut object) => {
                let key = object.url.as_local_path().to_string_lossy().into_owned();
                let relative = url.match_key(&key)?;
                object.relative_path = Some(relative);
                Some(Ok(object))
            }
            Err(e) => Some(Err(e)),
        })
        .collect()
}

/// The directory to walk when expanding a glob: the prefix path itself if it
/// names an existing directory (e.g. `dir/` in `dir/*.txt`), otherwise its
/// parent (e.g. `dir` in `dir/a*.txt`).
fn url_parent_dir(prefix_path: &Path) -> PathBuf {
    if prefix_path.as_os_str().is_empty() {
        return PathBuf::from(".");
    }
    match std::fs::metadata(prefix_path) {
        Ok(m) if m.is_dir() => prefix_path.to_path_buf(),
        _ => prefix_path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf(),
    }
}

pub type LocalObjectStream = Pin<Box<dyn Stream<Item = Result<Object>> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn stat_missing_file_is_not_found() {
        let storage = LocalStorage::new();
        let url = Url::parse("/no/such/path/should/exist").unwrap();
        let err = storage.stat(&url).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn stat_existing_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("a.txt").write_str("hello").unwrap();
        let storage = LocalStorage::new();
        let url = Url::parse(&temp.child("a.txt").path().to_string_lossy()).unwrap();
        let object = storage.stat(&url).await.unwrap();
        assert_eq!(object.size, 5);
        temp.close().unwrap();
    }

    #[tokio::test]
    async fn copy_creates_destination_ancestors() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("src.txt").write_str("payload").unwrap();
        let storage = LocalStorage::new();
        let src = Url::parse(&temp.child("src.txt").path().to_string_lossy()).unwrap();
        let dst = Url::parse(&temp.child("nested/dir/dst.txt").path().to_string_lossy()).unwrap();
        storage.copy(&src, &dst, &Metadata::default()).await.unwrap();
        temp.child("nested/dir/dst.txt").assert("payload");
        temp.close().unwrap();
    }

    #[tokio::test]
    async fn recursive_list_emits_nested_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("a.txt").write_str("x").unwrap();
        temp.child("sub").create_dir_all().unwrap();
        temp.child("sub/b.txt").write_str("y").unwrap();

        let storage = LocalStorage::new();
        let url = Url::parse(&temp.path().to_string_lossy()).unwrap();
        let items: Vec<_> = storage
            .list(&url, ListOptions { recursive: true, ..Default::default() })
            .collect()
            .await;
        let names: Vec<_> = items
            .into_iter()
            .map(|r| r.unwrap().relative_path.unwrap())
            .collect();
        assert!(names.iter().any(|n| n == "a.txt"));
        assert!(names.iter().any(|n| n.ends_with("b.txt")));
        temp.close().unwrap();
    }
}
