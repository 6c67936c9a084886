// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! In-process, in-memory object store used by planner/engine/sync tests so
//! they don't need real credentials or network access. Not wired into the
//! CLI; test-only.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use time::OffsetDateTime;

use crate::object::{EntryType, Metadata, Object, StorageClass};
use crate::url::Url;

use super::{DeleteResult, DeleteResultStream, Error, ListOptions, ObjectStream, Result, Storage};

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    storage_class: StorageClass,
    mtime: OffsetDateTime,
    retry_id: Option<String>,
}

/// Keyed on `(bucket, key)`; a bare `HashMap` would do, but `BTreeMap` gives
/// deterministic iteration order which makes listing tests easier to write.
#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<BTreeMap<(String, String), Entry>>,
    buckets: Mutex<Vec<String>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object directly, bypassing `put`, for test setup.
    pub fn seed(&self, url: &str, content: &[u8]) {
        let url = Url::parse(url).expect("valid test URL");
        self.objects.lock().expect("poisoned").insert(
            (url.bucket().to_owned(), url.path().to_owned()),
            Entry {
                bytes: content.to_vec(),
                storage_class: StorageClass::Standard,
                mtime: OffsetDateTime::UNIX_EPOCH,
                retry_id: None,
            },
        );
        let mut buckets = self.buckets.lock().expect("poisoned");
        if !buckets.contains(&url.bucket().to_owned()) {
            buckets.push(url.bucket().to_owned());
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        let url = Url::parse(url).expect("valid test URL");
        self.objects
            .lock()
            .expect("poisoned")
            .contains_key(&(url.bucket().to_owned(), url.path().to_owned()))
    }

    pub fn get_bytes(&self, url: &str) -> Option<Vec<u8>> {
        let url = Url::parse(url).expect("valid test URL");
        self.objects
            .lock()
            .expect("poisoned")
            .get(&(url.bucket().to_owned(), url.path().to_owned()))
            .map(|e| e.bytes.clone())
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn stat(&self, url: &Url) -> Result<Object> {
        let objects = self.objects.lock().expect("poisoned");
        let key = (url.bucket().to_owned(), url.path().to_owned());
        match objects.get(&key) {
            Some(entry) => Ok(Object {
                url: url.clone(),
                size: entry.bytes.len() as u64,
                mtime: Some(entry.mtime),
                etag: None,
                storage_class: entry.storage_class,
                entry_type: EntryType::File,
                relative_path: None,
                error: None,
                retry_id: entry.retry_id.clone(),
            }),
            None => Err(Error::NotFound(url.clone())),
        }
    }

    fn list(&self, url: &Url, options: ListOptions) -> ObjectStream {
        let bucket = url.bucket().to_owned();
        let objects = self.objects.lock().expect("poisoned");
        let matches: Vec<Result<Object>> = objects
            .iter()
            .filter(|((b, _), _)| *b == bucket)
            .filter_map(|((_, key), entry)| {
                if !options.force_glacier_transfer && entry.storage_class.is_glacier_tier() {
                    return None;
                }
                let relative = url.match_key(key)?;
                let object_url = Url::parse(&format!("s3://{bucket}/{key}")).ok()?;
                Some(Ok(Object {
                    url: object_url,
                    size: entry.bytes.len() as u64,
                    mtime: Some(entry.mtime),
                    etag: None,
                    storage_class: entry.storage_class,
                    entry_type: EntryType::File,
                    relative_path: Some(relative),
                    error: None,
                    retry_id: entry.retry_id.clone(),
                }))
            })
            .collect();
        let listed: ObjectStream = Box::pin(stream::iter(matches));
        crate::storage::emit_no_object_found_if_empty(listed, url.clone())
    }

    async fn copy(&self, src: &Url, dst: &Url, metadata: &Metadata) -> Result<()> {
        let mut objects = self.objects.lock().expect("poisoned");
        let src_key = (src.bucket().to_owned(), src.path().to_owned());
        let entry = objects.get(&src_key).cloned().ok_or_else(|| Error::NotFound(src.clone()))?;
        let dst_key = (dst.bucket().to_owned(), dst.path().to_owned());
        objects.insert(
            dst_key,
            Entry {
                storage_class: metadata.storage_class.unwrap_or(entry.storage_class),
                ..entry
            },
        );
        Ok(())
    }

    async fn get(&self, src: &Url, dst_path: &std::path::Path, _concurrency: usize, _part_size: u64) -> Result<u64> {
        let bytes = self
            .stat(src)
            .await
            .and_then(|_| {
                let objects = self.objects.lock().expect("poisoned");
                objects
                    .get(&(src.bucket().to_owned(), src.path().to_owned()))
                    .map(|e| e.bytes.clone())
                    .ok_or_else(|| Error::NotFound(src.clone()))
            })?;
        if let Some(parent) = dst_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Io { path: parent.to_string_lossy().into_owned(), source: e })?;
        }
        std::fs::write(dst_path, &bytes).map_err(|e| Error::Io { path: dst_path.to_string_lossy().into_owned(), source: e })?;
        Ok(bytes.len() as u64)
    }

    async fn put(
        &self,
        src_path: &std::path::Path,
        dst: &Url,
        metadata: &Metadata,
        _concurrency: usize,
        _part_size: u64,
    ) -> Result<()> {
        let bytes = std::fs::read(src_path).map_err(|e| Error::Io { path: src_path.to_string_lossy().into_owned(), source: e })?;
        self.objects.lock().expect("poisoned").insert(
            (dst.bucket().to_owned(), dst.path().to_owned()),
            Entry {
                bytes,
                storage_class: metadata.storage_class.unwrap_or_default(),
                mtime: OffsetDateTime::UNIX_EPOCH,
                retry_id: metadata.retry_id().map(str::to_owned),
            },
        );
        Ok(())
    }

    async fn delete(&self, url: &Url) -> Result<()> {
        let mut objects = self.objects.lock().expect("poisoned");
        let key = (url.bucket().to_owned(), url.path().to_owned());
        if objects.remove(&key).is_none() {
            return Err(Error::NotFound(url.clone()));
        }
        Ok(())
    }

    fn multi_delete(&self, urls: ObjectStream) -> DeleteResultStream {
        Box::pin(urls.then(move |item| async move {
            match item {
                Ok(object) => DeleteResult { url: object.url, error: None },
                Err(e) => DeleteResult {
                    url: Url::parse("s3://unknown/unknown").expect("static URL always parses"),
                    error: Some(e.to_string()),
                },
            }
        }))
    }

    async fn list_buckets(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .buckets
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|b| b.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn make_bucket(&self, name: &str) -> Result<()> {
        self.buckets.lock().expect("poisoned").push(name.to_owned());
        Ok(())
    }

    async fn remove_bucket(&self, name: &str) -> Result<()> {
        self.buckets.lock().expect("poisoned").retain(|b| b != name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_then_stat_roundtrips() {
        let store = FakeStorage::new();
        store.seed("s3://bucket/dir/file.txt", b"hello");
        let url = Url::parse("s3://bucket/dir/file.txt").unwrap();
        let object = store.stat(&url).await.unwrap();
        assert_eq!(object.size, 5);
    }

    #[tokio::test]
    async fn copy_preserves_bytes_and_applies_storage_class_override() {
        let store = FakeStorage::new();
        store.seed("s3://bucket/a.txt", b"payload");
        let src = Url::parse("s3://bucket/a.txt").unwrap();
        let dst = Url::parse("s3://bucket/b.txt").unwrap();
        let metadata = Metadata { storage_class: Some(StorageClass::Glacier), ..Default::default() };
        store.copy(&src, &dst, &metadata).await.unwrap();
        assert_eq!(store.get_bytes("s3://bucket/b.txt").unwrap(), b"payload");
        let stat = store.stat(&dst).await.unwrap();
        assert_eq!(stat.storage_class, StorageClass::Glacier);
    }

    #[tokio::test]
    async fn delete_missing_object_errors() {
        let store = FakeStorage::new();
        let url = Url::parse("s3://bucket/missing.txt").unwrap();
        let err = store.delete(&url).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_applies_directory_boundary_matching() {
        let store = FakeStorage::new();
        store.seed("s3://bucket/images/cat.png", b"1");
        store.seed("s3://bucket/images2/dog.png", b"2");
        let url = Url::parse("s3://bucket/images").unwrap();
        let items: Vec<_> = store
            .list(&url, ListOptions { recursive: true, ..Default::default() })
            .collect()
            .await;
        assert_eq!(items.len(), 1);
    }
}
