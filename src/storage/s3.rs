// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! S3-compatible backend.
//!
//! Discovers a bucket's region with `GetBucketLocation`, then rebuilds the
//! client bound to that region, and classifies every SDK error through a
//! small error-code table. Every method here is genuinely `async`: the
//! whole engine runs on Tokio, so there's no need to bridge sync code in
//! and out of a runtime per call.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use aws_config::AppName;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier, StorageClass as SdkStorageClass};
use aws_types::region::Region;
use aws_types::SdkConfig;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, trace_span};

use crate::object::{EntryType, Metadata, MetadataDirective, Object, StorageClass};
use crate::config::{SelectFormat, SelectOptions, SessionOptions};
use crate::retry::{self, Backoff, RetryableError};
use crate::url::Url;

use super::{DeleteResult, DeleteResultStream, Error, ListOptions, ObjectStream, Result, Storage};

/// Maximum keys accepted per `DeleteObjects` call on S3 and S3-compatible
/// endpoints. GCS doesn't implement batched `DeleteObjects` at all, so its
/// chunk size is 1 and each chunk falls back to a per-key `DeleteObject`
/// call; see [`delete_chunk_size`].
const MAX_DELETE_BATCH: usize = 1000;

/// Number of delete chunks run concurrently.
const DELETE_CONCURRENCY: usize = 10;

fn delete_chunk_size(endpoint: Option<&str>) -> usize {
    if is_gcs_endpoint(endpoint) {
        1
    } else {
        MAX_DELETE_BATCH
    }
}

/// Part size floor the SDK accepts for non-final multipart parts.
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

struct Session {
    client: aws_sdk_s3::Client,
    region: String,
}

fn session_cache() -> &'static Mutex<HashMap<(SessionOptions, String), Arc<Session>>> {
    static CACHE: OnceLock<Mutex<HashMap<(SessionOptions, String), Arc<Session>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

async fn load_aws_config(options: &SessionOptions, region: &str) -> SdkConfig {
    let mut loader = aws_config::from_env()
        .app_name(AppName::new(format!("s3fleet-{}", crate::version())).expect("valid app name"))
        .region(Region::new(region.to_owned()));
    if let Some(profile) = &options.profile {
        loader = loader.profile_name(profile);
    }
    if let Some(endpoint) = &options.endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    loader.load().await
}

/// Resolve (and cache) the session to use for `bucket`, discovering its
/// region on first use.
async fn session_for(options: &SessionOptions, bucket: &str) -> Result<Arc<Session>> {
    let key = (options.clone(), bucket.to_owned());
    if let Some(existing) = session_cache().lock().expect("session cache poisoned").get(&key) {
        return Ok(existing.clone());
    }

    let discovery_region = options.region.clone().unwrap_or_else(|| "us-east-1".to_owned());
    let discovery_config = load_aws_config(options, &discovery_region).await;
    let discovery_client = aws_sdk_s3::Client::new(&discovery_config);

    let region = if let Some(region) = &options.region {
        region.clone()
    } else {
        let response = discovery_client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| s3_error(bucket, e))?;
        debug!(?response, "discovered bucket region");
        response
            .location_constraint
            .map(|c| c.as_str().to_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "us-east-1".to_owned())
    };

    let config = load_aws_config(options, &region).await;
    let session = Arc::new(Session {
        client: aws_sdk_s3::Client::new(&config),
        region,
    });
    session_cache()
        .lock()
        .expect("session cache poisoned")
        .insert(key, session.clone());
    Ok(session)
}

pub struct S3Storage {
    options: SessionOptions,
    default_storage_class: StorageClass,
    use_list_objects_v1: bool,
    dry_run: bool,
}

impl S3Storage {
    pub fn new(options: SessionOptions) -> Self {
        S3Storage {
            options,
            default_storage_class: StorageClass::Standard,
            use_list_objects_v1: false,
            dry_run: false,
        }
    }

    pub fn with_default_storage_class(mut self, class: StorageClass) -> Self {
        self.default_storage_class = class;
        self
    }

    /// Force `ListObjects` (v1) for every listing this backend performs,
    /// per `--use-list-objects-v1`.
    pub fn with_use_list_objects_v1(mut self, use_v1: bool) -> Self {
        self.use_list_objects_v1 = use_v1;
        self
    }

    /// Bypass every mutating call (`copy`/`put`/`delete`/`multi_delete`/
    /// bucket operations) while still performing region discovery, listing,
    /// and stat, per §4.C's "dry-run bypasses all mutations". `get` is the
    /// one read path affected: a dry-run `get` skips the network fetch and
    /// returns `(0, Ok)` instead.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn client_for(&self, bucket: &str) -> Result<aws_sdk_s3::Client> {
        Ok(session_for(&self.options, bucket).await?.client.clone())
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn stat(&self, url: &Url) -> Result<Object> {
        let _span = trace_span!("S3Storage::stat", key = url.path()).entered();
        let client = self.client_for(url.bucket()).await?;
        let mut request = client.head_object().bucket(url.bucket()).key(url.path());
        if let Some(version_id) = url.version_id() {
            request = request.version_id(version_id);
        }
        let response = retry::with_retry(self.options.retry_count, Backoff::default(), || {
            let request = request.clone();
            async move { request.send().await.map_err(|e| classify(e)) }
        })
        .await
        .map_err(|e| map_retryable(e, url))?;

        Ok(Object {
            url: url.clone(),
            size: response.content_length.unwrap_or(0).max(0) as u64,
            mtime: response.last_modified.and_then(|d| {
                time::OffsetDateTime::from_unix_timestamp(d.secs()).ok()
            }),
            etag: response.e_tag.map(|e| e.trim_matches('"').to_owned()),
            storage_class: response
                .storage_class
                .map(|c| StorageClass::from(c.as_str()))
                .unwrap_or_default(),
            entry_type: EntryType::File,
            relative_path: None,
            error: None,
            retry_id: response
                .metadata
                .as_ref()
                .and_then(|m| m.get(crate::object::RETRY_ID_METADATA_KEY))
                .cloned(),
        })
    }

    fn list(&self, url: &Url, options: ListOptions) -> ObjectStream {
        let bucket = url.bucket().to_owned();
        let prefix = url.list_prefix().to_owned();
        let delimiter = url.delimiter().map(str::to_owned);
        let session_options = self.options.clone();
        let matcher_url = url.clone();
        let force_glacier = options.force_glacier_transfer;
        let use_v1 = options.use_list_objects_v1 || self.use_list_objects_v1 || is_gcs_endpoint(self.options.endpoint.as_deref());
        let iteration_start = time::OffsetDateTime::now_utc();

        let stream = stream::unfold(
            ListState::Start { session_options, bucket, prefix, delimiter },
            move |state| {
                let matcher_url = matcher_url.clone();
                async move {
                    state
                        .advance(&matcher_url, force_glacier, options.all_versions, use_v1, iteration_start)
                        .await
                }
            },
        );
        let listed: ObjectStream = Box::pin(stream.flat_map(stream::iter));
        crate::storage::emit_no_object_found_if_empty(listed, url.clone())
    }

    async fn copy(&self, src: &Url, dst: &Url, metadata: &Metadata) -> Result<()> {
        let _span = trace_span!("S3Storage::copy", src = src.path(), dst = dst.path()).entered();
        if self.dry_run {
            return Ok(());
        }
        let client = self.client_for(dst.bucket()).await?;
        let mut copy_source = format!("{}/{}", src.bucket(), urlencode_key(src.path()));
        if let Some(version_id) = src.version_id() {
            copy_source.push_str(&format!("?versionId={version_id}"));
        }
        let mut request = client
            .copy_object()
            .bucket(dst.bucket())
            .key(dst.path())
            .copy_source(copy_source)
            .storage_class(to_sdk_storage_class(
                metadata.storage_class.unwrap_or(self.default_storage_class),
            ));
        if metadata.metadata_directive == MetadataDirective::Replace {
            request = request.metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace);
            for (k, v) in &metadata.user_defined {
                request = request.metadata(k, v);
            }
            if let Some(ct) = &metadata.content_type {
                request = request.content_type(ct);
            }
        }
        if metadata.request_payer {
            request = request.request_payer(aws_sdk_s3::types::RequestPayer::Requester);
        }
        retry::with_retry(self.options.retry_count, Backoff::default(), || {
            let request = request.clone();
            async move { request.send().await.map_err(|e| classify(e)) }
        })
        .await
        .map_err(|e| map_retryable(e, dst))?;
        trace!("copy complete");
        Ok(())
    }

    async fn get(&self, src: &Url, dst_path: &Path, _concurrency: usize, _part_size: u64) -> Result<u64> {
        let _span = trace_span!("S3Storage::get", key = src.path()).entered();
        if self.dry_run {
            return Ok(0);
        }
        let client = self.client_for(src.bucket()).await?;
        let mut request = client.get_object().bucket(src.bucket()).key(src.path());
        if let Some(version_id) = src.version_id() {
            request = request.version_id(version_id);
        }
        let response = retry::with_retry(self.options.retry_count, Backoff::default(), || {
            let request = request.clone();
            async move { request.send().await.map_err(|e| classify(e)) }
        })
        .await
        .map_err(|e| map_retryable(e, src))?;

        let dir = dst_path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await.map_err(|e| Error::Io {
            path: dir.to_string_lossy().into_owned(),
            source: e,
        })?;
        let mut temp = tempfile::Builder::new()
            .prefix(".s3fleet-tmp-")
            .tempfile_in(dir)
            .map_err(|e| Error::Io { path: dir.to_string_lossy().into_owned(), source: e })?;
        let body = response.body.collect().await.map_err(|e| Error::Other(e.to_string()))?.into_bytes();
        let len = body.len() as u64;
        std::io::Write::write_all(temp.as_file_mut(), &body).map_err(|e| Error::Io {
            path: dst_path.to_string_lossy().into_owned(),
            source: e,
        })?;
        temp.persist(dst_path).map_err(|e| Error::Io {
            path: dst_path.to_string_lossy().into_owned(),
            source: e.error,
        })?;
        Ok(len)
    }

    async fn put(
        &self,
        src_path: &Path,
        dst: &Url,
        metadata: &Metadata,
        concurrency: usize,
        part_size: u64,
    ) -> Result<()> {
        let _span = trace_span!("S3Storage::put", key = dst.path()).entered();
        if self.dry_run {
            return Ok(());
        }
        let file_len = tokio::fs::metadata(src_path)
            .await
            .map_err(|e| Error::Io { path: src_path.to_string_lossy().into_owned(), source: e })?
            .len();
        let client = self.client_for(dst.bucket()).await?;

        if file_len <= part_size.max(MIN_PART_SIZE) {
            return put_single(&client, src_path, dst, metadata, self.default_storage_class, self.options.retry_count).await;
        }
        put_multipart_with_retry(
            &client,
            src_path,
            dst,
            metadata,
            file_len,
            part_size.max(MIN_PART_SIZE),
            concurrency,
            self.default_storage_class,
            self.options.retry_count,
        )
        .await
    }

    async fn delete(&self, url: &Url) -> Result<()> {
        let _span = trace_span!("S3Storage::delete", key = url.path()).entered();
        if self.dry_run {
            return Ok(());
        }
        let client = self.client_for(url.bucket()).await?;
        let mut request = client.delete_object().bucket(url.bucket()).key(url.path());
        if let Some(version_id) = url.version_id() {
            request = request.version_id(version_id);
        }
        retry::with_retry(self.options.retry_count, Backoff::default(), || {
            let request = request.clone();
            async move { request.send().await.map_err(|e| classify(e)) }
        })
        .await
        .map_err(|e| map_retryable(e, url))?;
        Ok(())
    }

    fn multi_delete(&self, urls: ObjectStream) -> DeleteResultStream {
        if self.dry_run {
            // Bypasses the mutation but still synthesizes one plausible
            // success result per input URL, per §4.C.
            let synthesized = urls.map(|item| match item {
                Ok(object) => DeleteResult { url: object.url, error: None },
                Err(e) => DeleteResult { url: Url::parse(".").expect(". is always valid"), error: Some(e.to_string()) },
            });
            return Box::pin(synthesized);
        }
        let options = self.options.clone();
        let chunk_size = delete_chunk_size(options.endpoint.as_deref());
        let batches = urls
            .filter_map(|item| async move { item.ok() })
            .ready_chunks(chunk_size);

        // Up to 10 chunks run concurrently, per §4.C.
        let results = batches
            .map(move |batch| {
                let options = options.clone();
                async move { delete_batch(&options, batch).await }
            })
            .buffer_unordered(DELETE_CONCURRENCY);
        Box::pin(results.flat_map(stream::iter))
    }

    async fn list_buckets(&self, prefix: &str) -> Result<Vec<String>> {
        let session = session_for(&self.options, "").await?;
        let response = session
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| s3_error("", e))?;
        Ok(response
            .buckets
            .unwrap_or_default()
            .into_iter()
            .filter_map(|b| b.name)
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn make_bucket(&self, name: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let session = session_for(&self.options, name).await?;
        session
            .client
            .create_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(|e| s3_error(name, e))?;
        Ok(())
    }

    async fn remove_bucket(&self, name: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let client = self.client_for(name).await?;
        client
            .delete_bucket()
            .bucket(name)
            .send()
            .await
            .map_err(|e| s3_error(name, e))?;
        Ok(())
    }

    async fn get_bucket_versioning(&self, name: &str) -> Result<bool> {
        let client = self.client_for(name).await?;
        let response = client.get_bucket_versioning().bucket(name).send().await.map_err(|e| s3_error(name, e))?;
        Ok(matches!(response.status(), Some(aws_sdk_s3::types::BucketVersioningStatus::Enabled)))
    }

    async fn set_bucket_versioning(&self, name: &str, enabled: bool) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let client = self.client_for(name).await?;
        let status = if enabled {
            aws_sdk_s3::types::BucketVersioningStatus::Enabled
        } else {
            aws_sdk_s3::types::BucketVersioningStatus::Suspended
        };
        let configuration = aws_sdk_s3::types::VersioningConfiguration::builder().status(status).build();
        client
            .put_bucket_versioning()
            .bucket(name)
            .versioning_configuration(configuration)
            .send()
            .await
            .map_err(|e| s3_error(name, e))?;
        Ok(())
    }

    async fn select(&self, url: &Url, options: &SelectOptions, sink: mpsc::Sender<bytes::Bytes>) -> Result<()> {
        let _span = trace_span!("S3Storage::select", key = url.path()).entered();
        let client = self.client_for(url.bucket()).await?;
        let request = client
            .select_object_content()
            .bucket(url.bucket())
            .key(url.path())
            .expression_type(aws_sdk_s3::types::ExpressionType::Sql)
            .expression(&options.query)
            .input_serialization(input_serialization(options))
            .output_serialization(output_serialization(options));
        let mut output = request.send().await.map_err(|e| s3_error(url.path(), e))?;
        loop {
            match output.payload.recv().await {
                Ok(Some(aws_sdk_s3::types::SelectObjectContentEventStream::Records(records))) => {
                    if let Some(payload) = records.payload {
                        let bytes = bytes::Bytes::from(payload.into_inner());
                        if sink.send(bytes).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Some(aws_sdk_s3::types::SelectObjectContentEventStream::End(_))) => break,
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => return Err(Error::Other(e.to_string())),
            }
        }
        Ok(())
    }
}

fn input_serialization(options: &SelectOptions) -> aws_sdk_s3::types::InputSerialization {
    let compression = match options.compression.as_deref() {
        Some("gzip") => aws_sdk_s3::types::CompressionType::Gzip,
        Some("bzip2") => aws_sdk_s3::types::CompressionType::Bzip2,
        _ => aws_sdk_s3::types::CompressionType::None,
    };
    let mut builder = aws_sdk_s3::types::InputSerialization::builder().compression_type(compression);
    builder = match options.input_format {
        SelectFormat::Json => builder.json(aws_sdk_s3::types::JsonInput::builder().build()),
        SelectFormat::Csv => builder.csv(aws_sdk_s3::types::CsvInput::builder().build()),
        SelectFormat::Parquet => builder.parquet(aws_sdk_s3::types::ParquetInput::builder().build()),
    };
    builder.build()
}

fn output_serialization(options: &SelectOptions) -> aws_sdk_s3::types::OutputSerialization {
    let mut builder = aws_sdk_s3::types::OutputSerialization::builder();
    builder = match options.output_format {
        SelectFormat::Json => builder.json(aws_sdk_s3::types::JsonOutput::builder().build()),
        SelectFormat::Csv | SelectFormat::Parquet => builder.csv(aws_sdk_s3::types::CsvOutput::builder().build()),
    };
    builder.build()
}

async fn put_single(
    client: &aws_sdk_s3::Client,
    src_path: &Path,
    dst: &Url,
    metadata: &Metadata,
    default_storage_class: StorageClass,
    retry_count: u32,
) -> Result<()> {
    let body = ByteStream::from_path(src_path)
        .await
        .map_err(|e| Error::Io { path: src_path.to_string_lossy().into_owned(), source: std::io::Error::new(std::io::ErrorKind::Other, e) })?;
    let mut request = client
        .put_object()
        .bucket(dst.bucket())
        .key(dst.path())
        .storage_class(to_sdk_storage_class(metadata.storage_class.unwrap_or(default_storage_class)))
        .body(body);
    request = apply_metadata(request, metadata);
    // ByteStream isn't Clone, so a whole-request retry would need to
    // re-open the source file; a single attempt plus the usual error
    // classification is enough here, and failures bubble up for the
    // engine's own task-level retry of the containing copy.
    let _ = retry_count;
    request.send().await.map_err(|e| map_retryable(classify(e), dst))?;
    Ok(())
}

fn apply_metadata(
    mut request: aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder,
    metadata: &Metadata,
) -> aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder {
    if let Some(ct) = &metadata.content_type {
        request = request.content_type(ct);
    }
    if let Some(ce) = &metadata.content_encoding {
        request = request.content_encoding(ce);
    }
    if let Some(cd) = &metadata.content_disposition {
        request = request.content_disposition(cd);
    }
    if let Some(cc) = &metadata.cache_control {
        request = request.cache_control(cc);
    }
    if let Some(acl) = &metadata.acl {
        request = request.acl(aws_sdk_s3::types::ObjectCannedAcl::from(acl.as_str()));
    }
    for (k, v) in &metadata.user_defined {
        request = request.metadata(k, v);
    }
    if metadata.request_payer {
        request = request.request_payer(aws_sdk_s3::types::RequestPayer::Requester);
    }
    request
}

/// Multipart upload with the no-such-upload retry state machine from §4.C:
///
/// ```text
/// START → UPLOADING
/// UPLOADING --success--> DONE
/// UPLOADING --NoSuchUpload, attempts<N--> STAT_CHECK
/// UPLOADING --NoSuchUpload, attempts=N--> FAIL(wrapped)
/// UPLOADING --other error--> FAIL(err)
/// STAT_CHECK --object exists, retryID matches--> DONE
/// STAT_CHECK --otherwise--> UPLOADING (attempts+=1)
/// ```
///
/// Some backends report `NoSuchUpload` on `CompleteMultipartUpload` even
/// when the complete actually landed (the upload ID is discarded once the
/// object is durable); a HEAD that finds our own retry ID on the object
/// disambiguates that case from a genuine failure, without ever risking a
/// double-write from blindly re-running the whole sequence.
async fn put_multipart_with_retry(
    client: &aws_sdk_s3::Client,
    src_path: &Path,
    dst: &Url,
    metadata: &Metadata,
    file_len: u64,
    part_size: u64,
    concurrency: usize,
    default_storage_class: StorageClass,
    max_retries: u32,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let retry_id = uuid_like_id();
        match put_multipart(
            client,
            src_path,
            dst,
            metadata,
            file_len,
            part_size,
            concurrency,
            default_storage_class,
            &retry_id,
        )
        .await
        {
            Ok(()) => return Ok(()),
            Err(e) if is_no_such_upload(&e) && attempt < max_retries => {
                debug!(attempt, "CompleteMultipartUpload reported NoSuchUpload; checking destination");
                match head_retry_id(client, dst).await {
                    Some(observed) if observed == retry_id => return Ok(()),
                    _ => {
                        attempt += 1;
                        continue;
                    }
                }
            }
            Err(e) if is_no_such_upload(&e) => {
                return Err(Error::Other(format!(
                    "upload failed after {} attempts: {e}",
                    attempt + 1
                )));
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_no_such_upload(error: &Error) -> bool {
    error.to_string().contains("NoSuchUpload")
}

/// HEAD `dst` and return its retry-ID user-metadata value, if any. Used only
/// by the STAT_CHECK state above; a failed HEAD (e.g. object genuinely
/// absent) is treated the same as "no match", driving another upload
/// attempt.
async fn head_retry_id(client: &aws_sdk_s3::Client, dst: &Url) -> Option<String> {
    let response = client.head_object().bucket(dst.bucket()).key(dst.path()).send().await.ok()?;
    response.metadata?.get(crate::object::RETRY_ID_METADATA_KEY).cloned()
}

async fn put_multipart(
    client: &aws_sdk_s3::Client,
    src_path: &Path,
    dst: &Url,
    metadata: &Metadata,
    file_len: u64,
    part_size: u64,
    concurrency: usize,
    default_storage_class: StorageClass,
    retry_id: &str,
) -> Result<()> {
    let tagged_metadata = metadata.clone().with_retry_id(retry_id);

    let mut create = client
        .create_multipart_upload()
        .bucket(dst.bucket())
        .key(dst.path())
        .storage_class(to_sdk_storage_class(metadata.storage_class.unwrap_or(default_storage_class)));
    for (k, v) in &tagged_metadata.user_defined {
        create = create.metadata(k, v);
    }
    let created = create.send().await.map_err(|e| s3_error(dst.path(), e))?;
    let upload_id = created.upload_id.ok_or_else(|| Error::Other("missing upload id".into()))?;

    let n_parts = file_len.div_ceil(part_size).max(1);
    let part_futures = (0..n_parts).map(|i| {
        let client = client.clone();
        let dst = dst.clone();
        let upload_id = upload_id.clone();
        let src_path = src_path.to_path_buf();
        async move {
            let offset = i * part_size;
            let len = part_size.min(file_len - offset);
            let body = ByteStream::read_from()
                .path(&src_path)
                .offset(offset)
                .length(aws_sdk_s3::primitives::Length::Exact(len))
                .build()
                .await
                .map_err(|e| Error::Io { path: src_path.to_string_lossy().into_owned(), source: std::io::Error::new(std::io::ErrorKind::Other, e) })?;
            let response = client
                .upload_part()
                .bucket(dst.bucket())
                .key(dst.path())
                .upload_id(&upload_id)
                .part_number((i + 1) as i32)
                .body(body)
                .send()
                .await
                .map_err(|e| s3_error(dst.path(), e))?;
            Ok::<_, Error>(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number((i + 1) as i32)
                    .set_e_tag(response.e_tag)
                    .build(),
            )
        }
    });

    let mut completed_parts = Vec::with_capacity(n_parts as usize);
    let mut buffered = stream::iter(part_futures).buffered(concurrency.max(1));
    while let Some(part) = buffered.next().await {
        match part {
            Ok(part) => completed_parts.push(part),
            Err(e) => {
                let _ = client
                    .abort_multipart_upload()
                    .bucket(dst.bucket())
                    .key(dst.path())
                    .upload_id(&upload_id)
                    .send()
                    .await;
                return Err(e);
            }
        }
    }
    completed_parts.sort_by_key(|p| p.part_number());

    let complete = client
        .complete_multipart_upload()
        .bucket(dst.bucket())
        .key(dst.path())
        .upload_id(&upload_id)
        .multipart_upload(
            aws_sdk_s3::types::CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build(),
        )
        .send()
        .await;

    match complete {
        Ok(_) => Ok(()),
        Err(e) => {
            // A NoSuchUpload here may mean the complete already succeeded on
            // a previous attempt and the upload ID was discarded; the retry
            // ID recorded on the object lets a caller tell which attempt
            // actually won.
            Err(map_retryable(classify(e), dst))
        }
    }
}

fn uuid_like_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

enum ListState {
    Start {
        session_options: SessionOptions,
        bucket: String,
        prefix: String,
        delimiter: Option<String>,
    },
    Continue {
        client: aws_sdk_s3::Client,
        bucket: String,
        prefix: String,
        delimiter: Option<String>,
        token: Option<String>,
    },
    Done,
}

impl ListState {
    async fn advance(
        self,
        url: &Url,
        force_glacier: bool,
        all_versions: bool,
        use_v1: bool,
        iteration_start: time::OffsetDateTime,
    ) -> Option<(Vec<Result<Object>>, ListState)> {
        let (client, bucket, prefix, delimiter, token) = match self {
            ListState::Done => return None,
            ListState::Start { session_options, bucket, prefix, delimiter } => {
                let session = match session_for(&session_options, &bucket).await {
                    Ok(s) => s,
                    Err(e) => return Some((vec![Err(e)], ListState::Done)),
                };
                (session.client.clone(), bucket, prefix, delimiter, None)
            }
            ListState::Continue { client, bucket, prefix, delimiter, token } => {
                (client, bucket, prefix, delimiter, token)
            }
        };

        let page = if all_versions {
            fetch_versions_page(&client, &bucket, &prefix, token.as_deref()).await
        } else if use_v1 {
            fetch_objects_page_v1(&client, &bucket, &prefix, delimiter.as_deref(), token.as_deref()).await
        } else {
            fetch_objects_page(&client, &bucket, &prefix, delimiter.as_deref(), token.as_deref()).await
        };

        let (items, next_token) = match page {
            Ok(v) => v,
            Err(e) => return Some((vec![Err(e)], ListState::Done)),
        };

        let filtered: Vec<Result<Object>> = items
            .into_iter()
            .filter_map(|object| {
                if !force_glacier && object.storage_class.is_glacier_tier() {
                    return None;
                }
                // Invariant 1: an object written after this listing began
                // must never be emitted, so a concurrent writer can't make
                // an in-progress `ls`/`cp`/`sync` scan non-deterministic.
                if !is_within_iteration(&object, iteration_start) {
                    return None;
                }
                let key = format!("s3://{}/{}", bucket, object.url.path());
                let relative = url.match_key(object.url.path())?;
                let mut object = object;
                object.relative_path = Some(relative);
                let _ = key;
                Some(Ok(object))
            })
            .collect();

        let next_state = match next_token {
            Some(token) => ListState::Continue { client, bucket, prefix, delimiter, token: Some(token) },
            None => ListState::Done,
        };
        Some((filtered, next_state))
    }
}

/// An object qualifies for a listing only if it has no mtime (directory
/// markers) or was last modified at or before the instant the listing began.
fn is_within_iteration(object: &Object, iteration_start: time::OffsetDateTime) -> bool {
    object.mtime.is_none_or(|mtime| mtime <= iteration_start)
}

async fn fetch_objects_page(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    prefix: &str,
    delimiter: Option<&str>,
    token: Option<&str>,
) -> Result<(Vec<Object>, Option<String>)> {
    let mut request = client.list_objects_v2().bucket(bucket).prefix(prefix);
    if let Some(delimiter) = delimiter {
        request = request.delimiter(delimiter);
    }
    if let Some(token) = token {
        request = request.continuation_token(token);
    }
    let response = request.send().await.map_err(|e| s3_error(prefix, e))?;
    let next_token = response.next_continuation_token.clone();
    let mut objects = Vec::new();
    for common_prefix in response.common_prefixes.unwrap_or_default() {
        if let Some(key) = common_prefix.prefix {
            let url = Url::parse(&format!("s3://{bucket}/{key}")).map_err(|e| Error::Other(e.to_string()))?;
            objects.push(Object {
                url,
                size: 0,
                mtime: None,
                etag: None,
                storage_class: StorageClass::Standard,
                entry_type: EntryType::Dir,
                relative_path: None,
                error: None,
                retry_id: None,
            });
        }
    }
    for object in response.contents.unwrap_or_default() {
        let key = object.key.clone().unwrap_or_default();
        let url = Url::parse(&format!("s3://{bucket}/{key}")).map_err(|e| Error::Other(e.to_string()))?;
        objects.push(Object {
            url,
            size: object.size.unwrap_or(0).max(0) as u64,
            mtime: object.last_modified.and_then(|d| time::OffsetDateTime::from_unix_timestamp(d.secs()).ok()),
            etag: object.e_tag.map(|e| e.trim_matches('"').to_owned()),
            storage_class: object
                .storage_class
                .map(|c| StorageClass::from(c.as_str()))
                .unwrap_or_default(),
            entry_type: EntryType::File,
            relative_path: None,
            error: None,
            retry_id: None,
        });
    }
    Ok((objects, next_token))
}

/// `ListObjects` (v1), used when `--use-list-objects-v1` is set or the
/// endpoint is GCS, which doesn't implement v2. Pagination uses `marker`
/// rather than a continuation token; when the response doesn't echo a
/// `next_marker` the last returned key stands in for it, per the classic
/// v1 contract.
async fn fetch_objects_page_v1(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    prefix: &str,
    delimiter: Option<&str>,
    marker: Option<&str>,
) -> Result<(Vec<Object>, Option<String>)> {
    let mut request = client.list_objects().bucket(bucket).prefix(prefix);
    if let Some(delimiter) = delimiter {
        request = request.delimiter(delimiter);
    }
    if let Some(marker) = marker {
        request = request.marker(marker);
    }
    let response = request.send().await.map_err(|e| s3_error(prefix, e))?;
    let mut objects = Vec::new();
    for common_prefix in response.common_prefixes.clone().unwrap_or_default() {
        if let Some(key) = common_prefix.prefix {
            let url = Url::parse(&format!("s3://{bucket}/{key}")).map_err(|e| Error::Other(e.to_string()))?;
            objects.push(Object {
                url,
                size: 0,
                mtime: None,
                etag: None,
                storage_class: StorageClass::Standard,
                entry_type: EntryType::Dir,
                relative_path: None,
                error: None,
                retry_id: None,
            });
        }
    }
    let mut last_key = None;
    for object in response.contents.clone().unwrap_or_default() {
        let key = object.key.clone().unwrap_or_default();
        last_key = Some(key.clone());
        let url = Url::parse(&format!("s3://{bucket}/{key}")).map_err(|e| Error::Other(e.to_string()))?;
        objects.push(Object {
            url,
            size: object.size.unwrap_or(0).max(0) as u64,
            mtime: object.last_modified.and_then(|d| time::OffsetDateTime::from_unix_timestamp(d.secs()).ok()),
            etag: object.e_tag.map(|e| e.trim_matches('"').to_owned()),
            storage_class: object
                .storage_class
                .map(|c| StorageClass::from(c.as_str()))
                .unwrap_or_default(),
            entry_type: EntryType::File,
            relative_path: None,
            error: None,
            retry_id: None,
        });
    }
    let next_token = if response.is_truncated.unwrap_or(false) {
        response.next_marker.clone().or(last_key)
    } else {
        None
    };
    Ok((objects, next_token))
}

/// GCS's S3-compatibility endpoint doesn't implement `ListObjectsV2`.
fn is_gcs_endpoint(endpoint: Option<&str>) -> bool {
    endpoint.is_some_and(|e| e.contains("storage.googleapis.com"))
}

async fn fetch_versions_page(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    prefix: &str,
    token: Option<&str>,
) -> Result<(Vec<Object>, Option<String>)> {
    let mut request = client.list_object_versions().bucket(bucket).prefix(prefix);
    if let Some(token) = token {
        request = request.key_marker(token);
    }
    let response = request.send().await.map_err(|e| s3_error(prefix, e))?;
    let next_token = response.next_key_marker.clone();
    let mut objects = Vec::new();
    for version in response.versions.unwrap_or_default() {
        let key = version.key.clone().unwrap_or_default();
        let mut url = Url::parse(&format!("s3://{bucket}/{key}")).map_err(|e| Error::Other(e.to_string()))?;
        if let Some(version_id) = version.version_id.clone() {
            url = Url::parse(&format!("s3://{bucket}/{key}?versionId={version_id}"))
                .map_err(|e| Error::Other(e.to_string()))?;
        }
        objects.push(Object {
            url,
            size: version.size.unwrap_or(0).max(0) as u64,
            mtime: version.last_modified.and_then(|d| time::OffsetDateTime::from_unix_timestamp(d.secs()).ok()),
            etag: version.e_tag.map(|e| e.trim_matches('"').to_owned()),
            storage_class: version
                .storage_class
                .map(|c| StorageClass::from(c.as_str()))
                .unwrap_or_default(),
            entry_type: EntryType::File,
            relative_path: None,
            error: None,
            retry_id: None,
        });
    }
    Ok((objects, next_token))
}

async fn delete_batch(options: &SessionOptions, batch: Vec<Object>) -> Vec<DeleteResult> {
    if batch.is_empty() {
        return Vec::new();
    }
    let bucket = batch[0].url.bucket().to_owned();
    let client = match session_for(options, &bucket).await {
        Ok(s) => s.client.clone(),
        Err(e) => {
            return batch
                .into_iter()
                .map(|o| DeleteResult { url: o.url, error: Some(e.to_string()) })
                .collect()
        }
    };
    if is_gcs_endpoint(options.endpoint.as_deref()) {
        return delete_one_by_one(&client, &bucket, batch).await;
    }
    let identifiers: Vec<ObjectIdentifier> = batch
        .iter()
        .filter_map(|o| ObjectIdentifier::builder().key(o.url.path()).build().ok())
        .collect();
    let request = client
        .delete_objects()
        .bucket(&bucket)
        .delete(Delete::builder().set_objects(Some(identifiers)).build().expect("delete request always buildable"));
    match request.send().await {
        Ok(response) => {
            let mut errors: HashMap<String, String> = response
                .errors
                .unwrap_or_default()
                .into_iter()
                .filter_map(|e| Some((e.key?, e.message.unwrap_or_default())))
                .collect();
            batch
                .into_iter()
                .map(|o| {
                    let error = errors.remove(o.url.path());
                    DeleteResult { url: o.url, error }
                })
                .collect()
        }
        Err(e) => {
            let message = s3_error(&bucket, e).to_string();
            batch
                .into_iter()
                .map(|o| DeleteResult { url: o.url, error: Some(message.clone()) })
                .collect()
        }
    }
}

/// GCS's S3-compatibility layer doesn't implement `DeleteObjects`, so each
/// key is deleted with its own `DeleteObject` call instead of one batched
/// request.
async fn delete_one_by_one(client: &aws_sdk_s3::Client, bucket: &str, batch: Vec<Object>) -> Vec<DeleteResult> {
    let mut results = Vec::with_capacity(batch.len());
    for object in batch {
        let error = client
            .delete_object()
            .bucket(bucket)
            .key(object.url.path())
            .send()
            .await
            .err()
            .map(|e| s3_error(bucket, e).to_string());
        results.push(DeleteResult { url: object.url, error });
    }
    results
}

fn to_sdk_storage_class(class: StorageClass) -> SdkStorageClass {
    SdkStorageClass::from(class.to_string().as_str())
}

fn urlencode_key(key: &str) -> String {
    // CopySource needs percent-encoding for reserved characters; keys in
    // this crate are always valid UTF-8 paths, so a minimal escape table
    // covering what S3 keys actually contain is enough.
    key.replace('%', "%25").replace(' ', "%20").replace('+', "%2B")
}

fn classify<E, R>(source: SdkError<E, R>) -> RetryableError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let (code, message) = match &source {
        SdkError::ServiceError(service_err) => {
            (service_err.err().code().map(str::to_owned), service_err.err().to_string())
        }
        _ => (None, source.to_string()),
    };
    let transient = retry::classify(code.as_deref(), &message);
    RetryableError { message, transient }
}

fn map_retryable(error: RetryableError, url: &Url) -> Error {
    if error.message.contains("NoSuchKey")
        || error.message.contains("NotFound")
        || error.message.contains("404")
    {
        Error::NotFound(url.clone())
    } else {
        Error::Retryable(error)
    }
}

fn s3_error<E, R>(key: &str, source: SdkError<E, R>) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    debug!(s3_error = ?source.to_string());
    let message = source.to_string();
    if message.contains("NoSuchKey") || message.contains("NoSuchBucket") || message.contains("NotFound") {
        Error::NotFound(Url::parse(key).unwrap_or_else(|_| Url::parse(".").expect(". is always valid")))
    } else {
        Error::Other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_options_are_hashable_cache_keys() {
        use std::collections::HashSet;
        let a = SessionOptions {
            endpoint: None,
            region: Some("us-east-1".into()),
            profile: None,
            credentials_file: None,
            no_sign_request: false,
            no_verify_ssl: false,
            retry_count: 10,
        };
        let b = a.clone();
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn urlencode_key_escapes_reserved_characters() {
        assert_eq!(urlencode_key("a b+c%d"), "a%20b%2Bc%25d");
    }

    #[test]
    fn to_sdk_storage_class_round_trips_through_display() {
        assert_eq!(to_sdk_storage_class(StorageClass::Glacier).as_str(), "GLACIER");
    }

    #[test]
    fn is_within_iteration_admits_objects_at_or_before_the_start() {
        let start = time::OffsetDateTime::now_utc();
        let earlier = Object {
            url: Url::parse("s3://b/k").unwrap(),
            size: 0,
            mtime: Some(start - time::Duration::SECOND),
            etag: None,
            storage_class: StorageClass::Standard,
            entry_type: EntryType::File,
            relative_path: None,
            error: None,
            retry_id: None,
        };
        let at_start = Object { mtime: Some(start), ..earlier.clone() };
        let later = Object { mtime: Some(start + time::Duration::SECOND), ..earlier.clone() };
        let no_mtime = Object { mtime: None, ..earlier.clone() };

        assert!(is_within_iteration(&earlier, start));
        assert!(is_within_iteration(&at_start, start));
        assert!(!is_within_iteration(&later, start));
        assert!(is_within_iteration(&no_mtime, start));
    }
}
