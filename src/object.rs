// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Listing and stat results, and the metadata bundle attached to copy/put
//! requests.

use std::collections::BTreeMap;
use std::fmt;

use time::OffsetDateTime;

use crate::url::Url;

/// Kind of directory entry a listing or stat returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Dir,
}

/// S3 storage class, narrowed to the values this crate reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageClass {
    #[default]
    Standard,
    IntelligentTiering,
    StandardIa,
    OnezoneIa,
    Glacier,
    DeepArchive,
    ReducedRedundancy,
    Other,
}

impl StorageClass {
    /// Objects in these classes require a restore before they can be read,
    /// so transfer commands skip them unless forced.
    pub fn is_glacier_tier(self) -> bool {
        matches!(self, StorageClass::Glacier | StorageClass::DeepArchive)
    }
}

impl From<&str> for StorageClass {
    fn from(s: &str) -> Self {
        match s {
            "STANDARD" => StorageClass::Standard,
            "INTELLIGENT_TIERING" => StorageClass::IntelligentTiering,
            "STANDARD_IA" => StorageClass::StandardIa,
            "ONEZONE_IA" => StorageClass::OnezoneIa,
            "GLACIER" => StorageClass::Glacier,
            "DEEP_ARCHIVE" => StorageClass::DeepArchive,
            "REDUCED_REDUNDANCY" => StorageClass::ReducedRedundancy,
            _ => StorageClass::Other,
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::OnezoneIa => "ONEZONE_IA",
            StorageClass::Glacier => "GLACIER",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
            StorageClass::ReducedRedundancy => "REDUCED_REDUNDANCY",
            StorageClass::Other => "OTHER",
        };
        f.write_str(s)
    }
}

/// A listing or stat result. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Object {
    pub url: Url,
    pub size: u64,
    pub mtime: Option<OffsetDateTime>,
    /// ETag with surrounding quotes stripped.
    pub etag: Option<String>,
    pub storage_class: StorageClass,
    pub entry_type: EntryType,
    /// Relative path computed by [`Url::match_key`] when this object came
    /// from a matched listing; used by the planner to name destinations.
    pub relative_path: Option<String>,
    /// Present if this entry represents a listing failure rather than a
    /// real object (e.g. an access-denied on one key during a recursive
    /// listing).
    pub error: Option<String>,
    /// Value of the retry-ID user-metadata key, if the object carries one.
    pub retry_id: Option<String>,
}

impl Object {
    pub fn new_file(url: Url, size: u64) -> Self {
        Object {
            url,
            size,
            mtime: None,
            etag: None,
            storage_class: StorageClass::Standard,
            entry_type: EntryType::File,
            relative_path: None,
            error: None,
            retry_id: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Dir
    }
}

/// Server-side encryption method for copy/put requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseMethod {
    Aes256,
    AwsKms,
}

/// Directive for how metadata should be applied on a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataDirective {
    #[default]
    Copy,
    Replace,
}

/// Request-shaping bundle attached to copy/put operations.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    /// Parsed RFC 3339 expiry.
    pub expires: Option<OffsetDateTime>,
    pub storage_class: Option<StorageClass>,
    pub acl: Option<String>,
    pub sse: Option<SseMethod>,
    pub sse_kms_key_id: Option<String>,
    pub user_defined: BTreeMap<String, String>,
    pub metadata_directive: MetadataDirective,
    pub request_payer: bool,
}

/// Well-known user-metadata key carrying the [retry ID](crate::retry) used
/// to disambiguate an eventually-consistent `CompleteMultipartUpload` retry.
pub const RETRY_ID_METADATA_KEY: &str = "x-s3fleet-retry-id";

impl Metadata {
    pub fn with_retry_id(mut self, retry_id: &str) -> Self {
        self.user_defined
            .insert(RETRY_ID_METADATA_KEY.to_owned(), retry_id.to_owned());
        self
    }

    pub fn retry_id(&self) -> Option<&str> {
        self.user_defined.get(RETRY_ID_METADATA_KEY).map(String::as_str)
    }
}
