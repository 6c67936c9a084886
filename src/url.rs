// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! A uniform address for local paths and remote objects.
//!
//! Remote URLs look like `s3://bucket/key`. Keys containing `?` or `*` are
//! glob URLs: the prefix is the substring before the first wildcard, and the
//! rest is compiled into a matching regex. Non-glob URLs use `/` as a
//! listing delimiter and match only objects equal to, or nested under, the
//! given key.

use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

const WILDCARDS: [char; 2] = ['?', '*'];

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme {scheme:?} (only s3:// and local paths are supported)")]
    UnsupportedScheme { scheme: String },

    #[error("s3:// URL has an empty bucket name: {0:?}")]
    EmptyBucket(String),

    #[error("bucket name {bucket:?} must not contain wildcard characters")]
    WildcardInBucket { bucket: String },

    #[error("invalid glob pattern in {0:?}: {1}")]
    InvalidGlob(String, regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A parsed address: either a local filesystem path or an `s3://` object URL.
#[derive(Debug, Clone)]
pub struct Url {
    kind: Kind,
    /// Original string form, reconstructable via [`Url::as_str`].
    raw: String,
    /// `s3://bucket/key` -> "bucket". Empty for local URLs.
    bucket: String,
    /// Object key (remote) or filesystem path (local). Never contains a
    /// leading `/` for the remote case.
    path: String,
    version_id: Option<String>,
    has_glob: bool,
    /// Present only for glob URLs: the literal portion of `path` before the
    /// first wildcard character.
    prefix: String,
    matcher: Option<Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Local,
    Remote,
}

impl Url {
    /// Parse a local path or `s3://...` URL.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Empty);
        }
        if let Some(rest) = s.strip_prefix("s3://") {
            return Self::parse_remote(s, rest);
        }
        if let Some((scheme, _)) = s.split_once("://") {
            return Err(Error::UnsupportedScheme {
                scheme: scheme.to_owned(),
            });
        }
        Self::local(s)
    }

    fn parse_remote(raw: &str, rest: &str) -> Result<Self> {
        let (bucket, path) = match rest.split_once('/') {
            Some((b, p)) => (b, p),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(Error::EmptyBucket(raw.to_owned()));
        }
        if bucket.contains(WILDCARDS) {
            return Err(Error::WildcardInBucket {
                bucket: bucket.to_owned(),
            });
        }
        let (path, version_id) = split_version_id(path);
        let (has_glob, prefix, matcher) = compile_glob(raw, path)?;
        Ok(Url {
            kind: Kind::Remote,
            raw: raw.to_owned(),
            bucket: bucket.to_owned(),
            path: path.to_owned(),
            version_id,
            has_glob,
            prefix,
            matcher,
        })
    }

    fn local(s: &str) -> Result<Self> {
        let (has_glob, prefix, matcher) = compile_glob(s, s)?;
        Ok(Url {
            kind: Kind::Local,
            raw: s.to_owned(),
            bucket: String::new(),
            path: s.to_owned(),
            version_id: None,
            has_glob,
            prefix,
            matcher,
        })
    }

    pub fn is_remote(&self) -> bool {
        self.kind == Kind::Remote
    }

    pub fn is_local(&self) -> bool {
        self.kind == Kind::Local
    }

    /// A remote URL whose path ends with `/`, denoting a directory-like
    /// destination rather than a specific object.
    pub fn is_prefix(&self) -> bool {
        self.is_remote() && (self.path.is_empty() || self.path.ends_with('/'))
    }

    /// A remote URL with no key at all: `s3://bucket`.
    pub fn is_bucket(&self) -> bool {
        self.is_remote() && self.path.is_empty()
    }

    pub fn has_glob(&self) -> bool {
        self.has_glob
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version_id(&self) -> Option<&str> {
        self.version_id.as_deref()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn as_local_path(&self) -> &Path {
        Path::new(&self.path)
    }

    /// The list prefix for this URL: the full key for non-glob remote URLs,
    /// or the literal portion before the first wildcard for glob URLs.
    pub fn list_prefix(&self) -> &str {
        if self.has_glob {
            &self.prefix
        } else {
            &self.path
        }
    }

    /// `/` for non-glob remote listings (real directory semantics), or
    /// `None` for glob listings, which must recurse through all keys under
    /// the prefix to apply the compiled pattern.
    pub fn delimiter(&self) -> Option<&'static str> {
        if self.has_glob {
            None
        } else {
            Some("/")
        }
    }

    /// Test whether `key` is matched by this URL, and if so return the
    /// relative path to expose to the planner.
    pub fn match_key(&self, key: &str) -> Option<String> {
        if self.has_glob {
            let matcher = self.matcher.as_ref().expect("glob URL has a matcher");
            if matcher.is_match(key) {
                Some(relative_to_prefix(&self.prefix, key))
            } else {
                None
            }
        } else if key == self.path {
            Some(
                key.rsplit_once('/')
                    .map(|(_, base)| base.to_owned())
                    .unwrap_or_else(|| key.to_owned()),
            )
        } else if let Some(rest) = key.strip_prefix(&self.path) {
            // Directory-boundary rule: "a/b/c" matches prefix "a/b", but
            // "a/b/cd" does not match a naive string prefix of "a/b/c".
            let boundary_ok = self.path.is_empty()
                || self.path.ends_with('/')
                || rest.starts_with('/');
            if boundary_ok {
                Some(rest.trim_start_matches('/').to_owned())
            } else {
                None
            }
        } else {
            None
        }
    }

    /// The final path component: the file or object name.
    pub fn base(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit_once('/')
            .map(|(_, base)| base)
            .unwrap_or_else(|| self.path.trim_end_matches('/'))
    }

    /// The URL with its final path component removed.
    pub fn dir(&self) -> Url {
        let trimmed = self.path.trim_end_matches('/');
        let dir_path = match trimmed.rsplit_once('/') {
            Some((dir, _)) => dir,
            None => "",
        };
        self.with_path(dir_path)
    }

    /// Join `suffix` onto this URL's path, producing a new URL.
    pub fn join(&self, suffix: &str) -> Url {
        let joined = join_paths(&self.path, suffix);
        self.with_path(&joined)
    }

    fn with_path(&self, path: &str) -> Url {
        match self.kind {
            Kind::Local => {
                let raw = path.to_owned();
                Url::local(&raw).expect("reconstructed local URL is well-formed")
            }
            Kind::Remote => {
                let raw = if path.is_empty() {
                    format!("s3://{}", self.bucket)
                } else {
                    format!("s3://{}/{}", self.bucket, path)
                };
                // Re-parsing is the simplest way to recompute glob/prefix
                // state consistently with `parse`.
                Url::parse(&raw).expect("reconstructed URL is well-formed")
            }
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Url {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl Eq for Url {}

/// Compile the glob prefix/matcher shared by remote and local URLs: the
/// literal portion of `path` before the first wildcard, and an anchored
/// regex over the tail. `raw` is used only to label a compile error.
fn compile_glob(raw: &str, path: &str) -> Result<(bool, String, Option<Regex>)> {
    let has_glob = path.contains(WILDCARDS);
    if !has_glob {
        return Ok((false, String::new(), None));
    }
    let idx = path.find(WILDCARDS).expect("has_glob implies a match");
    let prefix = path[..idx].to_owned();
    let pattern = glob_to_regex(&path[idx..]);
    let matcher = Regex::new(&pattern).map_err(|e| Error::InvalidGlob(raw.to_owned(), e))?;
    Ok((true, prefix, Some(matcher)))
}

fn split_version_id(path: &str) -> (&str, Option<String>) {
    match path.split_once("?versionId=") {
        Some((p, v)) => (p, Some(v.to_owned())),
        None => (path, None),
    }
}

/// Join two path-like strings the way S3 keys are joined: no double
/// slashes, no leading slash.
pub fn join_paths(a: &str, b: &str) -> String {
    if b.is_empty() {
        return a.to_owned();
    }
    if a.is_empty() {
        return b.to_owned();
    }
    let mut result = a.trim_end_matches('/').to_owned();
    result.push('/');
    result.push_str(b.trim_start_matches('/'));
    result
}

/// Compute the relative path of `key` within `prefix`: the portion of the
/// key after the directory part of the prefix (i.e. up to and including the
/// last `/` in `prefix`).
fn relative_to_prefix(prefix: &str, key: &str) -> String {
    let dir = match prefix.rsplit_once('/') {
        Some((dir, _)) => format!("{dir}/"),
        None => String::new(),
    };
    key.strip_prefix(&dir).unwrap_or(key).to_owned()
}

/// Translate an s5cmd-style glob tail (`?` and `*`) into an anchored regex.
/// `?` matches exactly one character; `*` matches zero or more, lazily, so
/// that patterns like `s3://b/x/*` don't greedily swallow path separators
/// they shouldn't.
fn glob_to_regex(tail: &str) -> String {
    let mut out = String::from("^");
    for ch in tail.chars() {
        match ch {
            '?' => out.push('.'),
            '*' => out.push_str(".*?"),
            _ => {
                if regex_syntax::is_meta_character(ch) {
                    out.push('\\');
                }
                out.push(ch);
            }
        }
    }
    out.push('$');
    out
}

/// Re-export just the bit of `regex_syntax` we need without adding a new
/// dependency on top of `regex` (which already vendors it).
mod regex_syntax {
    pub fn is_meta_character(c: char) -> bool {
        matches!(
            c,
            '\\' | '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        )
    }
}

/// Compute the path of `target` relative to `base`, for constructing
/// destination names when copying into a directory. Used for local
/// destinations where `Url` isn't otherwise involved.
pub fn relative_local_path(base: &Path, target: &Path) -> PathBuf {
    target
        .strip_prefix(base)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| target.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bucket_only() {
        let u = Url::parse("s3://mybucket").unwrap();
        assert!(u.is_remote());
        assert!(u.is_bucket());
        assert_eq!(u.bucket(), "mybucket");
        assert_eq!(u.path(), "");
    }

    #[test]
    fn parse_rejects_empty_bucket() {
        assert!(matches!(Url::parse("s3:///key"), Err(Error::EmptyBucket(_))));
    }

    #[test]
    fn parse_rejects_wildcard_bucket() {
        assert!(matches!(
            Url::parse("s3://my*bucket/key"),
            Err(Error::WildcardInBucket { .. })
        ));
    }

    #[test]
    fn parse_rejects_other_scheme() {
        assert!(matches!(
            Url::parse("gs://bucket/key"),
            Err(Error::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn round_trip_as_str() {
        for s in [
            "s3://bucket/key",
            "s3://bucket/a/b/c",
            "s3://bucket",
            "/local/path",
            "relative/path",
            "s3://bucket/key with spaces",
            "s3://bucket/key-with-unicode-\u{1F600}",
        ] {
            let u = Url::parse(s).unwrap();
            assert_eq!(u.as_str(), s);
        }
    }

    #[test]
    fn version_id_round_trips() {
        let u = Url::parse("s3://bucket/key?versionId=abc123").unwrap();
        assert_eq!(u.path(), "key");
        assert_eq!(u.version_id(), Some("abc123"));
    }

    #[test]
    fn glob_detection_and_prefix() {
        let u = Url::parse("s3://bucket/images/*.png").unwrap();
        assert!(u.has_glob());
        assert_eq!(u.list_prefix(), "images/");
        assert_eq!(u.delimiter(), None);
    }

    #[test]
    fn glob_matches_tail() {
        let u = Url::parse("s3://bucket/images/*.png").unwrap();
        assert!(u.match_key("images/cat.png").is_some());
        // `*` in a glob URL recurses through subdirectories.
        assert!(u.match_key("images/sub/cat.png").is_some());
        assert!(u.match_key("images/cat.jpg").is_none());
    }

    #[test]
    fn question_mark_matches_one_char() {
        let u = Url::parse("s3://bucket/file?.txt").unwrap();
        assert!(u.match_key("file1.txt").is_some());
        assert!(u.match_key("file12.txt").is_none());
    }

    #[test]
    fn non_glob_directory_boundary() {
        let u = Url::parse("s3://bucket/a/b").unwrap();
        assert!(u.match_key("a/b").is_some());
        assert!(u.match_key("a/b/c").is_some());
        assert!(u.match_key("a/bc").is_none(), "must not match sibling key sharing a string prefix");
        assert!(u.match_key("a/bcd/e").is_none());
    }

    #[test]
    fn relative_path_for_directory_match() {
        let u = Url::parse("s3://bucket/key").unwrap();
        assert_eq!(u.match_key("key/a").as_deref(), Some("a"));
        assert_eq!(u.match_key("key/b/c").as_deref(), Some("b/c"));
    }

    #[test]
    fn base_and_dir() {
        let u = Url::parse("s3://bucket/a/b/c.txt").unwrap();
        assert_eq!(u.base(), "c.txt");
        assert_eq!(u.dir().as_str(), "s3://bucket/a/b");
    }

    #[test]
    fn join_avoids_double_slash() {
        let u = Url::parse("s3://bucket/dir/").unwrap();
        let joined = u.join("file.txt");
        assert_eq!(joined.as_str(), "s3://bucket/dir/file.txt");
    }

    #[test]
    fn is_prefix_and_is_bucket() {
        assert!(Url::parse("s3://bucket/dir/").unwrap().is_prefix());
        assert!(!Url::parse("s3://bucket/dir").unwrap().is_prefix());
        assert!(Url::parse("s3://bucket").unwrap().is_bucket());
        assert!(!Url::parse("s3://bucket/").unwrap().is_bucket());
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_keys_round_trip(key in "[a-zA-Z0-9/_.-]{0,40}") {
            let raw = format!("s3://bucket/{key}");
            if let Ok(u) = Url::parse(&raw) {
                proptest::prop_assert_eq!(u.as_str(), raw.as_str());
            }
        }
    }
}
