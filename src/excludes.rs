// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Build a [`GlobSet`] of `--exclude` patterns applied to relative paths
//! after source matching.
//!
//! [`Excludes`] wraps the compiled set behind a cheap-to-clone handle so the
//! planner can carry one copy per source stream without rebuilding it.

use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid --exclude pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    #[error("failed to build exclude set: {0}")]
    Build(#[source] globset::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A compiled `--exclude` pattern set, checked against each matched
/// object's relative path after source expansion (§4.E).
#[derive(Debug, Clone)]
pub struct Excludes(Arc<GlobSet>);

impl Excludes {
    /// Build from `--exclude pattern` arguments. An empty list excludes
    /// nothing.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|source| Error::InvalidPattern {
                pattern: pattern.to_owned(),
                source,
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(Error::Build)?;
        Ok(Excludes(Arc::new(set)))
    }

    pub fn nothing() -> Self {
        Excludes(Arc::new(GlobSetBuilder::new().build().expect("empty GlobSet always builds")))
    }

    /// True if `relative_path` should be skipped because it matches any
    /// configured pattern.
    pub fn is_excluded(&self, relative_path: &str) -> bool {
        self.0.is_match(relative_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_parse() {
        let excludes = Excludes::from_patterns(["*.log", "*.tmp"]).unwrap();
        assert!(excludes.is_excluded("debug.log"));
        assert!(excludes.is_excluded("cache.tmp"));
        assert!(!excludes.is_excluded("readme.txt"));
    }

    #[test]
    fn path_pattern() {
        let excludes = Excludes::from_patterns(["build/**"]).unwrap();
        assert!(excludes.is_excluded("build/output/a.o"));
        assert!(!excludes.is_excluded("src/main.rs"));
    }

    #[test]
    fn nothing_excludes_nothing() {
        let excludes = Excludes::nothing();
        assert!(!excludes.is_excluded("anything"));
    }

    #[test]
    fn cp_exclude_scenario() {
        // `cp --exclude "*.log" src/ s3://b/dst/` over {a.txt, b.log, c.txt}
        // uploads exactly a.txt and c.txt.
        let excludes = Excludes::from_patterns(["*.log"]).unwrap();
        let files = ["a.txt", "b.log", "c.txt"];
        let uploaded: Vec<_> = files
            .iter()
            .filter(|f| !excludes.is_excluded(f))
            .collect();
        assert_eq!(uploaded, vec![&"a.txt", &"c.txt"]);
    }
}
