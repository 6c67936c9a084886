// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Atomic per-operation success/failure tallies, plus an elapsed timer.
//!
//! A [`strum`]-derived enum indexes a fixed array of [`AtomicUsize`]
//! counters so that updates never block task execution and are commutative
//! across workers.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::time::Instant;

use itertools::Itertools;
use serde::Serialize;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{EnumCount, EnumIter};

/// One kind of sub-task operation tracked by [`Stats`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, EnumCount, EnumIter, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Op {
    Copy,
    Delete,
    List,
    Get,
    Put,
    Select,
    MakeBucket,
    RemoveBucket,
    BucketVersion,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Copy => "copy",
            Op::Delete => "delete",
            Op::List => "list",
            Op::Get => "get",
            Op::Put => "put",
            Op::Select => "select",
            Op::MakeBucket => "make-bucket",
            Op::RemoveBucket => "remove-bucket",
            Op::BucketVersion => "bucket-version",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct OpCounters {
    success: AtomicUsize,
    error: AtomicUsize,
}

/// Process-wide (well: per-command) tallies of successes and failures per
/// [`Op`], plus an elapsed-time clock started at construction.
pub struct Stats {
    counters: [OpCounters; Op::COUNT],
    started: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Stats {
            counters: Default::default(),
            started: Instant::now(),
        }
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, op: Op) {
        self.counters[op as usize].success.fetch_add(1, Relaxed);
    }

    pub fn record_error(&self, op: Op) {
        self.counters[op as usize].error.fetch_add(1, Relaxed);
    }

    pub fn success_count(&self, op: Op) -> usize {
        self.counters[op as usize].success.load(Relaxed)
    }

    pub fn error_count(&self, op: Op) -> usize {
        self.counters[op as usize].error.load(Relaxed)
    }

    pub fn total_success(&self) -> usize {
        Op::iter().map(|op| self.success_count(op)).sum()
    }

    pub fn total_errors(&self) -> usize {
        Op::iter().map(|op| self.error_count(op)).sum()
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Iterate `(op, success, error)` triples for every tracked operation.
    pub fn iter(&self) -> impl Iterator<Item = (Op, usize, usize)> + '_ {
        Op::iter()
            .map(move |op| (op, self.success_count(op), self.error_count(op)))
            .collect_vec()
            .into_iter()
    }

    /// One JSON object per operation kind, as emitted by `--json`.
    pub fn to_json_lines(&self) -> Vec<String> {
        #[derive(Serialize)]
        struct Line {
            operation: Op,
            success: usize,
            error: usize,
        }
        self.iter()
            .map(|(operation, success, error)| {
                serde_json::to_string(&Line {
                    operation,
                    success,
                    error,
                })
                .expect("Line always serializes")
            })
            .collect()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<14} {:>10} {:>10}", "operation", "success", "error")?;
        for (op, success, error) in self.iter() {
            writeln!(f, "{op:<14} {success:>10} {error:>10}")?;
        }
        writeln!(
            f,
            "{:<14} {:>10} {:>10}",
            "total",
            self.total_success(),
            self.total_errors()
        )?;
        write!(f, "elapsed: {:.3}s", self.elapsed().as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_independently() {
        let stats = Stats::new();
        stats.record_success(Op::Copy);
        stats.record_success(Op::Copy);
        stats.record_error(Op::Copy);
        stats.record_success(Op::Delete);

        assert_eq!(stats.success_count(Op::Copy), 2);
        assert_eq!(stats.error_count(Op::Copy), 1);
        assert_eq!(stats.success_count(Op::Delete), 1);
        assert_eq!(stats.success_count(Op::List), 0);
        assert_eq!(stats.total_success(), 3);
        assert_eq!(stats.total_errors(), 1);
    }

    #[test]
    fn json_lines_round_trip_counts() {
        let stats = Stats::new();
        stats.record_success(Op::Put);
        let lines = stats.to_json_lines();
        let put_line = lines
            .iter()
            .find(|l| l.contains("\"put\""))
            .expect("put line present");
        let value: serde_json::Value = serde_json::from_str(put_line).unwrap();
        assert_eq!(value["success"], 1);
        assert_eq!(value["error"], 0);
    }

    #[test]
    fn display_includes_totals() {
        let stats = Stats::new();
        stats.record_success(Op::List);
        let rendered = format!("{stats}");
        assert!(rendered.contains("total"));
        assert!(rendered.contains("elapsed"));
    }
}
