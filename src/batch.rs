// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Batch driver (§4.G): reads one command per line from a file or stdin and
//! dispatches each through the same [`crate::engine::Engine`] used by the
//! single-command path, so a `run` invocation's stats and worker pool are
//! shared across every line rather than rebuilt per command.
//!
//! Lines are read lazily, never buffered all at once, and a malformed line
//! fails in isolation rather than aborting the scan.

use std::io::{self, BufRead};
use std::path::Path;

use clap::Parser;
use thiserror::Error;

use crate::commands::{self, build_request, BuildError, Cli, Context};
use crate::planner::TaskError;

/// A single line's token buffer is allowed to grow arbitrarily large so that
/// a `sync`-produced delete list (one URL per line, potentially very long
/// individual lines if a key itself is huge) never overflows a fixed buffer.
/// `BufRead::read_line` already grows its `String` as needed; this constant
/// only documents the intent.
const INITIAL_LINE_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
enum LineError {
    #[error("parse error: {0}")]
    Parse(#[from] clap::Error),
    #[error("{0}")]
    Build(#[from] BuildError),
}

/// Read and dispatch every line of `path` (or stdin, if `path` is `None`)
/// through `ctx`'s engine. Returns every sub-task error observed across every
/// line; a malformed line contributes one synthetic [`TaskError`] with no
/// task descriptor rather than aborting the scan.
pub async fn run_file(ctx: &Context, path: Option<&Path>) -> Vec<TaskError> {
    let reader: Box<dyn BufRead> = match path {
        Some(path) => match std::fs::File::open(path) {
            Ok(file) => Box::new(io::BufReader::new(file)),
            Err(e) => {
                return vec![TaskError {
                    task: None,
                    message: format!("run: cannot open {}: {e}", path.display()),
                }]
            }
        },
        None => Box::new(io::BufReader::new(io::stdin())),
    };

    run_lines(ctx, reader).await
}

async fn run_lines(ctx: &Context, mut reader: Box<dyn BufRead>) -> Vec<TaskError> {
    let mut all_errors = Vec::new();
    let mut line = String::with_capacity(INITIAL_LINE_CAPACITY);
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        line.clear();
        let bytes_read = match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                all_errors.push(TaskError { task: None, message: format!("run: read error: {e}") });
                break;
            }
        };
        let _ = bytes_read;

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match dispatch_line(ctx, trimmed).await {
            Ok(mut errors) => all_errors.append(&mut errors),
            Err(e) => {
                eprintln!("{e}");
                all_errors.push(TaskError { task: None, message: e.to_string() });
            }
        }
    }
    all_errors
}

/// Tokenize, parse, and dispatch one line.
async fn dispatch_line(ctx: &Context, line: &str) -> Result<Vec<TaskError>, LineError> {
    let tokens = tokenize(line);
    let argv = std::iter::once("s3fleet".to_owned()).chain(tokens);
    let cli = Cli::try_parse_from(argv)?;
    let request = build_request(cli.command)?;
    Ok(commands::dispatch(ctx, request).await)
}

/// Split `line` into shell-like tokens, honoring single and double quotes.
/// An unterminated quote takes the rest of the line as one token (the
/// batch driver never needs to span quotes across lines). Adjacent `/`
/// characters inside a token are left untouched: this is a tokenizer, not a
/// path normalizer.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => {
                quote = None;
            }
            Some(_) => {
                current.push(c);
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::config::GlobalOptions;

    fn context() -> Context {
        Context::new(GlobalOptions { dry_run: true, ..Default::default() })
    }

    /// A context that lets planner-level errors (mixed buckets, bad globs)
    /// surface instead of being short-circuited by dry-run. Safe to use
    /// offline: those checks run before any network call is made.
    fn live_context() -> Context {
        Context::new(GlobalOptions::default())
    }

    #[test]
    fn tokenize_splits_on_whitespace() {
        assert_eq!(tokenize("cp a.txt s3://b/k"), vec!["cp", "a.txt", "s3://b/k"]);
    }

    #[test]
    fn tokenize_respects_single_and_double_quotes() {
        assert_eq!(
            tokenize(r#"cp "a file.txt" 'another one.txt' s3://b/k"#),
            vec!["cp", "a file.txt", "another one.txt", "s3://b/k"]
        );
    }

    #[test]
    fn tokenize_preserves_adjacent_slashes() {
        assert_eq!(tokenize("ls s3://bucket//double/slash"), vec!["ls", "s3://bucket//double/slash"]);
    }

    #[tokio::test]
    async fn blank_lines_and_comments_are_skipped() {
        let ctx = context();
        let input = "\n  \n# a comment\n   # indented comment\n";
        let errors = run_lines(&ctx, Box::new(Cursor::new(input.as_bytes().to_vec()))).await;
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn a_malformed_line_does_not_abort_the_run() {
        let ctx = live_context();
        // "frobnicate" isn't a known subcommand; the next line must still run.
        let input = "frobnicate s3://bucket/key\nrm s3://b1/x s3://b2/y\n";
        let errors = run_lines(&ctx, Box::new(Cursor::new(input.as_bytes().to_vec()))).await;
        // One parse error from line 1, one mixed-bucket planner error from line 2.
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn independent_lines_each_complete_under_dry_run() {
        // Two unrelated mixed-bucket `rm` lines: each must produce its own
        // planner error without one line's dispatch leaking state into the
        // next. The mixed-bucket precheck runs before any network call
        // (`--dry-run` bypasses storage mutations, not planning), so this
        // stays offline-safe.
        let ctx = context();
        let input = "rm s3://b1/x s3://b2/y\nrm s3://b3/x s3://b4/y\n";
        let errors = run_lines(&ctx, Box::new(Cursor::new(input.as_bytes().to_vec()))).await;
        assert_eq!(errors.len(), 2, "each line's mixed-bucket precheck must surface independently: {errors:?}");
    }
}
