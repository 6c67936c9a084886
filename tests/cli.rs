// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Run the built binary as a subprocess and check its usage-error surface.
//! Every case here is offline: no network call happens before the process
//! exits, so these run without credentials or a reachable endpoint.

use assert_cmd::Command;
use predicates::prelude::*;

fn s3fleet() -> Command {
    Command::cargo_bin("s3fleet").expect("binary builds")
}

#[test]
fn no_args_is_a_usage_error_without_help() {
    s3fleet()
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Usage:"))
        .stderr(predicate::str::contains("Copy one or more sources").not());
}

#[test]
fn help_exits_zero_and_lists_commands() {
    s3fleet()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("high-throughput client"))
        .stdout(predicate::str::contains("sync"));
}

#[test]
fn version_exits_zero() {
    s3fleet().arg("--version").assert().success().stdout(predicate::str::contains("s3fleet"));
}

#[test]
fn rm_rejects_mixed_buckets_before_touching_the_network() {
    s3fleet()
        .args(["rm", "s3://bucket-one/a.txt", "s3://bucket-two/b.txt"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("bucket"));
}

#[test]
fn cp_with_only_one_path_is_a_usage_error() {
    s3fleet()
        .args(["cp", "s3://bucket/only-one-path"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn endpoint_without_scheme_is_rejected() {
    s3fleet()
        .args(["--endpoint-url", "localhost:9000", "ls"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("scheme"));
}

#[test]
fn unknown_subcommand_is_a_usage_error() {
    s3fleet().arg("frobnicate").assert().failure().code(1);
}

#[test]
fn local_to_local_cp_is_rejected_before_touching_the_network() {
    // The planner rejects local-to-local copy before building any task, so
    // this never reaches a storage backend and is safe to run offline.
    s3fleet()
        .args(["--dry-run", "cp", "a.txt", "b.txt", "/tmp/s3fleet-cli-test-dest/"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("local-to-local"));
}

#[test]
fn dry_run_rm_still_rejects_mixed_buckets_before_touching_the_network() {
    // `--dry-run` bypasses the storage layer's mutations, not the planner's
    // mixed-bucket precheck, so this stays offline-safe and must still fail.
    s3fleet()
        .args(["--dry-run", "rm", "s3://bucket-one/a.txt", "s3://bucket-two/b.txt"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("bucket"));
}
