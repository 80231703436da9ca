// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Run bulwark as a subprocess and test it, including the worker fan-out
//! that in-process tests cannot reach.

use assert_cmd::Command;
use predicates::prelude::*;

use bulwark::spool::{Direction, SegmentStatus, Spool};
use bulwark::test_fixtures::{make_segment_content, ScratchRepo};

fn run_bulwark(fixture: &ScratchRepo) -> Command {
    let options = fixture.options();
    let mut command = Command::cargo_bin("bulwark").unwrap();
    command
        .arg("--stanza=main")
        .arg(format!("--repo-path={}", options.repo_path))
        .arg(format!("--pg-path={}", options.pg_path.display()))
        .arg(format!("--spool-path={}", options.spool_path.display()))
        .arg(format!("--lock-path={}", options.lock_path.display()));
    command
}

#[test]
fn no_args_shows_usage() {
    Command::cargo_bin("bulwark")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn unknown_command_fails() {
    Command::cargo_bin("bulwark")
        .unwrap()
        .arg("conserve")
        .assert()
        .failure();
}

#[test]
fn check_and_info_on_fresh_stanza() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();

    run_bulwark(&fixture).arg("check").assert().success();

    run_bulwark(&fixture)
        .args(["info", "--output=text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stanza: main"))
        .stdout(predicate::str::contains("no valid backups"));

    run_bulwark(&fixture)
        .args(["info", "--output=json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status_code\": 2"));
}

#[test]
fn archive_push_and_get_round_trip() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();
    let wal = fixture.make_wal_segment("000000010000000000000001", 3);

    run_bulwark(&fixture)
        .arg("archive-push")
        .arg(&wal)
        .assert()
        .success();

    let restored = fixture.path().join("fetched");
    run_bulwark(&fixture)
        .arg("archive-get")
        .arg("000000010000000000000001")
        .arg(&restored)
        .assert()
        .success();
    assert_eq!(std::fs::read(&restored).unwrap(), make_segment_content(3));
}

#[test]
fn archive_get_missing_segment_exits_one() {
    let fixture = ScratchRepo::new();
    let destination = fixture.path().join("fetched");
    run_bulwark(&fixture)
        .arg("archive-get")
        .arg("0000000100000000000000FF")
        .arg(&destination)
        .assert()
        .code(1);
    assert!(!destination.exists());
}

#[test]
fn backup_restore_expire_cycle() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();

    run_bulwark(&fixture)
        .args(["backup", "--type=full"])
        .assert()
        .success();
    run_bulwark(&fixture)
        .args(["backup", "--type=incr"])
        .assert()
        .success();

    let restored = fixture.path().join("restored");
    std::fs::create_dir(&restored).unwrap();
    let options = fixture.options();
    Command::cargo_bin("bulwark")
        .unwrap()
        .arg("--stanza=main")
        .arg(format!("--repo-path={}", options.repo_path))
        .arg(format!("--pg-path={}", restored.display()))
        .arg(format!("--lock-path={}", options.lock_path.display()))
        .arg("restore")
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(restored.join("PG_VERSION")).unwrap(),
        "15\n"
    );

    // Only one full exists, so nothing expires.
    run_bulwark(&fixture)
        .args(["expire", "--repo-retention-full=1"])
        .assert()
        .success();
    run_bulwark(&fixture)
        .args(["info", "--output=text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("incr backup"));
}

#[test]
fn verify_clean_repository() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();
    let wal = fixture.make_wal_segment("000000010000000000000001", 2);
    run_bulwark(&fixture)
        .arg("archive-push")
        .arg(&wal)
        .assert()
        .success();
    run_bulwark(&fixture).arg("verify").assert().success();
}

#[test]
fn stop_fences_commands_until_start() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();

    run_bulwark(&fixture).arg("stop").assert().success();
    run_bulwark(&fixture)
        .arg("check")
        .assert()
        .code(56);
    run_bulwark(&fixture).arg("start").assert().success();
    run_bulwark(&fixture).arg("check").assert().success();
}

#[test]
fn repo_commands_round_trip() {
    let fixture = ScratchRepo::new();

    run_bulwark(&fixture)
        .args(["repo-put", "notes/hello"])
        .write_stdin("stored bytes")
        .assert()
        .success();

    run_bulwark(&fixture)
        .args(["repo-ls", "notes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"));

    run_bulwark(&fixture)
        .args(["repo-get", "notes/hello"])
        .assert()
        .success()
        .stdout(predicate::eq("stored bytes"));

    run_bulwark(&fixture)
        .args(["repo-rm", "notes/hello"])
        .assert()
        .success();
    run_bulwark(&fixture)
        .args(["repo-get", "notes/hello"])
        .assert()
        .code(38);
}

/// Queue several segments, then run the async daemon role directly with
/// two workers: every segment must get exactly one ok status and land in
/// the archive.
#[test]
fn async_daemon_drains_queue_with_worker_pool() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();

    let mut options = fixture.options().clone();
    options.process_max = 2;
    let spool = Spool::open(&options).unwrap();
    let segments: Vec<String> = (1..=5)
        .map(|n| format!("00000001000000000000000{n}"))
        .collect();
    for (index, segment) in segments.iter().enumerate() {
        let wal = fixture.make_wal_segment(segment, index as u8);
        spool.add(Direction::Out, segment, &wal).unwrap();
    }

    let mut command = Command::cargo_bin("bulwark").unwrap();
    command.arg("archive-push:async");
    for (key, value) in options.to_env() {
        command.env(key, value);
    }
    command.assert().success();

    for segment in &segments {
        assert_eq!(
            spool.status(Direction::Out, segment).unwrap(),
            Some(SegmentStatus::Ok { warning: None }),
            "{segment} should be ok"
        );
    }
    // The queue was drained and the archive holds all five.
    assert!(spool.list(Direction::Out).unwrap().is_empty());
    let repo = fixture.repo().unwrap();
    let storage = repo.archive_storage().unwrap();
    assert_eq!(
        storage.list("15-1/0000000100000000").unwrap().files.len(),
        5
    );
}

/// The async hook path end to end: a sync invocation queues the segment,
/// forks the daemon, waits for the ok, and a second invocation of the same
/// segment is a no-op dedup.
#[test]
fn async_archive_push_hook_flow() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();
    let wal = fixture.make_wal_segment("000000010000000000000009", 4);

    run_bulwark(&fixture)
        .arg("--archive-async")
        .arg("--archive-timeout=30s")
        .arg("archive-push")
        .arg(&wal)
        .assert()
        .success();

    // Status was consumed by the successful invocation.
    let spool = Spool::open(fixture.options()).unwrap();
    assert_eq!(
        spool
            .status(Direction::Out, "000000010000000000000009")
            .unwrap(),
        None
    );

    // Re-pushing the identical segment succeeds as a dedup no-op.
    run_bulwark(&fixture)
        .arg("--archive-async")
        .arg("--archive-timeout=30s")
        .arg("archive-push")
        .arg(&wal)
        .assert()
        .success();
}

#[test]
fn parallel_backup_uses_worker_pool() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();
    run_bulwark(&fixture)
        .args(["--process-max=2", "backup", "--type=full"])
        .assert()
        .success();
    run_bulwark(&fixture).arg("verify").assert().success();
}

#[test]
fn lock_conflict_reports_holder() {
    let fixture = ScratchRepo::new();
    fixture.make_cluster_files();
    let options = fixture.options();
    let _held = bulwark::lock::Lock::acquire(
        &options.lock_path,
        "main",
        bulwark::lock::LockType::Backup,
    )
    .unwrap();

    run_bulwark(&fixture)
        .args(["backup", "--type=full"])
        .assert()
        .code(42)
        .stderr(predicate::str::contains("unable to acquire lock"));
}
