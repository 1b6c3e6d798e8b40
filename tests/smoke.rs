//! Smoke tests -- verify the binary runs and the subcommands work end to end.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};

const EARLIER: &str = r#"{
    "version": "5.2.2024.0614.120000",
    "suites": [{
        "category": "unit",
        "name": "ledger-core",
        "group_name": "core",
        "tests": [
            {"class_name": "LedgerTest", "method_name": "opens",
             "start_time": "2024-06-14T12:00:00Z", "end_time": "2024-06-14T12:00:01Z",
             "statuses": ["RUNNING", "PASS"]}
        ]
    }]
}"#;

const LATER: &str = r#"{
    "version": "5.2.2024.0615.120000",
    "suites": [{
        "category": "unit",
        "name": "ledger-core",
        "group_name": "core",
        "tests": [
            {"class_name": "LedgerTest", "method_name": "opens",
             "start_time": "2024-06-15T12:00:00Z", "end_time": "2024-06-15T12:00:01Z",
             "statuses": ["RUNNING", "FAIL"]},
            {"class_name": "LedgerTest", "method_name": "closes",
             "start_time": "2024-06-15T12:00:00Z",
             "statuses": ["RUNNING"]}
        ]
    }]
}"#;

/// Write a config pointing at a database inside `dir`.
fn config_in(dir: &Path) -> PathBuf {
    let path = dir.join("testrollup.toml");
    let db = dir.join("rollup.db");
    std::fs::write(
        &path,
        format!("[storage]\ndatabase_path = {:?}\n", db.to_str().unwrap()),
    )
    .unwrap();
    path
}

fn cli(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("testrollup").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("TESTROLLUP_CONFIG")
        .arg("--config")
        .arg(config);
    cmd
}

fn import(config: &Path, dir: &Path, name: &str, doc: &str) {
    let file = dir.join(name);
    std::fs::write(&file, doc).unwrap();
    cli(config)
        .args(["import", "--file"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported build"));
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("testrollup")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Test-status reconciliation"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("testrollup")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("testrollup"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["init", "--help"],
        vec!["import", "--help"],
        vec!["status", "merge", "--help"],
        vec!["status", "set", "--help"],
        vec!["rollup", "build", "--help"],
        vec!["rollup", "groups", "--help"],
        vec!["history", "last-failure", "--help"],
    ] {
        Command::cargo_bin("testrollup")
            .unwrap()
            .args(&args)
            .assert()
            .success();
    }
}

#[test]
fn test_init_creates_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    cli(&config)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Database ready"));
    assert!(dir.path().join("rollup.db").exists());
}

#[test]
fn test_import_rollup_merge_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    import(&config, dir.path(), "earlier.json", EARLIER);
    import(&config, dir.path(), "later.json", LATER);

    // Build 2 holds executions 2 (FAIL) and 3 (RUNNING).
    cli(&config)
        .args(["rollup", "build", "--build", "2", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"state\": \"available\""))
        .stdout(predicate::str::contains("\"FAIL\": 1"))
        .stdout(predicate::str::contains("\"RUNNING\": 1"));

    cli(&config)
        .args(["history", "last-pass", "--execution", "2", "--category", "unit", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"id\": 1"));

    cli(&config)
        .args(["status", "merge", "--execution", "3", "--status", "PASS"])
        .assert()
        .success()
        .stdout(predicate::str::contains("RUNNING -> PASS"));

    cli(&config)
        .args(["status", "merge", "--execution", "2", "--status", "PASS"])
        .assert()
        .success()
        .stdout(predicate::str::contains("unchanged"));

    cli(&config)
        .args(["rollup", "group", "--build", "2", "--group", "core"])
        .assert()
        .success()
        .stdout(predicate::str::contains("core"));
}

#[test]
fn test_unknown_execution_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    cli(&config)
        .args(["status", "merge", "--execution", "99", "--status", "PASS"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("execution 99 not found"));
}

#[test]
fn test_wrong_category_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    import(&config, dir.path(), "earlier.json", EARLIER);
    cli(&config)
        .args(["history", "full", "--execution", "1", "--category", "ui"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("belongs to category unit"));
}
