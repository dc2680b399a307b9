//! Integration tests for the `cde` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get a Command instance for the cde binary
#[allow(deprecated)]
fn cde_cmd() -> Command {
    Command::cargo_bin("cde").expect("Failed to find cde binary")
}

fn state_cmd(temp_dir: &TempDir) -> Command {
    let mut cmd = cde_cmd();
    cmd.current_dir(temp_dir.path())
        .env_remove("CDE_LOG")
        .env_remove("RUST_LOG")
        .arg("--state")
        .arg(temp_dir.path().join("state.json"));
    cmd
}

/// Adding and advancing a feature persists it and leaves one backup per
/// overwrite.
#[test]
fn test_add_advance_show() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    state_cmd(&temp_dir)
        .args(["add", "feat-1", "--prompt", "Add login page"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .success()
        .stdout(predicate::str::contains("added feat-1"));

    state_cmd(&temp_dir)
        .args(["advance", "feat-1", "design"])
        .assert()
        .success()
        .stdout(predicate::str::contains("feat-1 -> design (designing)"));

    state_cmd(&temp_dir)
        .args(["show", "feat-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"current_phase\": \"design\""))
        .stdout(predicate::str::contains("Add login page"));

    state_cmd(&temp_dir)
        .arg("backups")
        .assert()
        .success()
        .stdout(predicate::str::contains("state_000001_"));
}

/// Adding the same feature twice fails without touching the file.
#[test]
fn test_add_duplicate_fails() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    state_cmd(&temp_dir)
        .args(["add", "feat-1", "--prompt", "First"])
        .assert()
        .success();

    state_cmd(&temp_dir)
        .args(["add", "feat-1", "--prompt", "Second"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    let raw = fs::read_to_string(temp_dir.path().join("state.json")).expect("read state");
    assert!(raw.contains("First"));
    assert!(!raw.contains("Second"));
}

/// Unknown phases are rejected before the state file is written.
#[test]
fn test_advance_rejects_unknown_phase() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    state_cmd(&temp_dir)
        .args(["advance", "feat-1", "shipping"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid current_phase"));

    assert!(!temp_dir.path().join("state.json").exists());
}

/// A corrupted state file still shows as an empty document.
#[test]
fn test_show_corrupt_state_is_empty() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(temp_dir.path().join("state.json"), "not json").expect("write");

    state_cmd(&temp_dir)
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"features\": {}"));
}

/// Help lists every subcommand.
#[test]
fn test_help_lists_subcommands() {
    cde_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("show"))
        .stdout(predicate::str::contains("backups"))
        .stdout(predicate::str::contains("advance"));
}
