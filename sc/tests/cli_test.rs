//! Tests for the sc binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn sc() -> Command {
    let mut cmd = Command::cargo_bin("sc").expect("binary builds");
    cmd.env("NO_COLOR", "1");
    cmd
}

#[test]
fn test_counter_with_updates() {
    sc().args(["counter", "--callers", "4", "--ops", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total: 40"));
}

#[test]
fn test_counter_with_casts_on_thread() {
    sc().args(["counter", "-n", "3", "--ops", "7", "--cast", "--thread"])
        .assert()
        .success()
        .stdout(predicate::str::contains("total: 21"));
}

#[test]
fn test_queue_pops_in_push_order() {
    sc().args(["queue", "--items", "3"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("item-1[\\s\\S]*item-2[\\s\\S]*item-3").unwrap());
}

#[test]
fn test_config_prints_loaded_file() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let path = temp.path().join("statecell.yml");
    std::fs::write(&path, "call_timeout_ms: 1234\n").unwrap();

    sc().arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("call_timeout_ms: 1234"));
}

#[test]
fn test_missing_config_file_fails() {
    sc().args(["--config", "/nonexistent/statecell.yml", "config"])
        .assert()
        .failure();
}

#[test]
fn test_config_write_saves_loaded_file() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let source = temp.path().join("statecell.yml");
    std::fs::write(&source, "call_timeout_ms: 250\ninit_timeout_ms: 40\n").unwrap();
    let target = temp.path().join("written.yml");

    sc().arg("--config")
        .arg(&source)
        .arg("config")
        .arg("--write")
        .arg(&target)
        .assert()
        .success()
        .stdout(predicate::str::contains("wrote"));

    let written = statecell::Config::load_from_file(&target).unwrap();
    assert_eq!(written.call_timeout_ms, 250);
    assert_eq!(written.init_timeout_ms, Some(40));
}
