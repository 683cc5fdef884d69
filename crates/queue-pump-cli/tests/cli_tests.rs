//! Black-box tests of the `queue-pump` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn queue_pump() -> Command {
    let mut cmd = Command::cargo_bin("queue-pump").unwrap();
    cmd.env_remove("QP_CONFIG").env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_help_lists_commands() {
    queue_pump()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("dead-letters"));
}

#[test]
fn test_config_shows_environment_settings() {
    let dir = TempDir::new().unwrap();

    queue_pump()
        .env("QP__FILE__PATH", dir.path().join("queue"))
        .env("QP__PUMP__RETRY_COUNT", "9")
        .args(["config", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"retry_count\": 9"));
}

#[test]
fn test_missing_file_path_exits_with_configuration_code() {
    queue_pump()
        .env_remove("QP__FILE__PATH")
        .args(["config"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("file.path"));
}

#[test]
fn test_send_then_list_empty_dead_letters() {
    let dir = TempDir::new().unwrap();
    let queue = dir.path().join("queue");

    queue_pump()
        .env("QP__FILE__PATH", &queue)
        .args(["send", "-n", "2"])
        .assert()
        .success();

    queue_pump()
        .env("QP__FILE__PATH", &queue)
        .arg("dead-letters")
        .assert()
        .success()
        .stdout(predicate::str::contains("No dead-lettered records"));
}
