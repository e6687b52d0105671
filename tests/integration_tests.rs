//! Integration tests for relwatch CLI commands
//!
//! These tests run the actual binary and verify its behavior. Every
//! invocation gets its own XDG environment under a temp directory, so the
//! suite never touches the real user configuration or state.

use assert_fs::{fixture::PathChild, TempDir};
use std::process::Command;

/// Build a `cargo run` command with its XDG environment jailed to `temp`
fn relwatch_cmd(temp: &TempDir) -> Command {
    let mut cmd = Command::new("cargo");
    cmd.args(&["run", "--"]);
    cmd.env("XDG_CONFIG_HOME", temp.child("config").path());
    cmd.env("XDG_DATA_HOME", temp.child("data").path());
    cmd.env("XDG_RUNTIME_DIR", temp.child("runtime").path());
    cmd.env("HOME", temp.path());
    cmd
}

/// A config that makes no real network calls and resolves failures fast
fn offline_config(temp: &TempDir) -> std::path::PathBuf {
    let config_path = temp.child("offline.yml");
    std::fs::write(
        config_path.path(),
        r#"
github:
  api_url: "http://127.0.0.1:1"
  repos: []
monitor:
  request_timeout: 2
  jitter_max: "0"
"#,
    )
    .unwrap();
    config_path.path().to_path_buf()
}

#[test]
fn test_cli_help() {
    let temp = TempDir::new().unwrap();
    let output = relwatch_cmd(&temp)
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    // Verify help contains expected commands
    assert!(stdout.contains("init"));
    assert!(stdout.contains("check"));
    assert!(stdout.contains("status"));
    assert!(stdout.contains("reset"));
    assert!(stdout.contains("daemon"));
    assert!(stdout.contains("doctor"));
}

#[test]
fn test_cli_version() {
    let temp = TempDir::new().unwrap();
    let output = relwatch_cmd(&temp)
        .arg("--version")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("relwatch"));
}

#[test]
fn test_invalid_command() {
    let temp = TempDir::new().unwrap();
    let output = relwatch_cmd(&temp)
        .arg("nonexistent-command")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("unrecognized") || stderr.contains("invalid")
    );
}

#[test]
fn test_help_subcommands() {
    let temp = TempDir::new().unwrap();
    let subcommands = vec!["init", "check", "status", "reset", "daemon", "doctor"];

    for cmd in subcommands {
        let output = relwatch_cmd(&temp)
            .args(&[cmd, "--help"])
            .output()
            .expect(&format!("Failed to execute {} help", cmd));

        assert!(output.status.success(), "Help for {} command failed", cmd);
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.len() > 0, "Help output for {} was empty", cmd);
    }
}

#[test]
fn test_init_creates_config() {
    let temp = TempDir::new().unwrap();

    let output = relwatch_cmd(&temp)
        .arg("init")
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration created"));

    let config_file = temp.child("config/relwatch/config.yml");
    assert!(config_file.path().exists());
}

#[test]
fn test_init_preserves_existing_config_without_force() {
    let temp = TempDir::new().unwrap();

    let output = relwatch_cmd(&temp).arg("init").output().unwrap();
    assert!(output.status.success());

    // Leave a mark to detect overwrites
    let config_file = temp.child("config/relwatch/config.yml");
    let mut content = std::fs::read_to_string(config_file.path()).unwrap();
    content.push_str("\n# hands off\n");
    std::fs::write(config_file.path(), &content).unwrap();

    let output = relwatch_cmd(&temp).arg("init").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("already exists"));

    let preserved = std::fs::read_to_string(config_file.path()).unwrap();
    assert!(preserved.contains("# hands off"));

    // --force resets the file to the defaults
    let output = relwatch_cmd(&temp).args(&["init", "--force"]).output().unwrap();
    assert!(output.status.success());

    let reset = std::fs::read_to_string(config_file.path()).unwrap();
    assert!(!reset.contains("# hands off"));
}

#[test]
fn test_status_with_empty_state() {
    let temp = TempDir::new().unwrap();
    let config = offline_config(&temp);

    let output = relwatch_cmd(&temp)
        .args(&["--config", config.to_str().unwrap(), "status"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("0 repositories recorded"));
    assert!(stdout.contains("Daemon not running"));
}

#[test]
fn test_check_with_no_repositories() {
    let temp = TempDir::new().unwrap();
    let config = offline_config(&temp);

    // An empty watch list makes no network calls at all
    let output = relwatch_cmd(&temp)
        .args(&["--config", config.to_str().unwrap(), "check"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Repositories checked: 0"));
}

#[test]
fn test_reset_unknown_repository() {
    let temp = TempDir::new().unwrap();
    let config = offline_config(&temp);

    let output = relwatch_cmd(&temp)
        .args(&["--config", config.to_str().unwrap(), "reset", "acme/widget"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("No recorded state"));
}

#[test]
fn test_reset_rejects_invalid_repository_id() {
    let temp = TempDir::new().unwrap();
    let config = offline_config(&temp);

    let output = relwatch_cmd(&temp)
        .args(&["--config", config.to_str().unwrap(), "reset", "notarepo"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid repository"));
}

#[test]
fn test_error_handling_invalid_config() {
    let temp = TempDir::new().unwrap();
    let config_path = temp.child("invalid-config.yml");

    std::fs::write(config_path.path(), "invalid: yaml: content: [").unwrap();

    let output = relwatch_cmd(&temp)
        .args(&["--config", config_path.path().to_str().unwrap(), "status"])
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("parse") || stderr.contains("config") || stderr.contains("yaml"));
}

#[test]
fn test_doctor_reports_diagnostics() {
    let temp = TempDir::new().unwrap();
    let config = offline_config(&temp);

    let output = relwatch_cmd(&temp)
        .args(&["--config", config.to_str().unwrap(), "doctor"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("System Diagnostics"));
    assert!(stdout.contains("Configuration"));
    assert!(stdout.contains("State Database"));
    assert!(stdout.contains("GitHub API"));
    assert!(stdout.contains("ntfy Delivery"));

    // Nothing listens on the configured API address, so that check fails
    assert!(stdout.contains("Some checks failed"));
}

#[test]
fn test_verbose_flag() {
    let temp = TempDir::new().unwrap();
    let config = offline_config(&temp);

    let output = relwatch_cmd(&temp)
        .args(&["--config", config.to_str().unwrap(), "--verbose", "status"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
}

#[test]
fn test_daemon_status_not_running() {
    let temp = TempDir::new().unwrap();
    let config = offline_config(&temp);

    let output = relwatch_cmd(&temp)
        .args(&["--config", config.to_str().unwrap(), "daemon", "status"])
        .output()
        .expect("Failed to execute command");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Not running"));
}
