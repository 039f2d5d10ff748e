//! Integration tests for the `arlo-sync` binary.
//!
//! Cover argument parsing and the configuration failures that end the
//! process before any network traffic.
#![allow(clippy::unwrap_used)]

use std::io::Write;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// Command with every `ARLO_*` variable cleared and the home directory
/// pointed somewhere empty.
fn arlo_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("arlo-sync");
    cmd.env("HOME", "/tmp/arlo-sync-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/arlo-sync-test-nonexistent")
        .env_remove("ARLO_PROFILE")
        .env_remove("ARLO_DEFAULT_PROFILE")
        .env_remove("ARLO_USERNAME")
        .env_remove("ARLO_PASSWORD")
        .env_remove("RUST_LOG");
    cmd
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    arlo_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("Arlo")
            .and(predicate::str::contains("--profile"))
            .and(predicate::str::contains("--no-wait")),
    );
}

#[test]
fn test_version_flag() {
    arlo_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("arlo-sync"));
}

#[test]
fn test_unknown_flag_is_usage_error() {
    arlo_cmd().arg("--bogus").assert().code(2);
}

// ── Configuration failures ──────────────────────────────────────────

#[test]
fn test_missing_config_reports_missing_profile() {
    arlo_cmd()
        .args(["--config", "/tmp/arlo-sync-test-nonexistent/config.toml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Profile 'default' not found"));
}

#[test]
fn test_unknown_profile_lists_available() {
    let file = config_file(
        r#"
[profiles.home]
username = "me@example.com"
"#,
    );
    arlo_cmd()
        .arg("--config")
        .arg(file.path())
        .args(["--profile", "cabin"])
        .assert()
        .code(1)
        .stderr(
            predicate::str::contains("Profile 'cabin' not found")
                .and(predicate::str::contains("home")),
        );
}

#[test]
fn test_profile_without_username_is_auth_error() {
    let file = config_file(
        r#"
default_profile = "home"

[profiles.home]
password = "hunter2"
"#,
    );
    arlo_cmd()
        .arg("--config")
        .arg(file.path())
        .assert()
        .code(3)
        .stderr(predicate::str::contains("No credentials configured for profile 'home'"));
}

#[test]
fn test_invalid_host_is_validation_error() {
    let file = config_file(
        r#"
[profiles.default]
username = "me@example.com"
host = "not a url"
"#,
    );
    arlo_cmd()
        .arg("--config")
        .arg(file.path())
        .env("ARLO_PASSWORD", "hunter2")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("host"));
}

#[test]
fn test_mailbox_code_source_is_rejected() {
    let file = config_file(
        r#"
[profiles.default]
username = "me@example.com"

[profiles.default.tfa]
source = "imap"
"#,
    );
    arlo_cmd()
        .arg("--config")
        .arg(file.path())
        .env("ARLO_PASSWORD", "hunter2")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("tfa.source").and(predicate::str::contains("console")));
}
