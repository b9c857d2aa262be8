//! CLI tests for `labproxy` failures that never reach a working server.
//!
//! Spawns the client binary and verifies each proxy-level failure exits with
//! its reserved code rather than something a device tool could return.

use std::process::Command;

use labproxy::client::URL_ENV;
use labproxy::exit_codes;

/// Nothing listens on port 1, so connecting fails immediately.
const DEAD_URL: &str = "127.0.0.1:1";

fn labproxy() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_labproxy"));
    cmd.env_remove(URL_ENV).env("RUST_LOG", "off");
    cmd
}

#[test]
fn missing_url_is_usage_error() {
    let output = labproxy()
        .args(["adb", "devices"])
        .output()
        .expect("labproxy");

    assert_eq!(output.status.code(), Some(exit_codes::USAGE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(URL_ENV), "{stderr}");
}

#[test]
fn missing_command_is_usage_error() {
    let output = labproxy()
        .args(["--url", DEAD_URL])
        .output()
        .expect("labproxy");
    assert_eq!(output.status.code(), Some(exit_codes::USAGE));
}

#[test]
fn unknown_command_fails_before_connecting() {
    let status = labproxy()
        .args(["--url", DEAD_URL, "rm", "-rf", "/"])
        .status()
        .expect("labproxy");
    assert_eq!(status.code(), Some(exit_codes::UNKNOWN_COMMAND));
}

#[test]
fn grammar_violation_is_invalid_arguments() {
    let status = labproxy()
        .args(["--url", DEAD_URL, "idevicescreenshot", "-u", "not-a-udid", "x.png"])
        .status()
        .expect("labproxy");
    assert_eq!(status.code(), Some(exit_codes::INVALID_ARGUMENTS));
}

#[test]
fn missing_input_file_is_local_file_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let apk = temp.path().join("missing.apk");
    let output = labproxy()
        .args(["--url", DEAD_URL, "adb", "install"])
        .arg(&apk)
        .output()
        .expect("labproxy");

    assert_eq!(output.status.code(), Some(exit_codes::LOCAL_FILE));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("missing.apk"), "{stderr}");
}

#[test]
fn unreachable_server_is_transport_error() {
    let status = labproxy()
        .env(URL_ENV, DEAD_URL)
        .args(["adb", "devices"])
        .status()
        .expect("labproxy");
    assert_eq!(status.code(), Some(exit_codes::TRANSPORT));
}

#[cfg(unix)]
#[test]
fn symlink_named_after_tool_acts_as_that_tool() {
    let temp = tempfile::tempdir().expect("tempdir");
    let link = temp.path().join("adb");
    std::os::unix::fs::symlink(env!("CARGO_BIN_EXE_labproxy"), &link).expect("symlink");

    let status = Command::new(&link)
        .env(URL_ENV, DEAD_URL)
        .env("RUST_LOG", "off")
        .args(["devices"])
        .status()
        .expect("adb symlink");
    assert_eq!(status.code(), Some(exit_codes::TRANSPORT));

    let status = Command::new(&link)
        .env(URL_ENV, DEAD_URL)
        .env("RUST_LOG", "off")
        .args(["frobnicate"])
        .status()
        .expect("adb symlink");
    assert_eq!(status.code(), Some(exit_codes::INVALID_ARGUMENTS));
}
