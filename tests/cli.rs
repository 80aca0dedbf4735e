// tests/cli.rs

//! Drives the built binary.

use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_kmsdisplay");

#[test]
fn missing_device_prints_one_diagnostic_and_fails() {
    let output = Command::new(BIN)
        .args(["--device", "/nonexistent/dri/card0", "--timeout-ms", "10"])
        .env("RUST_LOG", "off")
        .env_remove("KMSDISPLAY_DEVICE")
        .env_remove("KMSDISPLAY_CONFIG")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    assert_eq!(lines.len(), 1, "stderr: {stderr}");
    assert!(
        lines[0].starts_with("kmsdisplay: open device failed: cannot open /nonexistent/dri/card0"),
        "stderr: {stderr}"
    );
}

#[test]
fn default_logging_still_prints_the_failure_once() {
    let output = Command::new(BIN)
        .args(["--device", "/nonexistent/dri/card0", "--timeout-ms", "10"])
        .env_remove("RUST_LOG")
        .env_remove("KMSDISPLAY_DEVICE")
        .env_remove("KMSDISPLAY_CONFIG")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mentions = stderr.lines().filter(|l| l.contains("open device failed")).count();
    assert_eq!(mentions, 1, "stderr: {stderr}");
    assert_eq!(stderr.lines().count(), 1, "stderr: {stderr}");
}

#[test]
fn environment_selects_the_device() {
    let output = Command::new(BIN)
        .arg("probe")
        .env("RUST_LOG", "off")
        .env("KMSDISPLAY_DEVICE", "/nonexistent/dri/card9")
        .env_remove("KMSDISPLAY_CONFIG")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("/nonexistent/dri/card9"));
}

#[test]
fn unreadable_config_is_a_setup_failure() {
    let output = Command::new(BIN)
        .args(["--config", "/nonexistent/kmsdisplay.json"])
        .env("RUST_LOG", "off")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr)
        .starts_with("kmsdisplay: setup failed: Failed to read config file"));
}

#[test]
fn probe_on_a_missing_device_reports_through_the_terminal() -> Result<(), rexpect::error::Error> {
    let mut session = rexpect::spawn(
        &format!("{BIN} probe --device /nonexistent/dri/card0 --width 64 --height 64"),
        Some(5_000),
    )?;
    session.exp_string("kmsdisplay: open device failed")?;
    session.exp_eof()?;
    Ok(())
}

#[test]
fn help_lists_both_subcommands() -> Result<(), rexpect::error::Error> {
    let mut session = rexpect::spawn(&format!("{BIN} --help"), Some(5_000))?;
    session.exp_string("show")?;
    session.exp_string("probe")?;
    session.exp_eof()?;
    Ok(())
}
