//! CLI command contract tests.
//!
//! Each test runs `aledger` against a temp data directory through an
//! explicit config file, so nothing touches real state and no command
//! needs network access.
//!
//! Contract guarantees tested:
//! - Deterministic exit codes
//! - Stable JSON fields in `--format json` mode
//! - Actionable error messages for failure paths

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test fixture helpers
// =============================================================================

/// Temp dir holding `activity-ledger.toml` with its data dir beside it.
fn setup_workspace(extra: &str) -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("create temp dir");
    let data_dir = dir.path().join("data");
    let config_path = dir.path().join("activity-ledger.toml");
    let config = format!(
        "[storage]\ndata_dir = {data:?}\n\n[source]\ntoken_env = \"ALEDGER_TEST_TOKEN_NEVER_SET\"\n\n{extra}",
        data = data_dir.to_string_lossy()
    );
    std::fs::write(&config_path, config).expect("write config");
    (dir, config_path)
}

#[allow(deprecated)]
fn aledger(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("aledger").expect("aledger binary should be built");
    cmd.arg("--config").arg(config);
    cmd.env_remove("ACTIVITY_LEDGER_CONFIG");
    cmd.env_remove("RUST_LOG");
    cmd
}

// =============================================================================
// config
// =============================================================================

#[test]
fn config_check_accepts_valid_file() {
    let (_dir, config) = setup_workspace("");
    aledger(&config)
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config OK"))
        .stdout(predicate::str::contains("ledger.db"));
}

#[test]
fn config_check_rejects_invalid_values() {
    let (_dir, config) = setup_workspace("[ledger]\nparallelism = 0\n");
    aledger(&config)
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ledger.parallelism"));
}

#[test]
fn config_show_json_is_parseable() {
    let (_dir, config) = setup_workspace("");
    let output = aledger(&config)
        .args(["--format", "json", "config", "show"])
        .output()
        .expect("run aledger");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(value["ledger"]["parallelism"], 5);
    assert_eq!(value["source"]["token_env"], "ALEDGER_TEST_TOKEN_NEVER_SET");
}

// =============================================================================
// Store-only commands on an empty ledger
// =============================================================================

#[test]
fn stats_json_on_empty_ledger() {
    let (_dir, config) = setup_workspace("");
    let output = aledger(&config)
        .args(["--format", "json", "stats", "--community", "42"])
        .output()
        .expect("run aledger");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("valid JSON");
    assert_eq!(value["community"], 42);
    assert_eq!(value["total_messages"], 0);
    assert_eq!(value["backfill"]["status"], "not_started");
}

#[test]
fn top_and_audits_report_empty_state() {
    let (_dir, config) = setup_workspace("");
    aledger(&config)
        .args(["top", "--community", "42"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No counted messages yet."));
    aledger(&config)
        .args(["audits", "--community", "42", "--kind", "daily"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No audits recorded."));
}

#[test]
fn reset_on_empty_ledger_removes_nothing() {
    let (_dir, config) = setup_workspace("");
    aledger(&config)
        .args(["reset", "--community", "42"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 counters, 0 members, 0 cache entries"));
}

#[test]
fn cache_clear_json_reports_count() {
    let (_dir, config) = setup_workspace("");
    aledger(&config)
        .args(["--format", "json", "cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\":0"));
}

// =============================================================================
// Failure paths
// =============================================================================

#[test]
fn backfill_without_token_names_the_variable() {
    let (_dir, config) = setup_workspace("");
    aledger(&config)
        .env_remove("ALEDGER_TEST_TOKEN_NEVER_SET")
        .args(["backfill", "--community", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ALEDGER_TEST_TOKEN_NEVER_SET"));
}

#[test]
fn unknown_audit_kind_is_a_usage_error() {
    let (_dir, config) = setup_workspace("");
    aledger(&config)
        .args(["audits", "--community", "42", "--kind", "hourly"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown audit kind"));
}

#[test]
fn missing_community_is_a_usage_error() {
    let (_dir, config) = setup_workspace("");
    aledger(&config).args(["stats"]).assert().code(2);
}
