#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Write a config pointing the database into `dir`.
fn write_config(dir: &TempDir, secret: &str) {
    let db = dir.path().join("data/issueflow.db");
    let yaml = format!(
        "webhook:\n  secret: \"{secret}\"\ndatabase:\n  path: \"{}\"\n",
        db.display()
    );
    std::fs::write(dir.path().join("issueflow.yaml"), yaml).unwrap();
}

fn issueflow(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("issueflow").unwrap();
    cmd.current_dir(dir.path())
        .env("ISSUEFLOW_CONFIG", dir.path().join("issueflow.yaml"))
        .env_remove("GITHUB_WEBHOOK_SECRET")
        .env_remove("GITHUB_TOKEN")
        .env_remove("ISSUEFLOW_LLM_API_KEY")
        .env_remove("ISSUEFLOW_DATABASE")
        .env_remove("RUST_LOG");
    cmd
}

// ---------------------------------------------------------------------------
// issueflow config
// ---------------------------------------------------------------------------

#[test]
fn config_check_passes_with_secret() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "s3cret");
    issueflow(&dir)
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("llm api key is empty"));
}

#[test]
fn config_check_fails_without_secret() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "");
    issueflow(&dir)
        .args(["config", "check"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("webhook secret is empty"))
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn config_check_reads_secret_from_environment() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "");
    issueflow(&dir)
        .env("GITHUB_WEBHOOK_SECRET", "from-env")
        .args(["config", "check", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"ok\": true"));
}

#[test]
fn config_show_redacts_secrets() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "s3cret");
    issueflow(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<redacted>"))
        .stdout(predicate::str::contains("s3cret").not());
}

#[test]
fn malformed_config_is_reported() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("issueflow.yaml"), "server: [not, a, map]\n").unwrap();
    issueflow(&dir)
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}

// ---------------------------------------------------------------------------
// Inspection commands
// ---------------------------------------------------------------------------

#[test]
fn status_of_unknown_issue_is_not_started() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "s3cret");
    issueflow(&dir)
        .args(["status", "--repo", "org/shop", "--issue", "12"])
        .assert()
        .success()
        .stdout(predicate::str::contains("org/shop#12: not_started"));
}

#[test]
fn status_json_reports_existence() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "s3cret");
    let out = issueflow(&dir)
        .args(["status", "--repo", "org/shop", "--issue", "12", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let json: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(json["exists"], false);
    assert_eq!(json["stage"], "not_started");
}

#[test]
fn empty_database_lists_nothing() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "s3cret");
    issueflow(&dir)
        .arg("conversations")
        .assert()
        .success()
        .stdout(predicate::str::contains("No conversations."));
    issueflow(&dir)
        .arg("actions")
        .assert()
        .success()
        .stdout(predicate::str::contains("No actions recorded."));
    issueflow(&dir)
        .arg("reconcile")
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to reconcile."));
    assert!(dir.path().join("data/issueflow.db").exists());
}

#[test]
fn actions_json_is_an_array() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "s3cret");
    issueflow(&dir)
        .args(["actions", "--json", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("[]"));
}

#[test]
fn actions_rejects_zero_limit() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "s3cret");
    issueflow(&dir)
        .args(["actions", "--limit", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--limit must be greater than 0"));
}

#[test]
fn serve_refuses_to_start_without_secret() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "");
    issueflow(&dir)
        .args(["serve", "--port", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("webhook secret is empty"));
}

#[test]
fn sync_reports_missing_github_integration() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "s3cret");
    issueflow(&dir)
        .args(["sync", "--repo", "org/shop", "--pr", "12"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("pull request #12"));
}

#[test]
fn help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    issueflow(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("reconcile"))
        .stdout(predicate::str::contains("sync"));
}
