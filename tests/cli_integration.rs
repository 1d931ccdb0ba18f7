//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end.

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

/// Get the binary to test.
fn toolrelay() -> Command {
    let mut cmd = Command::cargo_bin("toolrelay").unwrap();
    cmd.env_remove("TOOLRELAY_CONFIG").env_remove("RUST_LOG");
    cmd
}

/// A service nobody listens on.
const UNREACHABLE: &str = "http://127.0.0.1:1/mcp";

/// Write `contents` as a config file in a fresh temp dir.
fn config_file(contents: &str) -> TempDir {
    let temp = TempDir::new().unwrap();
    temp.child("toolrelay.toml").write_str(contents).unwrap();
    temp
}

/// Run the binary inside `temp` with its config file.
fn with_config(temp: &TempDir) -> Command {
    let mut cmd = toolrelay();
    cmd.current_dir(temp.path()).arg("--config").arg(temp.child("toolrelay.toml").path());
    cmd
}

fn unreachable_config() -> String {
    format!(
        r#"
[registry]
discover_tools = false

[health]
failure_threshold = 1
probe_timeout_ms = 500
aggregate_timeout_ms = 1000

[[services]]
name = "docs"
server_url = "{UNREACHABLE}"
retries = 0
timeout_ms = 500
tools = ["search_docs", "get_doc"]
"#
    )
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    toolrelay()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Multi-service MCP tool client"));
}

#[test]
fn test_version_flag() {
    toolrelay()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_call_command_help() {
    toolrelay()
        .args(["call", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--args"))
        .stdout(predicate::str::contains("--force"));
}

#[test]
fn test_unknown_subcommand() {
    toolrelay().arg("frobnicate").assert().failure();
}

// ============================================================================
// Config Command Tests
// ============================================================================

#[test]
fn test_config_validate_valid() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid (1 services"));
}

#[test]
fn test_config_validate_reports_errors() {
    let temp = config_file(&format!(
        r#"
[retry]
jitter_ratio = 2.0

[[services]]
name = "docs"
server_url = "{UNREACHABLE}"

[[services]]
name = "docs"
server_url = "{UNREACHABLE}"

[[tools]]
id = "search_docs"
service = "nowhere"
"#
    ));
    with_config(&temp)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("defined twice"))
        .stdout(predicate::str::contains("jitter_ratio"))
        .stdout(predicate::str::contains("nowhere"));
}

#[test]
fn test_config_validate_unknown_profile() {
    let temp = config_file(
        r#"
[[services]]
name = "tasks"
profile = "jira"
"#,
    );
    with_config(&temp)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Unknown service profile 'jira'"));
}

#[test]
fn test_config_show() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[[services]]"))
        .stdout(predicate::str::contains("name = \"docs\""))
        .stdout(predicate::str::contains("failure_threshold = 1"));
}

#[test]
fn test_config_path() {
    toolrelay()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(".toolrelay.toml"));
}

#[test]
fn test_missing_config_file() {
    let temp = TempDir::new().unwrap();
    toolrelay()
        .current_dir(temp.path())
        .args(["--config", "does-not-exist.toml", "config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn test_malformed_config_file() {
    let temp = config_file("[[services]\nname = ");
    with_config(&temp)
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn test_local_dotfile_is_picked_up() {
    let temp = TempDir::new().unwrap();
    temp.child(".toolrelay.toml").write_str(&unreachable_config()).unwrap();
    toolrelay()
        .current_dir(temp.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("name = \"docs\""));
}

// ============================================================================
// Tools & Status Tests
// ============================================================================

#[test]
fn test_tools_lists_declared_tools() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .arg("tools")
        .assert()
        .success()
        .stdout(predicate::str::contains("search_docs"))
        .stdout(predicate::str::contains("get_doc"));
}

#[test]
fn test_tools_json_format() {
    let temp = config_file(&unreachable_config());
    let output = with_config(&temp).args(["tools", "--format", "json"]).output().unwrap();
    assert!(output.status.success());

    let tools: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = tools.as_array().unwrap().iter().filter_map(|t| t["id"].as_str()).collect();
    assert_eq!(ids, vec!["get_doc", "search_docs"]);
}

#[test]
fn test_tools_probe_hides_down_service() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .args(["tools", "--probe"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tools available"));
}

#[test]
fn test_status_json_reports_down_service() {
    let temp = config_file(&unreachable_config());
    let output = with_config(&temp).args(["status", "--format", "json"]).output().unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["services"]["docs"]["status"], "DOWN");
    assert_eq!(report["services"]["docs"]["consecutiveFailures"], 1);
    assert_eq!(report["alerts"].as_array().unwrap().len(), 1);
}

#[test]
fn test_status_text_table() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("SERVICE"))
        .stdout(predicate::str::contains("docs"))
        .stdout(predicate::str::contains("DOWN"));
}

// ============================================================================
// Call Command Tests
// ============================================================================

#[test]
fn test_call_rejects_invalid_json_args() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .args(["call", "search_docs", "--args", "{not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--args must be valid JSON"));
}

#[test]
fn test_call_rejects_non_object_args() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .args(["call", "search_docs", "--args", "[1, 2]"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be a JSON object"));
}

#[test]
fn test_call_unknown_tool() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .args(["call", "delete_everything"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("tool not found"));
}

#[test]
fn test_call_unreachable_service() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .args(["call", "search_docs", "--args", r#"{"query": "roadmap"}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("currently unavailable"))
        .stderr(predicate::str::contains("NETWORK"));
}

#[test]
fn test_stream_unknown_tool_fails_before_streaming() {
    let temp = config_file(&unreachable_config());
    with_config(&temp)
        .args(["stream", "missing_tool"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}
