//! Tests for the cardwall binary: output formats and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const PROJECT: &str = r#"
[project]
identifier = "agile"
name = "Agile Project"

[[card_types]]
name = "Release"

[[card_types]]
name = "Iteration"
properties = ["Status"]

[[card_types]]
name = "Story"
properties = ["Points", "Status"]

[[properties]]
name = "Points"
kind = "enum"
numeric = true
values = ["1", "2", "3", "5", "8"]

[[properties]]
name = "Status"
kind = "enum"
values = ["open", "closed"]

[[trees]]
name = "Planning"
levels = ["Release", "Iteration", "Story"]

[[aggregates]]
name = "Total Points"
tree = "Planning"
card_type = "Release"
function = "sum"
target = "Points"

[[formulas]]
name = "Double Points"
formula = "Points * 2"
card_types = ["Story"]

[[views]]
name = "Open stories"
params = { filters = ["[Type][is][Story]", "[Status][is][open]"], mql = ["SELECT Name, Points WHERE Points > 2"] }
"#;

/// Temp dir holding `cardwall.toml` and a command running inside it.
fn setup(config: &str) -> (TempDir, Command) {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join("cardwall.toml"), config).unwrap();
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("cardwall"));
    cmd.current_dir(temp_dir.path());
    (temp_dir, cmd)
}

#[test]
fn test_compile_prints_all_sql_forms() {
    let (_temp_dir, mut cmd) = setup(PROJECT);
    cmd.args(["compile", "SELECT Name, Points WHERE Points > 3 AND Type = Story"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-- values"))
        .stdout(predicate::str::contains("-- count"))
        .stdout(predicate::str::contains("COUNT(*)"))
        .stdout(predicate::str::contains("\"agile_cards\""));
}

#[test]
fn test_compile_quiet_prints_only_sql() {
    let (_temp_dir, mut cmd) = setup(PROJECT);
    let output = cmd
        .args(["compile", "WHERE Type = Story", "--quiet"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout.lines().count(), 4, "{}", stdout);
    assert!(stdout.lines().all(|l| l.starts_with("SELECT") && l.ends_with(';')));
}

#[test]
fn test_compile_json_envelope() {
    let (_temp_dir, mut cmd) = setup(PROJECT);
    let output = cmd
        .args(["--json", "compile", "select Name where Points > 3"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["metadata"]["command"], "compile");
    assert_eq!(json["data"]["mql"], "SELECT Name WHERE Points > 3");
    assert!(json["data"]["count_sql"].as_str().unwrap().contains("COUNT(*)"));
}

#[test]
fn test_syntax_error_exit_code() {
    let (_temp_dir, mut cmd) = setup(PROJECT);
    cmd.args(["compile", "WHERE Points >"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_as_of_with_tree_is_invalid_query() {
    let (_temp_dir, mut cmd) = setup(PROJECT);
    let output = cmd
        .args([
            "--json",
            "compile",
            "FROM TREE Planning WHERE Type = Story AS OF '2024-01-01'",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["error"]["code"], "INVALID_QUERY");
    assert_eq!(json["error"]["message"], "AS OF cannot be used with FROM TREE.");
}

#[test]
fn test_validate_reports_counts_and_order() {
    let (_temp_dir, mut cmd) = setup(PROJECT);
    cmd.arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Project Agile Project is valid."))
        .stdout(predicate::str::contains("Double Points"))
        .stdout(predicate::str::contains("Total Points"));
}

#[test]
fn test_validate_lists_every_problem() {
    let broken = PROJECT.replace("target = \"Points\"", "target = \"Estimate\"")
        + "\n[[views]]\nname = \"Bad\"\nparams = { filters = [\"[Colour][is][red]\"] }\n";
    let (_temp_dir, mut cmd) = setup(&broken);
    let output = cmd.args(["--json", "validate"]).output().unwrap();
    assert_eq!(output.status.code(), Some(4));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let errors = json["error"]["details"]["errors"].as_array().unwrap();
    assert!(errors.iter().any(|e| e.as_str().unwrap().contains("Estimate")));
    assert!(errors.iter().any(|e| e.as_str().unwrap().starts_with("View Bad: ")));
}

#[test]
fn test_missing_config_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    Command::new(assert_cmd::cargo::cargo_bin!("cardwall"))
        .current_dir(temp_dir.path())
        .arg("validate")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_describe_filter_with_tree_levels() {
    let (_temp_dir, mut cmd) = setup(PROJECT);
    cmd.args([
        "describe-filter",
        "--tree",
        "Planning",
        "--level",
        "Iteration=[Status][is][open]",
        "--exclude",
        "Release",
    ])
    .assert()
    .success()
    .stdout(predicate::str::contains(
        "Iteration: Status is open; excluding Release",
    ))
    .stdout(predicate::str::contains("'Planning - Iteration' IN (SELECT"));
}

#[test]
fn test_describe_filter_unknown_value() {
    let (_temp_dir, mut cmd) = setup(PROJECT);
    cmd.args(["describe-filter", "[Status][is][blocked]"])
        .assert()
        .code(4);
}
