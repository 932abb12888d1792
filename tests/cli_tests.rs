//! Tests for the `querydeck` binary: JSON records on stdout, one per command

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

fn records(output: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(output)
        .lines()
        .map(|line| serde_json::from_str(line).expect("stdout carries only JSON"))
        .collect()
}

#[test]
fn test_help_lists_commands() {
    let output = Command::cargo_bin("querydeck")
        .unwrap()
        .write_stdin(":help\n:quit\n")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines = records(&output);
    assert_eq!(lines.len(), 2);
    let commands = lines[0]["commands"].as_array().unwrap();
    assert!(commands.iter().any(|c| c.as_str().unwrap().starts_with(":open")));
}

#[test]
fn test_open_query_and_wait() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("cli.db");
    let script = "CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (7)\n:wait\n";

    let output = Command::cargo_bin("querydeck")
        .unwrap()
        .arg(db.to_str().unwrap())
        .write_stdin(script)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines = records(&output);
    assert_eq!(lines[0]["connectionId"], "conn_1");
    let query_id = lines[1]["queryId"].as_str().unwrap().to_string();
    assert_eq!(lines[2]["queryId"], query_id.as_str());
    assert_eq!(lines[2]["status"], "completed");
    assert_eq!(lines[2]["results"].as_array().unwrap().len(), 2);

    let script = format!(":open {}\n:count SELECT * FROM t\n:tables\n", db.to_str().unwrap());
    let output = Command::cargo_bin("querydeck")
        .unwrap()
        .write_stdin(script)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let lines = records(&output);
    assert!(query_id.starts_with("query_"));
    assert_eq!(lines[1]["count"], 1);
    assert_eq!(lines[2]["tables"][0], "t");
}

#[test]
fn test_errors_are_reported_as_records() {
    let output = Command::cargo_bin("querydeck")
        .unwrap()
        .write_stdin("SELECT 1\n:poll query_missing\n:bogus\n")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let lines = records(&output);
    assert_eq!(lines[0]["error"]["kind"], "ConnectionNotFound");
    assert_eq!(lines[1]["error"]["kind"], "NotFound");
    assert_eq!(lines[2]["error"]["kind"], "UnknownCommand");
}

#[test]
fn test_bad_config_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "[cache]\nenabled = \"maybe\"\n").unwrap();

    Command::cargo_bin("querydeck")
        .unwrap()
        .arg("--config")
        .arg(config.to_str().unwrap())
        .write_stdin(":quit\n")
        .assert()
        .failure();
}
