//! Command-line smoke tests. None of these need a Docker daemon.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

const REPORT: &str = r#"{
  "handler": {"file": "index.js", "export": "handler", "type": "async",
              "confidence": "high", "source": "package.json"},
  "environment": [{"name": "TABLE_NAME", "hasDefault": true, "defaultValue": "orders"}],
  "awsServices": [{"service": "dynamodb", "operations": ["PutItem"], "sdkVersion": "v3"}],
  "tests": [],
  "warnings": []
}"#;

const FAKE_ANALYZER_CONFIG: &str = r#"
[analyzer]
program = "sh"
args = ["-c", "cat \"$1/report.json\"", "analyzer"]
timeout_secs = 10
"#;

fn lth(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("lth").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_variants_lists_defaults() {
    let dir = tempfile::tempdir().unwrap();

    lth(dir.path())
        .arg("variants")
        .assert()
        .success()
        .stdout(predicate::str::contains("nodejs:20"))
        .stdout(predicate::str::contains("public.ecr.aws/lambda/nodejs:24"));
}

#[test]
fn test_variants_reads_config() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("custom.toml"),
        "[[variants]]\nid = \"node-canary\"\nimage = \"registry.local/node:canary\"\n",
    )
    .unwrap();

    lth(dir.path())
        .args(["-c", "custom.toml", "variants"])
        .assert()
        .success()
        .stdout(predicate::str::contains("node-canary"))
        .stdout(predicate::str::contains("nodejs:20").not());
}

#[test]
fn test_init_writes_config_once() {
    let dir = tempfile::tempdir().unwrap();

    lth(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created lth.toml"));

    let written = std::fs::read_to_string(dir.path().join("lth.toml")).unwrap();
    let config = lambda_harness::config::load_config_str(&written).unwrap();
    assert_eq!(config.harness.max_parallel, 4);
    assert_eq!(config.variants.len(), 3);

    lth(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_analyze_prints_report() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = dir.path().join("fn");
    std::fs::create_dir(&pkg).unwrap();
    std::fs::write(pkg.join("report.json"), REPORT).unwrap();
    std::fs::write(dir.path().join("lth.toml"), FAKE_ANALYZER_CONFIG).unwrap();

    lth(dir.path())
        .args(["analyze", "fn"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Handler: index.handler"))
        .stdout(predicate::str::contains("TABLE_NAME = orders"))
        .stdout(predicate::str::contains("dynamodb [v3] PutItem"));

    lth(dir.path())
        .args(["analyze", "fn", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""awsServices""#))
        .stdout(predicate::str::contains(r#""defaultValue": "orders""#));
}

#[test]
fn test_analyze_missing_path_fails() {
    let dir = tempfile::tempdir().unwrap();

    lth(dir.path())
        .args(["analyze", "does-not-exist"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid package path"));
}

#[test]
fn test_unknown_variant_is_rejected() {
    let dir = tempfile::tempdir().unwrap();

    lth(dir.path())
        .args(["test", ".", "-n", "python3.12", "--skip-analysis"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown runtime variant 'python3.12'"));
}
