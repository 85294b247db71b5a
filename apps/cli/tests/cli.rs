//! End-to-end tests of the `bulwark` binary

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn bulwark() -> Command {
    let mut cmd = Command::cargo_bin("bulwark").unwrap();
    cmd.env_remove("BULWARK_CONFIG").env("RUST_LOG", "off");
    cmd
}

#[test]
fn policies_prints_demo_set() {
    bulwark()
        .arg("policies")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"backendB\""))
        .stdout(predicate::str::contains("\"waitDurationInOpenState\": \"10s\""));
}

#[test]
fn unguarded_endpoint_always_succeeds() {
    bulwark()
        .args(["simulate", "ok", "--requests", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("5  b-ok"));
}

#[test]
fn open_breaker_serves_fallback() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(
        config,
        r#"{{ "policies": {{ "backendB": {{
            "circuitBreaker": {{ "slidingWindowSize": 4, "minimumNumberOfCalls": 4 }}
        }} }} }}"#
    )
    .unwrap();

    bulwark()
        .args(["simulate", "flaky", "--requests", "6", "--fail-rate", "100", "--events"])
        .arg("--config")
        .arg(config.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("4  circuit-breaker-fallback: OperationFailed"))
        .stdout(predicate::str::contains("2  circuit-breaker-fallback: CircuitOpen"))
        .stdout(predicate::str::contains(r#""type":"state_changed""#));
}

#[test]
fn bulkhead_rejects_overflow() {
    bulwark()
        .args(["simulate", "bulkhead-y", "--requests", "8", "--concurrency", "8"])
        .args(["--delay-ms", "200"])
        .assert()
        .success()
        .stdout(predicate::str::contains("5  b-ok"))
        .stdout(predicate::str::contains("3  bulkhead-fallback: BulkheadFull"));
}

#[test]
fn missing_config_is_reported() {
    bulwark()
        .args(["--config", "/definitely/not/here.json", "policies"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("loading policies from"));
}
