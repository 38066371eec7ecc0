//! 命令行端到端测试

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("canpdo-cli").unwrap()
}

#[test]
fn test_format_default() {
    cli()
        .arg("format")
        .assert()
        .success()
        .stdout(predicate::str::contains("0x181 single"))
        .stdout(predicate::str::contains("14 channels"));
}

#[test]
fn test_format_from_params_file() {
    let dir = tempfile::tempdir().unwrap();
    let params = dir.path().join("pdo.params");
    std::fs::write(
        &params,
        "tx_divider = 5\n2.transmit_type = 255\n2.channel_ptr_1 = speed\n",
    )
    .unwrap();
    cli()
        .args(["format", "--params"])
        .arg(&params)
        .assert()
        .success()
        .stdout(predicate::str::contains("2000 Hz, 1 frames per cycle"))
        .stdout(predicate::str::contains("0x281 7Q8"))
        .stdout(predicate::str::contains("speed"));
}

#[test]
fn test_check_rejects_bad_scope() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("pipeline.toml");
    std::fs::write(&config, "[[scope]]\nsignals = [\"385_0\"]\n").unwrap();
    cli().arg("check").arg(&config).assert().failure();
}

#[test]
fn test_run_logs_requested_rows() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("run.csv");
    cli()
        .args(["run", "--rows", "100", "--frame-rate", "40000", "--output"])
        .arg(&output)
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("100 rows"));
    let text = std::fs::read_to_string(&output).unwrap();
    assert_eq!(text.lines().count(), 101);
}

#[test]
fn test_run_with_duration_exits() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("timed.csv");
    cli()
        .args(["run", "--duration", "0.2", "--frame-rate", "40000", "--output"])
        .arg(&output)
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("200 rows"));
    let text = std::fs::read_to_string(&output).unwrap();
    assert_eq!(text.lines().count(), 201);
}
