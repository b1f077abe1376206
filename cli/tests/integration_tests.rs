use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn plantctl(state: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("plantctl").unwrap();
    cmd.env_remove("PLANTWATCH_CONFIG")
        .env("PLANTCTL_SETTINGS", state.path().join("plantctl.toml"))
        .args(["--no-color", "--state-dir"])
        .arg(state.path());
    cmd
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("plantctl").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Plantwatch CLI"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("plantctl").unwrap();
    cmd.arg("--version");
    cmd.assert().success().stdout(predicate::str::contains("plantctl"));
}

#[test]
fn test_rule_lifecycle_persists() {
    let state = TempDir::new().unwrap();

    plantctl(&state)
        .args([
            "rules", "add", "-c", "system_pressure", "--condition", "below", "--value", "2.5", "-s", "medium",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created rule-1"));

    assert!(state.path().join("rules.json").exists());

    plantctl(&state)
        .args(["rules", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("system_pressure").and(predicate::str::contains("rule-1")));

    plantctl(&state).args(["rules", "disable", "rule-1"]).assert().success();
    plantctl(&state)
        .args(["--output-format", "json", "rules", "show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"enabled\": false"));

    plantctl(&state).args(["rules", "remove", "rule-1"]).assert().success();
    plantctl(&state)
        .args(["rules", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No rules defined"));
}

#[test]
fn test_invalid_rule_is_rejected() {
    let state = TempDir::new().unwrap();
    plantctl(&state)
        .args(["rules", "add", "-c", "humidity", "--condition", "above", "--value", "60"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Rule Error"));
}

#[test]
fn test_manual_calibration() {
    let state = TempDir::new().unwrap();
    plantctl(&state)
        .args(["--output-format", "raw", "calibrate", "manual", "kiln_temperature", "-r", "100", "-m", "103"])
        .assert()
        .success()
        .stdout(predicate::str::contains("kiln_temperature error drift=3.00%"));
}

#[test]
fn test_export_round_trip() {
    let state = TempDir::new().unwrap();
    let recording = state.path().join("recording.csv");
    std::fs::write(
        &recording,
        "timestamp_ms,channel,value\n1000,system_pressure,3.0\n2000,system_pressure,2.0\n3000,oxygen_level,3.5\n",
    )
    .unwrap();

    let exported = state.path().join("window.csv");
    plantctl(&state)
        .args(["export", "--channels", "system_pressure", "--input"])
        .arg(&recording)
        .arg("--output")
        .arg(&exported)
        .assert()
        .success();

    let text = std::fs::read_to_string(&exported).unwrap();
    assert!(text.starts_with("timestamp_ms,timestamp,channel,value,unit,flagged"));
    assert_eq!(text.lines().count(), 3);

    // plantctl's own export is a valid recording
    plantctl(&state)
        .args(["export", "--format", "json", "--input"])
        .arg(&exported)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"value\": 2.0"));
}

#[test]
fn test_replay_without_history_fails() {
    let state = TempDir::new().unwrap();
    plantctl(&state)
        .args(["replay", "--no-wait"])
        .assert()
        .failure()
        .code(9);
}

#[test]
fn test_replay_simulated_history() {
    let state = TempDir::new().unwrap();
    plantctl(&state)
        .args(["replay", "--simulate", "20", "--speed", "4", "--no-wait", "--every", "50"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Replay finished"));
}

#[test]
fn test_config_init_and_validate() {
    let state = TempDir::new().unwrap();
    let path = state.path().join("engine.toml");

    plantctl(&state).args(["config", "init", "--file"]).arg(&path).assert().success();
    plantctl(&state).args(["config", "init", "--file"]).arg(&path).assert().failure();
    plantctl(&state)
        .args(["config", "validate", "--file"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}
