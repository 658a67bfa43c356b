use assert_cmd::cargo::cargo_bin_cmd;

fn fixture(path: &str) -> String {
    format!("{}/tests/fixtures/{path}", env!("CARGO_MANIFEST_DIR"))
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = cargo_bin_cmd!("bus-harness");
    cmd.arg("--help");
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");

    for name in ["record", "probe", "wipe", "settle"] {
        assert!(stdout.contains(name), "missing {name} in help");
    }
    assert!(stdout.contains("--config"));
}

#[test]
fn probe_help_lists_conditions() {
    let mut cmd = cargo_bin_cmd!("bus-harness");
    cmd.args(["probe", "--help"]);
    let out = cmd.assert().success();
    let stdout = String::from_utf8(out.get_output().stdout.clone()).expect("utf8");
    for flag in ["--equals", "--greater", "--less", "--absent", "--length", "--timeout-ms"] {
        assert!(stdout.contains(flag), "missing {flag} in probe help");
    }
}

#[test]
fn probe_without_condition_exits_nonzero() {
    let mut cmd = cargo_bin_cmd!("bus-harness");
    cmd.args([
        "probe",
        "--object",
        "/org/freedesktop/UDisks2/Manager",
        "--interface",
        ".Manager",
        "--property",
        "Version",
    ]);
    cmd.assert().failure();
}

#[test]
fn invalid_config_path_exits_nonzero() {
    let mut cmd = cargo_bin_cmd!("bus-harness");
    cmd.arg("settle")
        .arg("--config")
        .arg(fixture("configs/missing.toml"));
    cmd.assert().failure();
}

#[test]
fn zero_probe_interval_is_rejected() {
    let mut cmd = cargo_bin_cmd!("bus-harness");
    cmd.arg("settle")
        .arg("--config")
        .arg(fixture("configs/zero-interval.toml"));
    let out = cmd.assert().failure();
    let stderr = String::from_utf8(out.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.contains("invalid config"));
}

#[test]
fn malformed_test_id_fails_before_anything_is_recorded() {
    let temp = tempfile::tempdir().expect("tempdir");
    let record = temp.path().join("flight_record.log");
    let mut cmd = cargo_bin_cmd!("bus-harness");
    cmd.args(["record", "--test-id", "not-dotted", "--record-path"])
        .arg(&record)
        .args(["--", "true"]);
    cmd.assert().failure();
    assert!(!record.exists());
}

#[test]
fn record_requires_a_command() {
    let mut cmd = cargo_bin_cmd!("bus-harness");
    cmd.args(["record", "--test-id", "mod.Case.test_x"]);
    cmd.assert().failure();
}
