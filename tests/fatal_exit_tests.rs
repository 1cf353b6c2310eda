use std::process::Command;

fn fatal_lines(output: &str) -> usize {
    output.lines().filter(|line| line.contains("FATAL")).count()
}

#[test]
fn unreachable_store_logs_one_fatal_entry_and_exits_with_status_one() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("docserve.json");
    std::fs::write(&config, "{}").unwrap();
    let log_dir = dir.path().join("logs");

    let output = Command::new(env!("CARGO_BIN_EXE_docserve-server"))
        .arg("--config")
        .arg(&config)
        .args(["--database-url", "bogus://x"])
        .arg("--log-dir")
        .arg(&log_dir)
        .env("RUST_LOG", "info")
        .env_remove("DOCSERVE_HOST")
        .env_remove("DOCSERVE_PORT")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        fatal_lines(&stdout) + fatal_lines(&stderr),
        1,
        "stdout:\n{stdout}\nstderr:\n{stderr}"
    );
    assert!(stdout.contains("Database not available"));
}

#[test]
fn unreadable_config_exits_before_serving() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("broken.json");
    std::fs::write(&config, "{ not json").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_docserve-server"))
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to parse config JSON"));
}
