//! CLI smoke tests: verify basic binary behavior.

use std::process::Command;

fn cli_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_moodcal"))
}

#[test]
fn test_help_flag() {
    let output = cli_bin().arg("--help").output().expect("failed to run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage"), "Expected usage info in --help output");
    assert!(stdout.contains("calibrate"));
}

#[test]
fn test_version_flag() {
    let output = cli_bin().arg("--version").output().expect("failed to run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("moodcal"), "Expected binary name in --version output");
}

#[test]
fn test_ingest_score_and_weights() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("mood.db");
    let units = dir.path().join("units.json");
    let unit_id = "7d1f3c2a-5b4e-4a8f-9c6d-0e1f2a3b4c5d";
    std::fs::write(
        &units,
        format!(
            r#"{{
                "id": "{}",
                "conversation_id": "conv-1",
                "participants": [{{ "id": "alice", "role": "user" }}],
                "content": "",
                "messages": [{{ "speaker": "alice", "text": "I'm so happy and grateful today, thank you!" }}],
                "timestamp": "2024-01-01T12:00:00Z"
            }}"#,
            unit_id
        ),
    )
    .unwrap();

    let missing_config = dir.path().join("missing.toml");
    let run = |args: &[&str]| {
        cli_bin()
            .arg("--config")
            .arg(&missing_config)
            .arg("--db")
            .arg(&db)
            .args(args)
            .output()
            .expect("failed to run")
    };

    let ingest = run(&["ingest", units.to_str().unwrap(), "--score"]);
    assert!(ingest.status.success(), "{}", String::from_utf8_lossy(&ingest.stderr));
    assert!(String::from_utf8_lossy(&ingest.stdout).contains(unit_id));

    let mood = run(&["mood", unit_id]);
    assert!(mood.status.success());
    let score: serde_json::Value = serde_json::from_slice(&mood.stdout).unwrap();
    assert_eq!(score["unit_id"], unit_id);

    let weights = run(&["weights"]);
    assert!(weights.status.success());
    let profile: serde_json::Value = serde_json::from_slice(&weights.stdout).unwrap();
    assert_eq!(profile["version"], 1);
}

#[test]
fn test_unknown_unit_fails_cleanly() {
    let dir = tempfile::TempDir::new().unwrap();
    let output = cli_bin()
        .arg("--db")
        .arg(dir.path().join("mood.db"))
        .arg("score")
        .arg("00000000-0000-0000-0000-000000000001")
        .output()
        .expect("failed to run");
    assert!(!output.status.success());
}
