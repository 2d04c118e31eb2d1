//! CLI integration tests

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn tsynth(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tsynth"))
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("TSYNTH_CPU_TRACES")
        .env_remove("TSYNTH_GPU_TRACES")
        .env_remove("TSYNTH_MEMORY_TRACES")
        .env_remove("TSYNTH_MAXIMA_DIR")
        .output()
        .expect("Failed to execute tsynth")
}

fn write_trace(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = tsynth(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("replay"), "Should show replay command");
    assert!(stdout.contains("prerun"), "Should show prerun command");
    assert!(stdout.contains("inspect"), "Should show inspect command");
    assert!(stdout.contains("template"), "Should show template command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = tsynth(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("tsynth"), "Should show binary name");
}

#[test]
fn test_replay_help_lists_trace_options() {
    let output = tsynth(&["replay", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success());
    assert!(stdout.contains("--cpu"));
    assert!(stdout.contains("--gpu"));
    assert!(stdout.contains("--memory"));
    assert!(stdout.contains("--maxima-dir"));
}

#[test]
fn test_replay_without_traces_fails() {
    let output = tsynth(&["replay"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("no trace files given"));
}

#[test]
fn test_inspect_requires_files() {
    let output = tsynth(&["inspect", "--kind", "cpu"]);
    assert!(!output.status.success());
}

#[test]
fn test_inspect_json_summary() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(
        dir.path(),
        "cpu.csv",
        "timestamp,pod,value\n0,0,0.5\n0,1,1.5\n60,0,2.0\nbad,0,1.0\n",
    );

    let output = tsynth(&[
        "inspect",
        "--kind",
        "cpu",
        "--format",
        "json",
        trace.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["rows"], 3);
    assert_eq!(summary["skipped"], 1);
    assert_eq!(summary["entities"], 2);
    assert_eq!(summary["ticks"], 2);
}

#[test]
fn test_replay_json_events() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(
        dir.path(),
        "memory.csv",
        "timestamp,pod,value\n0,0,0.5\n60,0,1.5\n",
    );

    let output = tsynth(&[
        "replay",
        "--memory",
        trace.to_str().unwrap(),
        "--format",
        "json",
    ]);
    assert!(output.status.success());

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["report"]["summary"]["sessions"], 1);
    let events = result["events"].as_array().unwrap();
    assert_eq!(events[0]["name"], "session-started");
    assert_eq!(events[1]["name"], "session-ready");
    assert_eq!(events.last().unwrap()["name"], "session-stopped");
}

#[test]
fn test_prerun_writes_maxima_files() {
    let dir = TempDir::new().unwrap();
    let trace = write_trace(
        dir.path(),
        "memory.csv",
        "timestamp,pod,value\n0,0,0.5\n60,0,1.5\n",
    );
    let out = dir.path().join("maxima");

    let output = tsynth(&[
        "prerun",
        "--memory",
        trace.to_str().unwrap(),
        "--output",
        out.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    assert!(out.join("memory_session_maxima.csv").is_file());
    assert!(out.join("memory_task_maxima.csv").is_file());

    let replay = tsynth(&[
        "replay",
        "--memory",
        trace.to_str().unwrap(),
        "--maxima-dir",
        out.to_str().unwrap(),
    ]);
    assert!(replay.status.success());
}

#[test]
fn test_template_json_events() {
    let dir = TempDir::new().unwrap();
    let template = write_trace(
        dir.path(),
        "template.json",
        r#"{"sessions": [{"id": "s1", "start_tick": 0, "stop_tick": 4,
            "max_resource_request": {"cpus": 2, "memory_mb": 512, "gpus": 1},
            "trainings": [{"start_tick": 1, "duration_in_ticks": 2, "cpus": 1,
                "gpu_utilizations": [80]}]}]}"#,
    );

    let output = tsynth(&["template", template.to_str().unwrap(), "--format", "json"]);
    assert!(output.status.success());

    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["report"]["events"], 5);
    assert_eq!(result["report"]["final_tick"], 4);
    let events = result["events"].as_array().unwrap();
    assert_eq!(events[0]["name"], "session-started");
    assert_eq!(events[2]["name"], "training-started");
    assert_eq!(events.last().unwrap()["name"], "session-stopped");
}

#[test]
fn test_template_rejects_overlapping_trainings() {
    let dir = TempDir::new().unwrap();
    let template = write_trace(
        dir.path(),
        "template.json",
        r#"{"sessions": [{"id": "s1", "start_tick": 0, "stop_tick": 9,
            "trainings": [{"start_tick": 1, "duration_in_ticks": 4},
                          {"start_tick": 3, "duration_in_ticks": 1}]}]}"#,
    );

    let output = tsynth(&["template", template.to_str().unwrap()]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("before training 0 ends"));
}
