//! End-to-End Test Suite: Supervised Command Workflows
//!
//! Drives the supervisor the way RiceCoder tools do: build a config from a
//! JSON document, run commands in a scratch project directory, stream their
//! output, and shut long-running helpers down through the async manager.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ricecoder_supervisor::{
    InputStream, OutputStream, ProcessConfig, ProcessError, ProcessManager, ProcessSupervisor,
    TimeoutKind,
};
use ricecoder_integration_tests::init_tracing;
use tempfile::TempDir;

/// Complete workflow: configure from JSON, build in a project directory,
/// inspect output and failure details
#[test]
fn test_build_workflow_from_json_config() {
    init_tracing();
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    std::fs::write(temp_dir.path().join("main.txt"), "line one\nline two\n")
        .expect("Failed to write project file");

    let document = serde_json::json!({
        "command": { "shell": "wc -l < main.txt" },
        "working_dir": temp_dir.path(),
        "env": { "BUILD_MODE": "release" },
        "timeout": { "secs": 10, "nanos": 0 }
    });
    let config: ProcessConfig =
        serde_json::from_value(document).expect("Failed to parse process config");

    let mut process = ProcessSupervisor::new(config);
    process.must_run().expect("Build command failed");
    let lines = String::from_utf8_lossy(process.output().unwrap())
        .trim()
        .to_string();
    assert_eq!(lines, "2");

    // The same configuration rebuilt for a failing step reports the project dir
    let mut failing = ProcessSupervisor::new(
        process
            .configuration()
            .clone()
            .args(["missing-file.txt"]),
    );
    let err = failing.must_run().unwrap_err();
    assert!(err.is_command_failure());
    assert!(err
        .to_string()
        .contains(&temp_dir.path().display().to_string()));
}

/// Streaming workflow: a helper prints progress, the caller watches for a
/// readiness line, feeds it commands, then shuts it down
#[test]
fn test_interactive_helper_workflow() {
    init_tracing();
    let input = InputStream::new();
    let progress = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&progress);

    let mut helper = ProcessSupervisor::new(
        ProcessConfig::shell("echo ready; while read line; do echo \"got $line\"; done")
            .input(input.clone())
            .timeout_secs(20)
            .poll_interval(Duration::from_millis(20)),
    );
    helper
        .start_with(move |stream: OutputStream, bytes: &[u8]| {
            if stream == OutputStream::Stdout {
                sink.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(bytes).into_owned());
            }
        })
        .unwrap();

    assert!(helper
        .wait_until(|_, bytes| String::from_utf8_lossy(bytes).contains("ready"))
        .unwrap());

    input.write("alpha\n").unwrap();
    assert!(helper
        .wait_until(|_, bytes| String::from_utf8_lossy(bytes).contains("got alpha"))
        .unwrap());

    input.write("beta\n").unwrap();
    input.close();
    assert_eq!(helper.wait().unwrap(), 0);

    let streamed = progress.lock().unwrap().concat();
    assert_eq!(streamed, "ready\ngot alpha\ngot beta\n");
    assert_eq!(helper.output().unwrap(), streamed.as_bytes());
}

/// A hung step is bounded by its idle timeout and leaves nothing running
#[test]
fn test_hung_step_is_reaped() {
    init_tracing();
    let mut step = ProcessSupervisor::new(
        ProcessConfig::shell("echo starting; sleep 30")
            .idle_timeout(Duration::from_millis(400))
            .poll_interval(Duration::from_millis(20)),
    );

    let err = step.run().unwrap_err();
    assert!(matches!(
        err,
        ProcessError::Timeout {
            kind: TimeoutKind::Idle,
            ..
        }
    ));
    assert!(!step.is_running());
    assert_eq!(step.output().unwrap(), b"starting\n");
}

/// Async callers run several commands at once and stop a background server
#[tokio::test]
async fn test_async_manager_workflow() {
    init_tracing();
    let manager = ProcessManager::new();

    let (lint, test) = tokio::join!(
        manager.run(ProcessConfig::shell("echo lint ok")),
        manager.run(ProcessConfig::shell("echo tests failed >&2; exit 1")),
    );
    let lint = lint.unwrap();
    let test = test.unwrap();
    assert!(lint.is_successful());
    assert_eq!(lint.stdout_lossy(), "lint ok\n");
    assert_eq!(test.exit_code, 1);
    assert_eq!(test.stderr_lossy(), "tests failed\n");

    let server = manager
        .spawn(ProcessConfig::new("sleep").args(["30"]))
        .await
        .unwrap();
    let code = manager.shutdown(server).await.unwrap();
    assert_eq!(code, Some(143));
}
