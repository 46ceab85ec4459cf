//! Signal delivery, stop escalation and exit status resolution

#![cfg(unix)]

use std::time::{Duration, Instant};

use ricecoder_supervisor::{
    ProcessConfig, ProcessError, ProcessOptions, ProcessSupervisor, SIGKILL, SIGTERM,
};

const SIGHUP: i32 = 1;

#[test]
fn test_signal_is_recorded() {
    let mut process = ProcessSupervisor::new(ProcessConfig::new("sleep").args(["5"]));
    process.start().unwrap();

    process.signal(SIGTERM).unwrap();
    assert_eq!(process.latest_signal(), Some(SIGTERM));

    assert_eq!(process.wait().unwrap(), 128 + SIGTERM);
    assert!(process.has_been_signaled());
    assert_eq!(process.term_signal(), Some(SIGTERM));
    assert_eq!(
        process.exit_code_text(),
        Some("Termination (request to terminate)")
    );
}

#[test]
fn test_signal_on_terminated_fails() {
    let mut process = ProcessSupervisor::new(ProcessConfig::new("true"));
    process.run().unwrap();

    assert!(matches!(
        process.signal(SIGTERM),
        Err(ProcessError::NotRunning { .. })
    ));
}

#[test]
fn test_unexpected_signal_is_reported() {
    let mut process = ProcessSupervisor::new(ProcessConfig::shell("kill -9 $$"));

    let err = process.run().unwrap_err();
    assert!(matches!(
        err,
        ProcessError::SignaledUnexpectedly { signal: SIGKILL }
    ));
    assert_eq!(process.exit_code(), Some(137));
    assert!(process.is_terminated());
}

#[test]
fn test_stop_is_noop_before_start() {
    let mut process = ProcessSupervisor::new(ProcessConfig::new("sleep").args(["5"]));
    assert_eq!(process.stop().unwrap(), None);
    assert!(!process.is_started());
}

#[test]
fn test_stop_is_idempotent() {
    let mut process = ProcessSupervisor::new(ProcessConfig::new("sleep").args(["5"]));
    process.start().unwrap();

    let first = process.stop().unwrap();
    assert_eq!(first, Some(128 + SIGTERM));
    assert_eq!(process.stop().unwrap(), first);
}

#[test]
fn test_stop_with_unbounded_grace() {
    let mut idle = ProcessSupervisor::new(ProcessConfig::new("sleep").args(["5"]));
    assert_eq!(idle.stop_with(Duration::MAX, None).unwrap(), None);

    let mut process = ProcessSupervisor::new(
        ProcessConfig::new("sleep")
            .args(["5"])
            .poll_interval(Duration::from_millis(20)),
    );
    process.start().unwrap();
    assert_eq!(
        process.stop_with(Duration::MAX, None).unwrap(),
        Some(128 + SIGTERM)
    );
}

#[test]
fn test_stop_escalates_when_sigterm_is_ignored() {
    let mut process = ProcessSupervisor::new(
        ProcessConfig::shell("trap '' TERM; echo armed; while true; do sleep 0.05; done")
            .poll_interval(Duration::from_millis(20)),
    );
    process.start().unwrap();
    assert!(process
        .wait_until(|_, bytes| bytes.starts_with(b"armed"))
        .unwrap());

    let started = Instant::now();
    let code = process
        .stop_with(Duration::from_millis(300), None)
        .unwrap();

    assert_eq!(code, Some(128 + SIGKILL));
    assert_eq!(process.latest_signal(), Some(SIGKILL));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_stop_with_custom_signal() {
    let mut process = ProcessSupervisor::new(
        ProcessConfig::shell("trap '' TERM; echo armed; while true; do sleep 0.05; done")
            .poll_interval(Duration::from_millis(20)),
    );
    process.start().unwrap();
    assert!(process
        .wait_until(|_, bytes| bytes.starts_with(b"armed"))
        .unwrap());

    let code = process
        .stop_with(Duration::from_millis(100), Some(SIGHUP))
        .unwrap();
    assert_eq!(code, Some(128 + SIGHUP));
}

#[test]
fn test_stop_reaches_whole_process_group() {
    let mut process = ProcessSupervisor::new(ProcessConfig::shell(
        "sleep 30 & sleep 30 & echo spawned; wait",
    ));
    process.start().unwrap();
    assert!(process
        .wait_until(|_, bytes| bytes.starts_with(b"spawned"))
        .unwrap());

    let started = Instant::now();
    process.stop().unwrap();

    // Background sleeps would keep the pipes open if they survived
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(process.is_terminated());
}

#[test]
fn test_pid_only_while_running() {
    let mut process = ProcessSupervisor::new(ProcessConfig::new("sleep").args(["5"]));
    assert_eq!(process.pid().unwrap(), None);

    process.start().unwrap();
    let pid = process.pid().unwrap().unwrap();
    assert!(pid > 0);

    process.stop_with(Duration::ZERO, None).unwrap();
    assert_eq!(process.pid().unwrap(), None);
}

#[test]
fn test_sigchild_mode_blocks_pid_and_signals() {
    let options = ProcessOptions {
        sigchild_compatibility: Some(true),
        ..Default::default()
    };
    let mut process = ProcessSupervisor::new(
        ProcessConfig::new("sleep").args(["5"]).options(options),
    );
    process.start().unwrap();

    assert!(matches!(
        process.pid(),
        Err(ProcessError::PlatformUnsupported(_))
    ));
    assert!(matches!(
        process.signal(SIGTERM),
        Err(ProcessError::PlatformUnsupported(_))
    ));

    // Internal stop still reaches the wrapped command
    process.stop_with(Duration::ZERO, None).unwrap();
    assert!(process.is_terminated());
}

#[test]
fn test_sigchild_mode_keeps_output_and_code() {
    let options = ProcessOptions {
        sigchild_compatibility: Some(true),
        ..Default::default()
    };
    let mut process =
        ProcessSupervisor::new(ProcessConfig::shell("echo wrapped; exit 9").options(options));

    assert_eq!(process.run().unwrap(), 9);
    assert_eq!(process.output().unwrap(), b"wrapped\n");
}
