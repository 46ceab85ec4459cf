//! Timeout enforcement tests

#![cfg(unix)]

use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use ricecoder_supervisor::{
    ProcessConfig, ProcessError, ProcessInput, ProcessSupervisor, TimeoutKind,
};

fn fast(config: ProcessConfig) -> ProcessConfig {
    config.poll_interval(Duration::from_millis(20))
}

#[test]
fn test_general_timeout_stops_process() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::new("sleep").args(["5"]).timeout_secs(1),
    ));
    let started = Instant::now();
    process.start().unwrap();

    let err = process.wait().unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::General));
    assert!(!process.is_running());
    assert!(process.is_terminated());
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn test_run_fails_with_timeout() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::shell("sleep 5").timeout(Duration::from_millis(300)),
    ));

    let err = process.run().unwrap_err();
    let ProcessError::Timeout { kind, limit, command } = err else {
        panic!("expected a timeout");
    };
    assert_eq!(kind, TimeoutKind::General);
    assert_eq!(limit, Duration::from_millis(300));
    assert_eq!(command, "sleep 5");
    assert!(!process.is_running());
}

#[test]
fn test_idle_timeout_without_output() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::new("sleep")
            .args(["5"])
            .no_timeout()
            .idle_timeout(Duration::from_millis(500)),
    ));

    let err = process.run().unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Idle));
    assert!(!process.is_running());
}

#[test]
fn test_steady_output_avoids_idle_timeout() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::shell("for i in 1 2 3 4 5 6; do echo $i; sleep 0.2; done")
            .idle_timeout(Duration::from_secs(1)),
    ));

    assert_eq!(process.run().unwrap(), 0);
    assert_eq!(process.output().unwrap(), b"1\n2\n3\n4\n5\n6\n");
}

#[test]
fn test_general_timeout_wins_over_idle() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::new("sleep")
            .args(["5"])
            .timeout(Duration::from_millis(300))
            .idle_timeout(Duration::from_millis(300)),
    ));

    let err = process.run().unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::General));
}

#[test]
fn test_no_timeout_lets_process_finish() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::shell("sleep 0.3; echo done").no_timeout(),
    ));

    assert_eq!(process.run().unwrap(), 0);
    assert_eq!(process.output().unwrap(), b"done\n");
}

#[test]
fn test_manual_timeout_check() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::new("sleep")
            .args(["5"])
            .timeout(Duration::from_millis(200)),
    ));
    process.start().unwrap();
    assert!(process.check_timeout().is_ok());

    std::thread::sleep(Duration::from_millis(400));
    let err = process.check_timeout().unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::General));
    assert!(!process.is_running());

    // Terminated supervisors have nothing left to enforce
    assert!(process.check_timeout().is_ok());
}

#[test]
fn test_timeout_can_be_raised_while_running() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::shell("sleep 0.5")
            .timeout(Duration::from_millis(100)),
    ));
    process.start().unwrap();
    process.set_timeout(Some(Duration::from_secs(10)));

    assert_eq!(process.wait().unwrap(), 0);
}

#[test]
fn test_background_writer_does_not_hold_wait() {
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::shell("(while true; do echo x; sleep 0.05; done) & exit 0")
            .timeout(Duration::from_secs(5)),
    ));
    let started = Instant::now();

    assert_eq!(process.run().unwrap(), 0);
    assert!(process.is_terminated());
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_zero_timeout_from_json_disables_timeout() {
    let config: ProcessConfig = serde_json::from_value(serde_json::json!({
        "command": { "shell": "sleep 0.3; echo ok" },
        "timeout": { "secs": 0, "nanos": 0 },
        "idle_timeout": { "secs": 0, "nanos": 0 },
        "poll_interval": { "secs": 0, "nanos": 20_000_000 }
    }))
    .unwrap();
    let mut process = ProcessSupervisor::new(config);

    assert_eq!(process.timeout(), None);
    assert_eq!(process.run().unwrap(), 0);
    assert_eq!(process.output().unwrap(), b"ok\n");
}

#[test]
fn test_silent_input_reader_does_not_defeat_timeout() {
    let (quiet, peer) = UnixStream::pair().unwrap();
    let mut process = ProcessSupervisor::new(fast(
        ProcessConfig::new("sleep")
            .args(["30"])
            .input(ProcessInput::reader(quiet))
            .timeout(Duration::from_secs(1)),
    ));
    let started = Instant::now();

    let err = process.run().unwrap_err();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::General));
    assert!(!process.is_running());
    assert!(started.elapsed() < Duration::from_secs(5));
    drop(peer);
}
