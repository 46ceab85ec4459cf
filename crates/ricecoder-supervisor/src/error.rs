//! Error types for process supervision

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Which bound a timeout exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Wall-clock time since start
    General,
    /// Time since the last observed output
    Idle,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::General => f.write_str("timeout"),
            TimeoutKind::Idle => f.write_str("idle timeout"),
        }
    }
}

/// Report for a command that ran to completion with a non-zero exit code
#[derive(Debug, Clone)]
pub struct ProcessFailure {
    pub command: String,
    pub exit_code: i32,
    pub exit_code_text: &'static str,
    pub working_dir: Option<PathBuf>,
    /// `None` when output capture was disabled
    pub output: Option<Vec<u8>>,
    /// `None` when output capture was disabled
    pub error_output: Option<Vec<u8>>,
}

impl fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The command \"{}\" failed.\n\nExit Code: {}({})\n\nWorking directory: {}",
            self.command,
            self.exit_code,
            self.exit_code_text,
            self.working_dir
                .as_ref()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| ".".to_string()),
        )?;

        if let (Some(output), Some(error_output)) = (&self.output, &self.error_output) {
            write!(
                f,
                "\n\nOutput:\n================\n{}\n\nError Output:\n================\n{}",
                String::from_utf8_lossy(output),
                String::from_utf8_lossy(error_output),
            )?;
        }

        Ok(())
    }
}

/// Process supervision errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// `start`/`restart` on a supervisor that already left the ready state
    #[error("Process is already running")]
    AlreadyRunning,

    /// Operation needs a process that has been started
    #[error("Process must be started before calling {operation}()")]
    NotStarted { operation: &'static str },

    /// Operation needs a live process
    #[error("Cannot {operation} a process that is not running")]
    NotRunning { operation: &'static str },

    /// Failed to spawn process
    #[error("Failed to spawn process \"{command}\": {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Process exceeded a configured time bound and has been stopped
    #[error("The process \"{command}\" exceeded the {kind} of {limit:?}")]
    Timeout {
        kind: TimeoutKind,
        limit: Duration,
        command: String,
    },

    /// Process was terminated by a signal this supervisor did not send
    #[error("The process has been signaled with signal \"{signal}\"")]
    SignaledUnexpectedly { signal: i32 },

    /// The command ran but exited with a non-zero code
    #[error("{0}")]
    ProcessFailed(Box<ProcessFailure>),

    /// Operation unavailable on this platform or in sigchild compatibility mode
    #[error("Unsupported on this platform: {0}")]
    PlatformUnsupported(String),

    /// Output was requested from a supervisor with output capture disabled
    #[error("Output has been disabled")]
    OutputDisabled,

    /// Misuse of a toggle that conflicts with the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The OS refused to deliver a signal
    #[error("Error while sending signal {signal}: {reason}")]
    SignalDeliveryFailed { signal: i32, reason: String },

    /// Invalid configuration
    #[error("Invalid process configuration: {0}")]
    InvalidConfig(String),

    /// Supervisor worker died before reporting a result
    #[error("Process supervisor crashed: {reason}")]
    Crashed { reason: String },

    /// Pipe or status I/O failed while the process was supervised
    #[error("Process I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Programmer errors: surfaced immediately, never worth retrying
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            ProcessError::AlreadyRunning
                | ProcessError::NotStarted { .. }
                | ProcessError::NotRunning { .. }
                | ProcessError::InvalidState(_)
                | ProcessError::InvalidConfig(_)
                | ProcessError::OutputDisabled
        )
    }

    /// Supervision succeeded but the command itself failed
    pub fn is_command_failure(&self) -> bool {
        matches!(self, ProcessError::ProcessFailed(_))
    }

    /// Timeout kind, if this is a timeout error
    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            ProcessError::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
