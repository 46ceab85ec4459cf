//! # ricecoder-supervisor
//!
//! **Purpose**: Supervise one external command per instance for RiceCoder
//!
//! Spawns an OS child process, multiplexes its stdin/stdout/stderr, enforces
//! wall-clock and idle timeouts, and exposes full and incremental output,
//! signaling, waiting and forced termination.
//!
//! ## Features
//!
//! - **Lifecycle State Machine**: Ready → Started → Terminated, never backwards
//! - **Pipe Multiplexing**: Non-blocking `poll(2)` on Unix, reader threads elsewhere
//! - **Timeouts**: General and idle bounds checked once per poll iteration
//! - **Output Capture**: Full buffers, incremental reads and per-chunk handlers
//! - **Stdin Sources**: Fixed bytes, lazy readers or a live [`InputStream`]
//! - **Process Group Signals**: SIGTERM→SIGKILL escalation across all descendants
//! - **Exit Status Resolution**: OS code, sigchild side channel, `128 + signal`, `-1`
//! - **TTY/PTY Modes**: Terminal passthrough or a pseudo-terminal on all streams
//! - **Async Facade**: [`ProcessManager`] runs supervisors on tokio's blocking pool
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ricecoder_supervisor::{OutputStream, ProcessConfig, ProcessSupervisor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProcessConfig::shell("cargo build")
//!     .working_dir("/tmp/project")
//!     .timeout_secs(300)
//!     .idle_timeout(Duration::from_secs(60));
//!
//! let mut process = ProcessSupervisor::new(config);
//! process.run_with(|stream: OutputStream, bytes: &[u8]| {
//!     print!("[{stream}] {}", String::from_utf8_lossy(bytes));
//! })?;
//!
//! if !process.is_successful() {
//!     eprintln!("build failed: {:?}", process.exit_code_text());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod exit_code;
mod handle;
pub mod input;
pub mod manager;
pub mod output;
mod pipes;
pub mod platform;
pub mod supervisor;
pub mod timeout;

pub use config::{escape_argument, ProcessCommand, ProcessConfig, ProcessOptions};
pub use error::{ProcessError, ProcessFailure, Result, TimeoutKind};
pub use exit_code::exit_code_text;
pub use input::{InputStream, ProcessInput};
pub use manager::{ProcessManager, ProcessOutcome};
pub use output::{OutputHandler, OutputStream};
pub use platform::{pty_supported, sigchild_enabled, SIGKILL, SIGTERM};
pub use supervisor::{ProcessStatus, ProcessSupervisor, DEFAULT_STOP_GRACE};
pub use timeout::{TimeoutPolicy, TimeoutViolation};
