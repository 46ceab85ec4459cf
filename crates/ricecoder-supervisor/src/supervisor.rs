//! Process supervisor: lifecycle state machine and poll loop

use std::fmt;
use std::io;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{ProcessCommand, ProcessConfig};
use crate::error::{ProcessError, ProcessFailure, Result};
use crate::exit_code::{self, resolve_exit_code, OsExit};
use crate::handle::ProcessHandle;
use crate::input::InputFeeder;
use crate::output::{OutputBuffer, OutputHandler, OutputStream};
use crate::pipes::{PipeChannel, PipeChunk, PipeLayout, PipeMode, PipeSet};
use crate::platform::{self, SIGKILL, SIGTERM};
use crate::timeout::TimeoutPolicy;

/// Grace period `stop()` gives the child between SIGTERM and SIGKILL
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// First sleep of the back-off used while no pipe can be waited on
const MIN_BACKOFF: Duration = Duration::from_millis(1);

type ChunkPredicate<'a> = &'a mut dyn FnMut(OutputStream, &[u8]) -> bool;

/// Lifecycle state; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    Ready,
    Started,
    Terminated,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Ready => f.write_str("ready"),
            ProcessStatus::Started => f.write_str("started"),
            ProcessStatus::Terminated => f.write_str("terminated"),
        }
    }
}

/// Supervises exactly one external command
///
/// The caller's thread drives everything: `wait`, `run` and the query
/// methods poll the child and its pipes, forward output to the handler and
/// the buffers, and enforce timeouts. Dropping a started supervisor stops
/// the child.
///
/// ```no_run
/// use ricecoder_supervisor::{ProcessConfig, ProcessSupervisor};
///
/// # fn main() -> ricecoder_supervisor::Result<()> {
/// let mut process = ProcessSupervisor::new(ProcessConfig::new("echo").args(["hello"]));
/// let code = process.run()?;
/// assert_eq!(code, 0);
/// assert_eq!(process.output()?, b"hello\n");
/// # Ok(())
/// # }
/// ```
pub struct ProcessSupervisor {
    config: ProcessConfig,
    sigchild: bool,
    status: ProcessStatus,
    handle: Option<ProcessHandle>,
    pipes: Option<Box<dyn PipeSet>>,
    handler: Option<Box<dyn OutputHandler>>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    start_time: Option<Instant>,
    last_output_time: Option<Instant>,
    exit_code: Option<i32>,
    term_signal: Option<i32>,
    latest_signal: Option<i32>,
    /// Raw bytes from the sigchild side channel
    exit_status_payload: Vec<u8>,
    fallback_exit_code: Option<i32>,
}

impl ProcessSupervisor {
    /// Create a supervisor in the Ready state
    pub fn new(config: ProcessConfig) -> Self {
        let sigchild = cfg!(unix)
            && config
                .options
                .sigchild_compatibility
                .unwrap_or_else(platform::sigchild_enabled);

        Self {
            config,
            sigchild,
            status: ProcessStatus::Ready,
            handle: None,
            pipes: None,
            handler: None,
            stdout: OutputBuffer::default(),
            stderr: OutputBuffer::default(),
            start_time: None,
            last_output_time: None,
            exit_code: None,
            term_signal: None,
            latest_signal: None,
            exit_status_payload: Vec::new(),
            fallback_exit_code: None,
        }
    }

    /// Configuration this supervisor was built from, including later
    /// timeout and output changes
    pub fn configuration(&self) -> &ProcessConfig {
        &self.config
    }

    /// Fresh Ready supervisor with the same configuration
    ///
    /// Fails while the child runs: a live process is never duplicated.
    pub fn try_clone(&self) -> Result<Self> {
        if self.status == ProcessStatus::Started {
            return Err(ProcessError::InvalidState(
                "Cannot clone a supervisor while its process is started".to_string(),
            ));
        }
        Ok(Self::new(self.config.clone()))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the child without waiting for it
    pub fn start(&mut self) -> Result<()> {
        self.start_inner(None)
    }

    /// Spawn the child, forwarding every output chunk to `handler`
    pub fn start_with(&mut self, handler: impl OutputHandler + 'static) -> Result<()> {
        self.start_inner(Some(Box::new(handler)))
    }

    /// Start and wait; returns the exit code
    pub fn run(&mut self) -> Result<i32> {
        self.start()?;
        self.wait()
    }

    pub fn run_with(&mut self, handler: impl OutputHandler + 'static) -> Result<i32> {
        self.start_with(handler)?;
        self.wait()
    }

    pub(crate) fn run_boxed(&mut self, handler: Option<Box<dyn OutputHandler>>) -> Result<i32> {
        self.start_inner(handler)?;
        self.wait()
    }

    /// Run and fail with [`ProcessError::ProcessFailed`] on a non-zero exit code
    pub fn must_run(&mut self) -> Result<()> {
        let code = self.run()?;
        self.ensure_success(code)
    }

    pub fn must_run_with(&mut self, handler: impl OutputHandler + 'static) -> Result<()> {
        let code = self.run_with(handler)?;
        self.ensure_success(code)
    }

    /// Block until the child terminates; returns the exit code
    ///
    /// Fails with [`ProcessError::Timeout`] once a bound is exceeded (the
    /// child is stopped first) and with [`ProcessError::SignaledUnexpectedly`]
    /// when a signal this supervisor did not send killed the child.
    pub fn wait(&mut self) -> Result<i32> {
        self.require_started("wait")?;
        self.wait_for_exit()
    }

    /// Like [`wait`](Self::wait), replacing the handler given to `start_with`
    pub fn wait_with(&mut self, handler: impl OutputHandler + 'static) -> Result<i32> {
        self.require_started("wait")?;
        if self.config.output_disabled {
            self.stop_with(Duration::ZERO, None)?;
            return Err(ProcessError::InvalidState(
                "Pass the handler to start_with() or enable output to use a handler with wait_with()"
                    .to_string(),
            ));
        }
        self.handler = Some(Box::new(handler));
        self.wait_for_exit()
    }

    /// Wait until `predicate` accepts an output chunk
    ///
    /// Returns `Ok(true)` on the first accepted chunk and `Ok(false)` if the
    /// child terminates first. The child keeps running after a match.
    pub fn wait_until(
        &mut self,
        mut predicate: impl FnMut(OutputStream, &[u8]) -> bool,
    ) -> Result<bool> {
        self.require_started("wait_until")?;
        if self.config.output_disabled {
            return Err(ProcessError::OutputDisabled);
        }
        if self.config.tty {
            return Err(ProcessError::InvalidState(
                "Output cannot be observed in TTY mode".to_string(),
            ));
        }

        let mut until: Option<ChunkPredicate<'_>> = Some(&mut predicate);
        let mut backoff = MIN_BACKOFF;
        loop {
            self.check_timeout()?;
            if self.status != ProcessStatus::Started {
                return Ok(false);
            }
            let blocking = self.pipes_open();
            if self.poll(blocking, &mut until)? {
                return Ok(true);
            }
            if !blocking && self.status == ProcessStatus::Started {
                backoff = self.back_off(backoff);
            }
        }
    }

    /// Start a new supervisor with this configuration; `self` is left untouched
    pub fn restart(&mut self) -> Result<ProcessSupervisor> {
        self.restart_inner(None)
    }

    pub fn restart_with(
        &mut self,
        handler: impl OutputHandler + 'static,
    ) -> Result<ProcessSupervisor> {
        self.restart_inner(Some(Box::new(handler)))
    }

    /// Stop with the default grace period and SIGKILL escalation
    pub fn stop(&mut self) -> Result<Option<i32>> {
        self.stop_with(DEFAULT_STOP_GRACE, None)
    }

    /// Stop the child: SIGTERM to the process group, wait up to `grace`,
    /// then `signal` (SIGKILL when `None`)
    ///
    /// A no-op on a supervisor that is not running. Returns the stored exit
    /// code.
    pub fn stop_with(&mut self, grace: Duration, signal: Option<i32>) -> Result<Option<i32>> {
        let deadline = Instant::now().checked_add(grace);

        if self.is_running() {
            debug!(pid = ?self.handle_pid(), grace = ?grace, "Stopping process");
            if let Err(e) = self.deliver_signal(SIGTERM) {
                warn!(pid = ?self.handle_pid(), error = %e, "Failed to send SIGTERM");
            }

            let mut backoff = MIN_BACKOFF;
            let within_grace =
                |deadline: Option<Instant>| deadline.map_or(true, |at| Instant::now() < at);
            while self.is_running() && within_grace(deadline) {
                backoff = self.back_off(backoff);
            }

            if self.is_running() {
                let signal = signal.unwrap_or(SIGKILL);
                if let Err(e) = self.deliver_signal(signal) {
                    warn!(pid = ?self.handle_pid(), error = %e, "Signal failed, killing process");
                    let killed = match self.handle.as_mut() {
                        Some(handle) => handle.kill(),
                        None => Ok(()),
                    };
                    if let Err(e) = killed {
                        return Err(self.abandon(e, "Failed to kill process"));
                    }
                }
            }
        }

        if self.status == ProcessStatus::Started {
            let waited = match self.handle.as_mut() {
                Some(handle) => handle.wait_exit(),
                None => Ok(OsExit::unknown()),
            };
            match waited {
                Ok(os) => {
                    self.finish(os, &mut None);
                }
                Err(e) => return Err(self.abandon(e, "Failed to reap process")),
            }
        }

        Ok(self.exit_code)
    }

    /// Send a POSIX signal to the running child's process group
    pub fn signal(&mut self, signal: i32) -> Result<()> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning { operation: "signal" });
        }
        if self.sigchild {
            return Err(ProcessError::PlatformUnsupported(
                "Signals cannot be sent in sigchild compatibility mode".to_string(),
            ));
        }
        self.deliver_signal(signal)
    }

    /// Enforce both timeouts once; stops the child before failing
    ///
    /// For callers that drive the loop themselves after [`start`](Self::start).
    pub fn check_timeout(&mut self) -> Result<()> {
        if self.status != ProcessStatus::Started {
            return Ok(());
        }
        let (Some(start_time), Some(last_output_time)) = (self.start_time, self.last_output_time)
        else {
            return Ok(());
        };

        let policy = TimeoutPolicy::new(self.config.timeout, self.config.idle_timeout);
        let Some(violation) = policy.check(Instant::now(), start_time, last_output_time) else {
            return Ok(());
        };

        warn!(
            pid = ?self.handle_pid(),
            kind = %violation.kind,
            limit = ?violation.limit,
            "Process exceeded its timeout, stopping"
        );
        self.stop_with(Duration::ZERO, None)?;

        Err(ProcessError::Timeout {
            kind: violation.kind,
            limit: violation.limit,
            command: self.command_line(),
        })
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Everything the child wrote to stdout so far
    pub fn output(&mut self) -> Result<&[u8]> {
        self.refresh_output("output")?;
        Ok(self.stdout.contents())
    }

    /// Stdout bytes written since the previous call
    pub fn incremental_output(&mut self) -> Result<Vec<u8>> {
        self.refresh_output("incremental_output")?;
        Ok(self.stdout.take_incremental())
    }

    pub fn error_output(&mut self) -> Result<&[u8]> {
        self.refresh_output("error_output")?;
        Ok(self.stderr.contents())
    }

    pub fn incremental_error_output(&mut self) -> Result<Vec<u8>> {
        self.refresh_output("incremental_error_output")?;
        Ok(self.stderr.take_incremental())
    }

    pub fn clear_output(&mut self) {
        self.stdout.clear();
    }

    pub fn clear_error_output(&mut self) {
        self.stderr.clear();
    }

    /// Stop capturing output; only allowed before start and without an idle timeout
    pub fn disable_output(&mut self) -> Result<()> {
        if self.status != ProcessStatus::Ready {
            return Err(ProcessError::AlreadyRunning);
        }
        if self.config.idle_timeout.is_some() {
            return Err(ProcessError::InvalidState(
                "Output cannot be disabled while an idle timeout is set".to_string(),
            ));
        }
        self.config.output_disabled = true;
        Ok(())
    }

    pub fn enable_output(&mut self) -> Result<()> {
        if self.status != ProcessStatus::Ready {
            return Err(ProcessError::AlreadyRunning);
        }
        self.config.output_disabled = false;
        Ok(())
    }

    pub fn is_output_disabled(&self) -> bool {
        self.config.output_disabled
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Exit code once terminated
    pub fn exit_code(&mut self) -> Option<i32> {
        self.refresh();
        self.exit_code
    }

    /// Description of the exit code, `None` until terminated
    pub fn exit_code_text(&mut self) -> Option<&'static str> {
        self.exit_code().map(exit_code::exit_code_text)
    }

    pub fn is_successful(&mut self) -> bool {
        self.exit_code() == Some(0)
    }

    pub fn is_running(&mut self) -> bool {
        if self.status != ProcessStatus::Started {
            return false;
        }
        self.refresh();
        self.status == ProcessStatus::Started
    }

    pub fn is_started(&self) -> bool {
        self.status != ProcessStatus::Ready
    }

    pub fn is_terminated(&mut self) -> bool {
        self.status() == ProcessStatus::Terminated
    }

    pub fn status(&mut self) -> ProcessStatus {
        self.refresh();
        self.status
    }

    /// OS process id while running
    ///
    /// In sigchild compatibility mode the id belongs to the wrapper shell,
    /// so it is not reported.
    pub fn pid(&mut self) -> Result<Option<u32>> {
        if self.sigchild {
            return Err(ProcessError::PlatformUnsupported(
                "The process id is not available in sigchild compatibility mode".to_string(),
            ));
        }
        Ok(if self.is_running() {
            self.handle_pid()
        } else {
            None
        })
    }

    /// Whether a signal terminated the child
    pub fn has_been_signaled(&mut self) -> bool {
        self.term_signal().is_some()
    }

    pub fn term_signal(&mut self) -> Option<i32> {
        self.refresh();
        self.term_signal
    }

    /// Last signal successfully delivered by this supervisor
    pub fn latest_signal(&self) -> Option<i32> {
        self.latest_signal
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn last_output_time(&self) -> Option<Instant> {
        self.last_output_time
    }

    pub fn command_line(&self) -> String {
        self.config.command_line()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout
    }

    /// Change the wall-clock bound; `None` or zero disables it
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.config.timeout = timeout.filter(|t| !t.is_zero());
    }

    /// Change the idle bound; rejected while output is disabled
    pub fn set_idle_timeout(&mut self, idle_timeout: Option<Duration>) -> Result<()> {
        let idle_timeout = idle_timeout.filter(|t| !t.is_zero());
        if idle_timeout.is_some() && self.config.output_disabled {
            return Err(ProcessError::InvalidState(
                "Idle timeout cannot be set while the output is disabled".to_string(),
            ));
        }
        self.config.idle_timeout = idle_timeout;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn start_inner(&mut self, handler: Option<Box<dyn OutputHandler>>) -> Result<()> {
        if self.status != ProcessStatus::Ready {
            return Err(ProcessError::AlreadyRunning);
        }
        self.validate(handler.is_some())?;

        let command_line = self.command_line();
        let mode = if self.config.tty {
            PipeMode::Tty
        } else if self.config.pty {
            PipeMode::Pty
        } else {
            PipeMode::Pipes {
                capture_output: !self.config.output_disabled,
            }
        };
        let spawn_failed = |source| ProcessError::SpawnFailed {
            command: command_line.clone(),
            source,
        };

        let mut layout = PipeLayout::prepare(mode, self.config.input.is_some(), self.sigchild)
            .map_err(spawn_failed)?;
        let (mut command, owns_group) = self.build_command();
        layout.configure(&mut command).map_err(spawn_failed)?;

        debug!(command = %command_line, mode = ?mode, sigchild = self.sigchild, "Spawning process");
        let mut child = command.spawn().map_err(spawn_failed)?;

        let feeder = InputFeeder::new(self.config.input.clone());
        let pipes = match layout.attach(&mut child, feeder, self.config.effective_poll_interval()) {
            Ok(pipes) => pipes,
            Err(e) => {
                if let Err(kill_error) = child.kill() {
                    warn!(pid = child.id(), error = %kill_error, "Failed to kill unattached child");
                }
                if let Err(wait_error) = child.wait() {
                    warn!(pid = child.id(), error = %wait_error, "Failed to reap unattached child");
                }
                return Err(spawn_failed(e));
            }
        };

        let handle = ProcessHandle::new(child, owns_group);
        info!(pid = %handle.pid(), command = %command_line, "Process spawned");

        let now = Instant::now();
        self.handle = Some(handle);
        self.pipes = Some(pipes);
        self.handler = handler;
        self.start_time = Some(now);
        self.last_output_time = Some(now);
        self.status = ProcessStatus::Started;

        if self.config.tty {
            return Ok(());
        }

        self.update_status()?;
        self.check_timeout()
    }

    fn validate(&self, has_handler: bool) -> Result<()> {
        if has_handler && self.config.output_disabled {
            return Err(ProcessError::InvalidState(
                "Output has been disabled, enable it to allow the use of a handler".to_string(),
            ));
        }
        if self.config.output_disabled && self.config.idle_timeout.is_some() {
            return Err(ProcessError::InvalidConfig(
                "An idle timeout requires output to be enabled".to_string(),
            ));
        }
        if self.config.tty && cfg!(windows) {
            return Err(ProcessError::PlatformUnsupported(
                "TTY mode is not supported on Windows".to_string(),
            ));
        }
        if self.config.pty && !self.config.tty && !platform::pty_supported() {
            return Err(ProcessError::PlatformUnsupported(
                "PTY mode is not supported on this host".to_string(),
            ));
        }
        if let Some(dir) = &self.config.working_dir {
            if !dir.is_dir() {
                return Err(ProcessError::InvalidConfig(format!(
                    "The provided working directory \"{}\" does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Build the OS command; the flag tells whether the child leads its own group
    fn build_command(&self) -> (Command, bool) {
        let mut command = match &self.config.command {
            ProcessCommand::Exec { program, args } if !self.sigchild => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            other => {
                let line = other.command_line();
                if self.sigchild {
                    shell_command(&format!(
                        "({line}) 3>/dev/null; code=$?; echo $code >&3; exit $code"
                    ))
                } else {
                    shell_command(&line)
                }
            }
        };

        if !self.config.inherit_env {
            command.env_clear();
        }
        for (key, value) in &self.config.env {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        let owns_group = {
            use std::os::unix::process::CommandExt;

            // The terminal's foreground job must stay in the caller's group
            if self.config.tty {
                false
            } else {
                command.process_group(0);
                true
            }
        };

        #[cfg(windows)]
        let owns_group = {
            use std::os::windows::process::CommandExt;

            const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
            if self.config.options.create_new_console {
                command.creation_flags(CREATE_NEW_CONSOLE);
            }
            true
        };

        (command, owns_group)
    }

    fn restart_inner(
        &mut self,
        handler: Option<Box<dyn OutputHandler>>,
    ) -> Result<ProcessSupervisor> {
        if self.is_running() {
            return Err(ProcessError::AlreadyRunning);
        }
        let mut process = ProcessSupervisor::new(self.config.clone());
        process.start_inner(handler)?;
        Ok(process)
    }

    fn wait_for_exit(&mut self) -> Result<i32> {
        let mut backoff = MIN_BACKOFF;
        while self.status == ProcessStatus::Started {
            self.check_timeout()?;
            let blocking = self.pipes_open();
            self.poll(blocking, &mut None)?;
            if !blocking && self.status == ProcessStatus::Started {
                backoff = self.back_off(backoff);
            }
        }

        if let Some(signal) = self.term_signal {
            if self.latest_signal != Some(signal) {
                return Err(ProcessError::SignaledUnexpectedly { signal });
            }
        }

        Ok(self.exit_code.unwrap_or(-1))
    }

    fn ensure_success(&self, code: i32) -> Result<()> {
        if code == 0 {
            return Ok(());
        }

        let captured = |buffer: &OutputBuffer| buffer.contents().to_vec();
        let (output, error_output) = if self.config.output_disabled {
            (None, None)
        } else {
            (Some(captured(&self.stdout)), Some(captured(&self.stderr)))
        };

        Err(ProcessError::ProcessFailed(Box::new(ProcessFailure {
            command: self.command_line(),
            exit_code: code,
            exit_code_text: exit_code::exit_code_text(code),
            working_dir: self
                .config
                .working_dir
                .clone()
                .or_else(|| std::env::current_dir().ok()),
            output,
            error_output,
        })))
    }

    fn require_started(&self, operation: &'static str) -> Result<()> {
        if self.status == ProcessStatus::Ready {
            return Err(ProcessError::NotStarted { operation });
        }
        Ok(())
    }

    fn refresh_output(&mut self, operation: &'static str) -> Result<()> {
        if self.config.output_disabled {
            return Err(ProcessError::OutputDisabled);
        }
        self.require_started(operation)?;
        self.update_status()
    }

    /// Poll the child for status changes, logging instead of failing
    fn refresh(&mut self) {
        if let Err(e) = self.update_status() {
            warn!(pid = ?self.handle_pid(), error = %e, "Failed to refresh process status");
        }
    }

    fn update_status(&mut self) -> Result<()> {
        self.poll(false, &mut None).map(|_| ())
    }

    /// One poll step: forward pipe output while the child runs, or reap it
    /// once it has exited
    ///
    /// Returns whether `until` accepted any chunk.
    fn poll(
        &mut self,
        blocking: bool,
        until: &mut Option<ChunkPredicate<'_>>,
    ) -> Result<bool> {
        if self.status != ProcessStatus::Started {
            return Ok(false);
        }

        let exited = match self.handle.as_mut() {
            Some(handle) => handle.try_exit()?,
            None => Some(OsExit::unknown()),
        };
        match exited {
            None => self.read_pipes(blocking, until),
            Some(os) => Ok(self.finish(os, until)),
        }
    }

    /// Poll the pipes once, forwarding what arrived
    ///
    /// Returns whether `until` accepted any chunk.
    fn read_pipes(
        &mut self,
        blocking: bool,
        until: &mut Option<ChunkPredicate<'_>>,
    ) -> Result<bool> {
        let Some(pipes) = self.pipes.as_mut() else {
            return Ok(false);
        };
        let chunks = pipes.read_and_write(blocking, false)?;
        Ok(self.dispatch(chunks, until))
    }

    /// Move chunks to the handler and buffers, in read order
    fn dispatch(
        &mut self,
        chunks: Vec<PipeChunk>,
        until: &mut Option<ChunkPredicate<'_>>,
    ) -> bool {
        let mut matched = false;
        for chunk in chunks {
            let stream = match chunk.channel {
                PipeChannel::Output(stream) => stream,
                PipeChannel::ExitStatus => {
                    self.exit_status_payload.extend_from_slice(&chunk.data);
                    continue;
                }
            };

            self.last_output_time = Some(Instant::now());
            match stream {
                OutputStream::Stdout => self.stdout.push(&chunk.data),
                OutputStream::Stderr => self.stderr.push(&chunk.data),
            }
            if let Some(handler) = self.handler.as_mut() {
                handler.on_chunk(stream, &chunk.data);
            }
            if let Some(predicate) = until.as_mut() {
                matched |= (*predicate)(stream, &chunk.data);
            }
        }
        matched
    }

    /// Record the exit, release pipes and handle
    fn finish(&mut self, os: OsExit, until: &mut Option<ChunkPredicate<'_>>) -> bool {
        let mut matched = false;
        // Drain what the child left behind. A quiet poll or one poll interval
        // ends the drain; descendants holding the pipes open lose the rest.
        let deadline = Instant::now().checked_add(self.config.effective_poll_interval());
        while let Some(pipes) = self.pipes.as_mut() {
            if !pipes.are_open() {
                break;
            }
            match pipes.read_and_write(true, true) {
                Ok(chunks) if chunks.is_empty() => break,
                Ok(chunks) => {
                    matched |= self.dispatch(chunks, until);
                }
                Err(e) => {
                    warn!(pid = ?self.handle_pid(), error = %e, "Final pipe drain failed");
                    break;
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                debug!(pid = ?self.handle_pid(), "Pipes still busy after exit, closing them");
                break;
            }
        }
        if let Some(mut pipes) = self.pipes.take() {
            pipes.close();
        }

        if self.sigchild {
            self.fallback_exit_code = String::from_utf8_lossy(&self.exit_status_payload)
                .trim()
                .parse()
                .ok();
        }

        let pid = self.handle_pid();
        self.handle = None;
        self.handler = None;

        let code = resolve_exit_code(os, self.fallback_exit_code);
        self.term_signal = os.signal;
        self.exit_code = Some(code);
        self.status = ProcessStatus::Terminated;

        info!(
            pid = ?pid,
            exit_code = code,
            signal = ?os.signal,
            "Process terminated"
        );
        matched
    }

    /// Terminate the supervisor around a child the OS would not stop or reap
    fn abandon(&mut self, error: io::Error, context: &'static str) -> ProcessError {
        warn!(pid = ?self.handle_pid(), error = %error, "{context}");
        self.finish(OsExit::unknown(), &mut None);
        error.into()
    }

    fn deliver_signal(&mut self, signal: i32) -> Result<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or(ProcessError::NotRunning { operation: "signal" })?;

        handle
            .signal(signal)
            .map_err(|e| ProcessError::SignalDeliveryFailed {
                signal,
                reason: e.to_string(),
            })?;
        self.latest_signal = Some(signal);
        Ok(())
    }

    fn pipes_open(&self) -> bool {
        self.pipes.as_ref().is_some_and(|pipes| pipes.are_open())
    }

    fn handle_pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::pid)
    }

    /// Sleep for `current` and return the next, doubled, back-off step
    fn back_off(&self, current: Duration) -> Duration {
        thread::sleep(current);
        (current * 2).min(self.config.effective_poll_interval())
    }
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("command", &self.command_line())
            .field("status", &self.status)
            .field("pid", &self.handle_pid())
            .field("exit_code", &self.exit_code)
            .field("sigchild", &self.sigchild)
            .finish_non_exhaustive()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.status != ProcessStatus::Started {
            return;
        }

        // A child in its own console outlives the supervisor
        if self.config.options.create_new_console {
            debug!(pid = ?self.handle_pid(), "Detaching process on drop");
            if let Some(mut pipes) = self.pipes.take() {
                pipes.close();
            }
            return;
        }

        if let Err(e) = self.stop_with(Duration::ZERO, None) {
            warn!(pid = ?self.handle_pid(), error = %e, "Failed to stop process on drop");
        }
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    use std::os::windows::process::CommandExt;

    let mut command = Command::new("cmd");
    command
        .args(["/V:ON", "/E:ON", "/D", "/C"])
        .raw_arg(format!("({line})"));
    command
}
