//! Process manager - async facade over blocking supervisors

use tracing::debug;

use crate::{
    config::ProcessConfig,
    error::{ProcessError, Result},
    output::OutputHandler,
    supervisor::ProcessSupervisor,
};

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutcome {
    fn collect(exit_code: i32, process: &mut ProcessSupervisor) -> Result<Self> {
        if process.is_output_disabled() {
            return Ok(Self {
                exit_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            });
        }

        Ok(Self {
            exit_code,
            stdout: process.output()?.to_vec(),
            stderr: process.error_output()?.to_vec(),
        })
    }

    pub fn is_successful(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout decoded lossily as UTF-8
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs supervisors for async callers
///
/// Each supervisor blocks its own thread from tokio's blocking pool, so many
/// processes can be awaited concurrently without stalling the runtime.
pub struct ProcessManager;

impl ProcessManager {
    /// Create new process manager
    pub fn new() -> Self {
        Self
    }

    /// Build a Ready supervisor for callers that drive it themselves
    pub fn supervisor(&self, config: ProcessConfig) -> ProcessSupervisor {
        ProcessSupervisor::new(config)
    }

    /// Start a process and hand back its running supervisor
    ///
    /// # Examples
    /// ```no_run
    /// use ricecoder_supervisor::{ProcessManager, ProcessConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = ProcessManager::new();
    /// let config = ProcessConfig::new("sleep").args(["1000"]);
    /// let process = manager.spawn(config).await?;
    /// manager.shutdown(process).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn(&self, config: ProcessConfig) -> Result<ProcessSupervisor> {
        blocking(move || {
            let mut process = ProcessSupervisor::new(config);
            process.start()?;
            Ok(process)
        })
        .await
    }

    /// Run a process to completion and collect its output
    ///
    /// # Examples
    /// ```no_run
    /// use ricecoder_supervisor::{ProcessManager, ProcessConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = ProcessManager::new();
    /// let outcome = manager.run(ProcessConfig::new("echo").args(["hello"])).await?;
    /// assert_eq!(outcome.stdout_lossy(), "hello\n");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(&self, config: ProcessConfig) -> Result<ProcessOutcome> {
        self.execute(config, None).await
    }

    /// Like [`run`](Self::run), forwarding chunks to `handler` from the worker thread
    pub async fn run_with(
        &self,
        config: ProcessConfig,
        handler: impl OutputHandler + 'static,
    ) -> Result<ProcessOutcome> {
        self.execute(config, Some(Box::new(handler))).await
    }

    /// Run and fail with [`ProcessError::ProcessFailed`] on a non-zero exit code
    pub async fn must_run(&self, config: ProcessConfig) -> Result<ProcessOutcome> {
        let outcome = blocking(move || {
            let mut process = ProcessSupervisor::new(config);
            process.must_run()?;
            ProcessOutcome::collect(0, &mut process)
        })
        .await?;
        Ok(outcome)
    }

    /// Stop a running supervisor (SIGTERM, then SIGKILL after the default grace)
    pub async fn shutdown(&self, mut process: ProcessSupervisor) -> Result<Option<i32>> {
        blocking(move || process.stop()).await
    }

    async fn execute(
        &self,
        config: ProcessConfig,
        handler: Option<Box<dyn OutputHandler>>,
    ) -> Result<ProcessOutcome> {
        debug!(command = %config.command_line(), "Running process on blocking pool");
        blocking(move || {
            let mut process = ProcessSupervisor::new(config);
            let exit_code = process.run_boxed(handler)?;
            ProcessOutcome::collect(exit_code, &mut process)
        })
        .await
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` on the blocking pool; a panicked or cancelled worker is a crash
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProcessError::Crashed {
            reason: e.to_string(),
        })?
}
