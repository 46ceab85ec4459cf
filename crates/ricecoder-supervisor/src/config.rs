//! Process configuration

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::input::ProcessInput;

/// Default wall-clock timeout for a supervised command
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default poll cadence of the supervision loop (timeout enforcement granularity)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Lower bound for the poll cadence
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessCommand {
    /// Program plus argument vector, executed without a shell
    Exec { program: String, args: Vec<String> },
    /// Command line interpreted by the platform shell (`sh -c` / `cmd /C`)
    Shell(String),
}

impl ProcessCommand {
    /// Human-readable command line, arguments escaped for the platform shell
    pub fn command_line(&self) -> String {
        match self {
            ProcessCommand::Exec { program, args } => std::iter::once(program)
                .chain(args.iter())
                .map(|part| escape_argument(part))
                .collect::<Vec<_>>()
                .join(" "),
            ProcessCommand::Shell(line) => line.clone(),
        }
    }
}

/// Platform spawn options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    /// Windows only: give the child its own console (`CREATE_NEW_CONSOLE`)
    pub create_new_console: bool,
    /// Override the process-wide sigchild probe (None = probe the host)
    pub sigchild_compatibility: Option<bool>,
}

/// Configuration for a supervised process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// What to execute
    pub command: ProcessCommand,
    /// Working directory (None = current dir)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Environment overrides; `None` removes the variable
    #[serde(default)]
    pub env: HashMap<String, Option<String>>,
    /// Start from the parent environment (false = empty environment)
    #[serde(default = "default_true")]
    pub inherit_env: bool,
    /// Bytes fed to stdin
    #[serde(skip)]
    pub input: Option<ProcessInput>,
    /// Wall-clock timeout (None or zero = no timeout)
    #[serde(default = "default_timeout", deserialize_with = "zero_disables")]
    pub timeout: Option<Duration>,
    /// Maximum silence between two outputs (None or zero = no idle timeout)
    #[serde(default, deserialize_with = "zero_disables")]
    pub idle_timeout: Option<Duration>,
    /// Discard stdout/stderr instead of capturing them
    #[serde(default)]
    pub output_disabled: bool,
    /// Hand the caller's terminal to the child
    #[serde(default)]
    pub tty: bool,
    /// Give the child a pseudo-terminal
    #[serde(default)]
    pub pty: bool,
    /// Supervision loop cadence
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Platform spawn options
    #[serde(default)]
    pub options: ProcessOptions,
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Option<Duration> {
    Some(DEFAULT_TIMEOUT)
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn zero_disables<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Duration>::deserialize(deserializer)?.and_then(non_zero))
}

impl ProcessConfig {
    /// Create configuration for a program executed without a shell
    pub fn new(program: impl Into<String>) -> Self {
        Self::with_command(ProcessCommand::Exec {
            program: program.into(),
            args: vec![],
        })
    }

    /// Create configuration for a shell command line
    pub fn shell(line: impl Into<String>) -> Self {
        Self::with_command(ProcessCommand::Shell(line.into()))
    }

    fn with_command(command: ProcessCommand) -> Self {
        Self {
            command,
            working_dir: None,
            env: HashMap::new(),
            inherit_env: true,
            input: None,
            timeout: Some(DEFAULT_TIMEOUT),
            idle_timeout: None,
            output_disabled: false,
            tty: false,
            pty: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            options: ProcessOptions::default(),
        }
    }

    /// Set command arguments
    ///
    /// For shell command lines the arguments are escaped and appended.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = args.into_iter().map(Into::into);
        match &mut self.command {
            ProcessCommand::Exec { args: current, .. } => *current = args.collect(),
            ProcessCommand::Shell(line) => {
                for arg in args {
                    line.push(' ');
                    line.push_str(&escape_argument(&arg));
                }
            }
        }
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), Some(value.into()));
        self
    }

    /// Remove an inherited environment variable
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env.insert(key.into(), None);
        self
    }

    /// Inherit the parent environment (default) or start from an empty one
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }

    /// Set stdin source
    pub fn input(mut self, input: impl Into<ProcessInput>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Set timeout in seconds (0 disables)
    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    /// Set timeout duration (zero disables)
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = non_zero(duration);
        self
    }

    /// Disable the wall-clock timeout
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set idle timeout duration (zero disables)
    pub fn idle_timeout(mut self, duration: Duration) -> Self {
        self.idle_timeout = non_zero(duration);
        self
    }

    /// Disable/enable stdout and stderr capture
    pub fn disable_output(mut self, disabled: bool) -> Self {
        self.output_disabled = disabled;
        self
    }

    /// Enable/disable TTY mode
    pub fn tty(mut self, enabled: bool) -> Self {
        self.tty = enabled;
        self
    }

    /// Enable/disable PTY mode
    pub fn pty(mut self, enabled: bool) -> Self {
        self.pty = enabled;
        self
    }

    /// Set the supervision loop cadence (clamped to [`MIN_POLL_INTERVAL`])
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Set platform spawn options
    pub fn options(mut self, options: ProcessOptions) -> Self {
        self.options = options;
        self
    }

    /// Command line as it would be typed in a shell
    pub fn command_line(&self) -> String {
        self.command.command_line()
    }

    /// Effective poll cadence, floored at [`MIN_POLL_INTERVAL`]
    pub(crate) fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

fn non_zero(duration: Duration) -> Option<Duration> {
    if duration.is_zero() {
        None
    } else {
        Some(duration)
    }
}

/// Escape a single argument for the platform shell
#[cfg(not(windows))]
pub fn escape_argument(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// Escape a single argument for the platform shell
#[cfg(windows)]
pub fn escape_argument(arg: &str) -> String {
    if arg.is_empty() {
        return "\"\"".to_string();
    }
    if !arg.contains(|c: char| c.is_whitespace() || "\"^%!&|<>()".contains(c)) {
        return arg.to_string();
    }
    let mut escaped = String::with_capacity(arg.len() + 2);
    escaped.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        if c == '\\' {
            backslashes += 1;
            continue;
        }
        if c == '"' {
            escaped.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
        } else {
            escaped.extend(std::iter::repeat('\\').take(backslashes));
        }
        escaped.push(c);
        backslashes = 0;
    }
    escaped.extend(std::iter::repeat('\\').take(backslashes * 2));
    escaped.push('"');
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessConfig::new("echo");
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(config.idle_timeout, None);
        assert!(config.inherit_env);
        assert!(!config.output_disabled);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = ProcessConfig::new("echo").timeout_secs(0);
        assert_eq!(config.timeout, None);

        let config = ProcessConfig::new("echo").idle_timeout(Duration::ZERO);
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_poll_interval_floor() {
        let config = ProcessConfig::new("echo").poll_interval(Duration::from_millis(1));
        assert_eq!(config.poll_interval, MIN_POLL_INTERVAL);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_line_escaping() {
        let config = ProcessConfig::new("echo").args(["it's", "a b"]);
        assert_eq!(config.command_line(), "'echo' 'it'\\''s' 'a b'");

        let config = ProcessConfig::shell("echo").args(["x y"]);
        assert_eq!(config.command_line(), "echo 'x y'");
    }

    #[test]
    fn test_env_overrides() {
        let config = ProcessConfig::new("env")
            .env("A", "1")
            .env_remove("B")
            .inherit_env(false);
        assert_eq!(config.env.get("A"), Some(&Some("1".to_string())));
        assert_eq!(config.env.get("B"), Some(&None));
        assert!(!config.inherit_env);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: ProcessConfig =
            serde_json::from_str(r#"{"command": {"shell": "echo hi"}}"#).unwrap();
        assert_eq!(config.command, ProcessCommand::Shell("echo hi".to_string()));
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
        assert!(config.inherit_env);
        assert!(config.input.is_none());
    }

    #[test]
    fn test_deserialize_zero_timeouts_disable() {
        let config: ProcessConfig = serde_json::from_str(
            r#"{
                "command": {"shell": "sleep 1"},
                "timeout": {"secs": 0, "nanos": 0},
                "idle_timeout": {"secs": 0, "nanos": 0}
            }"#,
        )
        .unwrap();
        assert_eq!(config.timeout, None);
        assert_eq!(config.idle_timeout, None);

        let config: ProcessConfig = serde_json::from_str(
            r#"{"command": {"shell": "sleep 1"}, "timeout": null, "idle_timeout": {"secs": 3, "nanos": 0}}"#,
        )
        .unwrap();
        assert_eq!(config.timeout, None);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(3)));
    }
}
