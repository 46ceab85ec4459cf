//! Exit code descriptions and termination status resolution

/// Text returned for codes missing from the table
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Human-readable description of an exit code
///
/// Covers shell conventions and `128 + signal` codes up to 159; 144, 156 and
/// 158 are deliberately unmapped.
pub fn exit_code_text(code: i32) -> &'static str {
    match code {
        0 => "OK",
        1 => "General error",
        2 => "Misuse of shell builtins",

        126 => "Invoked command cannot execute",
        127 => "Command not found",
        128 => "Invalid exit argument",

        // signals
        129 => "Hangup",
        130 => "Interrupt",
        131 => "Quit and dump core",
        132 => "Illegal instruction",
        133 => "Trace/breakpoint trap",
        134 => "Process aborted",
        135 => "Bus error: \"access to undefined portion of memory object\"",
        136 => "Floating point exception: \"erroneous arithmetic operation\"",
        137 => "Kill (terminate immediately)",
        138 => "User-defined 1",
        139 => "Segmentation violation",
        140 => "User-defined 2",
        141 => "Write to pipe with no one reading",
        142 => "Signal raised by alarm",
        143 => "Termination (request to terminate)",
        145 => "Child process terminated, stopped (or continued*)",
        146 => "Continue if stopped",
        147 => "Stop executing temporarily",
        148 => "Terminal stop signal",
        149 => "Background process attempting to read from tty (\"in\")",
        150 => "Background process attempting to write to tty (\"out\")",
        151 => "Urgent data available on socket",
        152 => "CPU time limit exceeded",
        153 => "File size limit exceeded",
        154 => "Signal raised by timer counting virtual time: \"virtual timer expired\"",
        155 => "Profiling timer expired",
        157 => "Pollable event",
        159 => "Bad syscall",

        _ => UNKNOWN_ERROR,
    }
}

/// What the OS reported when the child stopped running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct OsExit {
    /// Exit code for a normal exit
    pub code: Option<i32>,
    /// Terminating signal
    pub signal: Option<i32>,
}

impl OsExit {
    /// The child was reaped elsewhere and no status is available
    pub(crate) fn unknown() -> Self {
        Self::default()
    }

    pub(crate) fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Final exit code, in priority order: OS code, side-channel code,
/// `128 + signal`, then `-1`
pub(crate) fn resolve_exit_code(os: OsExit, fallback: Option<i32>) -> i32 {
    os.code
        .or(fallback)
        .or_else(|| os.signal.map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes() {
        assert_eq!(exit_code_text(0), "OK");
        assert_eq!(exit_code_text(127), "Command not found");
        assert_eq!(exit_code_text(137), "Kill (terminate immediately)");
        assert_eq!(exit_code_text(143), "Termination (request to terminate)");
        assert_eq!(exit_code_text(159), "Bad syscall");
    }

    #[test]
    fn test_gaps_are_unknown() {
        for code in [3, 42, 125, 144, 156, 158, 160, 255, -1] {
            assert_eq!(exit_code_text(code), UNKNOWN_ERROR, "code {code}");
        }
    }

    #[test]
    fn test_resolution_order() {
        let normal = OsExit {
            code: Some(3),
            signal: None,
        };
        assert_eq!(resolve_exit_code(normal, Some(7)), 3);

        assert_eq!(resolve_exit_code(OsExit::unknown(), Some(7)), 7);

        let signaled = OsExit {
            code: None,
            signal: Some(15),
        };
        assert_eq!(resolve_exit_code(signaled, None), 143);

        assert_eq!(resolve_exit_code(OsExit::unknown(), None), -1);
    }
}
