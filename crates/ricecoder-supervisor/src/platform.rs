//! Platform capability probes and signal delivery

use std::io;
use std::sync::OnceLock;

use tracing::{debug, warn};

/// Graceful termination request
pub const SIGTERM: i32 = 15;

/// Forced termination
pub const SIGKILL: i32 = 9;

static SIGCHILD_ENABLED: OnceLock<bool> = OnceLock::new();
static PTY_SUPPORTED: OnceLock<bool> = OnceLock::new();

/// Whether the host runs in sigchild compatibility mode
///
/// True when SIGCHLD is ignored (or `SA_NOCLDWAIT` is set): the kernel then
/// reaps children on its own and `waitpid` can no longer report their exit
/// status, so supervisors read it from a side channel instead. Probed once
/// per process.
pub fn sigchild_enabled() -> bool {
    *SIGCHILD_ENABLED.get_or_init(probe_sigchild)
}

/// Whether a pseudo-terminal can be opened on this host. Probed once per process.
pub fn pty_supported() -> bool {
    *PTY_SUPPORTED.get_or_init(probe_pty)
}

#[cfg(unix)]
fn probe_sigchild() -> bool {
    // SAFETY: an all-zero sigaction is a valid value for this plain C struct.
    let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
    // SAFETY: a null `act` only queries the disposition; `current` is valid, writable storage.
    let rc = unsafe { libc::sigaction(libc::SIGCHLD, std::ptr::null(), &mut current) };
    if rc != 0 {
        warn!(error = %io::Error::last_os_error(), "Failed to query SIGCHLD disposition");
        return false;
    }

    let enabled =
        current.sa_sigaction == libc::SIG_IGN || current.sa_flags & libc::SA_NOCLDWAIT != 0;
    debug!(enabled, "Probed sigchild compatibility");
    enabled
}

#[cfg(not(unix))]
fn probe_sigchild() -> bool {
    false
}

#[cfg(unix)]
fn probe_pty() -> bool {
    use nix::pty::{openpty, Winsize};
    use nix::sys::termios::Termios;

    match openpty(None::<&Winsize>, None::<&Termios>) {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "PTY probe failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn probe_pty() -> bool {
    false
}

/// Send `signal` to the process group led by `pid`, or to `pid` alone
#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, signal: i32, group: bool) -> io::Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let signal = Signal::try_from(signal).map_err(io::Error::from)?;
    let pid = i32::try_from(pid)
        .map(Pid::from_raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

    if group {
        match killpg(pid, signal) {
            Ok(()) => {
                debug!(pid = %pid, signal = %signal, "Sent signal to process group");
                return Ok(());
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to signal process group, trying process only");
            }
        }
    }

    kill(pid, signal).map_err(io::Error::from)?;
    debug!(pid = %pid, signal = %signal, "Sent signal to process");
    Ok(())
}

/// Windows has no signals: every request terminates the process tree
#[cfg(windows)]
pub(crate) fn send_signal(pid: u32, signal: i32, _group: bool) -> io::Result<()> {
    use std::process::{Command, Stdio};

    let taskkill = which::which("taskkill").unwrap_or_else(|_| "taskkill".into());
    let status = Command::new(taskkill)
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;

    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("taskkill failed for pid {} (exit {:?})", pid, status.code()),
        ));
    }

    debug!(pid = %pid, signal, "Windows process tree killed with taskkill");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probes_are_memoized() {
        assert_eq!(sigchild_enabled(), sigchild_enabled());
        assert_eq!(pty_supported(), pty_supported());
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_unknown_pid_fails() {
        // Highest pid value; never allocated on a test host.
        let err = send_signal(i32::MAX as u32, SIGTERM, true).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }
}
