//! Opaque owned handle to a running OS process

use std::io;
use std::process::Child;

use tracing::debug;

use crate::exit_code::OsExit;
use crate::platform;

/// Exclusive owner of a spawned child; never handed to callers
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    child: Child,
    pid: u32,
    /// The child leads its own process group
    owns_group: bool,
}

impl ProcessHandle {
    pub(crate) fn new(child: Child, owns_group: bool) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            owns_group,
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking status check; `None` while the child runs
    pub(crate) fn try_exit(&mut self) -> io::Result<Option<OsExit>> {
        match self.child.try_wait() {
            Ok(status) => Ok(status.map(OsExit::from_status)),
            Err(e) if reaped_elsewhere(&e) => {
                debug!(pid = %self.pid, "Child already reaped, exit status unavailable");
                Ok(Some(OsExit::unknown()))
            }
            Err(e) => Err(e),
        }
    }

    /// Block until the child has exited
    pub(crate) fn wait_exit(&mut self) -> io::Result<OsExit> {
        match self.child.wait() {
            Ok(status) => Ok(OsExit::from_status(status)),
            Err(e) if reaped_elsewhere(&e) => Ok(OsExit::unknown()),
            Err(e) => Err(e),
        }
    }

    /// Deliver a signal to the child's process group (or the child alone)
    pub(crate) fn signal(&self, signal: i32) -> io::Result<()> {
        platform::send_signal(self.pid, signal, self.owns_group)
    }

    /// Forceful platform kill of the child itself
    pub(crate) fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// `waitpid` reports ECHILD once the kernel auto-reaped the child
#[cfg(unix)]
fn reaped_elsewhere(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::ECHILD)
}

#[cfg(not(unix))]
fn reaped_elsewhere(_e: &io::Error) -> bool {
    false
}
