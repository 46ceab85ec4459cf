//! Unix pipes: non-blocking descriptors multiplexed with `poll(2)`

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use super::{PipeChannel, PipeChunk, PipeMode, PipeSet, READ_CHUNK_SIZE};
use crate::input::{Feed, InputFeeder};
use crate::output::OutputStream;

/// Descriptor the sigchild wrapper writes the exit code to
pub(crate) const SIDE_CHANNEL_FD: RawFd = 3;

/// Upper bound on bytes drained from one channel per call, so a chatty child
/// cannot starve timeout checks
const MAX_DRAIN_PER_CALL: usize = 1024 * 1024;

/// Wait used when only a live input stream is open and nothing is pollable
const INPUT_WAIT: Duration = Duration::from_millis(10);

/// Pre-spawn wiring for the Unix pipe set
#[derive(Debug)]
pub(crate) struct UnixLayout {
    mode: PipeMode,
    has_input: bool,
    /// (master, slave)
    pty: Option<(OwnedFd, OwnedFd)>,
    /// (read end, write end)
    side_channel: Option<(OwnedFd, OwnedFd)>,
}

impl UnixLayout {
    pub(crate) fn prepare(mode: PipeMode, has_input: bool, side_channel: bool) -> io::Result<Self> {
        let pty = match mode {
            PipeMode::Pty => Some(open_pty()?),
            _ => None,
        };
        let side_channel = if side_channel {
            Some(open_pipe()?)
        } else {
            None
        };

        Ok(Self {
            mode,
            has_input,
            pty,
            side_channel,
        })
    }

    /// Point the command's stdio at this layout
    pub(crate) fn configure(&mut self, command: &mut Command) -> io::Result<()> {
        match self.mode {
            PipeMode::Tty => {
                command.stdin(Stdio::inherit());
                command.stdout(Stdio::inherit());
                command.stderr(Stdio::inherit());
            }
            PipeMode::Pty => {
                let (_, slave) = self
                    .pty
                    .as_ref()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "pty not prepared"))?;
                command.stdin(Stdio::from(slave.try_clone()?));
                command.stdout(Stdio::from(slave.try_clone()?));
                command.stderr(Stdio::from(slave.try_clone()?));
            }
            PipeMode::Pipes { capture_output } => {
                command.stdin(if self.has_input {
                    Stdio::piped()
                } else {
                    Stdio::null()
                });
                let output = || {
                    if capture_output {
                        Stdio::piped()
                    } else {
                        Stdio::null()
                    }
                };
                command.stdout(output());
                command.stderr(output());
            }
        }

        if let Some((_, write)) = &self.side_channel {
            let fd = write.as_raw_fd();
            // SAFETY: only async-signal-safe calls (dup2, fcntl) run between fork
            // and exec; `fd` stays open in the parent until the child has spawned.
            unsafe {
                command.pre_exec(move || {
                    if fd == SIDE_CHANNEL_FD {
                        if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                            return Err(io::Error::last_os_error());
                        }
                    } else if libc::dup2(fd, SIDE_CHANNEL_FD) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        Ok(())
    }

    /// Take the parent ends after a successful spawn
    pub(crate) fn attach(
        self,
        child: &mut Child,
        input: InputFeeder,
        poll_interval: Duration,
    ) -> io::Result<Box<dyn PipeSet>> {
        let mut stdin = None;
        let mut readers = Vec::new();

        match self.mode {
            PipeMode::Tty => {}
            PipeMode::Pty => {
                if let Some((master, slave)) = self.pty {
                    drop(slave);
                    let master = File::from(master);
                    if self.has_input {
                        stdin = Some(master.try_clone()?);
                    }
                    readers.push((PipeChannel::Output(OutputStream::Stdout), master));
                }
            }
            PipeMode::Pipes { .. } => {
                stdin = child.stdin.take().map(|s| File::from(OwnedFd::from(s)));
                if let Some(stdout) = child.stdout.take() {
                    readers.push((
                        PipeChannel::Output(OutputStream::Stdout),
                        File::from(OwnedFd::from(stdout)),
                    ));
                }
                if let Some(stderr) = child.stderr.take() {
                    readers.push((
                        PipeChannel::Output(OutputStream::Stderr),
                        File::from(OwnedFd::from(stderr)),
                    ));
                }
            }
        }

        if let Some((read, write)) = self.side_channel {
            drop(write);
            readers.push((PipeChannel::ExitStatus, File::from(read)));
        }

        for (_, reader) in &readers {
            set_nonblocking(reader.as_raw_fd())?;
        }
        if let Some(stdin) = &stdin {
            set_nonblocking(stdin.as_raw_fd())?;
        }

        Ok(Box::new(UnixPipes {
            stdin,
            pending: Vec::new(),
            input,
            readers,
            poll_interval,
        }))
    }
}

/// Non-blocking pipe set over raw descriptors
pub(crate) struct UnixPipes {
    stdin: Option<File>,
    /// Bytes taken from the input source but not yet accepted by the pipe
    pending: Vec<u8>,
    input: InputFeeder,
    readers: Vec<(PipeChannel, File)>,
    poll_interval: Duration,
}

impl UnixPipes {
    fn write_input(&mut self) -> io::Result<()> {
        while let Some(stdin) = self.stdin.as_mut() {
            if self.pending.is_empty() {
                match self.input.next_chunk()? {
                    Feed::Data(data) => self.pending = data,
                    Feed::Pending => return Ok(()),
                    Feed::Finished => {
                        debug!("Input exhausted, closing stdin");
                        self.stdin = None;
                        return Ok(());
                    }
                }
            }

            match stdin.write(&self.pending) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("Child closed stdin, dropping remaining input");
                    self.stdin = None;
                    self.pending.clear();
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Block until a channel is readable, stdin is writable, or `timeout` passes
    fn wait_ready(&self, timeout: Duration) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .readers
            .iter()
            .map(|(_, reader)| libc::pollfd {
                fd: reader.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        if let Some(stdin) = &self.stdin {
            if !self.pending.is_empty() {
                fds.push(libc::pollfd {
                    fd: stdin.as_raw_fd(),
                    events: libc::POLLOUT,
                    revents: 0,
                });
            }
        }

        if fds.is_empty() {
            if self.stdin.is_some() {
                std::thread::sleep(timeout.min(INPUT_WAIT));
            }
            return Ok(());
        }

        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: `fds` holds `fds.len()` initialized pollfd entries for descriptors
        // owned by `self`, all of which outlive the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        Ok(())
    }

    fn read_available(&mut self) -> Vec<PipeChunk> {
        let mut chunks = Vec::new();
        let mut still_open = Vec::with_capacity(self.readers.len());

        for (channel, mut reader) in self.readers.drain(..) {
            let (data, eof) = drain_nonblocking(&mut reader, channel);
            if !data.is_empty() {
                chunks.push(PipeChunk { channel, data });
            }
            if eof {
                debug!(?channel, "Channel reached EOF");
            } else {
                still_open.push((channel, reader));
            }
        }

        self.readers = still_open;
        chunks
    }
}

impl PipeSet for UnixPipes {
    fn read_and_write(&mut self, blocking: bool, close: bool) -> io::Result<Vec<PipeChunk>> {
        self.write_input()?;
        if blocking {
            self.wait_ready(self.poll_interval)?;
            self.write_input()?;
        }
        let chunks = self.read_available();

        if close {
            self.stdin = None;
            self.pending.clear();
        }
        Ok(chunks)
    }

    fn are_open(&self) -> bool {
        self.stdin.is_some() || !self.readers.is_empty()
    }

    fn close(&mut self) {
        self.stdin = None;
        self.pending.clear();
        self.readers.clear();
    }
}

/// Read until the descriptor would block; the flag reports EOF
fn drain_nonblocking(reader: &mut File, channel: PipeChannel) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut buf = [0u8; READ_CHUNK_SIZE];
    while out.len() < MAX_DRAIN_PER_CALL {
        match reader.read(&mut buf) {
            Ok(0) => return (out, true),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return (out, false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            // A pty master reports EIO once every slave descriptor is closed
            Err(e) if e.raw_os_error() == Some(libc::EIO) => return (out, true),
            Err(e) => {
                warn!(?channel, error = %e, "Read failed, closing channel");
                return (out, true);
            }
        }
    }
    (out, false)
}

fn open_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    use nix::pty::{openpty, Winsize};
    use nix::sys::termios::Termios;

    let pair = openpty(None::<&Winsize>, None::<&Termios>).map_err(io::Error::from)?;
    set_cloexec(pair.master.as_raw_fd())?;
    set_cloexec(pair.slave.as_raw_fd())?;
    Ok((pair.master, pair.slave))
}

fn open_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    // SAFETY: `fds` is valid storage for the two descriptors pipe(2) returns.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe(2) succeeded, so both descriptors are open and owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; errors are checked.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; errors are checked.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
