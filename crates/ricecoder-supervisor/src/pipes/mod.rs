//! Pipe sets: the child's standard streams behind one contract
//!
//! The supervisor never branches on platform: it asks [`PipeLayout`] to wire
//! the command before spawn and gets a boxed [`PipeSet`] back afterwards.
//! Unix uses non-blocking descriptors and `poll(2)`; other platforms emulate
//! non-blocking I/O with one thread per stream.

use std::io;

use crate::output::OutputStream;

pub(crate) mod threaded;
#[cfg(unix)]
pub(crate) mod unix;

#[cfg(not(unix))]
pub(crate) use threaded::ThreadedLayout as PipeLayout;
#[cfg(unix)]
pub(crate) use unix::UnixLayout as PipeLayout;

/// Bytes read from a single stream per read call
pub(crate) const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Source of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeChannel {
    Output(OutputStream),
    /// Sigchild side channel carrying the real exit code
    ExitStatus,
}

/// Bytes read from one channel during one `read_and_write` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PipeChunk {
    pub channel: PipeChannel,
    pub data: Vec<u8>,
}

/// How the child's standard streams are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeMode {
    /// Child inherits the caller's terminal; nothing to read
    Tty,
    /// All three streams on a pseudo-terminal, read back as stdout
    Pty,
    /// Anonymous pipes; stdout/stderr go to the null device unless captured
    Pipes { capture_output: bool },
}

/// Owned set of pipes connected to a running child
pub(crate) trait PipeSet: Send {
    /// Feed pending stdin bytes and collect available output
    ///
    /// With `blocking`, waits up to the poll interval for activity. With
    /// `close`, stdin is released as the child is gone. Channels that reach
    /// EOF are always released.
    fn read_and_write(&mut self, blocking: bool, close: bool) -> io::Result<Vec<PipeChunk>>;

    /// Whether any channel is still open
    fn are_open(&self) -> bool;

    /// Release every channel
    fn close(&mut self);
}
