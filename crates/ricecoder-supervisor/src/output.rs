//! Output capture: full and incremental buffers, chunk handlers

use std::fmt;

/// Which child stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("out"),
            OutputStream::Stderr => f.write_str("err"),
        }
    }
}

/// Receives output chunks in the order they are read from the pipes
///
/// Chunks of one stream are never reordered; stdout and stderr chunks
/// interleave in read order.
pub trait OutputHandler: Send {
    fn on_chunk(&mut self, stream: OutputStream, bytes: &[u8]);
}

impl<F> OutputHandler for F
where
    F: FnMut(OutputStream, &[u8]) + Send,
{
    fn on_chunk(&mut self, stream: OutputStream, bytes: &[u8]) {
        self(stream, bytes)
    }
}

/// Growing byte buffer with a cursor for incremental reads
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    data: Vec<u8>,
    read_offset: usize,
}

impl OutputBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Bytes appended since the previous call
    pub(crate) fn take_incremental(&mut self) -> Vec<u8> {
        let fresh = self.data.get(self.read_offset..).unwrap_or_default().to_vec();
        self.read_offset = self.data.len();
        fresh
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.read_offset = 0;
    }
}
