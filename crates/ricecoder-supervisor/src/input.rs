//! Stdin sources for supervised processes

use std::fmt;
use std::io::{self, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{ProcessError, Result};

/// Bytes pulled from a reader per read call
const INPUT_CHUNK_SIZE: usize = 16 * 1024;

/// Bytes a reader pump may queue ahead of the child
const PUMP_HIGH_WATER: usize = 4 * INPUT_CHUNK_SIZE;

/// Pause of a reader pump while its queue is full or the reader would block
const PUMP_WAIT: Duration = Duration::from_millis(5);

/// Data written to the child's stdin
#[derive(Clone)]
pub enum ProcessInput {
    /// Fixed buffer, written once and then stdin is closed
    Bytes(Vec<u8>),
    /// Lazy source read chunk by chunk until EOF, on a helper thread so a
    /// reader with nothing to say cannot stall supervision
    Reader(Arc<Mutex<Box<dyn Read + Send>>>),
    /// Live stream the caller keeps writing to while the process runs
    Stream(InputStream),
}

impl ProcessInput {
    /// Wrap a lazy reader
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        ProcessInput::Reader(Arc::new(Mutex::new(Box::new(reader))))
    }
}

impl fmt::Debug for ProcessInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessInput::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ProcessInput::Reader(_) => f.write_str("Reader(..)"),
            ProcessInput::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

impl From<Vec<u8>> for ProcessInput {
    fn from(bytes: Vec<u8>) -> Self {
        ProcessInput::Bytes(bytes)
    }
}

impl From<&[u8]> for ProcessInput {
    fn from(bytes: &[u8]) -> Self {
        ProcessInput::Bytes(bytes.to_vec())
    }
}

impl From<&str> for ProcessInput {
    fn from(text: &str) -> Self {
        ProcessInput::Bytes(text.as_bytes().to_vec())
    }
}

impl From<String> for ProcessInput {
    fn from(text: String) -> Self {
        ProcessInput::Bytes(text.into_bytes())
    }
}

impl From<InputStream> for ProcessInput {
    fn from(stream: InputStream) -> Self {
        ProcessInput::Stream(stream)
    }
}

#[derive(Debug, Default)]
struct StreamState {
    buffer: Vec<u8>,
    closed: bool,
}

/// Caller-fed stdin stream; cloning shares the same stream
///
/// The child's stdin stays open until [`InputStream::close`] is called and
/// everything written so far has been delivered.
#[derive(Clone, Default)]
pub struct InputStream {
    state: Arc<Mutex<StreamState>>,
}

impl InputStream {
    /// Create an open, empty stream
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the child
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return Err(ProcessError::InvalidState(
                "Cannot write to a closed input stream".to_string(),
            ));
        }
        state.buffer.extend_from_slice(data.as_ref());
        Ok(())
    }

    /// Signal end of input
    pub fn close(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    fn take_available(&self) -> (Vec<u8>, bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        (std::mem::take(&mut state.buffer), state.closed)
    }

    fn buffered(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).buffer.len()
    }
}

/// Copy a blocking reader into a fresh stream from a helper thread
///
/// The pump stops at EOF, on a read error, or once the stream is closed by
/// the consumer. A restarted process shares the reader and picks up where the
/// previous pump stopped.
fn spawn_reader_pump(reader: Arc<Mutex<Box<dyn Read + Send>>>) -> io::Result<InputStream> {
    let stream = InputStream::new();
    let sink = stream.clone();

    thread::Builder::new()
        .name("supervisor-input".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; INPUT_CHUNK_SIZE];
            loop {
                while sink.buffered() >= PUMP_HIGH_WATER && !sink.is_closed() {
                    thread::sleep(PUMP_WAIT);
                }
                if sink.is_closed() {
                    return;
                }

                let read = reader.lock().unwrap_or_else(|e| e.into_inner()).read(&mut buf);
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if sink.write(&buf[..n]).is_err() {
                            debug!(dropped = n, "Input consumer went away");
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(PUMP_WAIT),
                    Err(e) => {
                        warn!(error = %e, "Input reader failed, closing stdin");
                        break;
                    }
                }
            }
            sink.close();
        })?;

    Ok(stream)
}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("InputStream")
            .field("buffered", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Result of one feed step
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Feed {
    Data(Vec<u8>),
    /// Nothing available yet, stdin stays open
    Pending,
    /// Source exhausted, stdin must be closed
    Finished,
}

/// Pulls chunks out of a [`ProcessInput`] for the pipe writer
pub(crate) struct InputFeeder {
    source: Option<ProcessInput>,
    /// Stream filled by a reader pump; closed when the feeder goes away
    pumped: Option<InputStream>,
}

impl InputFeeder {
    pub(crate) fn new(source: Option<ProcessInput>) -> Self {
        Self {
            source,
            pumped: None,
        }
    }

    pub(crate) fn next_chunk(&mut self) -> io::Result<Feed> {
        if let Some(ProcessInput::Reader(reader)) = &self.source {
            let stream = spawn_reader_pump(Arc::clone(reader))?;
            self.source = Some(ProcessInput::Stream(stream.clone()));
            self.pumped = Some(stream);
        }

        let feed = match &mut self.source {
            None => Feed::Finished,
            Some(ProcessInput::Bytes(bytes)) => {
                let bytes = std::mem::take(bytes);
                self.source = None;
                if bytes.is_empty() {
                    Feed::Finished
                } else {
                    Feed::Data(bytes)
                }
            }
            // Replaced by its pump above
            Some(ProcessInput::Reader(_)) => Feed::Pending,
            Some(ProcessInput::Stream(stream)) => {
                let (data, closed) = stream.take_available();
                if !data.is_empty() {
                    Feed::Data(data)
                } else if closed {
                    self.source = None;
                    Feed::Finished
                } else {
                    Feed::Pending
                }
            }
        };
        Ok(feed)
    }
}

impl Drop for InputFeeder {
    fn drop(&mut self) {
        if let Some(stream) = self.pumped.take() {
            stream.close();
        }
    }
}
