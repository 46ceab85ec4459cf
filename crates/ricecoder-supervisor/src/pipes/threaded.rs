//! Thread-backed pipes for platforms without non-blocking anonymous pipes
//!
//! Each output stream gets a reader thread that forwards chunks over a
//! channel; stdin gets a writer thread fed through a bounded channel. The
//! supervisor sees the same `PipeSet` contract as on Unix.

#![cfg_attr(unix, allow(dead_code, unused_imports))]

use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::{PipeChannel, PipeChunk, PipeSet, READ_CHUNK_SIZE};
use crate::input::{Feed, InputFeeder};
use crate::output::OutputStream;

/// Chunks queued for the writer thread before `read_and_write` stops feeding
const WRITER_QUEUE_DEPTH: usize = 4;

/// Wait used when only a live input stream is open
const INPUT_WAIT: Duration = Duration::from_millis(10);

enum ReaderEvent {
    Data(PipeChannel, Vec<u8>),
    Closed(PipeChannel),
}

/// Pipe set emulating non-blocking I/O with helper threads
pub(crate) struct ThreadedPipes {
    events: Receiver<ReaderEvent>,
    sender: mpsc::Sender<ReaderEvent>,
    open_readers: usize,
    readers: Vec<JoinHandle<()>>,
    stdin: Option<SyncSender<Vec<u8>>>,
    /// Chunk rejected by a full writer queue
    pending: Option<Vec<u8>>,
    input: InputFeeder,
    poll_interval: Duration,
}

impl ThreadedPipes {
    pub(crate) fn new(input: InputFeeder, poll_interval: Duration) -> Self {
        let (sender, events) = mpsc::channel();
        Self {
            events,
            sender,
            open_readers: 0,
            readers: Vec::new(),
            stdin: None,
            pending: None,
            input,
            poll_interval,
        }
    }

    /// Start forwarding everything `reader` produces
    pub(crate) fn add_reader(
        &mut self,
        channel: PipeChannel,
        mut reader: impl Read + Send + 'static,
    ) -> io::Result<()> {
        let sender = self.sender.clone();
        let handle = thread::Builder::new()
            .name(format!("supervisor-reader-{channel:?}").to_lowercase())
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if sender
                                .send(ReaderEvent::Data(channel, buf[..n].to_vec()))
                                .is_err()
                            {
                                return;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!(?channel, error = %e, "Reader thread failed, closing channel");
                            break;
                        }
                    }
                }
                let _ = sender.send(ReaderEvent::Closed(channel));
            })?;

        self.readers.push(handle);
        self.open_readers += 1;
        Ok(())
    }

    /// Start a writer thread that owns the child's stdin
    pub(crate) fn set_writer(&mut self, mut writer: impl Write + Send + 'static) -> io::Result<()> {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(WRITER_QUEUE_DEPTH);
        thread::Builder::new()
            .name("supervisor-writer".to_string())
            .spawn(move || {
                for chunk in rx {
                    if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                        debug!(error = %e, "Child stdin closed early");
                        return;
                    }
                }
            })?;
        self.stdin = Some(tx);
        Ok(())
    }

    fn write_input(&mut self) -> io::Result<()> {
        while let Some(stdin) = self.stdin.as_ref() {
            let chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None => match self.input.next_chunk()? {
                    Feed::Data(data) => data,
                    Feed::Pending => return Ok(()),
                    Feed::Finished => {
                        debug!("Input exhausted, closing stdin");
                        self.stdin = None;
                        return Ok(());
                    }
                },
            };

            match stdin.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    self.pending = Some(chunk);
                    return Ok(());
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.stdin = None;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, event: ReaderEvent, chunks: &mut Vec<PipeChunk>) {
        match event {
            ReaderEvent::Data(channel, data) => match chunks.last_mut() {
                Some(last) if last.channel == channel => last.data.extend(data),
                _ => chunks.push(PipeChunk { channel, data }),
            },
            ReaderEvent::Closed(channel) => {
                debug!(?channel, "Channel reached EOF");
                self.open_readers = self.open_readers.saturating_sub(1);
            }
        }
    }
}

impl PipeSet for ThreadedPipes {
    fn read_and_write(&mut self, blocking: bool, close: bool) -> io::Result<Vec<PipeChunk>> {
        self.write_input()?;

        let mut chunks = Vec::new();
        if blocking && self.open_readers > 0 {
            match self.events.recv_timeout(self.poll_interval) {
                Ok(event) => self.record(event, &mut chunks),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.open_readers = 0,
            }
        } else if blocking && self.stdin.is_some() {
            thread::sleep(self.poll_interval.min(INPUT_WAIT));
        }

        while let Ok(event) = self.events.try_recv() {
            self.record(event, &mut chunks);
        }

        if close {
            self.stdin = None;
            self.pending = None;
        }
        Ok(chunks)
    }

    fn are_open(&self) -> bool {
        self.stdin.is_some() || self.open_readers > 0
    }

    fn close(&mut self) {
        self.stdin = None;
        self.pending = None;
        // Reader threads end on their own once the child side closes; they are detached.
        self.open_readers = 0;
        self.readers.clear();
    }
}

/// Pre-spawn wiring for the thread-backed pipe set
#[cfg(not(unix))]
#[derive(Debug)]
pub(crate) struct ThreadedLayout {
    mode: super::PipeMode,
    has_input: bool,
}

#[cfg(not(unix))]
impl ThreadedLayout {
    pub(crate) fn prepare(
        mode: super::PipeMode,
        has_input: bool,
        side_channel: bool,
    ) -> io::Result<Self> {
        if matches!(mode, super::PipeMode::Pty) || side_channel {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "pseudo-terminals and sigchild mode are not available on this platform",
            ));
        }
        Ok(Self { mode, has_input })
    }

    pub(crate) fn configure(&mut self, command: &mut std::process::Command) -> io::Result<()> {
        use std::process::Stdio;

        match self.mode {
            super::PipeMode::Pipes { capture_output } => {
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
            _ => {
                command.stdin(Stdio::inherit());
                command.stdout(Stdio::inherit());
                command.stderr(Stdio::inherit());
            }
        }
        Ok(())
    }

    pub(crate) fn attach(
        self,
        child: &mut std::process::Child,
        input: InputFeeder,
        poll_interval: Duration,
    ) -> io::Result<Box<dyn PipeSet>> {
        let mut pipes = ThreadedPipes::new(input, poll_interval);
        if let Some(stdout) = child.stdout.take() {
            pipes.add_reader(PipeChannel::Output(OutputStream::Stdout), stdout)?;
        }
        if let Some(stderr) = child.stderr.take() {
            pipes.add_reader(PipeChannel::Output(OutputStream::Stderr), stderr)?;
        }
        if let Some(stdin) = child.stdin.take() {
            pipes.set_writer(stdin)?;
        }
        Ok(Box::new(pipes))
    }
}
