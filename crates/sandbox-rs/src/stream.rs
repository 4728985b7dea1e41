//! Line streams of a sandboxed program's output

use sandbox_core::{Result, SandboxError};
use std::io::{BufRead, BufReader};
use std::os::fd::OwnedFd;
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::thread;

/// One event from a running sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    /// A line the program wrote to stdout
    Stdout(String),
    /// A line the program wrote to stderr
    Stderr(String),
    /// The program is gone; always the last chunk
    Exit {
        exit_code: i32,
        signal: Option<i32>,
        timed_out: bool,
        violations: u64,
    },
}

/// Receiving side of a sandbox's output
#[derive(Debug)]
pub struct ProcessStream {
    receiver: Receiver<StreamChunk>,
}

impl ProcessStream {
    pub fn new() -> (ProcessStreamWriter, Self) {
        let (tx, rx) = channel();
        (ProcessStreamWriter { tx }, ProcessStream { receiver: rx })
    }

    /// Block for the next chunk; `None` once every writer is gone
    pub fn recv(&self) -> Option<StreamChunk> {
        self.receiver.recv().ok()
    }

    /// Next chunk if one is ready
    pub fn try_recv(&self) -> Result<Option<StreamChunk>> {
        match self.receiver.try_recv() {
            Ok(chunk) => Ok(Some(chunk)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SandboxError::NotRunning),
        }
    }
}

pub struct StreamIter {
    receiver: Receiver<StreamChunk>,
}

impl Iterator for StreamIter {
    type Item = StreamChunk;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

impl IntoIterator for ProcessStream {
    type Item = StreamChunk;
    type IntoIter = StreamIter;

    fn into_iter(self) -> Self::IntoIter {
        StreamIter {
            receiver: self.receiver,
        }
    }
}

/// Sending side, cloned into each reader thread
#[derive(Debug, Clone)]
pub struct ProcessStreamWriter {
    tx: Sender<StreamChunk>,
}

impl ProcessStreamWriter {
    pub fn send(&self, chunk: StreamChunk) -> Result<()> {
        self.tx
            .send(chunk)
            .map_err(|_| SandboxError::Io(std::io::Error::other("stream receiver dropped")))
    }
}

/// Forward each line read from `fd` until end of file
pub fn spawn_fd_reader(
    fd: OwnedFd,
    is_stderr: bool,
    writer: ProcessStreamWriter,
) -> Result<thread::JoinHandle<()>> {
    let name = if is_stderr { "sandbox-stderr" } else { "sandbox-stdout" };
    let handle = thread::Builder::new().name(name.into()).spawn(move || {
        let reader = BufReader::new(std::fs::File::from(fd));
        for line in reader.split(b'\n') {
            let Ok(line) = line else { break };
            let line = String::from_utf8_lossy(&line).into_owned();
            let chunk = if is_stderr {
                StreamChunk::Stderr(line)
            } else {
                StreamChunk::Stdout(line)
            };
            if writer.send(chunk).is_err() {
                break;
            }
        }
    })?;
    Ok(handle)
}
