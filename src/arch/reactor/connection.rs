//! State shared between the read loop, response emitters and the write loop.

use crate::arch::lifecycle::lock;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Token, Waker};
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Mutex};

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Encoded responses for one connection, oldest first.
#[derive(Debug, Default)]
pub(crate) struct Outbound {
    frames: Mutex<VecDeque<Bytes>>,
}

impl Outbound {
    pub fn push(&self, frame: Bytes) {
        lock(&self.frames).push_back(frame);
    }

    pub fn front(&self) -> Option<Bytes> {
        lock(&self.frames).front().cloned()
    }

    pub fn pop(&self) {
        lock(&self.frames).pop_front();
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        lock(&self.frames).is_empty()
    }
}

/// Work handed to the write loop from other threads.
pub(crate) enum WriteCommand {
    /// A new connection; `stream` is the write loop's own handle to the socket.
    Attach {
        id: usize,
        stream: TcpStream,
        outbound: Arc<Outbound>,
    },
    /// A response was queued and the connection needs write interest.
    Ready { id: usize, outbound: Arc<Outbound> },
    /// The peer went away; forget the connection.
    Cancel(usize),
}

/// Cross-thread queue drained once per write loop iteration.
pub(crate) struct Registrations {
    commands: Mutex<Vec<WriteCommand>>,
    waker: Arc<Waker>,
}

impl Registrations {
    pub fn new(waker: Arc<Waker>) -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            waker,
        }
    }

    pub fn submit(&self, command: WriteCommand) {
        lock(&self.commands).push(command);
        let _ = self.waker.wake();
    }

    pub fn drain(&self) -> Vec<WriteCommand> {
        mem::take(&mut *lock(&self.commands))
    }
}
