//! Error taxonomy shared by the codec and every architecture.

use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The stream ended strictly inside an envelope.
    #[error("truncated frame: expected {expected} bytes, received {received}")]
    Framing { expected: usize, received: usize },

    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("failed to decode payload: {0}")]
    Payload(#[from] bincode::error::DecodeError),

    #[error("payload has {trailing} unread trailing bytes")]
    TrailingBytes { trailing: usize },

    #[error("failed to encode payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("server {0} has already been started")]
    AlreadyStarted(String),

    #[error("server {0} has been closed")]
    ServerClosed(String),

    #[error("request handler panicked")]
    HandlerPanicked,

    #[error("client has been closed")]
    ClientClosed,

    #[error("invalid IP address '{0}'")]
    InvalidAddress(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid endpoint '{0}', expected <ip>:<port>")]
    InvalidEndpoint(String),
}

impl Error {
    /// True for failures that only mean the peer went away.
    ///
    /// These end a connection quietly instead of being reported as faults.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }
}

pub(crate) fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}
