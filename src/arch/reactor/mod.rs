//! Readiness-based reactor on mio.
//!
//! Exactly two threads serve every connection. The read loop owns the
//! listener and each connection's [`FrameDecoder`](crate::codec::FrameDecoder);
//! the write loop owns a duplicate of each socket and its write interest.
//! Responses travel from handlers to the write loop through a per-connection
//! [`Outbound`](connection::Outbound) queue plus a command queue drained once
//! per iteration.
//!
//! There is no reactor client: the async client speaks the same wire format.

mod connection;
mod read_loop;
mod server;
mod write_loop;

pub use server::ReactorServer;
