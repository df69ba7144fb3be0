//! Blocking thread-per-connection architecture.

mod client;
mod lane;
mod server;

pub use client::BlockingClient;
pub use server::BlockingServer;
