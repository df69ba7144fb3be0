//! archbench: one request/response contract, three server architectures.
//!
//! - [`arch::blocking`]: thread per connection with ordered write lanes
//! - [`arch::completion`]: completion-driven tasks on a tokio runtime
//! - [`arch::reactor`]: two mio readiness loops, one reading and one writing
//!
//! All of them speak the framing in [`codec`] and are built through
//! [`Architecture`], so a benchmark can swap them behind [`Server`] and [`Client`].

pub mod arch;
pub mod codec;
pub mod config;
pub mod contract;
pub mod endpoint;
pub mod error;

pub use arch::Architecture;
pub use config::ServerOptions;
pub use contract::{
    Client, NoopTimeLogger, RequestContext, RequestHandler, Responder, ResponseContext,
    ResponseHandler, Server, TimeLogger,
};
pub use endpoint::{Endpoint, IpAddress, Port};
pub use error::{Error, Result};
