//! The three server architectures and the factory that picks between them.

pub mod blocking;
pub mod completion;
pub mod reactor;

pub(crate) mod lifecycle;
pub(crate) mod listener;

use crate::codec::Payload;
use crate::config::ServerOptions;
use crate::contract::{Client, RequestHandler, ResponseHandler, Server, TimeLogger};
use crate::endpoint::{Endpoint, Port};
use blocking::{BlockingClient, BlockingServer};
use completion::{AsyncClient, AsyncServer};
use reactor::ReactorServer;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Thread per connection
    #[default]
    Blocking,
    /// Completion-driven tasks on tokio
    Async,
    /// Two mio readiness loops
    Reactor,
}

impl Architecture {
    pub const ALL: [Architecture; 3] = [
        Architecture::Blocking,
        Architecture::Async,
        Architecture::Reactor,
    ];

    pub fn server<Req, Resp, H>(
        self,
        port: Port,
        time_logger: Arc<dyn TimeLogger>,
        handler: H,
    ) -> Box<dyn Server>
    where
        Req: Payload,
        Resp: Payload,
        H: RequestHandler<Req, Resp>,
    {
        self.server_with_options(port, ServerOptions::default(), time_logger, handler)
    }

    pub fn server_with_options<Req, Resp, H>(
        self,
        port: Port,
        options: ServerOptions,
        time_logger: Arc<dyn TimeLogger>,
        handler: H,
    ) -> Box<dyn Server>
    where
        Req: Payload,
        Resp: Payload,
        H: RequestHandler<Req, Resp>,
    {
        match self {
            Architecture::Blocking => Box::new(BlockingServer::with_options(
                port,
                options,
                time_logger,
                handler,
            )),
            Architecture::Async => Box::new(AsyncServer::with_options(
                port,
                options,
                time_logger,
                handler,
            )),
            Architecture::Reactor => Box::new(ReactorServer::with_options(
                port,
                options,
                time_logger,
                handler,
            )),
        }
    }

    /// A client for this architecture. The reactor is served by the async client.
    pub fn client<Req, Resp, H>(self, endpoint: Endpoint, handler: H) -> Box<dyn Client<Req>>
    where
        Req: Payload,
        Resp: Payload,
        H: ResponseHandler<Resp>,
    {
        match self {
            Architecture::Blocking => Box::new(BlockingClient::<Req, Resp>::new(endpoint, handler)),
            Architecture::Async | Architecture::Reactor => {
                Box::new(AsyncClient::<Req, Resp>::new(endpoint, handler))
            }
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::Blocking => "blocking",
            Architecture::Async => "async",
            Architecture::Reactor => "reactor",
        })
    }
}
