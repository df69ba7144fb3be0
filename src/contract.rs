//! The server/client contract every architecture implements.

use crate::endpoint::{Endpoint, IpAddress};
use crate::error::Result;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Server: Send + Sync {
    /// Name used for thread names and log fields, e.g. `reactor-3`.
    fn name(&self) -> &str;

    /// Bind and spawn the internal threads. Fails if called twice or after close.
    fn start(&self) -> Result<()>;

    /// Block until the server's driving threads have exited.
    fn await_termination(&self);

    /// Stop accepting, release sockets and join the driving threads. Idempotent.
    fn close(&self);
}

pub trait Client<Req>: Send + Sync {
    /// Queue a request. The response is delivered to the response handler.
    ///
    /// The first call opens the connection.
    fn send_request(&self, request: Req) -> Result<()>;

    fn close(&self);
}

/// What a request handler knows about the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: IpAddress,
}

impl RequestContext {
    pub(crate) fn for_peer(peer: SocketAddr) -> Result<Self> {
        Ok(Self {
            client_ip: IpAddress::try_from(peer.ip())?,
        })
    }
}

/// What a response handler knows about the server that answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseContext {
    pub server: Endpoint,
}

/// Receives the time from request arrival to the handler's response.
pub trait TimeLogger: Send + Sync + 'static {
    fn log_request_processing(&self, elapsed: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTimeLogger;

impl TimeLogger for NoopTimeLogger {
    fn log_request_processing(&self, _elapsed: Duration) {}
}

impl<F> TimeLogger for F
where
    F: Fn(Duration) + Send + Sync + 'static,
{
    fn log_request_processing(&self, elapsed: Duration) {
        self(elapsed)
    }
}

pub trait RequestHandler<Req, Resp>: Send + Sync + 'static {
    /// Handle one request. `responder` may be used from any thread.
    fn handle(&self, ctx: RequestContext, request: Req, responder: Responder<Resp>);
}

impl<Req, Resp, F> RequestHandler<Req, Resp> for F
where
    F: Fn(RequestContext, Req, Responder<Resp>) + Send + Sync + 'static,
{
    fn handle(&self, ctx: RequestContext, request: Req, responder: Responder<Resp>) {
        self(ctx, request, responder)
    }
}

pub trait ResponseHandler<Resp>: Send + Sync + 'static {
    fn handle(&self, ctx: &ResponseContext, response: Resp);
}

impl<Resp, F> ResponseHandler<Resp> for F
where
    F: Fn(&ResponseContext, Resp) + Send + Sync + 'static,
{
    fn handle(&self, ctx: &ResponseContext, response: Resp) {
        self(ctx, response)
    }
}

/// One-shot response emitter handed to a request handler.
///
/// Consuming it logs the processing time and hands the response to the
/// connection's write path. Dropping it sends nothing.
pub struct Responder<Resp> {
    started: Instant,
    time_logger: Arc<dyn TimeLogger>,
    emit: Box<dyn FnOnce(Resp) + Send>,
}

impl<Resp> Responder<Resp> {
    pub(crate) fn new<F>(time_logger: Arc<dyn TimeLogger>, emit: F) -> Self
    where
        F: FnOnce(Resp) + Send + 'static,
    {
        Self {
            started: Instant::now(),
            time_logger,
            emit: Box::new(emit),
        }
    }

    pub fn respond(self, response: Resp) {
        self.time_logger
            .log_request_processing(self.started.elapsed());
        (self.emit)(response)
    }
}

impl<Resp> fmt::Debug for Responder<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}
