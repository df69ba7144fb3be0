use super::{read_frame, WriteQueue};
use crate::arch::lifecycle::Lifecycle;
use crate::arch::listener;
use crate::codec::{self, Payload};
use crate::config::ServerOptions;
use crate::contract::{RequestContext, RequestHandler, Responder, Server, TimeLogger};
use crate::endpoint::Port;
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Handle};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Server whose connections are tokio tasks on a private runtime.
pub struct AsyncServer<Req, Resp> {
    port: Port,
    options: ServerOptions,
    lifecycle: Lifecycle,
    shared: Arc<Shared<Req, Resp>>,
    shutdown: Arc<Notify>,
}

struct Shared<Req, Resp> {
    name: String,
    handler: Arc<dyn RequestHandler<Req, Resp>>,
    time_logger: Arc<dyn TimeLogger>,
}

impl<Req: Payload, Resp: Payload> AsyncServer<Req, Resp> {
    pub fn new<H>(port: Port, time_logger: Arc<dyn TimeLogger>, handler: H) -> Self
    where
        H: RequestHandler<Req, Resp>,
    {
        Self::with_options(port, ServerOptions::default(), time_logger, handler)
    }

    pub fn with_options<H>(
        port: Port,
        options: ServerOptions,
        time_logger: Arc<dyn TimeLogger>,
        handler: H,
    ) -> Self
    where
        H: RequestHandler<Req, Resp>,
    {
        let lifecycle = Lifecycle::new("async");
        let shared = Arc::new(Shared {
            name: lifecycle.name().to_string(),
            handler: Arc::new(handler),
            time_logger,
        });
        Self {
            port,
            options,
            lifecycle,
            shared,
            shutdown: Arc::new(Notify::new()),
        }
    }
}

impl<Req: Payload, Resp: Payload> Server for AsyncServer<Req, Resp> {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn start(&self) -> Result<()> {
        self.lifecycle.start(|name| {
            let std_listener = listener::bind(self.port, self.options.backlog)?;
            std_listener.set_nonblocking(true)?;

            let workers = self.options.worker_threads();
            let runtime = Builder::new_multi_thread()
                .worker_threads(workers)
                .thread_name(format!("{name}-worker"))
                .enable_all()
                .build()?;
            info!(server = %name, port = %self.port, workers, "Accepting connections");

            let shared = Arc::clone(&self.shared);
            let shutdown = Arc::clone(&self.shutdown);
            let driver = thread::Builder::new()
                .name(format!("{name}-driver"))
                .spawn(move || {
                    runtime.block_on(async {
                        match TcpListener::from_std(std_listener) {
                            Ok(listener) => accept_loop(&shared, listener, &shutdown).await,
                            Err(e) => error!(server = %shared.name, error = %e, "Failed to register listener"),
                        }
                    });
                    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
                    info!(server = %shared.name, "Runtime stopped");
                })?;
            Ok(vec![driver])
        })
    }

    fn await_termination(&self) {
        self.lifecycle.await_termination();
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl<Req, Resp> AsyncServer<Req, Resp> {
    fn shutdown(&self) {
        let shutdown = &self.shutdown;
        self.lifecycle.close(|| shutdown.notify_one());
    }
}

impl<Req, Resp> Drop for AsyncServer<Req, Resp> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop<Req: Payload, Resp: Payload>(
    shared: &Arc<Shared<Req, Resp>>,
    listener: TcpListener,
    shutdown: &Notify,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(server = %shared.name, peer = %peer, "Client connected");
                    tokio::spawn(serve_connection(Arc::clone(shared), stream, peer));
                }
                Err(e) => {
                    error!(server = %shared.name, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    info!(server = %shared.name, "Accept loop exited");
}

async fn serve_connection<Req: Payload, Resp: Payload>(
    shared: Arc<Shared<Req, Resp>>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(server = %shared.name, peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let (mut reader, writer) = stream.into_split();
    let queue = Arc::new(WriteQueue::new(
        format!("{}-{peer}", shared.name),
        writer,
        Handle::current(),
    ));
    let ctx = match RequestContext::for_peer(peer) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(server = %shared.name, peer = %peer, error = %e, "Rejecting connection");
            return;
        }
    };

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(server = %shared.name, peer = %peer, "Client disconnected");
                return;
            }
            Err(e) if e.is_disconnect() => {
                debug!(server = %shared.name, peer = %peer, error = %e, "Connection closed");
                return;
            }
            Err(e) => {
                warn!(server = %shared.name, peer = %peer, error = %e, "Failed to read request");
                return;
            }
        };
        let request: Req = match codec::decode_payload(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(server = %shared.name, peer = %peer, error = %e, "Malformed request");
                return;
            }
        };
        trace!(server = %shared.name, peer = %peer, "Request received");

        let responder = {
            let queue = Arc::clone(&queue);
            let name = shared.name.clone();
            Responder::new(Arc::clone(&shared.time_logger), move |response: Resp| {
                match codec::encode(&response) {
                    Ok(frame) => queue.push(frame),
                    Err(e) => error!(server = %name, error = %e, "Failed to encode response"),
                }
            })
        };
        shared.handler.handle(ctx, request, responder);
    }
}
