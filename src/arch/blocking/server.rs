//! Thread-per-connection server.
//!
//! One accept thread blocks in `accept()`. Every accepted connection gets a
//! reader thread that decodes requests one at a time and a write [`Lane`]
//! that sends responses in the order the handler produced them.

use super::lane::Lane;
use crate::arch::lifecycle::{lock, Lifecycle};
use crate::arch::listener;
use crate::codec::{self, Payload};
use crate::config::ServerOptions;
use crate::contract::{RequestContext, RequestHandler, Responder, Server, TimeLogger};
use crate::endpoint::Port;
use crate::error::{is_disconnect_kind, Result};
use slab::Slab;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed `accept()` so a persistent error (EMFILE) cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

pub struct BlockingServer<Req, Resp> {
    port: Port,
    options: ServerOptions,
    lifecycle: Lifecycle,
    shared: Arc<Shared<Req, Resp>>,
}

struct Shared<Req, Resp> {
    name: String,
    handler: Arc<dyn RequestHandler<Req, Resp>>,
    time_logger: Arc<dyn TimeLogger>,
    closed: AtomicBool,
    /// Clone of the listening socket, kept to interrupt `accept()`.
    listener: Mutex<Option<TcpListener>>,
    /// Clones of live connection sockets, shut down on close.
    connections: Mutex<Slab<TcpStream>>,
    /// Thread that called `close`; a connection worker closing its own server is not joined.
    closer: Mutex<Option<ThreadId>>,
}

impl<Req: Payload, Resp: Payload> BlockingServer<Req, Resp> {
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
        let lifecycle = Lifecycle::new("blocking");
        let shared = Arc::new(Shared {
            name: lifecycle.name().to_string(),
            handler: Arc::new(handler),
            time_logger,
            closed: AtomicBool::new(false),
            listener: Mutex::new(None),
            connections: Mutex::new(Slab::new()),
            closer: Mutex::new(None),
        });
        Self {
            port,
            options,
            lifecycle,
            shared,
        }
    }
}

impl<Req: Payload, Resp: Payload> Server for BlockingServer<Req, Resp> {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn start(&self) -> Result<()> {
        self.lifecycle.start(|name| {
            let listener = listener::bind(self.port, self.options.backlog)?;
            *lock(&self.shared.listener) = Some(listener.try_clone()?);
            info!(server = %name, port = %self.port, "Accepting connections");

            let shared = Arc::clone(&self.shared);
            let accept = thread::Builder::new()
                .name(format!("{name}-accept"))
                .spawn(move || accept_loop(shared, listener))?;
            Ok(vec![accept])
        })
    }

    fn await_termination(&self) {
        self.lifecycle.await_termination();
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl<Req, Resp> BlockingServer<Req, Resp> {
    fn shutdown(&self) {
        let shared = &self.shared;
        let port = self.port;
        self.lifecycle.close(|| {
            *lock(&shared.closer) = Some(thread::current().id());
            shared.closed.store(true, Ordering::SeqCst);
            if let Some(listener) = lock(&shared.listener).take() {
                listener::wake_acceptor(&listener, port);
            }
            for (_, stream) in lock(&shared.connections).iter() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        });
    }
}

impl<Req, Resp> Drop for BlockingServer<Req, Resp> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop<Req: Payload, Resp: Payload>(shared: Arc<Shared<Req, Resp>>, listener: TcpListener) {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(_) if shared.closed.load(Ordering::SeqCst) => break,
            Err(e) => {
                error!(server = %shared.name, error = %e, "Accept failed");
                thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
        };

        workers.retain(|worker| !worker.is_finished());
        match spawn_connection(&shared, stream, peer) {
            Ok(Some(worker)) => workers.push(worker),
            Ok(None) => break,
            Err(e) => warn!(server = %shared.name, peer = %peer, error = %e, "Failed to set up connection"),
        }
    }

    let closer = *lock(&shared.closer);
    for worker in workers {
        if Some(worker.thread().id()) == closer {
            continue;
        }
        let _ = worker.join();
    }
    info!(server = %shared.name, "Accept loop exited");
}

/// Register the connection and start its reader. `Ok(None)` once closed.
fn spawn_connection<Req: Payload, Resp: Payload>(
    shared: &Arc<Shared<Req, Resp>>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<Option<JoinHandle<()>>> {
    stream.set_nodelay(true)?;
    let id = {
        let mut connections = lock(&shared.connections);
        if shared.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        connections.insert(stream.try_clone()?)
    };
    debug!(server = %shared.name, conn_id = id, peer = %peer, "Client connected");

    let worker_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("{}-conn-{id}", shared.name))
        .spawn(move || {
            serve_connection(&worker_shared, id, stream, peer);
            lock(&worker_shared.connections).try_remove(id);
        });

    match spawned {
        Ok(worker) => Ok(Some(worker)),
        Err(e) => {
            lock(&shared.connections).try_remove(id);
            Err(e.into())
        }
    }
}

fn serve_connection<Req: Payload, Resp: Payload>(
    shared: &Shared<Req, Resp>,
    id: usize,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let writer = match stream.try_clone() {
        Ok(writer) => Arc::new(writer),
        Err(e) => {
            warn!(server = %shared.name, conn_id = id, error = %e, "Failed to clone socket");
            return;
        }
    };
    let lane = match Lane::spawn(format!("{}-conn-{id}-write", shared.name)) {
        Ok(lane) => Arc::new(lane),
        Err(e) => {
            warn!(server = %shared.name, conn_id = id, error = %e, "Failed to start write lane");
            return;
        }
    };

    let ctx = match RequestContext::for_peer(peer) {
        Ok(ctx) => ctx,
        Err(e) => {
            warn!(server = %shared.name, conn_id = id, error = %e, "Rejecting connection");
            lane.stop();
            return;
        }
    };
    let mut reader = BufReader::new(&stream);

    loop {
        let frame = match codec::read_frame(&mut reader) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(server = %shared.name, conn_id = id, "Client disconnected");
                break;
            }
            Err(e) if e.is_disconnect() || shared.closed.load(Ordering::SeqCst) => {
                debug!(server = %shared.name, conn_id = id, error = %e, "Connection closed");
                break;
            }
            Err(e) => {
                warn!(server = %shared.name, conn_id = id, error = %e, "Failed to read request");
                break;
            }
        };
        let request: Req = match codec::decode_payload(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(server = %shared.name, conn_id = id, error = %e, "Malformed request");
                break;
            }
        };
        trace!(server = %shared.name, conn_id = id, "Request received");

        let responder = {
            let lane = Arc::clone(&lane);
            let writer = Arc::clone(&writer);
            let name = shared.name.clone();
            Responder::new(Arc::clone(&shared.time_logger), move |response: Resp| {
                let frame = match codec::encode(&response) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(server = %name, conn_id = id, error = %e, "Failed to encode response");
                        return;
                    }
                };
                lane.execute(move || {
                    if let Err(e) = (&*writer).write_all(&frame) {
                        if is_disconnect_kind(e.kind()) {
                            debug!(server = %name, conn_id = id, error = %e, "Response dropped");
                        } else {
                            warn!(server = %name, conn_id = id, error = %e, "Failed to send response");
                        }
                    }
                });
            })
        };
        let handled = panic::catch_unwind(AssertUnwindSafe(|| {
            shared.handler.handle(ctx, request, responder)
        }));
        if handled.is_err() {
            error!(server = %shared.name, conn_id = id, "Request handler panicked");
            break;
        }
    }

    lane.stop();
    let _ = stream.shutdown(Shutdown::Both);
}
