//! Accepts connections and advances each one's read state machine.

use super::connection::{Outbound, Registrations, WriteCommand, LISTENER_TOKEN, WAKER_TOKEN};
use crate::arch::listener;
use crate::codec::{self, FrameDecoder, Payload};
use crate::contract::{RequestContext, RequestHandler, Responder, TimeLogger};
use crate::error::{Error, Result};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use socket2::SockRef;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

struct ReadConnection {
    stream: TcpStream,
    decoder: FrameDecoder,
    outbound: Arc<Outbound>,
    ctx: RequestContext,
}

/// Everything a completed request needs to reach its handler and come back.
pub(crate) struct Dispatch<Req, Resp> {
    pub name: String,
    pub handler: Arc<dyn RequestHandler<Req, Resp>>,
    pub time_logger: Arc<dyn TimeLogger>,
    pub registrations: Arc<Registrations>,
}

pub(crate) struct ReadLoop<Req, Resp> {
    poll: Poll,
    listener: TcpListener,
    connections: Slab<ReadConnection>,
    /// Accepted this iteration, registered after the events are processed.
    pending: Vec<(TcpStream, SocketAddr)>,
    dispatch: Dispatch<Req, Resp>,
    closed: Arc<AtomicBool>,
    event_capacity: usize,
}

enum ReadOutcome {
    Open,
    Disconnected,
}

impl<Req: Payload, Resp: Payload> ReadLoop<Req, Resp> {
    /// `poll` must already carry the waker under `WAKER_TOKEN`.
    pub fn new(
        poll: Poll,
        mut listener: TcpListener,
        dispatch: Dispatch<Req, Resp>,
        closed: Arc<AtomicBool>,
        event_capacity: usize,
    ) -> io::Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            listener,
            connections: Slab::new(),
            pending: Vec::new(),
            dispatch,
            closed,
            event_capacity,
        })
    }

    pub fn run(mut self) {
        if let Err(e) = self.event_loop() {
            error!(server = %self.dispatch.name, error = %e, "Read loop failed");
        }
        let dropped = self.connections.len();
        for mut conn in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        trace!(server = %self.dispatch.name, dropped, "Connections dropped on shutdown");
        info!(server = %self.dispatch.name, "Read loop exited");
    }

    fn event_loop(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_ready(),
                    WAKER_TOKEN => {}
                    Token(id) => self.service(id),
                }
            }

            self.register_pending();
        }
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.pending.push((stream, peer)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(server = %self.dispatch.name, error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn register_pending(&mut self) {
        for (stream, peer) in std::mem::take(&mut self.pending) {
            if let Err(e) = self.register(stream, peer) {
                warn!(server = %self.dispatch.name, peer = %peer, error = %e, "Failed to register connection");
            }
        }
    }

    fn register(&mut self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let ctx = RequestContext::for_peer(peer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        stream.set_nodelay(true)?;
        // the write loop polls its own handle so each registry owns its registration
        let write_half = listener::duplicate(SockRef::from(&stream))?;
        write_half.set_nonblocking(true)?;

        let entry = self.connections.vacant_entry();
        let id = entry.key();
        self.poll
            .registry()
            .register(&mut stream, Token(id), Interest::READABLE)?;

        let outbound = Arc::new(Outbound::default());
        entry.insert(ReadConnection {
            stream,
            decoder: FrameDecoder::new(),
            outbound: Arc::clone(&outbound),
            ctx,
        });
        self.dispatch.registrations.submit(WriteCommand::Attach {
            id,
            stream: TcpStream::from_std(write_half),
            outbound,
        });

        debug!(server = %self.dispatch.name, conn_id = id, peer = %peer, "Client connected");
        Ok(())
    }

    fn service(&mut self, id: usize) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        match read_ready(conn, &self.dispatch, id) {
            Ok(ReadOutcome::Open) => return,
            Ok(ReadOutcome::Disconnected) => {
                debug!(server = %self.dispatch.name, conn_id = id, "Client disconnected");
            }
            Err(e) if e.is_disconnect() => {
                debug!(server = %self.dispatch.name, conn_id = id, error = %e, "Connection closed");
            }
            Err(e) => {
                warn!(server = %self.dispatch.name, conn_id = id, error = %e, "Dropping connection");
            }
        }
        self.close_connection(id);
    }

    fn close_connection(&mut self, id: usize) {
        if let Some(mut conn) = self.connections.try_remove(id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            self.dispatch.registrations.submit(WriteCommand::Cancel(id));
        }
    }
}

/// Read until the socket would block, dispatching every completed envelope.
fn read_ready<Req: Payload, Resp: Payload>(
    conn: &mut ReadConnection,
    dispatch: &Dispatch<Req, Resp>,
    id: usize,
) -> Result<ReadOutcome> {
    loop {
        let n = match conn.stream.read(conn.decoder.unfilled()) {
            Ok(0) => {
                conn.decoder.finish()?;
                return Ok(ReadOutcome::Disconnected);
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::Open),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if let Some(frame) = conn.decoder.advance(n)? {
            dispatch.request(conn, id, frame)?;
        }
    }
}

impl<Req: Payload, Resp: Payload> Dispatch<Req, Resp> {
    fn request(&self, conn: &ReadConnection, id: usize, frame: Bytes) -> Result<()> {
        let request: Req = codec::decode_payload(&frame)?;
        trace!(server = %self.name, conn_id = id, "Request received");

        let outbound = Arc::clone(&conn.outbound);
        let registrations = Arc::clone(&self.registrations);
        let name = self.name.clone();
        let responder = Responder::new(Arc::clone(&self.time_logger), move |response: Resp| {
            match codec::encode(&response) {
                Ok(frame) => {
                    // queue first so the write loop never sees Ready with nothing to send
                    outbound.push(frame);
                    registrations.submit(WriteCommand::Ready { id, outbound });
                }
                Err(e) => error!(server = %name, conn_id = id, error = %e, "Failed to encode response"),
            }
        });
        let handled = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.handle(conn.ctx, request, responder)
        }));
        if handled.is_err() {
            error!(server = %self.name, conn_id = id, "Request handler panicked");
            return Err(Error::HandlerPanicked);
        }
        Ok(())
    }
}
