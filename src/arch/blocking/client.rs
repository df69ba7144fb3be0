//! Blocking client with separate write and read lanes.

use super::lane::Lane;
use crate::arch::lifecycle::{lock, next_id};
use crate::arch::listener;
use crate::codec::{self, Payload};
use crate::contract::{Client, ResponseContext, ResponseHandler};
use crate::endpoint::Endpoint;
use crate::error::{is_disconnect_kind, Error, Result};
use std::io::Write;
use std::marker::PhantomData;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

pub struct BlockingClient<Req, Resp> {
    name: String,
    endpoint: Endpoint,
    handler: Arc<dyn ResponseHandler<Resp>>,
    state: Mutex<State>,
    _request: PhantomData<fn(Req)>,
}

enum State {
    Idle,
    Connected(Connection),
    Closed,
}

struct Connection {
    stream: Arc<TcpStream>,
    closed: Arc<AtomicBool>,
    write_lane: Lane,
    read_lane: Arc<Lane>,
}

impl Connection {
    fn open(name: &str, endpoint: &Endpoint) -> Result<Self> {
        let stream = listener::connect(endpoint)?;
        debug!(client = %name, server = %endpoint, "Connected");
        Ok(Self {
            stream: Arc::new(stream),
            closed: Arc::new(AtomicBool::new(false)),
            write_lane: Lane::spawn(format!("{name}-write"))?,
            read_lane: Arc::new(Lane::spawn(format!("{name}-read"))?),
        })
    }

    fn shutdown(self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.write_lane.stop();
        self.read_lane.stop();
    }
}

impl<Req: Payload, Resp: Payload> BlockingClient<Req, Resp> {
    pub fn new<H>(endpoint: Endpoint, handler: H) -> Self
    where
        H: ResponseHandler<Resp>,
    {
        Self {
            name: format!("blocking-client-{}", next_id()),
            endpoint,
            handler: Arc::new(handler),
            state: Mutex::new(State::Idle),
            _request: PhantomData,
        }
    }
}

impl<Req: Payload, Resp: Payload> Client<Req> for BlockingClient<Req, Resp> {
    fn send_request(&self, request: Req) -> Result<()> {
        let frame = codec::encode(&request)?;

        let mut state = lock(&self.state);
        if let State::Idle = *state {
            *state = State::Connected(Connection::open(&self.name, &self.endpoint)?);
        }
        let conn = match &*state {
            State::Connected(conn) => conn,
            _ => return Err(Error::ClientClosed),
        };

        let stream = Arc::clone(&conn.stream);
        let closed = Arc::clone(&conn.closed);
        let read_lane = Arc::clone(&conn.read_lane);
        let handler = Arc::clone(&self.handler);
        let ctx = ResponseContext {
            server: self.endpoint,
        };
        let name = self.name.clone();

        conn.write_lane.execute(move || {
            if let Err(e) = (&*stream).write_all(&frame) {
                if closed.load(Ordering::SeqCst) || is_disconnect_kind(e.kind()) {
                    debug!(client = %name, error = %e, "Request dropped");
                } else {
                    warn!(client = %name, error = %e, "Failed to send request");
                }
                return;
            }
            trace!(client = %name, "Request sent");

            read_lane.execute(move || {
                match codec::decode_one::<Resp, _>(&mut &*stream) {
                    Ok(Some(response)) => handler.handle(&ctx, response),
                    Ok(None) => debug!(client = %name, "Server closed the connection"),
                    Err(e) if closed.load(Ordering::SeqCst) || e.is_disconnect() => {
                        debug!(client = %name, error = %e, "Response dropped")
                    }
                    Err(e) => {
                        warn!(client = %name, error = %e, "Failed to receive response, closing connection");
                        closed.store(true, Ordering::SeqCst);
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                }
            });
        });
        Ok(())
    }

    fn close(&self) {
        self.disconnect();
    }
}

impl<Req, Resp> BlockingClient<Req, Resp> {
    fn disconnect(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), State::Closed);
        if let State::Connected(conn) = previous {
            conn.shutdown();
            debug!(client = %self.name, "Closed");
        }
    }
}

impl<Req, Resp> Drop for BlockingClient<Req, Resp> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
