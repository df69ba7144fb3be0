use super::{read_frame, WriteQueue};
use crate::arch::lifecycle::{lock, next_id};
use crate::arch::listener;
use crate::codec::{self, Payload};
use crate::contract::{Client, ResponseContext, ResponseHandler};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, trace, warn};

const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Client that issues every socket operation on its own single-worker runtime.
///
/// Writes overlap freely through a [`WriteQueue`]. Responses are read by one
/// chain at a time, started when the count of awaited responses leaves zero.
pub struct AsyncClient<Req, Resp> {
    name: String,
    endpoint: Endpoint,
    handler: Arc<dyn ResponseHandler<Resp>>,
    state: Mutex<State<Resp>>,
    _request: PhantomData<fn(Req)>,
}

enum State<Resp> {
    Idle,
    Connected {
        runtime: Runtime,
        session: Arc<Session<Resp>>,
    },
    Closed,
}

struct Session<Resp> {
    name: String,
    ctx: ResponseContext,
    handler: Arc<dyn ResponseHandler<Resp>>,
    queue: Arc<WriteQueue<OwnedWriteHalf>>,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    awaiting: AtomicUsize,
    handle: Handle,
}

impl<Req: Payload, Resp: Payload> AsyncClient<Req, Resp> {
    pub fn new<H>(endpoint: Endpoint, handler: H) -> Self
    where
        H: ResponseHandler<Resp>,
    {
        Self {
            name: format!("async-client-{}", next_id()),
            endpoint,
            handler: Arc::new(handler),
            state: Mutex::new(State::Idle),
            _request: PhantomData,
        }
    }

    fn connect(&self) -> Result<State<Resp>> {
        let std_stream = listener::connect(&self.endpoint)?;
        std_stream.set_nonblocking(true)?;

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{}-io", self.name))
            .enable_all()
            .build()?;
        let stream = {
            let _guard = runtime.enter();
            TcpStream::from_std(std_stream)
        };
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                runtime.shutdown_background();
                return Err(e.into());
            }
        };
        let (reader, writer) = stream.into_split();
        debug!(client = %self.name, server = %self.endpoint, "Connected");

        let handle = runtime.handle().clone();
        let session = Arc::new(Session {
            name: self.name.clone(),
            ctx: ResponseContext {
                server: self.endpoint,
            },
            handler: Arc::clone(&self.handler),
            queue: Arc::new(WriteQueue::new(self.name.clone(), writer, handle.clone())),
            reader: tokio::sync::Mutex::new(reader),
            awaiting: AtomicUsize::new(0),
            handle,
        });
        Ok(State::Connected { runtime, session })
    }
}

impl<Resp: Payload> Session<Resp> {
    fn send(self: &Arc<Self>, frame: Bytes) {
        self.queue.push(frame);
        trace!(client = %self.name, "Request queued");
        if self.awaiting.fetch_add(1, Ordering::AcqRel) == 0 {
            let session = Arc::clone(self);
            self.handle.spawn(async move { session.read_responses().await });
        }
    }

    async fn read_responses(&self) {
        let mut reader = self.reader.lock().await;
        loop {
            match read_frame(&mut *reader).await {
                Ok(Some(frame)) => match codec::decode_payload::<Resp>(&frame) {
                    Ok(response) => self.handler.handle(&self.ctx, response),
                    Err(e) => {
                        warn!(client = %self.name, error = %e, "Malformed response, abandoning connection");
                        return;
                    }
                },
                Ok(None) => {
                    debug!(client = %self.name, "Server closed the connection");
                    return;
                }
                Err(e) if e.is_disconnect() => {
                    debug!(client = %self.name, error = %e, "Connection lost");
                    return;
                }
                Err(e) => {
                    warn!(client = %self.name, error = %e, "Failed to receive response");
                    return;
                }
            }
            if self.awaiting.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

impl<Req: Payload, Resp: Payload> Client<Req> for AsyncClient<Req, Resp> {
    fn send_request(&self, request: Req) -> Result<()> {
        let frame = codec::encode(&request)?;

        let session = {
            let mut state = lock(&self.state);
            if let State::Idle = *state {
                *state = self.connect()?;
            }
            match &*state {
                State::Connected { session, .. } => Arc::clone(session),
                _ => return Err(Error::ClientClosed),
            }
        };
        session.send(frame);
        Ok(())
    }

    fn close(&self) {
        self.disconnect();
    }
}

impl<Req, Resp> AsyncClient<Req, Resp> {
    fn disconnect(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), State::Closed);
        if let State::Connected { runtime, session } = previous {
            // blocking shutdown is not allowed from inside a runtime
            if Handle::try_current().is_ok() {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
            }
            drop(session);
            debug!(client = %self.name, "Closed");
        }
    }
}

impl<Req, Resp> Drop for AsyncClient<Req, Resp> {
    fn drop(&mut self) {
        self.disconnect();
    }
}
