use super::connection::{Registrations, WAKER_TOKEN};
use super::read_loop::{Dispatch, ReadLoop};
use super::write_loop::WriteLoop;
use crate::arch::lifecycle::{lock, Lifecycle};
use crate::arch::listener;
use crate::codec::Payload;
use crate::config::ServerOptions;
use crate::contract::{RequestHandler, Server, TimeLogger};
use crate::endpoint::Port;
use crate::error::Result;
use mio::{Poll, Waker};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::info;

/// Two-thread readiness server: one loop reads, the other writes.
pub struct ReactorServer<Req, Resp> {
    port: Port,
    options: ServerOptions,
    lifecycle: Lifecycle,
    handler: Arc<dyn RequestHandler<Req, Resp>>,
    time_logger: Arc<dyn TimeLogger>,
    closed: Arc<AtomicBool>,
    wakers: Mutex<Vec<Arc<Waker>>>,
}

impl<Req: Payload, Resp: Payload> ReactorServer<Req, Resp> {
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
        Self {
            port,
            options,
            lifecycle: Lifecycle::new("reactor"),
            handler: Arc::new(handler),
            time_logger,
            closed: Arc::new(AtomicBool::new(false)),
            wakers: Mutex::new(Vec::new()),
        }
    }
}

impl<Req: Payload, Resp: Payload> Server for ReactorServer<Req, Resp> {
    fn name(&self) -> &str {
        self.lifecycle.name()
    }

    fn start(&self) -> Result<()> {
        self.lifecycle.start(|name| {
            let std_listener = listener::bind(self.port, self.options.backlog)?;
            std_listener.set_nonblocking(true)?;
            let listener = mio::net::TcpListener::from_std(std_listener);

            let read_poll = Poll::new()?;
            let read_waker = Arc::new(Waker::new(read_poll.registry(), WAKER_TOKEN)?);
            let write_poll = Poll::new()?;
            let write_waker = Arc::new(Waker::new(write_poll.registry(), WAKER_TOKEN)?);
            let registrations = Arc::new(Registrations::new(Arc::clone(&write_waker)));

            let read_loop = ReadLoop::new(
                read_poll,
                listener,
                Dispatch {
                    name: name.to_string(),
                    handler: Arc::clone(&self.handler),
                    time_logger: Arc::clone(&self.time_logger),
                    registrations: Arc::clone(&registrations),
                },
                Arc::clone(&self.closed),
                self.options.event_capacity,
            )?;
            let write_loop = WriteLoop::new(
                name.to_string(),
                write_poll,
                registrations,
                Arc::clone(&self.closed),
                self.options.event_capacity,
            );

            lock(&self.wakers).extend([read_waker, write_waker]);
            info!(server = %name, port = %self.port, "Accepting connections");

            let writer = thread::Builder::new()
                .name(format!("{name}-write"))
                .spawn(move || write_loop.run())?;
            let reader = thread::Builder::new()
                .name(format!("{name}-read"))
                .spawn(move || read_loop.run());
            match reader {
                Ok(reader) => Ok(vec![reader, writer]),
                Err(e) => {
                    self.wake_loops();
                    let _ = writer.join();
                    Err(e.into())
                }
            }
        })
    }

    fn await_termination(&self) {
        self.lifecycle.await_termination();
    }

    fn close(&self) {
        self.shutdown();
    }
}

impl<Req, Resp> ReactorServer<Req, Resp> {
    fn wake_loops(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for waker in lock(&self.wakers).iter() {
            let _ = waker.wake();
        }
    }

    fn shutdown(&self) {
        self.lifecycle.close(|| self.wake_loops());
    }
}

impl<Req, Resp> Drop for ReactorServer<Req, Resp> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
