//! Drains per-connection response queues as sockets become writable.
//!
//! Write interest is only held while a connection has something queued. Each
//! iteration first services readiness events, then applies the commands other
//! threads queued since the previous wait. A response is always pushed onto
//! its queue before its `Ready` command is submitted, so a queue observed empty
//! during the event phase is re-armed by the drain phase that follows.

use super::connection::{Outbound, Registrations, WriteCommand, WAKER_TOKEN};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

struct WriteConnection {
    stream: TcpStream,
    outbound: Arc<Outbound>,
    /// Bytes of the head frame already on the wire.
    written: usize,
    interested: bool,
}

enum Flush {
    Drained,
    Blocked,
}

impl WriteConnection {
    fn flush(&mut self) -> io::Result<Flush> {
        loop {
            let Some(frame) = self.outbound.front() else {
                return Ok(Flush::Drained);
            };
            match self.stream.write(&frame[self.written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.written += n;
                    if self.written == frame.len() {
                        self.outbound.pop();
                        self.written = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

pub(crate) struct WriteLoop {
    name: String,
    poll: Poll,
    registrations: Arc<Registrations>,
    connections: HashMap<usize, WriteConnection>,
    closed: Arc<AtomicBool>,
    event_capacity: usize,
}

impl WriteLoop {
    /// `poll` must carry the waker that `registrations` signals.
    pub fn new(
        name: String,
        poll: Poll,
        registrations: Arc<Registrations>,
        closed: Arc<AtomicBool>,
        event_capacity: usize,
    ) -> Self {
        Self {
            name,
            poll,
            registrations,
            connections: HashMap::new(),
            closed,
            event_capacity,
        }
    }

    pub fn run(mut self) {
        if let Err(e) = self.event_loop() {
            error!(server = %self.name, error = %e, "Write loop failed");
        }
        for (_, mut conn) in self.connections.drain() {
            if conn.interested {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
        }
        info!(server = %self.name, "Write loop exited");
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
                    WAKER_TOKEN => {}
                    Token(id) => self.service(id),
                }
            }

            for command in self.registrations.drain() {
                self.apply(command);
            }
        }
    }

    fn service(&mut self, id: usize) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match conn.flush() {
            Ok(Flush::Blocked) => {}
            Ok(Flush::Drained) => {
                // nothing queued: clear write interest, the connection stays known
                if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                    warn!(server = %self.name, conn_id = id, error = %e, "Failed to clear write interest");
                }
                conn.interested = false;
            }
            Err(e) => {
                if crate::error::is_disconnect_kind(e.kind()) {
                    debug!(server = %self.name, conn_id = id, error = %e, "Peer gone, dropping responses");
                } else {
                    warn!(server = %self.name, conn_id = id, error = %e, "Write failed");
                }
                self.forget(id);
            }
        }
    }

    fn apply(&mut self, command: WriteCommand) {
        match command {
            WriteCommand::Attach {
                id,
                stream,
                outbound,
            } => {
                trace!(server = %self.name, conn_id = id, "Attached");
                let previous = self.connections.insert(
                    id,
                    WriteConnection {
                        stream,
                        outbound,
                        written: 0,
                        interested: false,
                    },
                );
                if let Some(mut stale) = previous {
                    if stale.interested {
                        let _ = self.poll.registry().deregister(&mut stale.stream);
                    }
                }
            }
            WriteCommand::Ready { id, outbound } => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    return;
                };
                // the id may have been reused by a newer connection
                if !Arc::ptr_eq(&conn.outbound, &outbound) || conn.interested {
                    return;
                }
                match self
                    .poll
                    .registry()
                    .register(&mut conn.stream, Token(id), Interest::WRITABLE)
                {
                    Ok(()) => conn.interested = true,
                    Err(e) => {
                        warn!(server = %self.name, conn_id = id, error = %e, "Failed to register write interest");
                        self.forget(id);
                    }
                }
            }
            WriteCommand::Cancel(id) => {
                trace!(server = %self.name, conn_id = id, "Cancelled");
                self.forget(id);
            }
        }
    }

    fn forget(&mut self, id: usize) {
        if let Some(mut conn) = self.connections.remove(&id) {
            if conn.interested {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Waker;
    use std::io::Read;
    use std::thread;
    use std::time::Duration;

    fn socket_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_queued_frames_reach_the_peer_in_order() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());
        let registrations = Arc::new(Registrations::new(Arc::clone(&waker)));
        let closed = Arc::new(AtomicBool::new(false));
        let write_loop = WriteLoop::new(
            "write-test".into(),
            poll,
            Arc::clone(&registrations),
            Arc::clone(&closed),
            64,
        );
        let runner = thread::spawn(move || write_loop.run());

        let (mut client, server) = socket_pair();
        server.set_nonblocking(true).unwrap();
        let outbound = Arc::new(Outbound::default());
        registrations.submit(WriteCommand::Attach {
            id: 0,
            stream: TcpStream::from_std(server),
            outbound: Arc::clone(&outbound),
        });

        // large frames force partial writes and several writable edges
        let chunk = vec![7u8; 256 * 1024];
        for i in 0..8u8 {
            let mut frame = chunk.clone();
            frame[0] = i;
            outbound.push(frame.into());
            registrations.submit(WriteCommand::Ready {
                id: 0,
                outbound: Arc::clone(&outbound),
            });
            if i % 3 == 0 {
                thread::sleep(Duration::from_millis(5));
            }
        }

        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut received = vec![0u8; chunk.len()];
        for i in 0..8u8 {
            client.read_exact(&mut received).unwrap();
            assert_eq!(received[0], i);
            assert!(received[1..].iter().all(|&b| b == 7));
        }

        closed.store(true, Ordering::SeqCst);
        waker.wake().unwrap();
        runner.join().unwrap();
    }
}
