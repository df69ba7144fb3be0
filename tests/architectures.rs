//! End-to-end behavior shared by every architecture, over loopback.

use archbench::codec;
use archbench::{
    Architecture, Client, Endpoint, Error, NoopTimeLogger, Port, RequestContext, Responder,
    ResponseContext, Server, TimeLogger,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Barrier, OnceLock, Weak};
use std::thread;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Request {
    cmd: String,
    id: u32,
    data: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Response {
    id: u32,
    data: i32,
}

fn free_port() -> Port {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    Port::new(listener.local_addr().unwrap().port()).unwrap()
}

fn apply(cmd: &str, data: i32) -> i32 {
    match cmd {
        "p" => data.wrapping_add(1),
        "m" => data.wrapping_sub(1),
        other => panic!("unknown command {other}"),
    }
}

fn arithmetic(_ctx: RequestContext, req: Request, responder: Responder<Response>) {
    let data = apply(&req.cmd, req.data);
    responder.respond(Response { id: req.id, data });
}

fn start_server(arch: Architecture, port: Port) -> Box<dyn Server> {
    start_server_with(arch, port, Arc::new(NoopTimeLogger))
}

fn start_server_with(
    arch: Architecture,
    port: Port,
    time_logger: Arc<dyn TimeLogger>,
) -> Box<dyn Server> {
    let server = arch.server::<Request, Response, _>(port, time_logger, arithmetic);
    server.start().unwrap();
    server
}

fn collecting_client<Resp>(arch: Architecture, port: Port) -> (Box<dyn Client<Request>>, Receiver<Resp>)
where
    Resp: archbench::codec::Payload,
{
    let (tx, rx) = mpsc::channel();
    let client = arch.client::<Request, Resp, _>(
        Endpoint::localhost(port),
        move |_ctx: &ResponseContext, resp: Resp| {
            let _ = tx.send(resp);
        },
    );
    (client, rx)
}

fn receive<T>(rx: &Receiver<T>, n: usize) -> Vec<T> {
    (0..n)
        .map(|i| {
            rx.recv_timeout(RECV_TIMEOUT)
                .unwrap_or_else(|_| panic!("response {i} of {n} never arrived"))
        })
        .collect()
}

fn request(cmd: &str, id: u32, data: i32) -> Request {
    Request {
        cmd: cmd.to_string(),
        id,
        data,
    }
}

#[test]
fn responses_arrive_in_request_order() {
    for arch in Architecture::ALL {
        let port = free_port();
        let server = start_server(arch, port);
        let (client, rx) = collecting_client::<Response>(arch, port);

        for id in 0..200 {
            client.send_request(request("p", id, id as i32)).unwrap();
        }
        let responses = receive(&rx, 200);
        let expected: Vec<Response> = (0..200)
            .map(|id| Response {
                id,
                data: id as i32 + 1,
            })
            .collect();
        assert_eq!(responses, expected, "{arch}");

        client.close();
        server.close();
    }
}

#[test]
fn three_clients_thirty_random_requests() {
    for arch in Architecture::ALL {
        let port = free_port();
        let server = start_server(arch, port);
        let clients: Vec<_> = (0..3)
            .map(|_| collecting_client::<Response>(arch, port))
            .collect();

        let mut rng = StdRng::seed_from_u64(42);
        let mut planned: Vec<Vec<Request>> = vec![Vec::new(); 3];
        for id in 0..30 {
            let cmd = if rng.random_range(0..2) == 0 { "p" } else { "m" };
            let data: i32 = rng.random();
            planned[rng.random_range(0..3)].push(request(cmd, id, data));
        }

        // every client sends from its own thread, released together
        let barrier = Barrier::new(clients.len());
        thread::scope(|scope| {
            for (client, requests) in clients.iter().map(|(client, _)| client).zip(&planned) {
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    for req in requests {
                        client.send_request(req.clone()).unwrap();
                    }
                });
            }
        });

        for ((_, rx), requests) in clients.iter().zip(&planned) {
            let expected: Vec<Response> = requests
                .iter()
                .map(|req| Response {
                    id: req.id,
                    data: apply(&req.cmd, req.data),
                })
                .collect();
            let mut received = receive(rx, expected.len());
            received.sort_by_key(|r| r.id);
            assert_eq!(received, expected, "{arch}");
            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        }

        for (client, _) in &clients {
            client.close();
        }
        server.close();
    }
}

#[test]
fn start_twice_and_close_twice() {
    for arch in Architecture::ALL {
        let port = free_port();
        let server = start_server(arch, port);
        assert!(matches!(server.start(), Err(Error::AlreadyStarted(_))));

        let (client, rx) = collecting_client::<Response>(arch, port);
        client.send_request(request("m", 1, 10)).unwrap();
        assert_eq!(receive(&rx, 1), vec![Response { id: 1, data: 9 }]);

        server.close();
        server.close();
        server.await_termination();
        assert!(matches!(server.start(), Err(Error::ServerClosed(_))));

        client.close();
        client.close();
        assert!(matches!(
            client.send_request(request("p", 2, 0)),
            Err(Error::ClientClosed)
        ));
    }
}

#[test]
fn await_termination_returns_after_close_from_another_thread() {
    for arch in Architecture::ALL {
        let port = free_port();
        let server: Arc<Box<dyn Server>> = Arc::new(start_server(arch, port));

        let closer = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                server.close();
            })
        };
        server.await_termination();
        closer.join().unwrap();

        // the port is free again once the server has terminated
        let again = start_server(arch, port);
        again.close();
    }
}

#[test]
fn large_responses_survive_backpressure() {
    const COUNT: u32 = 24;
    const SIZE: usize = 512 * 1024;

    fn bulk(_ctx: RequestContext, req: Request, responder: Responder<Vec<u8>>) {
        let mut body = vec![req.id as u8; SIZE];
        body[0] = 0xAB;
        responder.respond(body);
    }

    for arch in Architecture::ALL {
        let port = free_port();
        let server =
            arch.server::<Request, Vec<u8>, _>(port, Arc::new(NoopTimeLogger), bulk);
        server.start().unwrap();
        let (client, rx) = collecting_client::<Vec<u8>>(arch, port);

        for id in 0..COUNT {
            client.send_request(request("p", id, 0)).unwrap();
        }
        for (id, body) in receive(&rx, COUNT as usize).into_iter().enumerate() {
            assert_eq!(body.len(), SIZE, "{arch}");
            assert_eq!(body[0], 0xAB);
            assert!(body[1..].iter().all(|&b| b == id as u8), "{arch}: response {id} out of order");
        }

        client.close();
        server.close();
    }
}

#[test]
fn raw_client_writing_single_bytes() {
    for arch in Architecture::ALL {
        let port = free_port();
        let server = start_server(arch, port);

        let mut stream = TcpStream::connect(("127.0.0.1", port.get())).unwrap();
        stream.set_nodelay(true).unwrap();
        stream.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();

        for id in 0..3 {
            let frame = codec::encode(&request("p", id, 41)).unwrap();
            for byte in frame.iter() {
                stream.write_all(&[*byte]).unwrap();
            }
            let response: Response = codec::decode_one(&mut stream).unwrap().unwrap();
            assert_eq!(response, Response { id, data: 42 }, "{arch}");
        }

        drop(stream);
        server.close();
    }
}

#[test]
fn truncated_peer_does_not_disturb_others() {
    for arch in Architecture::ALL {
        let port = free_port();
        let server = start_server(arch, port);

        // prefix promises more bytes than are ever sent
        let mut broken = TcpStream::connect(("127.0.0.1", port.get())).unwrap();
        let frame = codec::encode(&request("p", 0, 0)).unwrap();
        broken.write_all(&frame[..frame.len() - 2]).unwrap();
        drop(broken);

        let mut garbage = TcpStream::connect(("127.0.0.1", port.get())).unwrap();
        garbage.write_all(&[0xff, 0xff, 0xff, 0xff]).unwrap();

        let (client, rx) = collecting_client::<Response>(arch, port);
        for id in 0..10 {
            client.send_request(request("m", id, 0)).unwrap();
        }
        assert_eq!(receive(&rx, 10).len(), 10, "{arch}");

        drop(garbage);
        client.close();
        server.close();
    }
}

#[test]
fn undecodable_request_drops_only_that_connection() {
    for arch in Architecture::ALL {
        let port = free_port();
        let server = start_server(arch, port);

        // well framed, but too short to hold a Request
        let mut bad = TcpStream::connect(("127.0.0.1", port.get())).unwrap();
        bad.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        bad.write_all(&codec::frame_payload(&[0xff]).unwrap()).unwrap();
        match codec::read_frame(&mut bad) {
            Ok(None) => {}
            Err(e) if e.is_disconnect() => {}
            other => panic!("{arch}: connection should have been dropped, got {other:?}"),
        }

        let (client, rx) = collecting_client::<Response>(arch, port);
        client.send_request(request("p", 3, 3)).unwrap();
        assert_eq!(receive(&rx, 1), vec![Response { id: 3, data: 4 }], "{arch}");

        client.close();
        server.close();
    }
}

#[test]
fn panicking_handler_only_loses_its_own_connection() {
    fn fragile(ctx: RequestContext, req: Request, responder: Responder<Response>) {
        if req.id == 13 {
            panic!("handler failed on request 13");
        }
        arithmetic(ctx, req, responder);
    }

    for arch in Architecture::ALL {
        let port = free_port();
        let server = arch.server::<Request, Response, _>(port, Arc::new(NoopTimeLogger), fragile);
        server.start().unwrap();

        let (doomed, doomed_rx) = collecting_client::<Response>(arch, port);
        doomed.send_request(request("p", 13, 0)).unwrap();
        assert!(doomed_rx.recv_timeout(Duration::from_millis(200)).is_err(), "{arch}");

        let (sibling, rx) = collecting_client::<Response>(arch, port);
        sibling.send_request(request("m", 7, 8)).unwrap();
        assert_eq!(receive(&rx, 1), vec![Response { id: 7, data: 7 }], "{arch}");

        doomed.close();
        sibling.close();
        server.close();
    }
}

#[test]
fn handler_can_close_its_own_server() {
    for arch in Architecture::ALL {
        let port = free_port();
        let slot: Arc<OnceLock<Weak<Box<dyn Server>>>> = Arc::new(OnceLock::new());
        let handler = {
            let slot = Arc::clone(&slot);
            move |ctx: RequestContext, req: Request, responder: Responder<Response>| {
                let last = req.id == 9;
                arithmetic(ctx, req, responder);
                if last {
                    if let Some(server) = slot.get().and_then(Weak::upgrade) {
                        server.close();
                    }
                }
            }
        };
        let server: Arc<Box<dyn Server>> = Arc::new(arch.server::<Request, Response, _>(
            port,
            Arc::new(NoopTimeLogger),
            handler,
        ));
        let _ = slot.set(Arc::downgrade(&server));
        server.start().unwrap();

        let (terminated_tx, terminated) = mpsc::channel();
        let waiter = {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                server.await_termination();
                let _ = terminated_tx.send(());
            })
        };

        let (client, _rx) = collecting_client::<Response>(arch, port);
        for id in 0..10 {
            client.send_request(request("p", id, 0)).unwrap();
        }
        assert!(
            terminated.recv_timeout(RECV_TIMEOUT).is_ok(),
            "{arch}: server never terminated"
        );
        waiter.join().unwrap();

        client.close();
        server.close();
    }
}

#[test]
fn malformed_response_ends_the_client_connection() {
    for arch in [Architecture::Blocking, Architecture::Async] {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = Port::new(listener.local_addr().unwrap().port()).unwrap();
        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for _ in 0..2 {
                codec::read_frame(&mut stream).unwrap().unwrap();
            }
            let _ = stream.write_all(&codec::frame_payload(&[0xff]).unwrap());
            let _ = stream.write_all(&codec::encode(&Response { id: 1, data: 1 }).unwrap());
            // returns once the client hangs up
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest);
        });

        let (client, rx) = collecting_client::<Response>(arch, port);
        client.send_request(request("p", 0, 0)).unwrap();
        client.send_request(request("p", 1, 0)).unwrap();
        assert!(
            rx.recv_timeout(Duration::from_millis(300)).is_err(),
            "{arch}: response after a malformed one was delivered"
        );

        client.close();
        peer.join().unwrap();
    }
}

#[test]
fn time_logger_sees_every_answered_request() {
    for arch in Architecture::ALL {
        let logged = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&logged);
        let logger = move |_elapsed: Duration| {
            counter.fetch_add(1, Ordering::SeqCst);
        };

        let port = free_port();
        let server = start_server_with(arch, port, Arc::new(logger));
        let (client, rx) = collecting_client::<Response>(arch, port);
        for id in 0..25 {
            client.send_request(request("p", id, 0)).unwrap();
        }
        receive(&rx, 25);
        assert_eq!(logged.load(Ordering::SeqCst), 25, "{arch}");

        client.close();
        server.close();
    }
}

#[test]
fn responses_from_another_thread_keep_order() {
    for arch in Architecture::ALL {
        let (jobs, queue) = mpsc::channel::<(Request, Responder<Response>)>();
        let worker = thread::spawn(move || {
            for (req, responder) in queue {
                thread::sleep(Duration::from_micros(200));
                let data = apply(&req.cmd, req.data);
                responder.respond(Response { id: req.id, data });
            }
        });

        let jobs = std::sync::Mutex::new(jobs);
        let port = free_port();
        let server = arch.server::<Request, Response, _>(
            port,
            Arc::new(NoopTimeLogger),
            move |_ctx: RequestContext, req: Request, responder: Responder<Response>| {
                let _ = jobs.lock().unwrap().send((req, responder));
            },
        );
        server.start().unwrap();

        let (client, rx) = collecting_client::<Response>(arch, port);
        for id in 0..50 {
            client.send_request(request("m", id, 100)).unwrap();
        }
        let ids: Vec<u32> = receive(&rx, 50).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, (0..50).collect::<Vec<_>>(), "{arch}");

        client.close();
        server.close();
        drop(server);
        worker.join().unwrap();
    }
}

#[test]
fn client_connects_lazily() {
    for arch in Architecture::ALL {
        let port = free_port();
        let (client, _rx) = collecting_client::<Response>(arch, port);
        // nothing listens yet, so only the first send can fail
        assert!(matches!(
            client.send_request(request("p", 0, 0)),
            Err(Error::Io(_))
        ));

        let server = start_server(arch, port);
        let (client, rx) = collecting_client::<Response>(arch, port);
        client.send_request(request("p", 0, 0)).unwrap();
        assert_eq!(receive(&rx, 1), vec![Response { id: 0, data: 1 }]);
        client.close();
        server.close();
    }
}

#[tokio::test]
async fn async_client_closes_inside_a_runtime() {
    let port = free_port();
    let server = start_server(Architecture::Async, port);
    let (client, rx) = collecting_client::<Response>(Architecture::Async, port);

    client.send_request(request("p", 5, 5)).unwrap();
    let response = tokio::task::spawn_blocking(move || rx.recv_timeout(RECV_TIMEOUT))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, Response { id: 5, data: 6 });

    client.close();
    tokio::task::spawn_blocking(move || server.close())
        .await
        .unwrap();
}
