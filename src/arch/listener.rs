//! Socket setup shared by the architectures.

use crate::endpoint::{Endpoint, Port};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

/// Bind a blocking listener on all interfaces.
pub(crate) fn bind(port: Port, backlog: i32) -> io::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port.get()));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Open a blocking connection with Nagle disabled.
pub(crate) fn connect(endpoint: &Endpoint) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(endpoint.socket_addr())?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Unblock a thread parked in `accept()` on `listener`.
///
/// Linux fails the pending accept once the socket is shut down. Other
/// platforms ignore shutdown on listeners, so a loopback connect is made too.
pub(crate) fn wake_acceptor(listener: &TcpListener, port: Port) {
    let _ = SockRef::from(listener).shutdown(Shutdown::Both);
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port.get()));
    let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
}

/// Second handle to the same socket, for a loop that needs its own registration.
pub(crate) fn duplicate(socket: SockRef<'_>) -> io::Result<TcpStream> {
    Ok(socket.try_clone()?.into())
}
