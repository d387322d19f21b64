//! Helpers over the raw socket layer.
//!
//! Listening sockets and the nonblocking connect are driven through
//! `socket2` (the std types cannot express them); once a descriptor is
//! connected it is handed around as a `std::net::TcpStream`, with
//! [`SockRef`] for the options std does not expose.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

use rivet_core::Config;

/// Placeholder address used when the kernel cannot report one.
pub fn unspecified_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// Converts a raw socket address, falling back to the unspecified address.
pub fn to_socket_addr(addr: &SockAddr) -> SocketAddr {
    addr.as_socket().unwrap_or_else(unspecified_addr)
}

/// Creates a nonblocking, close-on-exec TCP socket for `addr`'s family.
pub fn new_nonblocking_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    Ok(socket)
}

/// Binds and listens a nonblocking socket according to `config`.
pub fn bind_listener(addr: SocketAddr, config: &Config) -> io::Result<Socket> {
    let socket = new_nonblocking_socket(&addr)?;
    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(config.listen_backlog)?;
    Ok(socket)
}

/// Applies per-connection socket options from `config`.
pub fn apply_stream_options(stream: &TcpStream, config: &Config) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(config.keepalive)?;
    if let Some(size) = config.socket_recv_buffer_size {
        sock.set_recv_buffer_size(size)?;
    }
    if let Some(size) = config.socket_send_buffer_size {
        sock.set_send_buffer_size(size)?;
    }
    Ok(())
}

/// Fetches and clears the pending SO_ERROR of a connected stream, if any.
pub fn stream_error(stream: &TcpStream) -> Option<io::Error> {
    match stream.take_error() {
        Ok(err) => err,
        Err(e) => Some(e),
    }
}

/// Fetches and clears the pending SO_ERROR of a raw socket, if any.
pub fn socket_error(socket: &Socket) -> Option<io::Error> {
    match socket.take_error() {
        Ok(err) => err,
        Err(e) => Some(e),
    }
}

/// Detects the loopback degenerate case where an ephemeral port collided
/// with the server port and the socket connected to itself.
pub fn is_self_connect(socket: &Socket) -> bool {
    match (socket.local_addr(), socket.peer_addr()) {
        (Ok(local), Ok(peer)) => match (local.as_socket(), peer.as_socket()) {
            (Some(l), Some(p)) => l == p,
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_listener_on_ephemeral_port() {
        let config = Config::default();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let local = to_socket_addr(&listener.local_addr().unwrap());
        assert_ne!(local.port(), 0);
        assert!(local.ip().is_loopback());
    }

    #[test]
    fn test_unconnected_socket_is_not_self_connect() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = new_nonblocking_socket(&addr).unwrap();
        assert!(!is_self_connect(&socket));
        assert!(socket_error(&socket).is_none());
    }

    #[test]
    fn test_stream_options_apply_cleanly() {
        let config = Config::default();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        let addr = to_socket_addr(&listener.local_addr().unwrap());
        let stream = TcpStream::connect(addr).unwrap();
        apply_stream_options(&stream, &config).unwrap();
        assert!(stream_error(&stream).is_none());
    }
}
