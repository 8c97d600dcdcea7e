//! Listening socket construction.
//!
//! Sockets are configured through `socket2` before they ever reach the
//! poll registry: `SO_REUSEADDR`, non-blocking, close-on-exec, and a
//! backlog of at least 128. The result is handed over as a
//! `mio::net::TcpListener` so the event loop can register it directly.

use crate::net::Endpoint;
use mio::net::TcpListener;
use std::io;

const LISTEN_BACKLOG: i32 = 128;

/// Bind and listen on `endpoint`, returning a non-blocking listener.
pub fn bind_listener(endpoint: Endpoint) -> io::Result<TcpListener> {
    let addr = endpoint.socket_addr();
    let socket = socket2::Socket::new(
        match addr {
            std::net::SocketAddr::V4(_) => socket2::Domain::IPV4,
            std::net::SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_cloexec(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let ep: Endpoint = "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into();
        let listener = bind_listener(ep).unwrap();
        let bound = listener.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let ep: Endpoint = "127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap().into();
        let first = bind_listener(ep).unwrap();
        let bound: Endpoint = first.local_addr().unwrap().into();

        // Second bind on the same concrete port must fail even with
        // SO_REUSEADDR, since the first socket is actively listening.
        assert!(bind_listener(bound).is_err());
    }
}
