//! Per-connection session state machine.
//!
//! A session owns the client stream, an input ring feeding the request
//! parser, an output ring draining the current response, and a
//! last-activity deadline. It advances only on readiness events from
//! the loop; every socket call is non-blocking and `WouldBlock` is a
//! normal outcome, never an error.
//!
//! State walk: accepted sessions start `Reading`; a complete (or
//! failed) request flips them to `Writing`; a fully drained response
//! either closes the connection or resets the parser and returns to
//! `Reading`, picking up any pipelined bytes already buffered.

use crate::handlers;
use crate::http::parser::{ParseEvent, Parser, MAX_HEADER_BLOCK, MAX_REQUEST_LINE};
use crate::http::response::Response;
use crate::net::Endpoint;
use crate::vhost::ServerMap;
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Initial input ring size; grows on demand up to the header caps.
const INPUT_RING_SIZE: usize = 4 * 1024;
/// Input ring growth bound: a maximal request line plus a maximal
/// header block, with slack for body bytes in flight.
const INPUT_RING_MAX: usize = MAX_REQUEST_LINE + MAX_HEADER_BLOCK + 16 * 1024;
/// Output ring size.
const OUTPUT_RING_SIZE: usize = 8 * 1024;
/// Per-event read budget, for fairness between sessions.
const MAX_READ_PER_EVENT: usize = 64 * 1024;
/// Per-event write budget.
const MAX_WRITE_PER_EVENT: usize = 64 * 1024;
/// Idle deadline.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

use crate::runtime::ring::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for request bytes.
    Reading,
    /// Draining a response.
    Writing,
    /// Finished; the loop must deregister and drop the session.
    Closed,
}

pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    /// The listening endpoint this connection was accepted on; keys
    /// virtual-server resolution.
    endpoint: Endpoint,
    state: SessionState,
    input: RingBuffer,
    output: RingBuffer,
    parser: Parser,
    response: Option<Response>,
    close_after_response: bool,
    last_activity: Instant,
    /// Interest currently registered with the poll, kept by the loop
    /// so it only reregisters on change.
    pub(crate) registered_interest: mio::Interest,
}

impl Session {
    pub fn new(stream: TcpStream, peer: SocketAddr, endpoint: Endpoint) -> Self {
        Self {
            stream,
            peer,
            endpoint,
            state: SessionState::Reading,
            input: RingBuffer::with_capacity(INPUT_RING_SIZE),
            output: RingBuffer::with_capacity(OUTPUT_RING_SIZE),
            parser: Parser::new(),
            response: None,
            close_after_response: false,
            last_activity: Instant::now(),
            registered_interest: mio::Interest::READABLE,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Interest the session's state calls for, or `None` once closed.
    pub fn desired_interest(&self) -> Option<mio::Interest> {
        match self.state {
            SessionState::Reading => Some(mio::Interest::READABLE),
            SessionState::Writing => Some(mio::Interest::WRITABLE),
            SessionState::Closed => None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn deadline_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > IDLE_TIMEOUT
    }

    /// Drain the socket into the input ring and advance the parser.
    pub fn on_readable(&mut self, map: &ServerMap) {
        if self.state != SessionState::Reading {
            return;
        }

        let mut budget = MAX_READ_PER_EVENT;
        let mut chunk = [0u8; 8 * 1024];
        loop {
            self.drive_parser(map);
            if self.state != SessionState::Reading {
                return;
            }

            if self.input.writable() == 0 {
                // Headers can outgrow the initial ring; bodies are
                // consumed by the parser, so a full ring here means
                // the header block is still incomplete.
                if self.input.capacity() >= INPUT_RING_MAX {
                    self.fail_request(431, map);
                    return;
                }
                let grown = (self.input.capacity() * 2).min(INPUT_RING_MAX);
                self.input.reserve(grown);
            }

            if budget == 0 {
                // Fairness bound reached; level-triggered polling will
                // hand the rest back on the next iteration.
                return;
            }

            let want = chunk.len().min(self.input.writable()).min(budget);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    trace!(peer = %self.peer, "peer closed");
                    self.state = SessionState::Closed;
                    return;
                }
                Ok(n) => {
                    self.input.write(&chunk[..n]);
                    budget -= n;
                    self.last_activity = Instant::now();
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(peer = %self.peer, error = %err, "read failed");
                    self.state = SessionState::Closed;
                    return;
                }
            }
        }
    }

    /// Drain the output ring (refilled from the response cursor) into
    /// the socket.
    pub fn on_writable(&mut self, map: &ServerMap) {
        if self.state != SessionState::Writing {
            return;
        }

        let mut budget = MAX_WRITE_PER_EVENT;
        loop {
            // Refill the ring from the response's unsent bytes.
            if let Some(response) = &mut self.response {
                let n = self.output.write(response.unsent());
                response.advance(n);
            }

            if self.output.is_empty() {
                break;
            }

            let (first, _) = self.output.as_slices();
            let want = first.len().min(budget);
            match self.stream.write(&first[..want]) {
                Ok(0) => {
                    self.state = SessionState::Closed;
                    return;
                }
                Ok(n) => {
                    self.output.consume(n);
                    budget -= n;
                    self.last_activity = Instant::now();
                    if budget == 0 {
                        return;
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // EPIPE and friends are a normal close.
                    debug!(peer = %self.peer, error = %err, "write failed");
                    self.state = SessionState::Closed;
                    return;
                }
            }
        }

        let done = self
            .response
            .as_ref()
            .map(|r| r.is_fully_sent())
            .unwrap_or(true);
        if done && self.output.is_empty() {
            if self.close_after_response {
                self.state = SessionState::Closed;
            } else {
                self.rearm(map);
            }
        }
    }

    /// Idle-deadline expiry: answer 408 best-effort when the client
    /// went quiet mid-request, then close.
    pub fn expire(&mut self, map: &ServerMap, now: Instant) -> bool {
        if !self.deadline_expired(now) {
            return false;
        }
        debug!(peer = %self.peer, "idle timeout");

        if self.state == SessionState::Reading && self.parser.started() && self.output.is_empty() {
            let host = self.parser.request().and_then(|r| r.host()).map(str::to_string);
            if let Some(server) = map.resolve(self.endpoint, host.as_deref()) {
                let mut response = handlers::error_response(408, server);
                response.set_header("Connection", "close");
                response.finalize();
                // One opportunistic write; the session dies either way.
                let _ = self.stream.write(response.unsent());
            }
        }
        self.state = SessionState::Closed;
        true
    }

    /// Run the parser over buffered input, dispatching when a request
    /// completes or fails.
    fn drive_parser(&mut self, map: &ServerMap) {
        loop {
            match self.parser.advance(&mut self.input) {
                ParseEvent::NeedMore => return,
                ParseEvent::HeadersDone => {
                    let host = self.parser.request().and_then(|r| r.host()).map(str::to_string);
                    if let Some(server) = map.resolve(self.endpoint, host.as_deref()) {
                        self.parser.set_body_limit(server.client_max_body_size);
                    }
                }
                ParseEvent::Complete => {
                    self.dispatch(map);
                    return;
                }
                ParseEvent::Error(status) => {
                    self.fail_request(status, map);
                    return;
                }
            }
        }
    }

    /// A complete request: resolve the virtual server and location,
    /// run the handler, stage the response.
    fn dispatch(&mut self, map: &ServerMap) {
        let mut request = match self.parser.take_request() {
            Some(request) => request,
            None => {
                self.state = SessionState::Closed;
                return;
            }
        };

        let server = match map.resolve(self.endpoint, request.host()) {
            Some(server) => server,
            None => {
                self.state = SessionState::Closed;
                return;
            }
        };

        let mut response = handlers::handle_request(&mut request, server);
        // Error responses drop the connection once drained; only a 413
        // on a keep-alive server leaves the framing intact enough to
        // continue.
        let recoverable = response.status < 400 || (response.status == 413 && server.keep_alive);
        let keep_alive = server.keep_alive && request.wants_keep_alive() && recoverable;
        self.finish_response(&mut response, keep_alive);

        debug!(
            peer = %self.peer,
            method = %request.method,
            path = %request.path,
            status = response.status,
            "request handled"
        );

        self.response = Some(response);
        self.state = SessionState::Writing;
    }

    /// A parse failure: stage the mapped error response and close
    /// afterwards. The input stream's framing can no longer be
    /// trusted, so even recoverable-looking statuses drop the
    /// connection once the response drains.
    fn fail_request(&mut self, status: u16, map: &ServerMap) {
        let host = self.parser.request().and_then(|r| r.host()).map(str::to_string);
        let server = match map.resolve(self.endpoint, host.as_deref()) {
            Some(server) => server,
            None => {
                self.state = SessionState::Closed;
                return;
            }
        };

        debug!(peer = %self.peer, status, "request rejected");
        let mut response = handlers::error_response(status, server);
        self.finish_response(&mut response, false);
        self.response = Some(response);
        self.state = SessionState::Writing;
    }

    fn finish_response(&mut self, response: &mut Response, keep_alive: bool) {
        self.close_after_response = !keep_alive;
        response.set_header(
            "Connection",
            if keep_alive { "keep-alive" } else { "close" },
        );
        response.finalize();
    }

    /// Response fully emitted: reset for the next request on this
    /// connection and immediately parse any pipelined bytes.
    fn rearm(&mut self, map: &ServerMap) {
        self.parser.reset();
        self.response = None;
        self.close_after_response = false;
        self.state = SessionState::Reading;
        self.last_activity = Instant::now();
        if !self.input.is_empty() {
            self.drive_parser(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhost::VirtualServer;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener as StdListener;
    use std::thread::sleep;

    /// Connected (session, client) pair over loopback.
    fn connected_pair(endpoint_str: &str) -> (Session, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(accepted);
        let endpoint: Endpoint = endpoint_str.parse().unwrap();
        (Session::new(stream, peer, endpoint), client)
    }

    fn map_with_root(root: &std::path::Path) -> ServerMap {
        let mut server = VirtualServer::example();
        server.root = root.to_path_buf();
        ServerMap::new(vec![server])
    }

    /// Pump the session until it leaves `Reading` or attempts run out.
    fn pump_read(session: &mut Session, map: &ServerMap) {
        for _ in 0..100 {
            session.on_readable(map);
            if session.state() != SessionState::Reading {
                return;
            }
            sleep(Duration::from_millis(5));
        }
        panic!("session never finished reading");
    }

    /// Drive writes until the session leaves `Writing`, collecting the
    /// bytes the client received.
    fn pump_write(session: &mut Session, map: &ServerMap, client: &mut std::net::TcpStream) -> Vec<u8> {
        client.set_nonblocking(true).unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        let mut drain = |received: &mut Vec<u8>| loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("client read: {e}"),
            }
        };

        for _ in 0..100 {
            session.on_writable(map);
            drain(&mut received);
            if session.state() != SessionState::Writing {
                // Bytes already written by the session may still be in
                // flight; wait until the count stops growing.
                let mut stable = 0;
                while stable < 3 {
                    let before = received.len();
                    sleep(Duration::from_millis(5));
                    drain(&mut received);
                    if received.len() == before {
                        stable += 1;
                    } else {
                        stable = 0;
                    }
                }
                return received;
            }
            sleep(Duration::from_millis(5));
        }
        panic!("session never finished writing");
    }

    #[test]
    fn test_full_request_cycle() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "HELLO\n").unwrap();
        let map = map_with_root(dir.path());

        let (mut session, mut client) = connected_pair("127.0.0.1:8080");
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();

        pump_read(&mut session, &map);
        assert_eq!(session.state(), SessionState::Writing);

        let received = pump_write(&mut session, &map, &mut client);
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("HELLO\n"));

        // Keep-alive: back to reading, not closed.
        assert_eq!(session.state(), SessionState::Reading);
    }

    #[test]
    fn test_sequential_pipelined_requests() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "HELLO\n").unwrap();
        let map = map_with_root(dir.path());

        let (mut session, mut client) = connected_pair("127.0.0.1:8080");
        client
            .write_all(
                b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n\
                  GET /nope HTTP/1.1\r\nHost: localhost\r\n\r\n",
            )
            .unwrap();

        pump_read(&mut session, &map);
        let first = pump_write(&mut session, &map, &mut client);
        let first = String::from_utf8_lossy(&first);
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"));

        // The second request is usually already buffered and picked up
        // by rearm; if its bytes were still in flight, read them now.
        if session.state() == SessionState::Reading {
            pump_read(&mut session, &map);
        }
        assert_eq!(session.state(), SessionState::Writing);
        let second = pump_write(&mut session, &map, &mut client);
        let second = String::from_utf8_lossy(&second);
        assert!(second.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }

    #[test]
    fn test_chunked_post_upload() {
        let www = tempfile::tempdir().unwrap();
        let uploads = tempfile::tempdir().unwrap();

        let mut server = VirtualServer::example();
        server.root = www.path().to_path_buf();
        let mut location = crate::router::Location::new("/up");
        location.allowed_methods =
            Some(std::collections::BTreeSet::from([crate::http::Method::Post]));
        location.upload_path = Some(uploads.path().to_path_buf());
        server.locations = vec![location];
        let map = ServerMap::new(vec![server]);

        let (mut session, mut client) = connected_pair("127.0.0.1:8080");
        client
            .write_all(
                b"POST /up HTTP/1.1\r\nHost: localhost\r\n\
                  Transfer-Encoding: chunked\r\nContent-Type: text/plain\r\n\r\n\
                  5\r\nHELLO\r\n0\r\n\r\n",
            )
            .unwrap();

        pump_read(&mut session, &map);
        assert_eq!(session.state(), SessionState::Writing);
        let received = pump_write(&mut session, &map, &mut client);
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 201 Created\r\n"), "got: {text}");
        assert!(text.contains("Location: /up/"));

        let entries: Vec<_> = std::fs::read_dir(uploads.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let path = entries[0].as_ref().unwrap().path();
        assert_eq!(std::fs::read(&path).unwrap(), b"HELLO");
    }

    #[test]
    fn test_parse_error_produces_response_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let map = map_with_root(dir.path());

        let (mut session, mut client) = connected_pair("127.0.0.1:8080");
        client.write_all(b"GET / HTTP/9.9\r\n\r\n").unwrap();

        pump_read(&mut session, &map);
        assert_eq!(session.state(), SessionState::Writing);

        let received = pump_write(&mut session, &map, &mut client);
        let text = String::from_utf8_lossy(&received);
        assert!(text.starts_with("HTTP/1.1 505 HTTP Version Not Supported\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_connection_close_requested_by_client() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "x").unwrap();
        let map = map_with_root(dir.path());

        let (mut session, mut client) = connected_pair("127.0.0.1:8080");
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n")
            .unwrap();

        pump_read(&mut session, &map);
        let received = pump_write(&mut session, &map, &mut client);
        assert!(String::from_utf8_lossy(&received).contains("Connection: close\r\n"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_peer_close_closes_session() {
        let dir = tempfile::tempdir().unwrap();
        let map = map_with_root(dir.path());

        let (mut session, client) = connected_pair("127.0.0.1:8080");
        drop(client);

        for _ in 0..100 {
            session.on_readable(&map);
            if session.state() == SessionState::Closed {
                return;
            }
            sleep(Duration::from_millis(5));
        }
        panic!("session did not observe peer close");
    }

    #[test]
    fn test_idle_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let map = map_with_root(dir.path());

        let (mut session, _client) = connected_pair("127.0.0.1:8080");
        let now = Instant::now();
        assert!(!session.deadline_expired(now));
        assert!(!session.expire(&map, now));

        let later = now + IDLE_TIMEOUT + Duration::from_secs(1);
        assert!(session.deadline_expired(later));
        assert!(session.expire(&map, later));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_activity_refreshes_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let map = map_with_root(dir.path());

        let (mut session, mut client) = connected_pair("127.0.0.1:8080");
        // Partial request; enough to count as activity.
        client.write_all(b"GET / HT").unwrap();
        sleep(Duration::from_millis(20));
        session.on_readable(&map);

        // The deadline is measured from the last read, not accept.
        assert!(!session.deadline_expired(Instant::now()));
        assert_eq!(session.state(), SessionState::Reading);
    }
}
