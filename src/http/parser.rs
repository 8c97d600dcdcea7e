//! Incremental HTTP/1.1 request parser.
//!
//! The parser is fed from the session's input ring and makes as much
//! progress as the buffered bytes allow; every outcome is identical no
//! matter how the request bytes were split across reads. Limit
//! violations and malformed input resolve to the HTTP status the
//! session should answer with, never to a panic.
//!
//! After the header block is parsed the session gets a
//! `HeadersDone` event so it can resolve the virtual server and
//! install the effective body-size limit before body parsing proceeds.
//! After `Complete`, `reset()` re-arms the parser while leaving any
//! buffered bytes of a pipelined follow-up request untouched.

use crate::http::chunked::{ChunkProgress, ChunkedDecoder};
use crate::http::request::{Request, SPILL_THRESHOLD};
use crate::http::{is_tchar, Method, Version};
use crate::runtime::ring::RingBuffer;

/// Request line cap; beyond it the request is answered with 414.
pub const MAX_REQUEST_LINE: usize = 8 * 1024;
/// Header block cap; beyond it the request is answered with 431.
pub const MAX_HEADER_BLOCK: usize = 8 * 1024;
/// Absolute header count cap.
pub const MAX_HEADER_COUNT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    RequestLine,
    Headers,
    BodyIdentity,
    BodyChunked,
    Complete,
    Failed,
}

/// Outcome of one `advance` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseEvent {
    /// Buffered input exhausted; feed more bytes and call again.
    NeedMore,
    /// Request line and headers are parsed; the body (if any) has not
    /// been consumed yet.
    HeadersDone,
    /// A full request is ready via `take_request`.
    Complete,
    /// Parsing failed; respond with this status and stop feeding.
    Error(u16),
}

#[derive(Debug)]
pub struct Parser {
    state: ParserState,
    request: Option<Request>,
    /// Total header-block bytes consumed so far, request line excluded.
    header_bytes: usize,
    content_length: Option<u64>,
    chunked: bool,
    /// Identity-body bytes still owed.
    body_remaining: u64,
    /// Effective client-max-body-size, installed after `HeadersDone`.
    body_limit: Option<u64>,
    decoder: ChunkedDecoder,
    /// Scratch for decoded chunk payloads.
    scratch: Vec<u8>,
    error: u16,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            state: ParserState::RequestLine,
            request: None,
            header_bytes: 0,
            content_length: None,
            chunked: false,
            body_remaining: 0,
            body_limit: None,
            decoder: ChunkedDecoder::new(),
            scratch: Vec::new(),
            error: 0,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// True once any byte of the current request has been consumed.
    pub fn started(&self) -> bool {
        self.state != ParserState::RequestLine || self.request.is_some()
    }

    /// Install the resolved virtual server's body cap. Applies to the
    /// request currently being parsed.
    pub fn set_body_limit(&mut self, limit: u64) {
        self.body_limit = Some(limit);
    }

    /// The request being built, if any. Headers are only meaningful
    /// once `advance` has returned `HeadersDone`.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// The parsed request, available once `advance` returned `Complete`.
    pub fn take_request(&mut self) -> Option<Request> {
        if self.state == ParserState::Complete {
            self.request.take()
        } else {
            None
        }
    }

    /// Clear per-request state. Buffered bytes that belong to the next
    /// pipelined request stay in the caller's ring.
    pub fn reset(&mut self) {
        self.state = ParserState::RequestLine;
        self.request = None;
        self.header_bytes = 0;
        self.content_length = None;
        self.chunked = false;
        self.body_remaining = 0;
        self.body_limit = None;
        self.decoder.reset();
        self.scratch.clear();
        self.error = 0;
    }

    /// Consume as much of `input` as the state machine allows.
    pub fn advance(&mut self, input: &mut RingBuffer) -> ParseEvent {
        loop {
            match self.state {
                ParserState::RequestLine => match self.parse_request_line(input) {
                    Step::Continue => {}
                    Step::Yield(event) => return event,
                },
                ParserState::Headers => match self.parse_header_line(input) {
                    Step::Continue => {}
                    Step::Yield(event) => return event,
                },
                ParserState::BodyIdentity => match self.parse_identity_body(input) {
                    Step::Continue => {}
                    Step::Yield(event) => return event,
                },
                ParserState::BodyChunked => match self.parse_chunked_body(input) {
                    Step::Continue => {}
                    Step::Yield(event) => return event,
                },
                ParserState::Complete => return ParseEvent::Complete,
                ParserState::Failed => return ParseEvent::Error(self.error),
            }
        }
    }

    fn fail(&mut self, status: u16) -> Step {
        self.state = ParserState::Failed;
        self.error = status;
        Step::Yield(ParseEvent::Error(status))
    }

    fn parse_request_line(&mut self, input: &mut RingBuffer) -> Step {
        // Tolerate stray CRLFs between pipelined requests.
        if self.request.is_none() {
            while input.find(b"\r\n") == Some(0) {
                input.consume(2);
            }
        }

        let end = match input.find(b"\r\n") {
            Some(end) => end,
            None => {
                if input.readable() > MAX_REQUEST_LINE {
                    return self.fail(414);
                }
                return Step::Yield(ParseEvent::NeedMore);
            }
        };
        if end > MAX_REQUEST_LINE {
            return self.fail(414);
        }

        let mut line = vec![0u8; end];
        input.read(&mut line);
        input.consume(2);

        let mut parts = line.splitn(3, |&b| b == b' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) => (m, t, v),
            _ => return self.fail(400),
        };

        if method.is_empty() || !method.iter().all(|&b| is_tchar(b)) {
            return self.fail(400);
        }
        let method = match Method::from_bytes(method) {
            Some(method) => method,
            // A syntactically valid token the server does not implement.
            None => return self.fail(501),
        };

        if target.is_empty() || target[0] != b'/' || target.contains(&b' ') {
            return self.fail(400);
        }
        let target = match std::str::from_utf8(target) {
            Ok(t) => t.to_string(),
            Err(_) => return self.fail(400),
        };

        let version = match Version::from_bytes(version) {
            Some(version) => version,
            None => return self.fail(505),
        };

        self.request = Some(Request::new(method, target, version));
        self.state = ParserState::Headers;
        Step::Continue
    }

    fn parse_header_line(&mut self, input: &mut RingBuffer) -> Step {
        let end = match input.find(b"\r\n") {
            Some(end) => end,
            None => {
                if self.header_bytes + input.readable() > MAX_HEADER_BLOCK {
                    return self.fail(431);
                }
                return Step::Yield(ParseEvent::NeedMore);
            }
        };

        self.header_bytes += end + 2;
        if self.header_bytes > MAX_HEADER_BLOCK {
            return self.fail(431);
        }

        let mut line = vec![0u8; end];
        input.read(&mut line);
        input.consume(2);

        if line.is_empty() {
            return self.finish_headers();
        }

        // Obsolete folded continuations are rejected outright.
        if line[0] == b' ' || line[0] == b'\t' {
            return self.fail(400);
        }

        let request = self.request.as_mut().unwrap();
        if request.headers.len() >= MAX_HEADER_COUNT {
            return self.fail(431);
        }

        let colon = match line.iter().position(|&b| b == b':') {
            Some(colon) if colon > 0 => colon,
            _ => return self.fail(400),
        };
        let (name, rest) = line.split_at(colon);
        if !name.iter().all(|&b| is_tchar(b)) {
            return self.fail(400);
        }

        let value = &rest[1..];
        let value = match std::str::from_utf8(value) {
            Ok(v) => v.trim_matches([' ', '\t']).to_string(),
            Err(_) => return self.fail(400),
        };
        let name = match std::str::from_utf8(name) {
            Ok(n) => n.to_string(),
            Err(_) => return self.fail(400),
        };

        request.headers.push(name, value);
        Step::Continue
    }

    /// Validate framing headers and pick the body state.
    fn finish_headers(&mut self) -> Step {
        let request = self.request.as_ref().unwrap();

        if request.version == Version::Http11 && request.host().is_none() {
            return self.fail(400);
        }

        if request.headers.count("content-length") > 1 {
            return self.fail(400);
        }
        let content_length = match request.headers.get("content-length") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(n) => Some(n),
                Err(_) => return self.fail(400),
            },
            None => None,
        };

        let transfer_encoding = request.headers.get("transfer-encoding");
        let chunked = match transfer_encoding {
            Some(te) if te.eq_ignore_ascii_case("chunked") => {
                // A sender must not combine a length with chunked framing.
                if content_length.is_some() {
                    return self.fail(400);
                }
                true
            }
            Some(te) if te.eq_ignore_ascii_case("identity") => false,
            Some(_) => return self.fail(501),
            None => false,
        };

        self.content_length = content_length;
        self.chunked = chunked;

        if chunked {
            self.state = ParserState::BodyChunked;
        } else {
            match content_length {
                Some(n) if n > 0 => {
                    self.body_remaining = n;
                    self.state = ParserState::BodyIdentity;
                }
                _ => self.state = ParserState::Complete,
            }
        }
        Step::Yield(ParseEvent::HeadersDone)
    }

    fn parse_identity_body(&mut self, input: &mut RingBuffer) -> Step {
        if let (Some(limit), Some(total)) = (self.body_limit, self.content_length) {
            if total > limit {
                return self.fail(413);
            }
        }

        while self.body_remaining > 0 {
            let take = (self.body_remaining.min(input.readable() as u64)) as usize;
            if take == 0 {
                return Step::Yield(ParseEvent::NeedMore);
            }
            self.scratch.resize(take, 0);
            input.read(&mut self.scratch[..take]);
            let request = self.request.as_mut().unwrap();
            if request.body.append(&self.scratch[..take], SPILL_THRESHOLD).is_err() {
                return self.fail(500);
            }
            self.body_remaining -= take as u64;
        }

        self.state = ParserState::Complete;
        Step::Continue
    }

    fn parse_chunked_body(&mut self, input: &mut RingBuffer) -> Step {
        loop {
            self.scratch.clear();
            let progress = self.decoder.decode(input, &mut self.scratch);

            if !self.scratch.is_empty() {
                let request = self.request.as_mut().unwrap();
                if request.body.append(&self.scratch, SPILL_THRESHOLD).is_err() {
                    return self.fail(500);
                }
                if let Some(limit) = self.body_limit {
                    if request.body.len() > limit {
                        return self.fail(413);
                    }
                }
            }

            match progress {
                ChunkProgress::Complete => {
                    self.state = ParserState::Complete;
                    return Step::Continue;
                }
                ChunkProgress::NeedMore => return Step::Yield(ParseEvent::NeedMore),
                ChunkProgress::Error => return self.fail(400),
            }
        }
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

enum Step {
    /// State advanced; run the next state with the remaining input.
    Continue,
    /// Stop and report this event to the caller.
    Yield(ParseEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::BodyStore;

    fn ring_with(bytes: &[u8]) -> RingBuffer {
        let mut ring = RingBuffer::with_capacity(bytes.len() + 64);
        ring.write(bytes);
        ring
    }

    /// Drive a parser over `bytes`, installing `limit` at HeadersDone.
    fn run(bytes: &[u8], limit: u64) -> (Parser, ParseEvent) {
        let mut parser = Parser::new();
        let mut ring = ring_with(bytes);
        loop {
            match parser.advance(&mut ring) {
                ParseEvent::HeadersDone => parser.set_body_limit(limit),
                event => return (parser, event),
            }
        }
    }

    #[test]
    fn test_simple_get() {
        let (mut parser, event) = run(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n", 1024);
        assert_eq!(event, ParseEvent::Complete);

        let req = parser.take_request().unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/index.html");
        assert_eq!(req.version, Version::Http11);
        assert_eq!(req.headers.get("host"), Some("localhost"));
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_byte_split_invariance() {
        let raw = b"POST /submit?q=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 11\r\nX-Extra: yes\r\n\r\nhello world";

        let (mut whole, event) = run(raw, 1024);
        assert_eq!(event, ParseEvent::Complete);
        let reference = whole.take_request().unwrap();

        for split in 1..raw.len() {
            let mut parser = Parser::new();
            let mut ring = RingBuffer::with_capacity(raw.len() + 64);

            ring.write(&raw[..split]);
            loop {
                match parser.advance(&mut ring) {
                    ParseEvent::HeadersDone => parser.set_body_limit(1024),
                    ParseEvent::NeedMore => break,
                    ParseEvent::Complete => break,
                    ParseEvent::Error(status) => panic!("split {split}: error {status}"),
                }
            }
            ring.write(&raw[split..]);
            let event = loop {
                match parser.advance(&mut ring) {
                    ParseEvent::HeadersDone => parser.set_body_limit(1024),
                    event => break event,
                }
            };
            assert_eq!(event, ParseEvent::Complete, "split at {split}");

            let mut req = parser.take_request().unwrap();
            assert_eq!(req.method, reference.method);
            assert_eq!(req.path, reference.path);
            assert_eq!(req.query, reference.query);
            assert_eq!(req.headers.len(), reference.headers.len());
            assert_eq!(req.body.to_vec().unwrap(), b"hello world");
        }
    }

    #[test]
    fn test_malformed_request_line() {
        for raw in [
            &b"GET\r\n\r\n"[..],
            b"GET /\r\n\r\n",
            b" GET / HTTP/1.1\r\n\r\n",
            b"G@T / HTTP/1.1\r\n\r\n",
            b"GET missing-slash HTTP/1.1\r\n\r\n",
        ] {
            let (_, event) = run(raw, 1024);
            assert_eq!(event, ParseEvent::Error(400), "{:?}", raw);
        }
    }

    #[test]
    fn test_unknown_method_token() {
        let (_, event) = run(b"PATCH / HTTP/1.1\r\nHost: x\r\n\r\n", 1024);
        assert_eq!(event, ParseEvent::Error(501));
    }

    #[test]
    fn test_overlong_request_line() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_REQUEST_LINE + 10));
        raw.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        let (_, event) = run(&raw, 1024);
        assert_eq!(event, ParseEvent::Error(414));
    }

    #[test]
    fn test_overlong_request_line_without_crlf() {
        // No CRLF at all; the cap still fires once enough bytes queue up.
        let raw = vec![b'a'; MAX_REQUEST_LINE + 100];
        let (_, event) = run(&raw, 1024);
        assert_eq!(event, ParseEvent::Error(414));
    }

    #[test]
    fn test_bad_version() {
        let (_, event) = run(b"GET / HTTP/2.0\r\nHost: x\r\n\r\n", 1024);
        assert_eq!(event, ParseEvent::Error(505));
    }

    #[test]
    fn test_missing_host_http11() {
        let (_, event) = run(b"GET / HTTP/1.1\r\n\r\n", 1024);
        assert_eq!(event, ParseEvent::Error(400));
    }

    #[test]
    fn test_http10_without_host_is_fine() {
        let (_, event) = run(b"GET / HTTP/1.0\r\n\r\n", 1024);
        assert_eq!(event, ParseEvent::Complete);
    }

    #[test]
    fn test_folded_header_rejected() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: a\r\n b\r\n\r\n";
        let (_, event) = run(raw, 1024);
        assert_eq!(event, ParseEvent::Error(400));
    }

    #[test]
    fn test_duplicate_content_length() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nContent-Length: 3\r\n\r\nabc";
        let (_, event) = run(raw, 1024);
        assert_eq!(event, ParseEvent::Error(400));
    }

    #[test]
    fn test_conflicting_length_and_chunked() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (_, event) = run(raw, 1024);
        assert_eq!(event, ParseEvent::Error(400));
    }

    #[test]
    fn test_unknown_transfer_encoding() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n";
        let (_, event) = run(raw, 1024);
        assert_eq!(event, ParseEvent::Error(501));
    }

    #[test]
    fn test_too_many_headers() {
        let mut raw = b"GET / HTTP/1.1\r\nHost: x\r\n".to_vec();
        for i in 0..MAX_HEADER_COUNT + 1 {
            raw.extend_from_slice(format!("H{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let (_, event) = run(&raw, 1024);
        assert_eq!(event, ParseEvent::Error(431));
    }

    #[test]
    fn test_header_block_cap() {
        let mut raw = b"GET / HTTP/1.1\r\nHost: x\r\n".to_vec();
        raw.extend_from_slice(b"X-Big: ");
        raw.extend(std::iter::repeat(b'v').take(MAX_HEADER_BLOCK));
        raw.extend_from_slice(b"\r\n\r\n");
        let (_, event) = run(&raw, 1024);
        assert_eq!(event, ParseEvent::Error(431));
    }

    #[test]
    fn test_identity_body_over_limit() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 100\r\n\r\n";
        let (_, event) = run(raw, 10);
        assert_eq!(event, ParseEvent::Error(413));
    }

    #[test]
    fn test_chunked_body_over_limit() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\nff\r\n";
        let mut full = raw.to_vec();
        full.extend(std::iter::repeat(b'z').take(0xff));
        full.extend_from_slice(b"\r\n0\r\n\r\n");
        let (_, event) = run(&full, 16);
        assert_eq!(event, ParseEvent::Error(413));
    }

    #[test]
    fn test_chunked_round_trip() {
        let raw = b"POST /up HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHELLO\r\n6\r\n WORLD\r\n0\r\n\r\n";
        let (mut parser, event) = run(raw, 1024);
        assert_eq!(event, ParseEvent::Complete);
        let mut req = parser.take_request().unwrap();
        assert_eq!(req.body.to_vec().unwrap(), b"HELLO WORLD");
    }

    #[test]
    fn test_bad_chunk_size() {
        let raw = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\nxyz\r\n";
        let (_, event) = run(raw, 1024);
        assert_eq!(event, ParseEvent::Error(400));
    }

    #[test]
    fn test_pipelined_bytes_survive_reset() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut parser = Parser::new();
        let mut ring = ring_with(raw);

        loop {
            match parser.advance(&mut ring) {
                ParseEvent::HeadersDone => {}
                ParseEvent::Complete => break,
                other => panic!("unexpected: {other:?}"),
            }
        }
        let first = parser.take_request().unwrap();
        assert_eq!(first.path, "/a");

        parser.reset();
        loop {
            match parser.advance(&mut ring) {
                ParseEvent::HeadersDone => {}
                ParseEvent::Complete => break,
                other => panic!("unexpected: {other:?}"),
            }
        }
        let second = parser.take_request().unwrap();
        assert_eq!(second.path, "/b");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_body_spills_to_temp_file() {
        let size = SPILL_THRESHOLD + 4096;
        let mut raw = format!("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: {size}\r\n\r\n").into_bytes();
        raw.extend(std::iter::repeat(b'b').take(size));

        // Feed in pieces small enough for a modest ring.
        let mut parser = Parser::new();
        let mut ring = RingBuffer::with_capacity(4096);
        let mut offset = 0;
        let event = loop {
            if offset < raw.len() {
                offset += ring.write(&raw[offset..]);
            }
            match parser.advance(&mut ring) {
                ParseEvent::HeadersDone => parser.set_body_limit(u64::MAX),
                ParseEvent::NeedMore => continue,
                event => break event,
            }
        };
        assert_eq!(event, ParseEvent::Complete);

        let mut req = parser.take_request().unwrap();
        assert!(matches!(req.body, BodyStore::Spilled { .. }));
        assert_eq!(req.body.len(), size as u64);
        assert!(req.body.to_vec().unwrap().iter().all(|&b| b == b'b'));
    }
}
