//! Response representation and wire serialization.
//!
//! A response is a status, an ordered header list, and a body, plus a
//! bytes-sent cursor so the session can drain it through the output
//! ring across many writable events. `finalize` stamps the headers
//! every response carries (`Server`, `Date`) and freezes the head; the
//! cursor then walks head bytes first, body bytes second.

use crate::http::reason_phrase;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::SystemTime;

/// Token sent in the `Server` header and the autoindex footer.
pub const SERVER_TOKEN: &str = "hearth/0.1";

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Current time in IMF-fixdate form for the `Date` header.
pub fn http_date_now() -> String {
    Utc::now().format(HTTP_DATE_FORMAT).to_string()
}

/// A file mtime in IMF-fixdate form for `Last-Modified`.
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(HTTP_DATE_FORMAT).to_string()
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: &'static str,
    headers: Vec<(String, String)>,
    body: Bytes,
    /// HEAD requests keep all headers but send no body bytes.
    head_only: bool,
    /// Serialized status line + headers, set by `finalize`.
    head: Bytes,
    sent: usize,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status),
            headers: Vec::new(),
            body: Bytes::new(),
            head_only: false,
            head: Bytes::new(),
            sent: 0,
        }
    }

    /// Append a header. Order is preserved on the wire.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Install the body and its `Content-Type`/`Content-Length` headers.
    pub fn set_body(&mut self, body: impl Into<Bytes>, content_type: &str) {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
        self.set_header("Content-Length", self.body.len().to_string());
    }

    /// An explicitly empty body, with `Content-Length: 0`.
    pub fn set_empty_body(&mut self) {
        self.body = Bytes::new();
        self.set_header("Content-Length", "0");
    }

    /// Suppress body bytes while keeping every header (HEAD).
    pub fn set_head_only(&mut self) {
        self.head_only = true;
    }

    /// Stamp the ambient headers and freeze the serialized head.
    /// Must be called exactly once, after all headers are set.
    pub fn finalize(&mut self) {
        if self.header("server").is_none() {
            self.set_header("Server", SERVER_TOKEN);
        }
        if self.header("date").is_none() {
            self.set_header("Date", http_date_now());
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(b"HTTP/1.1 ");
        head.extend_from_slice(self.status.to_string().as_bytes());
        head.push(b' ');
        head.extend_from_slice(self.reason.as_bytes());
        head.extend_from_slice(b"\r\n");
        for (name, value) in &self.headers {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        self.head = head.into();
        self.sent = 0;
    }

    fn total_len(&self) -> usize {
        self.head.len() + if self.head_only { 0 } else { self.body.len() }
    }

    /// The next unsent bytes: head first, then body.
    pub fn unsent(&self) -> &[u8] {
        if self.sent < self.head.len() {
            &self.head[self.sent..]
        } else if self.head_only {
            &[]
        } else {
            &self.body[self.sent - self.head.len()..]
        }
    }

    /// Advance the bytes-sent cursor.
    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.total_len());
    }

    pub fn is_fully_sent(&self) -> bool {
        !self.head.is_empty() && self.sent >= self.total_len()
    }
}

/// Built-in minimal error page used when no status page is configured.
pub fn builtin_error_page(status: u16) -> String {
    let reason = reason_phrase(status);
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n\
         <body>\n<h1>{status} {reason}</h1>\n<hr>\n<address>{SERVER_TOKEN}</address>\n\
         </body>\n</html>\n"
    )
}
