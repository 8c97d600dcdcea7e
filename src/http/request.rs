//! Parsed request representation and request-body storage.

use crate::http::{Method, Version};
use bytes::BytesMut;
use std::io::{self, Read, Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

/// Bodies larger than this move from memory to a temporary file.
pub const SPILL_THRESHOLD: usize = 64 * 1024;

/// Ordered header list with case-insensitive name lookup.
///
/// Duplicate names are preserved in arrival order; callers that care
/// about duplicates (`Content-Length`) use `count`.
#[derive(Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: String, value: String) {
        self.entries.push((name, value));
    }

    /// First value for `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Number of entries with `name`.
    pub fn count(&self, name: &str) -> usize {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Request-body bytes, in memory up to a threshold and spilled to an
/// unlinked-on-drop temporary file beyond it.
#[derive(Debug)]
pub enum BodyStore {
    Memory(BytesMut),
    Spilled { file: NamedTempFile, len: u64 },
}

impl BodyStore {
    pub fn new() -> Self {
        BodyStore::Memory(BytesMut::new())
    }

    pub fn len(&self) -> u64 {
        match self {
            BodyStore::Memory(buf) => buf.len() as u64,
            BodyStore::Spilled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes, spilling to a temporary file once the in-memory
    /// size would exceed `threshold`.
    pub fn append(&mut self, data: &[u8], threshold: usize) -> io::Result<()> {
        match self {
            BodyStore::Memory(buf) => {
                if buf.len() + data.len() <= threshold {
                    buf.extend_from_slice(data);
                    return Ok(());
                }
                let mut file = NamedTempFile::new()?;
                file.write_all(buf)?;
                file.write_all(data)?;
                let len = buf.len() as u64 + data.len() as u64;
                *self = BodyStore::Spilled { file, len };
                Ok(())
            }
            BodyStore::Spilled { file, len } => {
                file.write_all(data)?;
                *len += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Copy the whole body into `out`. Rewinds the spill file first.
    pub fn copy_to(&mut self, out: &mut impl Write) -> io::Result<u64> {
        match self {
            BodyStore::Memory(buf) => {
                out.write_all(buf)?;
                Ok(buf.len() as u64)
            }
            BodyStore::Spilled { file, len } => {
                file.seek(SeekFrom::Start(0))?;
                io::copy(file.as_file_mut(), out)?;
                Ok(*len)
            }
        }
    }

    /// The whole body as a contiguous byte vector.
    pub fn to_vec(&mut self) -> io::Result<Vec<u8>> {
        match self {
            BodyStore::Memory(buf) => Ok(buf.to_vec()),
            BodyStore::Spilled { file, len } => {
                file.seek(SeekFrom::Start(0))?;
                let mut out = Vec::with_capacity(*len as usize);
                file.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

impl Default for BodyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully or partially parsed request.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    /// Target exactly as it appeared on the request line.
    pub raw_target: String,
    /// Target path with query and fragment stripped.
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
    pub headers: Headers,
    pub body: BodyStore,
}

impl Request {
    pub fn new(method: Method, raw_target: String, version: Version) -> Self {
        let without_fragment = match raw_target.find('#') {
            Some(i) => &raw_target[..i],
            None => raw_target.as_str(),
        };
        let (path, query) = match without_fragment.find('?') {
            Some(i) => (
                without_fragment[..i].to_string(),
                Some(without_fragment[i + 1..].to_string()),
            ),
            None => (without_fragment.to_string(), None),
        };
        Self {
            method,
            raw_target,
            path,
            query,
            version,
            headers: Headers::new(),
            body: BodyStore::new(),
        }
    }

    /// The `Host` header value, if present and non-empty.
    pub fn host(&self) -> Option<&str> {
        self.headers.get("host").filter(|h| !h.is_empty())
    }

    /// Whether the client asked to keep the connection open.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.headers.get("connection");
        match self.version {
            Version::Http11 => {
                !matches!(connection, Some(v) if v.eq_ignore_ascii_case("close"))
            }
            Version::Http10 => {
                matches!(connection, Some(v) if v.eq_ignore_ascii_case("keep-alive"))
            }
        }
    }
}
