//! `Transfer-Encoding: chunked` decoder.
//!
//! A sub-state machine driven by the request parser: hexadecimal size
//! line (optionally followed by `;extension`), chunk data terminated by
//! CRLF, and a zero-size chunk introducing trailer lines that are
//! discarded up to the final empty line. Any framing violation is a
//! hard error; the parser maps it to a 400.

use crate::runtime::ring::RingBuffer;

/// Longest size line the decoder will wait for before giving up.
const MAX_SIZE_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Expecting `<hex-size>[;ext]\r\n`.
    Size,
    /// Expecting chunk payload plus its trailing CRLF.
    Data,
    /// Expecting trailer lines, ended by an empty line.
    Trailer,
    Complete,
    Error,
}

/// Outcome of one `decode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkProgress {
    /// Buffered bytes exhausted mid-message.
    NeedMore,
    /// Final zero chunk and trailers consumed.
    Complete,
    /// Framing violation.
    Error,
}

#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
    /// Payload bytes still owed by the current chunk.
    remaining: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            remaining: 0,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Consume as much of `input` as possible, appending decoded
    /// payload bytes to `out`.
    pub fn decode(&mut self, input: &mut RingBuffer, out: &mut Vec<u8>) -> ChunkProgress {
        loop {
            match self.state {
                ChunkState::Size => {
                    let line = match take_line(input, MAX_SIZE_LINE) {
                        LineResult::Line(line) => line,
                        LineResult::NeedMore => return ChunkProgress::NeedMore,
                        LineResult::TooLong => return self.fail(),
                    };
                    let size = match parse_chunk_size(&line) {
                        Some(size) => size,
                        None => return self.fail(),
                    };
                    if size == 0 {
                        self.state = ChunkState::Trailer;
                    } else {
                        self.remaining = size;
                        self.state = ChunkState::Data;
                    }
                }
                ChunkState::Data => {
                    if self.remaining > 0 {
                        let take = (self.remaining.min(input.readable() as u64)) as usize;
                        if take == 0 {
                            return ChunkProgress::NeedMore;
                        }
                        let start = out.len();
                        out.resize(start + take, 0);
                        input.read(&mut out[start..]);
                        self.remaining -= take as u64;
                        if self.remaining > 0 {
                            return ChunkProgress::NeedMore;
                        }
                    }
                    // Payload done; the chunk must close with CRLF.
                    if input.readable() < 2 {
                        return ChunkProgress::NeedMore;
                    }
                    let mut crlf = [0u8; 2];
                    input.peek(&mut crlf);
                    if &crlf != b"\r\n" {
                        return self.fail();
                    }
                    input.consume(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let line = match take_line(input, MAX_SIZE_LINE) {
                        LineResult::Line(line) => line,
                        LineResult::NeedMore => return ChunkProgress::NeedMore,
                        LineResult::TooLong => return self.fail(),
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Complete;
                        return ChunkProgress::Complete;
                    }
                    // Trailer headers are read and discarded.
                }
                ChunkState::Complete => return ChunkProgress::Complete,
                ChunkState::Error => return ChunkProgress::Error,
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = ChunkState::Size;
        self.remaining = 0;
    }

    fn fail(&mut self) -> ChunkProgress {
        self.state = ChunkState::Error;
        ChunkProgress::Error
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

enum LineResult {
    Line(Vec<u8>),
    NeedMore,
    TooLong,
}

/// Pop one CRLF-terminated line (without the CRLF) off the ring.
fn take_line(input: &mut RingBuffer, max_len: usize) -> LineResult {
    match input.find(b"\r\n") {
        Some(end) if end <= max_len => {
            let mut line = vec![0u8; end];
            input.read(&mut line);
            input.consume(2);
            LineResult::Line(line)
        }
        Some(_) => LineResult::TooLong,
        None if input.readable() > max_len => LineResult::TooLong,
        None => LineResult::NeedMore,
    }
}

/// Parse a hex chunk size, ignoring any `;extension` suffix.
fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let hex_end = line
        .iter()
        .position(|&b| !b.is_ascii_hexdigit())
        .unwrap_or(line.len());
    if hex_end == 0 {
        return None;
    }
    // After the hex digits only an extension (or padding space) may follow.
    match line.get(hex_end) {
        None | Some(b';') | Some(b' ') | Some(b'\t') => {}
        Some(_) => return None,
    }
    let hex = std::str::from_utf8(&line[..hex_end]).ok()?;
    u64::from_str_radix(hex, 16).ok()
}
