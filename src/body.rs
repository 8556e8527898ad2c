//! Incremental request body reading.
//!
//! A `BodyReader` pulls the body that follows a request head off the
//! connection one chunk at a time. For `Content-Length` bodies a chunk is
//! whatever a single read delivered; for chunked transfer coding it is one
//! decoded chunk. Bytes belonging to the next pipelined request stay in the
//! connection buffer.

use crate::protocol::{find_crlf, BodyFraming, ParseError, StatusCode};
use bytes::{Buf, Bytes, BytesMut};
use std::str;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest chunk-size or trailer line accepted
const MAX_LINE_LENGTH: usize = 4096;

/// Body reading errors
#[derive(Debug)]
pub enum BodyError {
    Io(std::io::Error),
    /// Peer closed the connection before the body was complete
    UnexpectedEof,
    /// Chunked framing violation
    Malformed(ParseError),
    /// Body is larger than the configured limit
    TooLarge { limit: usize },
}

impl BodyError {
    /// Status code of the response sent for this error
    pub fn status(&self) -> StatusCode {
        match self {
            BodyError::TooLarge { .. } => StatusCode::PayloadTooLarge,
            _ => StatusCode::BadRequest,
        }
    }
}

impl std::fmt::Display for BodyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyError::Io(e) => write!(f, "I/O error reading body: {}", e),
            BodyError::UnexpectedEof => write!(f, "Connection closed before body was complete"),
            BodyError::Malformed(e) => write!(f, "HTTP Parsing Error: {}", e),
            BodyError::TooLarge { limit } => {
                write!(f, "Request body exceeds limit of {} bytes", limit)
            }
        }
    }
}

impl std::error::Error for BodyError {}

impl From<std::io::Error> for BodyError {
    fn from(e: std::io::Error) -> Self {
        BodyError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { size: usize },
    Trailers,
    Done,
}

/// Reads one request body from a connection.
pub struct BodyReader<'a, S> {
    stream: &'a mut S,
    buffer: &'a mut BytesMut,
    state: State,
    limit: usize,
    received: usize,
}

impl<'a, S> BodyReader<'a, S>
where
    S: AsyncRead + Unpin,
{
    /// Bytes already in `buffer` are consumed before reading from `stream`.
    pub fn new(
        stream: &'a mut S,
        buffer: &'a mut BytesMut,
        framing: BodyFraming,
        limit: usize,
    ) -> Self {
        let state = match framing {
            BodyFraming::Empty => State::Done,
            BodyFraming::Length(remaining) => State::Length { remaining },
            BodyFraming::Chunked => State::ChunkSize,
        };

        BodyReader {
            stream,
            buffer,
            state,
            limit,
            received: 0,
        }
    }

    /// Next chunk of the body, or `None` once the body is complete.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        loop {
            match self.state {
                State::Done => return Ok(None),

                State::Length { remaining } => {
                    if self.received as u64 + remaining > self.limit as u64 {
                        return Err(BodyError::TooLarge { limit: self.limit });
                    }
                    if self.buffer.is_empty() {
                        self.fill().await?;
                    }

                    let n = remaining.min(self.buffer.len() as u64) as usize;
                    let chunk = self.buffer.split_to(n).freeze();
                    let remaining = remaining - n as u64;
                    self.received += n;
                    self.state = if remaining == 0 {
                        State::Done
                    } else {
                        State::Length { remaining }
                    };
                    return Ok(Some(chunk));
                }

                State::ChunkSize => match parse_chunk_size(&self.buffer[..])? {
                    Some((0, line_len)) => {
                        self.buffer.advance(line_len);
                        self.state = State::Trailers;
                    }
                    Some((size, line_len)) => {
                        if self.received.saturating_add(size) > self.limit {
                            return Err(BodyError::TooLarge { limit: self.limit });
                        }
                        self.buffer.advance(line_len);
                        self.state = State::ChunkData { size };
                    }
                    None => {
                        if self.buffer.len() > MAX_LINE_LENGTH {
                            return Err(BodyError::Malformed(ParseError::InvalidChunk(
                                "chunk size line too long".to_string(),
                            )));
                        }
                        self.fill().await?;
                    }
                },

                State::ChunkData { size } => {
                    // Wait for the whole chunk plus its trailing \r\n
                    if self.buffer.len() < size + 2 {
                        self.fill().await?;
                        continue;
                    }
                    if &self.buffer[size..size + 2] != b"\r\n" {
                        return Err(BodyError::Malformed(ParseError::InvalidChunk(
                            "missing CRLF after chunk data".to_string(),
                        )));
                    }

                    let chunk = self.buffer.split_to(size).freeze();
                    self.buffer.advance(2);
                    self.received += size;
                    self.state = State::ChunkSize;
                    return Ok(Some(chunk));
                }

                State::Trailers => match find_crlf(&self.buffer[..]) {
                    Some(0) => {
                        self.buffer.advance(2);
                        self.state = State::Done;
                    }
                    // Trailer fields are read and ignored
                    Some(pos) => self.buffer.advance(pos + 2),
                    None => {
                        if self.buffer.len() > MAX_LINE_LENGTH {
                            return Err(BodyError::Malformed(ParseError::InvalidChunk(
                                "trailer line too long".to_string(),
                            )));
                        }
                        self.fill().await?;
                    }
                },
            }
        }
    }

    /// Read and discard the rest of the body.
    pub async fn drain(&mut self) -> Result<usize, BodyError> {
        let mut discarded = 0;
        while let Some(chunk) = self.next_chunk().await? {
            discarded += chunk.len();
        }
        Ok(discarded)
    }

    async fn fill(&mut self) -> Result<(), BodyError> {
        let n = self.stream.read_buf(&mut *self.buffer).await?;
        if n == 0 {
            return Err(BodyError::UnexpectedEof);
        }
        Ok(())
    }
}

/// Parse a `<hex-size>[;ext]\r\n` line, returning the size and the line length.
fn parse_chunk_size(buffer: &[u8]) -> Result<Option<(usize, usize)>, BodyError> {
    let line_end = match find_crlf(buffer) {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let line = &buffer[..line_end];
    let size_part = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };

    let invalid = || {
        BodyError::Malformed(ParseError::InvalidChunk(format!(
            "invalid chunk size: {}",
            String::from_utf8_lossy(size_part)
        )))
    };

    let size_str = str::from_utf8(size_part).map_err(|_| invalid())?.trim();
    if size_str.is_empty() || size_str.len() > 16 || !size_str.bytes().all(|b| b.is_ascii_hexdigit())
    {
        return Err(invalid());
    }
    let size = usize::from_str_radix(size_str, 16).map_err(|_| invalid())?;

    Ok(Some((size, line_end + 2)))
}
