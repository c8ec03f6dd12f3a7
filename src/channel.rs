//! Buffered, framed byte I/O over a network channel.
//!
//! This module provides the low-level I/O primitive shared by every protocol built on
//! this crate: a fixed-capacity write buffer bound to a bidirectional byte channel,
//! with chunked-transfer framing for payloads whose length is not known up front and
//! line-oriented reads for CRLF-delimited preambles.
//!
//! # Overview
//!
//! Outgoing data is accumulated in an internal buffer and only written to the channel
//! when the buffer fills or on an explicit [`flush`](FramedBuffer::flush). Multi-byte
//! integers are written in network byte order and are never split across a flush
//! boundary: if the value does not fit in the remaining buffer space, the buffer is
//! flushed first and the value is appended as one contiguous unit.
//!
//! Incoming data is consumed through [`read_line`](FramedBuffer::read_line) and
//! [`read_chunk`](FramedBuffer::read_chunk). Bytes that arrive past the first CRLF in
//! a single network read stay buffered and are served to the next call, avoiding a
//! second round trip when several logical lines arrive together.
//!
//! # Chunk framing
//!
//! A chunk is encoded as:
//!
//! ```text
//! <length as ASCII hexadecimal> CRLF
//! <length bytes of payload> CRLF
//! ```
//!
//! A zero-length chunk terminates a stream. Emitting that terminal chunk is the
//! caller's responsibility; [`write_stream`](FramedBuffer::write_stream) deliberately
//! does not emit it.
//!
//! # Attachment
//!
//! A buffer must be attached to a channel before any operation that touches the wire.
//! Operations on a detached buffer fail with [`ChannelError::Unattached`]; writes that
//! stay within the buffer capacity succeed until a flush is required.

use std::io::{self, Read, Write};
use std::thread;

use log::{debug, trace};
use thiserror::Error;

/// Capacity of the outgoing buffer and ceiling for a single buffered line.
pub const MAX_BUFFER_SIZE: usize = 8 * 1024;
/// Block size used when framing a byte stream into chunks.
pub const CHUNK_SIZE: usize = 1024;
/// Line and chunk delimiter.
pub const CRLF: &[u8] = b"\r\n";
/// Consecutive `WouldBlock` results tolerated by a single flush before the
/// error is surfaced.
const MAX_FLUSH_STALLS: usize = 1024;

/// A bidirectional byte channel a [`FramedBuffer`] can attach to.
pub trait Channel: Read + Write {}

impl<T: Read + Write> Channel for T {}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("buffer is not attached to a channel")]
    Unattached,
    #[error("channel has been closed by the remote peer")]
    Closed,
    #[error("no line terminator within {0} buffered bytes")]
    LineTooLong(usize),
    #[error("malformed chunk length {0:?}")]
    BadChunkLength(String),
    #[error("truncated chunk: declared {declared} bytes, channel ended after {read}")]
    TruncatedChunk { declared: usize, read: usize },
    #[error("chunk content is not followed by CRLF")]
    BadChunkDelimiter,
    #[error("channel i/o error: {0}")]
    Io(#[from] io::Error),
}

/// A buffered reader/writer bound to an optional channel.
///
/// Write operations return `&mut Self` so framing sequences can be chained:
///
/// ```
/// use patchbay::channel::FramedBuffer;
/// use std::io::Cursor;
///
/// let mut buffer = FramedBuffer::with_channel(Cursor::new(Vec::new()));
/// buffer.write_str("HTTP/1.1 200 OK").unwrap().write_crlf().unwrap();
/// buffer.flush().unwrap();
/// ```
pub struct FramedBuffer<C> {
    channel: Option<C>,
    out: Vec<u8>,
    leftover: Vec<u8>,
}

impl<C: Channel> Default for FramedBuffer<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Channel> FramedBuffer<C> {
    /// Creates a detached buffer. A channel must be [attached](Self::attach)
    /// before any operation reaches the wire.
    pub fn new() -> Self {
        Self {
            channel: None,
            out: Vec::with_capacity(MAX_BUFFER_SIZE),
            leftover: Vec::new(),
        }
    }

    pub fn with_channel(channel: C) -> Self {
        let mut buffer = Self::new();
        buffer.attach(channel);
        buffer
    }

    /// Attaches a channel, returning the previously attached one, if any.
    pub fn attach(&mut self, channel: C) -> Option<C> {
        self.channel.replace(channel)
    }

    pub fn detach(&mut self) -> Option<C> {
        self.channel.take()
    }

    pub fn is_attached(&self) -> bool {
        self.channel.is_some()
    }

    /// Number of bytes currently buffered for writing.
    pub fn buffered(&self) -> usize {
        self.out.len()
    }

    /// Appends bytes to the buffer, flushing to the channel whenever the
    /// buffer fills up.
    pub fn write_bytes(&mut self, mut bytes: &[u8]) -> Result<&mut Self, ChannelError> {
        while !bytes.is_empty() {
            let room = MAX_BUFFER_SIZE - self.out.len();
            let n = room.min(bytes.len());
            self.out.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if self.out.len() == MAX_BUFFER_SIZE {
                self.flush()?;
            }
        }
        Ok(self)
    }

    /// Appends a `u32` in network byte order. The value is flushed ahead of
    /// time if it would otherwise straddle a flush boundary.
    pub fn write_u32(&mut self, value: u32) -> Result<&mut Self, ChannelError> {
        if MAX_BUFFER_SIZE - self.out.len() < size_of::<u32>() {
            self.flush()?;
        }
        self.out.extend_from_slice(&value.to_be_bytes());
        Ok(self)
    }

    /// Appends a `u64` in network byte order, never torn across a flush.
    pub fn write_u64(&mut self, value: u64) -> Result<&mut Self, ChannelError> {
        if MAX_BUFFER_SIZE - self.out.len() < size_of::<u64>() {
            self.flush()?;
        }
        self.out.extend_from_slice(&value.to_be_bytes());
        Ok(self)
    }

    pub fn write_str(&mut self, value: &str) -> Result<&mut Self, ChannelError> {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_crlf(&mut self) -> Result<&mut Self, ChannelError> {
        self.write_bytes(CRLF)
    }

    /// Writes the buffered region to the attached channel and clears it.
    ///
    /// The channel may be non-blocking: a region larger than the channel
    /// accepts at once is written in pieces, and a write that reports
    /// `WouldBlock` is retried a bounded number of times before the error
    /// is surfaced.
    pub fn flush(&mut self) -> Result<(), ChannelError> {
        let channel = self.channel.as_mut().ok_or(ChannelError::Unattached)?;
        if !self.out.is_empty() {
            trace!("flushing {} buffered bytes", self.out.len());
            write_fully(channel, &self.out)?;
            self.out.clear();
        }
        channel.flush()?;
        Ok(())
    }

    /// Frames the given bytes as one chunk. A zero-length chunk terminates
    /// a chunked stream.
    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<&mut Self, ChannelError> {
        let length = format!("{:x}", chunk.len());
        debug!("writing chunk of 0x{length} bytes");
        self.write_bytes(length.as_bytes())?
            .write_crlf()?
            .write_bytes(chunk)?
            .write_crlf()
    }

    /// Frames a string as a sequence of chunks of at most [`CHUNK_SIZE`]
    /// bytes each. The terminal empty chunk is not written.
    pub fn write_str_chunks(&mut self, value: &str) -> Result<&mut Self, ChannelError> {
        for block in value.as_bytes().chunks(CHUNK_SIZE) {
            self.write_chunk(block)?;
        }
        Ok(self)
    }

    /// Reads the given source in [`CHUNK_SIZE`] blocks and frames each block
    /// as one chunk. The terminal empty chunk is the caller's responsibility.
    pub fn write_stream<R: Read>(&mut self, source: &mut R) -> Result<&mut Self, ChannelError> {
        self.flush()?;
        let mut block = [0u8; CHUNK_SIZE];
        loop {
            let n = source.read(&mut block)?;
            if n == 0 {
                break;
            }
            self.write_chunk(&block[..n])?;
        }
        Ok(self)
    }

    /// Reads up to and including the first CRLF and returns the bytes before
    /// it. Bytes read past the CRLF remain buffered for the next read.
    pub fn read_line(&mut self) -> Result<Vec<u8>, ChannelError> {
        loop {
            if let Some(pos) = find_crlf(&self.leftover) {
                let mut line: Vec<u8> = self.leftover.drain(..pos + CRLF.len()).collect();
                line.truncate(pos);
                trace!(
                    "read line of {} bytes, {} bytes remain buffered",
                    line.len(),
                    self.leftover.len()
                );
                return Ok(line);
            }
            if self.leftover.len() >= MAX_BUFFER_SIZE {
                return Err(ChannelError::LineTooLong(self.leftover.len()));
            }
            self.fill()?;
        }
    }

    /// Reads one chunk: a hexadecimal length line followed by exactly that
    /// many content bytes and a trailing CRLF. Returns the content; an empty
    /// content marks the end of a chunked stream.
    pub fn read_chunk(&mut self) -> Result<Vec<u8>, ChannelError> {
        let line = self.read_line()?;
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        let declared = usize::from_str_radix(text, 16)
            .map_err(|_| ChannelError::BadChunkLength(text.to_string()))?;
        debug!("reading chunk of 0x{text} bytes");

        while self.leftover.len() < declared + CRLF.len() {
            match self.fill() {
                Ok(_) => {}
                Err(ChannelError::Closed) => {
                    return Err(ChannelError::TruncatedChunk {
                        declared,
                        read: self.leftover.len().min(declared),
                    });
                }
                Err(other) => return Err(other),
            }
        }

        let mut content: Vec<u8> = self.leftover.drain(..declared + CRLF.len()).collect();
        if &content[declared..] != CRLF {
            return Err(ChannelError::BadChunkDelimiter);
        }
        content.truncate(declared);
        Ok(content)
    }

    /// Reads more bytes from the channel into the leftover buffer.
    fn fill(&mut self) -> Result<usize, ChannelError> {
        let channel = self.channel.as_mut().ok_or(ChannelError::Unattached)?;
        let mut scratch = [0u8; 512];
        let n = channel.read(&mut scratch)?;
        if n == 0 {
            return Err(ChannelError::Closed);
        }
        trace!("buffered {n} inbound bytes");
        self.leftover.extend_from_slice(&scratch[..n]);
        Ok(n)
    }
}

fn find_crlf(bytes: &[u8]) -> Option<usize> {
    bytes.windows(CRLF.len()).position(|window| window == CRLF)
}

fn write_fully<C: Channel>(channel: &mut C, mut bytes: &[u8]) -> Result<(), ChannelError> {
    let mut stalls = 0;
    while !bytes.is_empty() {
        match channel.write(bytes) {
            Ok(0) => return Err(ChannelError::Closed),
            Ok(n) => {
                bytes = &bytes[n..];
                stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                stalls += 1;
                if stalls > MAX_FLUSH_STALLS {
                    return Err(e.into());
                }
                thread::yield_now();
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Splits a header-like `name:value` line, trimming surrounding whitespace
/// from both parts. Returns `None` when the line carries no colon.
pub fn split_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    Some((name.trim(), value.trim()))
}
