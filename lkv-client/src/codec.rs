//! # Length-Prefixed Block Codec
//!
//! Purpose: Encode commands and reassemble responses for the block protocol,
//! tolerating arbitrary chunking of the TCP byte stream.
//!
//! ## Wire Format
//!
//! ```text
//! command:  3\nget\n5\nalpha\n\n
//!           |  |    |  |      '- bare newline ends the message
//!           |  |    |  '- block bytes, then '\n'
//!           |  |    '- decimal length of the next block
//!           '- decimal length of the first block
//!
//! response: 2\nok\n5\nvalue\n\n
//!           '- first block is the status: "ok", "not_found", or an error status
//! ```
//!
//! ## Design Principles
//! 1. **Incremental Parsing**: A block is consumed only when its length line,
//!    payload and delimiter are all buffered; otherwise the decoder waits.
//! 2. **Buffer Reuse**: The read buffer and encode buffer live on the codec.
//! 3. **Zero-Copy Frames**: Decoded blocks are `Bytes` views split off the
//!    read buffer.
//! 4. **Fail Fast**: A length line with a non-digit byte is rejected as soon
//!    as the byte arrives.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use lkv_common::{LkvError, LkvResult, Value};

/// Canonical success status.
pub const STATUS_OK: &[u8] = b"ok";

/// Canonical empty-result status; a normal outcome, not an error.
pub const STATUS_NOT_FOUND: &[u8] = b"not_found";

/// Bytes requested from the socket per read call.
const READ_CHUNK: usize = 8 * 1024;

/// Longest accepted length line, in digits (enough for `u64::MAX`).
const MAX_LENGTH_DIGITS: usize = 20;

/// Socket operations the codec needs: byte I/O plus per-call deadlines.
pub trait Socket: Read + Write {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

/// One decoded response: the status block followed by data blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    frames: Vec<Bytes>,
}

impl Reply {
    pub fn new(frames: Vec<Bytes>) -> Self {
        Reply { frames }
    }

    /// First block, if any.
    pub fn status(&self) -> Option<&[u8]> {
        self.frames.first().map(|frame| frame.as_ref())
    }

    pub fn is_ok(&self) -> bool {
        self.status() == Some(STATUS_OK)
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(STATUS_NOT_FOUND)
    }

    /// Blocks after the status.
    pub fn values(&self) -> &[Bytes] {
        self.frames.get(1..).unwrap_or(&[])
    }

    /// Every block, status included.
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Data block `index` (0 is the first block after the status) as lossy UTF-8.
    pub fn string(&self, index: usize) -> Option<String> {
        self.values()
            .get(index)
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
    }

    /// Data block `index` parsed as a signed decimal integer.
    pub fn int(&self, index: usize) -> LkvResult<i64> {
        let frame = self
            .values()
            .get(index)
            .ok_or_else(|| LkvError::Protocol(format!("reply has no block {index}")))?;
        std::str::from_utf8(frame)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| LkvError::Protocol(format!("block {index} is not an integer")))
    }

    /// All blocks, status included, as lossy UTF-8 strings.
    pub fn into_strings(self) -> Vec<String> {
        self.frames
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).into_owned())
            .collect()
    }

    /// Accepts `ok` and `not_found`; any other status becomes `LkvError::Server`.
    pub fn check(self) -> LkvResult<Reply> {
        match self.status() {
            None => Err(LkvError::Protocol("empty response".to_string())),
            Some(STATUS_OK) | Some(STATUS_NOT_FOUND) => Ok(self),
            Some(other) => {
                let status = String::from_utf8_lossy(other).into_owned();
                let detail = self.into_strings().into_iter().skip(1).collect();
                Err(LkvError::Server { status, detail })
            }
        }
    }
}

/// Appends one command to `out`: `<len>\n<bytes>\n` per argument, then `\n`.
///
/// Nothing is appended when an argument fails to encode.
pub fn encode_command(args: &[Value], json_fallback: bool, out: &mut Vec<u8>) -> LkvResult<()> {
    let start = out.len();
    for arg in args {
        let bytes = match arg.to_bytes(json_fallback) {
            Ok(bytes) => bytes,
            Err(err) => {
                out.truncate(start);
                return Err(err);
            }
        };
        encode_block(&bytes, out);
    }
    out.push(b'\n');
    Ok(())
}

fn encode_block(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(data);
    out.push(b'\n');
}

/// Incremental response decoder.
///
/// Completed blocks are split off the buffer as they arrive; a partial block
/// stays in the buffer untouched until more bytes are appended.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    frames: Vec<Bytes>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Consumes complete blocks from `buf`.
    ///
    /// Returns `Ok(Some(reply))` once the terminating empty line is consumed,
    /// `Ok(None)` when more input is needed.
    pub fn decode(&mut self, buf: &mut BytesMut) -> LkvResult<Option<Reply>> {
        loop {
            let newline = match buf.iter().position(|&b| b == b'\n') {
                Some(idx) => idx,
                None => {
                    check_partial_length(&buf[..])?;
                    return Ok(None);
                }
            };

            let line = trim_cr(&buf[..newline]);
            if line.is_empty() {
                buf.advance(newline + 1);
                return Ok(Some(Reply::new(std::mem::take(&mut self.frames))));
            }

            let len = parse_length(line)?;
            let header = newline + 1;
            let body_end = header
                .checked_add(len)
                .ok_or_else(|| LkvError::Protocol("block length overflow".to_string()))?;
            let delimiter = match delimiter_len(&buf[..], body_end)? {
                Some(delimiter) => delimiter,
                None => return Ok(None),
            };

            buf.advance(header);
            let frame = buf.split_to(len).freeze();
            buf.advance(delimiter);
            self.frames.push(frame);
        }
    }

    /// Drops blocks of a half-received response.
    pub fn reset(&mut self) {
        self.frames.clear();
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

fn parse_length(line: &[u8]) -> LkvResult<usize> {
    if line.len() > MAX_LENGTH_DIGITS {
        return Err(LkvError::Protocol("length prefix too long".to_string()));
    }
    let mut value: usize = 0;
    for &b in line {
        if !b.is_ascii_digit() {
            return Err(LkvError::Protocol(format!(
                "invalid length prefix {:?}",
                String::from_utf8_lossy(line)
            )));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as usize))
            .ok_or_else(|| LkvError::Protocol("block length overflow".to_string()))?;
    }
    Ok(value)
}

/// Rejects an unterminated length line that can no longer become valid.
fn check_partial_length(buf: &[u8]) -> LkvResult<()> {
    let digits = match buf.split_last() {
        Some((b'\r', rest)) => rest,
        _ => buf,
    };
    if digits.len() > MAX_LENGTH_DIGITS || !digits.iter().all(u8::is_ascii_digit) {
        return Err(LkvError::Protocol(format!(
            "invalid length prefix {:?}",
            String::from_utf8_lossy(buf)
        )));
    }
    Ok(())
}

/// Length of the delimiter after a block ending at `body_end`, or `None` when
/// it has not fully arrived.
fn delimiter_len(buf: &[u8], body_end: usize) -> LkvResult<Option<usize>> {
    match buf.get(body_end) {
        None => Ok(None),
        Some(b'\n') => Ok(Some(1)),
        Some(b'\r') => match buf.get(body_end + 1) {
            None => Ok(None),
            Some(b'\n') => Ok(Some(2)),
            Some(_) => Err(LkvError::Protocol("block not followed by newline".to_string())),
        },
        Some(_) => Err(LkvError::Protocol("block not followed by newline".to_string())),
    }
}

/// Per-connection codec state: reusable buffers plus the decoder.
#[derive(Debug)]
pub struct Codec {
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    decoder: FrameDecoder,
    json_fallback: bool,
}

impl Codec {
    pub fn new(json_fallback: bool) -> Self {
        Codec {
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: Vec::with_capacity(256),
            decoder: FrameDecoder::new(),
            json_fallback,
        }
    }

    /// Encodes `args` and writes them within `timeout` (zero disables the deadline).
    ///
    /// Encoding happens before any byte is written, so an `Encode` error
    /// leaves the stream untouched. The deadline covers the whole command,
    /// however many partial writes it takes.
    pub fn send<S: Socket>(&mut self, stream: &mut S, args: &[Value], timeout: Duration) -> LkvResult<()> {
        self.write_buf.clear();
        encode_command(args, self.json_fallback, &mut self.write_buf)?;

        let deadline = deadline_after(timeout);
        let mut written = 0;
        while written < self.write_buf.len() {
            stream.set_write_timeout(remaining(deadline)?)?;
            match stream.write(&self.write_buf[written..]) {
                Ok(0) => return Err(LkvError::Closed),
                Ok(count) => written += count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        stream.flush()?;
        Ok(())
    }

    /// Reads until one full response is decoded or `timeout` elapses
    /// (zero disables the deadline).
    pub fn receive<S: Socket>(&mut self, stream: &mut S, timeout: Duration) -> LkvResult<Reply> {
        let deadline = deadline_after(timeout);
        // Stack buffer keeps the read loop allocation-free.
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(reply) = self.decoder.decode(&mut self.read_buf)? {
                return Ok(reply);
            }

            stream.set_read_timeout(remaining(deadline)?)?;
            let read = match stream.read(&mut chunk) {
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if read == 0 {
                return Err(LkvError::Closed);
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Discards buffered input and any half-decoded response.
    pub fn reset(&mut self) {
        self.read_buf.clear();
        self.write_buf.clear();
        self.decoder.reset();
    }
}

/// Absolute deadline for `timeout`; `None` when zero disables it.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        return None;
    }
    Instant::now().checked_add(timeout)
}

/// Time left before `deadline`, as a socket timeout.
fn remaining(deadline: Option<Instant>) -> LkvResult<Option<Duration>> {
    match deadline {
        Some(deadline) => {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(LkvError::Timeout);
            }
            Ok(Some(left))
        }
        None => Ok(None),
    }
}
