//! Line-based `topic,payload` wire format used on the TCP side.
//!
//! One record per line, ASCII, terminated by CR or LF. The topic is
//! everything before the first comma and must be non-empty; the payload is
//! the remainder of the line, commas included (the topic itself therefore
//! must not contain a comma). Both directions enforce the same maximum
//! line length, terminator included.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::net::TcpStream;

pub const CR: u8 = 0x0d;
pub const LF: u8 = 0x0a;

/// A decoded `topic,payload` record. Transient: it exists only for the
/// duration of one decode-then-publish step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The line contains no comma, so no topic can be extracted.
    #[error("no topic delimiter in line")]
    MissingDelimiter,

    /// The line starts with the comma, leaving an empty topic.
    #[error("empty topic in line")]
    EmptyTopic,

    /// The encoded line would exceed the wire limit. Over-long lines are
    /// rejected, never truncated.
    #[error("encoded line is {got} bytes, limit is {limit}")]
    TooLong { got: usize, limit: usize },
}

/// Result of one bounded, non-blocking line read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A terminator was seen. The line may be empty (bare CR or LF, or the
    /// LF half of a CRLF pair).
    Line(Vec<u8>),
    /// No complete line is buffered on the socket yet. Any partial input
    /// consumed so far stays in the caller's buffer and the read resumes
    /// there on a later call; the connection stays open.
    NotReady,
    /// EOF or an I/O error.
    Disconnected,
    /// `max_len` bytes accumulated without a terminator.
    TooLong,
}

/// Split a raw line at the first comma into topic and payload.
pub fn decode_line(raw: &[u8]) -> Result<Record, CodecError> {
    let comma = raw
        .iter()
        .position(|&b| b == b',')
        .ok_or(CodecError::MissingDelimiter)?;
    if comma == 0 {
        return Err(CodecError::EmptyTopic);
    }
    Ok(Record {
        topic: String::from_utf8_lossy(&raw[..comma]).into_owned(),
        payload: String::from_utf8_lossy(&raw[comma + 1..]).into_owned(),
    })
}

/// Encode a record as `topic,payload` followed by CRLF.
///
/// The total length including the terminator must fit within `max_len`,
/// the same bound `read_line` enforces on the inbound side.
pub fn encode_line(topic: &str, payload: &str, max_len: usize) -> Result<Bytes, CodecError> {
    let total = topic.len() + 1 + payload.len() + 2;
    if total > max_len {
        return Err(CodecError::TooLong {
            got: total,
            limit: max_len,
        });
    }
    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(topic.as_bytes());
    buf.put_u8(b',');
    buf.put_slice(payload.as_bytes());
    buf.put_u8(CR);
    buf.put_u8(LF);
    Ok(buf.freeze())
}

/// Read one line from `stream` without blocking.
///
/// Bytes are consumed one at a time until a CR or LF is seen. A record
/// split across TCP segments is ordinary, so on would-block the bytes
/// read so far stay in `buf` and the line is resumed on a later call once
/// readiness fires again; only EOF and real I/O errors disconnect. A
/// sender that accumulates `max_len` bytes without ever terminating the
/// line gets [`ReadOutcome::TooLong`] so it cannot stall the event loop.
pub fn read_line(stream: &TcpStream, buf: &mut Vec<u8>, max_len: usize) -> ReadOutcome {
    let mut byte = [0u8; 1];
    while buf.len() < max_len {
        match stream.try_read(&mut byte) {
            Ok(0) => return ReadOutcome::Disconnected,
            Ok(_) => {
                if byte[0] == CR || byte[0] == LF {
                    return ReadOutcome::Line(std::mem::take(buf));
                }
                buf.push(byte[0]);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return ReadOutcome::NotReady;
            }
            Err(_) => return ReadOutcome::Disconnected,
        }
    }
    buf.clear();
    ReadOutcome::TooLong
}
