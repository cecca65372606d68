//! RESP2 request parsing and reply encoding.
//!
//! Requests arrive either as multibulk frames (`*2\r\n$4\r\nLLEN\r\n$1\r\nq\r\n`)
//! or as inline commands (`LLEN q\r\n`). Parsing is incremental: a partial
//! frame leaves the buffer untouched until more bytes arrive.

use bytes::{Buf, BufMut, BytesMut};

/// Largest accepted bulk argument.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
/// Largest accepted argument count in one multibulk frame.
const MAX_ARGS: i64 = 1024 * 1024;
/// Largest inline command line.
const MAX_INLINE_LEN: usize = 64 * 1024;

/// Malformed request bytes. The connection cannot be resynchronized.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid multibulk length")]
    InvalidMultibulkLength,

    #[error("invalid bulk length")]
    InvalidBulkLength,

    #[error("expected '$', got byte {0:#04x}")]
    ExpectedBulk(u8),

    #[error("bulk argument not terminated by CRLF")]
    MissingTerminator,

    #[error("too big inline request")]
    InlineTooLong,
}

/// Parse the next request from `buf`, consuming its bytes.
///
/// Returns `Ok(None)` when `buf` holds only part of a frame. Empty inline
/// lines and zero-length multibulk frames are skipped.
pub fn parse_request(buf: &mut BytesMut) -> Result<Option<Vec<Vec<u8>>>, ProtocolError> {
    loop {
        if buf.is_empty() {
            return Ok(None);
        }
        let parsed = if buf[0] == b'*' {
            parse_multibulk(buf)?
        } else {
            parse_inline(buf)?
        };
        let Some((consumed, args)) = parsed else {
            return Ok(None);
        };
        buf.advance(consumed);
        if !args.is_empty() {
            return Ok(Some(args));
        }
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_len(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn parse_multibulk(buf: &[u8]) -> Result<Option<(usize, Vec<Vec<u8>>)>, ProtocolError> {
    let Some(end) = find_crlf(buf, 0) else {
        return Ok(None);
    };
    let count = parse_len(&buf[1..end]).ok_or(ProtocolError::InvalidMultibulkLength)?;
    if count > MAX_ARGS {
        return Err(ProtocolError::InvalidMultibulkLength);
    }

    let mut pos = end + 2;
    let mut args = Vec::new();
    for _ in 0..count.max(0) {
        let Some(&marker) = buf.get(pos) else {
            return Ok(None);
        };
        if marker != b'$' {
            return Err(ProtocolError::ExpectedBulk(marker));
        }
        let Some(end) = find_crlf(buf, pos) else {
            return Ok(None);
        };
        let len = parse_len(&buf[pos + 1..end])
            .filter(|len| (0..=MAX_BULK_LEN).contains(len))
            .ok_or(ProtocolError::InvalidBulkLength)?;

        let start = end + 2;
        let stop = start + usize::try_from(len).map_err(|_| ProtocolError::InvalidBulkLength)?;
        if buf.len() < stop + 2 {
            return Ok(None);
        }
        if &buf[stop..stop + 2] != b"\r\n" {
            return Err(ProtocolError::MissingTerminator);
        }
        args.push(buf[start..stop].to_vec());
        pos = stop + 2;
    }
    Ok(Some((pos, args)))
}

fn parse_inline(buf: &[u8]) -> Result<Option<(usize, Vec<Vec<u8>>)>, ProtocolError> {
    let Some(newline) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > MAX_INLINE_LEN {
            return Err(ProtocolError::InlineTooLong);
        }
        return Ok(None);
    };
    let line = buf[..newline].strip_suffix(b"\r").unwrap_or(&buf[..newline]);
    let args = line
        .split(u8::is_ascii_whitespace)
        .filter(|word| !word.is_empty())
        .map(<[u8]>::to_vec)
        .collect();
    Ok(Some((newline + 1, args)))
}

/// A reply to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Simple(&'static str),
    Error(String),
    Integer(i64),
    Array(Vec<Vec<u8>>),
}

impl Reply {
    /// Error reply with the conventional `ERR` prefix.
    pub fn err(message: impl std::fmt::Display) -> Self {
        Self::Error(format!("ERR {message}"))
    }

    pub fn integer(n: usize) -> Self {
        Self::Integer(i64::try_from(n).unwrap_or(i64::MAX))
    }

    /// Append the wire form of this reply to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Self::Simple(s) => {
                out.put_u8(b'+');
                out.put_slice(s.as_bytes());
            },
            Self::Error(message) => {
                out.put_u8(b'-');
                // Error lines cannot carry line breaks.
                for b in message.bytes() {
                    out.put_u8(if b == b'\r' || b == b'\n' { b' ' } else { b });
                }
            },
            Self::Integer(n) => {
                out.put_u8(b':');
                out.put_slice(n.to_string().as_bytes());
            },
            Self::Array(items) => {
                out.put_u8(b'*');
                out.put_slice(items.len().to_string().as_bytes());
                for item in items {
                    out.put_slice(b"\r\n$");
                    out.put_slice(item.len().to_string().as_bytes());
                    out.put_slice(b"\r\n");
                    out.put_slice(item);
                }
            },
        }
        out.put_slice(b"\r\n");
    }
}
