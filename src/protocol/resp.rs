//! Command encoding and reply decoding.
//!
//! Outbound commands are arrays of binary-safe bulk strings:
//! ```text
//! *<count>\r\n
//! $<byte length>\r\n<bytes>\r\n      (repeated <count> times)
//! ```
//!
//! Inbound replies are one of five types, selected by the first byte:
//!
//! | Tag | Type          | Body                                        |
//! |-----|---------------|---------------------------------------------|
//! | `+` | simple string | line                                        |
//! | `-` | error         | line                                        |
//! | `:` | integer       | signed decimal line                         |
//! | `$` | bulk string   | length line, bytes, CRLF (`-1` = null)      |
//! | `*` | array         | count line, `count` replies (`-1` = null)   |
//!
//! [`decode`] is stateless: it either returns one complete reply together with
//! the number of bytes it consumed, or `None` when the buffer ends inside a
//! reply. The caller keeps the tail and calls again once more bytes arrive,
//! so parsing can resume at any byte boundary.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{OrigamiError, Result};

/// Line terminator.
pub const CRLF: &[u8; 2] = b"\r\n";

/// Type tags.
pub mod tags {
    /// `+` simple string.
    pub const SIMPLE_STRING: u8 = b'+';
    /// `-` error.
    pub const ERROR: u8 = b'-';
    /// `:` integer.
    pub const INTEGER: u8 = b':';
    /// `$` bulk string.
    pub const BULK_STRING: u8 = b'$';
    /// `*` array.
    pub const ARRAY: u8 = b'*';
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK`
    Simple(String),
    /// `-ERR ...`
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$5\r\nhello`, `None` for the null bulk string.
    Bulk(Option<Bytes>),
    /// `*2\r\n...`, `None` for the null array.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Bulk string from UTF-8 text.
    pub fn bulk(text: &str) -> Self {
        Reply::Bulk(Some(Bytes::copy_from_slice(text.as_bytes())))
    }

    /// Raw bytes of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Simple(s) => Some(s.as_bytes()),
            Reply::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    /// Text of a simple or bulk string, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Elements of a non-null array.
    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    /// Whether this is an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// Encode a list of arguments as a command array.
///
/// Lengths are byte lengths of the encoded form, so multi-byte text is
/// framed correctly.
pub fn encode_command<S: AsRef<[u8]>>(args: &[S]) -> Bytes {
    let body: usize = args.iter().map(|a| a.as_ref().len() + 16).sum();
    let mut buf = BytesMut::with_capacity(16 + body);

    put_prefixed(&mut buf, tags::ARRAY, args.len());

    for arg in args {
        let arg = arg.as_ref();
        put_prefixed(&mut buf, tags::BULK_STRING, arg.len());
        buf.put_slice(arg);
        buf.put_slice(CRLF);
    }

    buf.freeze()
}

fn put_prefixed(buf: &mut BytesMut, tag: u8, n: usize) {
    buf.put_u8(tag);
    buf.put_slice(n.to_string().as_bytes());
    buf.put_slice(CRLF);
}

/// Decode one reply from the start of `buf`.
///
/// Returns `Ok(Some((reply, consumed)))` for a complete reply, `Ok(None)` if
/// more bytes are needed. Stray `\r`/`\n` bytes before the top-level type tag
/// are skipped and counted as consumed.
///
/// # Errors
///
/// Only on data that can never become valid: an unknown type tag, a
/// malformed length/integer line, a bulk string missing its terminator, or
/// arrays nested deeper than [`MAX_DEPTH`].
pub fn decode(buf: &[u8]) -> Result<Option<(Reply, usize)>> {
    let start = buf
        .iter()
        .position(|&b| b != b'\r' && b != b'\n')
        .unwrap_or(buf.len());

    parse_value(buf, start, 0)
}

/// Deepest array nesting accepted by [`decode`].
pub const MAX_DEPTH: usize = 64;

fn parse_value(buf: &[u8], cursor: usize, depth: usize) -> Result<Option<(Reply, usize)>> {
    let Some(&tag) = buf.get(cursor) else {
        return Ok(None);
    };
    let cursor = cursor + 1;

    match tag {
        tags::SIMPLE_STRING => Ok(read_line(buf, cursor)
            .map(|(line, next)| (Reply::Simple(String::from_utf8_lossy(line).into_owned()), next))),
        tags::ERROR => Ok(read_line(buf, cursor)
            .map(|(line, next)| (Reply::Error(String::from_utf8_lossy(line).into_owned()), next))),
        tags::INTEGER => match read_line(buf, cursor) {
            Some((line, next)) => Ok(Some((Reply::Integer(parse_integer(line)?), next))),
            None => Ok(None),
        },
        tags::BULK_STRING => parse_bulk(buf, cursor),
        tags::ARRAY => parse_array(buf, cursor, depth),
        other => Err(OrigamiError::Protocol(format!(
            "unknown reply type tag 0x{:02x}",
            other
        ))),
    }
}

/// Find the line starting at `cursor`; returns the line body and the index
/// just past its CRLF.
fn read_line(buf: &[u8], cursor: usize) -> Option<(&[u8], usize)> {
    let rest = buf.get(cursor..)?;
    let pos = rest.windows(2).position(|w| w == CRLF)?;
    Some((&rest[..pos], cursor + pos + 2))
}

fn parse_integer(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            OrigamiError::Protocol(format!(
                "invalid integer line {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn parse_bulk(buf: &[u8], cursor: usize) -> Result<Option<(Reply, usize)>> {
    let Some((line, next)) = read_line(buf, cursor) else {
        return Ok(None);
    };

    let len = parse_integer(line)?;
    if len < 0 {
        return Ok(Some((Reply::Bulk(None), next)));
    }

    let len = len as usize;
    let end = next + len;
    if buf.len() < end + CRLF.len() {
        return Ok(None);
    }

    if &buf[end..end + CRLF.len()] != CRLF {
        return Err(OrigamiError::Protocol(format!(
            "bulk string of {} bytes is not terminated by CRLF",
            len
        )));
    }

    let value = Bytes::copy_from_slice(&buf[next..end]);
    Ok(Some((Reply::Bulk(Some(value)), end + CRLF.len())))
}

fn parse_array(buf: &[u8], cursor: usize, depth: usize) -> Result<Option<(Reply, usize)>> {
    if depth >= MAX_DEPTH {
        return Err(OrigamiError::Protocol(format!(
            "reply nested deeper than {} levels",
            MAX_DEPTH
        )));
    }

    let Some((line, mut next)) = read_line(buf, cursor) else {
        return Ok(None);
    };

    let count = parse_integer(line)?;
    if count < 0 {
        return Ok(Some((Reply::Array(None), next)));
    }

    let mut items = Vec::with_capacity((count as usize).min(1024));

    for _ in 0..count {
        // An incomplete element discards everything built so far; the next
        // attempt starts again from the array's own tag.
        match parse_value(buf, next, depth + 1)? {
            Some((item, after)) => {
                items.push(item);
                next = after;
            }
            None => return Ok(None),
        }
    }

    Ok(Some((Reply::Array(Some(items)), next)))
}
