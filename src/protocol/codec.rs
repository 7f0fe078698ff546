//! Incremental RESP parsing
//!
//! The parsers work on a borrowed buffer and report how many bytes a
//! complete value used, so callers can track replication offsets exactly.
//! `Ok(None)` means the buffer holds only part of a value.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::RespValue;
use crate::error::{Error, Result};

/// Largest bulk string or snapshot accepted (512 MiB)
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Deepest array nesting accepted
const MAX_DEPTH: usize = 32;

/// Parse one value from the front of `buf`
pub fn parse_value(buf: &[u8]) -> Result<Option<(RespValue, usize)>> {
    parse_at(buf, 0, 0)
}

/// Parse a snapshot payload (`$<len>\r\n<bytes>`, no trailing CRLF)
pub fn parse_snapshot(buf: &[u8]) -> Result<Option<(Bytes, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf[0] != b'$' {
        return Err(Error::Protocol(format!(
            "expected snapshot payload, got type byte {:?}",
            buf[0] as char
        )));
    }

    let Some((line, header_len)) = read_line(buf, 1)? else {
        return Ok(None);
    };
    let len = parse_len(line)?;
    if len < 0 {
        return Err(Error::Protocol("snapshot length cannot be negative".into()));
    }
    let len = len as usize;
    if len > MAX_BULK_LEN {
        return Err(Error::Protocol(format!("snapshot of {} bytes is too large", len)));
    }

    let end = header_len + len;
    if buf.len() < end {
        return Ok(None);
    }
    Ok(Some((Bytes::copy_from_slice(&buf[header_len..end]), end)))
}

fn parse_at(buf: &[u8], pos: usize, depth: usize) -> Result<Option<(RespValue, usize)>> {
    if pos >= buf.len() {
        return Ok(None);
    }
    if depth > MAX_DEPTH {
        return Err(Error::Protocol("array nesting too deep".into()));
    }

    match buf[pos] {
        b'+' => {
            let Some((line, next)) = read_line(buf, pos + 1)? else {
                return Ok(None);
            };
            Ok(Some((RespValue::SimpleString(utf8(line)?), next)))
        }
        b'-' => {
            let Some((line, next)) = read_line(buf, pos + 1)? else {
                return Ok(None);
            };
            Ok(Some((RespValue::Error(utf8(line)?), next)))
        }
        b':' => {
            let Some((line, next)) = read_line(buf, pos + 1)? else {
                return Ok(None);
            };
            Ok(Some((RespValue::Integer(parse_len(line)?), next)))
        }
        b'$' => {
            let Some((line, next)) = read_line(buf, pos + 1)? else {
                return Ok(None);
            };
            let len = parse_len(line)?;
            if len == -1 {
                return Ok(Some((RespValue::NullBulk, next)));
            }
            if len < 0 || len as usize > MAX_BULK_LEN {
                return Err(Error::Protocol(format!("invalid bulk length {}", len)));
            }
            let end = next + len as usize;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(Error::Protocol("bulk string missing CRLF terminator".into()));
            }
            let data = Bytes::copy_from_slice(&buf[next..end]);
            Ok(Some((RespValue::BulkString(data), end + 2)))
        }
        b'*' => {
            let Some((line, mut next)) = read_line(buf, pos + 1)? else {
                return Ok(None);
            };
            let count = parse_len(line)?;
            if count == -1 {
                return Ok(Some((RespValue::NullArray, next)));
            }
            if count < 0 {
                return Err(Error::Protocol(format!("invalid array length {}", count)));
            }
            let mut items = Vec::with_capacity((count as usize).min(1024));
            for _ in 0..count {
                match parse_at(buf, next, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        next = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), next)))
        }
        _ => parse_inline(buf, pos),
    }
}

/// Inline commands: a bare line split on whitespace
fn parse_inline(buf: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>> {
    let Some(newline) = buf[pos..].iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let end = pos + newline;
    let line = &buf[pos..end];
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let parts: Vec<RespValue> = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| RespValue::BulkString(Bytes::copy_from_slice(part)))
        .collect();

    Ok(Some((RespValue::Array(parts), end + 1)))
}

/// Returns the line body starting at `start` and the index after its CRLF
fn read_line(buf: &[u8], start: usize) -> Result<Option<(&[u8], usize)>> {
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' {
            if buf[i + 1] != b'\n' {
                return Err(Error::Protocol("CR not followed by LF".into()));
            }
            return Ok(Some((&buf[start..i], i + 2)));
        }
        i += 1;
    }
    Ok(None)
}

fn parse_len(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid integer '{}'",
                String::from_utf8_lossy(line)
            ))
        })
}

fn utf8(line: &[u8]) -> Result<String> {
    String::from_utf8(line.to_vec())
        .map_err(|_| Error::Protocol("simple string is not valid UTF-8".into()))
}

/// `tokio_util` codec over [`RespValue`]
///
/// After [`RespCodec::expect_snapshot`] the next frame is decoded as a
/// snapshot payload instead of a regular value.
#[derive(Debug, Default)]
pub struct RespCodec {
    snapshot_next: bool,
}

impl RespCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next frame as a snapshot payload
    pub fn expect_snapshot(&mut self) {
        self.snapshot_next = true;
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>> {
        if self.snapshot_next {
            return match parse_snapshot(src)? {
                Some((data, used)) => {
                    src.advance(used);
                    self.snapshot_next = false;
                    Ok(Some(RespValue::Snapshot(data)))
                }
                None => Ok(None),
            };
        }

        match parse_value(src)? {
            Some((value, used)) => {
                src.advance(used);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = Error;

    fn encode(&mut self, item: RespValue, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_array_reports_length() {
        let wire = b"*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n+extra";
        let (value, used) = parse_value(wire).unwrap().unwrap();
        assert_eq!(value, RespValue::command(&["ECHO", "hi"]));
        assert_eq!(used, wire.len() - "+extra".len());
    }

    #[test]
    fn test_partial_input_is_none() {
        let wire = b"*2\r\n$4\r\nECHO\r\n$2\r\nh";
        for cut in 0..wire.len() {
            assert!(parse_value(&wire[..cut]).unwrap().is_none(), "cut at {}", cut);
        }
    }

    #[test]
    fn test_inline_command() {
        let (value, used) = parse_value(b"PING  hello\r\n").unwrap().unwrap();
        assert_eq!(value, RespValue::command(&["PING", "hello"]));
        assert_eq!(used, 13);
    }

    #[test]
    fn test_malformed_length() {
        assert!(parse_value(b"$abc\r\n").is_err());
        assert!(parse_value(b"*-5\r\n").is_err());
        assert!(parse_value(b"$3\r\nfooXY").is_err());
    }

    #[test]
    fn test_null_values() {
        assert_eq!(parse_value(b"$-1\r\n").unwrap(), Some((RespValue::NullBulk, 5)));
        assert_eq!(parse_value(b"*-1\r\n").unwrap(), Some((RespValue::NullArray, 5)));
    }

    #[test]
    fn test_snapshot_then_command() {
        let mut wire = BytesMut::from(&b"$5\r\nREDIS*1\r\n$4\r\nPING\r\n"[..]);
        let mut codec = RespCodec::new();
        codec.expect_snapshot();

        let snap = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(snap, RespValue::Snapshot(Bytes::from_static(b"REDIS")));

        let next = codec.decode(&mut wire).unwrap().unwrap();
        assert_eq!(next, RespValue::command(&["PING"]));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_snapshot_rejects_other_types() {
        assert!(parse_snapshot(b"+OK\r\n").is_err());
        assert!(parse_snapshot(b"$10\r\nshort").unwrap().is_none());
    }
}
