//! Wire Protocol
//!
//! RESP value model plus the incremental parser and `tokio_util` codec
//! used by server connections, the leader link and the client.

mod codec;

pub use codec::{parse_snapshot, parse_value, RespCodec, MAX_BULK_LEN};

use bytes::{BufMut, Bytes, BytesMut};

/// A single protocol value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`
    SimpleString(String),
    /// `-ERR message`
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$3\r\nfoo`
    BulkString(Bytes),
    /// `$-1`
    NullBulk,
    /// `*2\r\n...`
    Array(Vec<RespValue>),
    /// `*-1`
    NullArray,
    /// Full-resync payload: `$<len>\r\n<bytes>` with no trailing CRLF
    Snapshot(Bytes),
}

impl RespValue {
    /// Build a command array of bulk strings
    pub fn command<S: AsRef<[u8]>>(parts: &[S]) -> Self {
        RespValue::Array(
            parts
                .iter()
                .map(|p| RespValue::BulkString(Bytes::copy_from_slice(p.as_ref())))
                .collect(),
        )
    }

    /// `+OK`
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Simple string reply
    pub fn simple(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Error reply
    pub fn error(message: impl Into<String>) -> Self {
        RespValue::Error(message.into())
    }

    /// Bulk string reply from anything byte-like
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Encode onto a buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                dst.put_u8(b'-');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                dst.put_u8(b':');
                dst.put_slice(n.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::BulkString(data) => {
                dst.put_u8(b'$');
                dst.put_slice(data.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
                dst.put_slice(b"\r\n");
            }
            RespValue::NullBulk => dst.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                dst.put_u8(b'*');
                dst.put_slice(items.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                for item in items {
                    item.encode(dst);
                }
            }
            RespValue::NullArray => dst.put_slice(b"*-1\r\n"),
            RespValue::Snapshot(data) => {
                dst.put_u8(b'$');
                dst.put_slice(data.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(data);
            }
        }
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Text of a simple string, error or UTF-8 bulk string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::SimpleString(s) | RespValue::Error(s) => Some(s),
            RespValue::BulkString(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Raw bytes of a bulk string or simple string
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(b) | RespValue::Snapshot(b) => Some(b),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Integer value, if any
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Short type label for logs and error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            RespValue::SimpleString(_) => "simple-string",
            RespValue::Error(_) => "error",
            RespValue::Integer(_) => "integer",
            RespValue::BulkString(_) => "bulk-string",
            RespValue::NullBulk => "null-bulk",
            RespValue::Array(_) => "array",
            RespValue::NullArray => "null-array",
            RespValue::Snapshot(_) => "snapshot",
        }
    }
}

impl std::fmt::Display for RespValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            RespValue::NullBulk | RespValue::NullArray => write!(f, "(nil)"),
            RespValue::Array(items) if items.is_empty() => write!(f, "(empty array)"),
            RespValue::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", i + 1, item)?;
                }
                Ok(())
            }
            RespValue::Snapshot(b) => write!(f, "(snapshot {} bytes)", b.len()),
        }
    }
}
