//! RDB snapshot encoding
//!
//! Only string values are supported. The trailing checksum is written as
//! eight zero bytes, which readers treat as "not checked".

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::Path;

use super::{Entry, Store};
use crate::error::{Error, Result};

const MAGIC: &[u8] = b"REDIS";
const VERSION: &[u8] = b"0011";

const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0x00;

const ENC_INT8: u8 = 0;
const ENC_INT16: u8 = 1;
const ENC_INT32: u8 = 2;
const ENC_LZF: u8 = 3;

/// Serialize the live contents of a store
pub fn encode(store: &Store) -> Bytes {
    let entries = store.entries();
    let expiring = entries.iter().filter(|(_, e)| e.expires_at.is_some()).count();

    let mut buf = BytesMut::with_capacity(64 + entries.len() * 16);
    buf.put_slice(MAGIC);
    buf.put_slice(VERSION);

    for (key, value) in [("redis-ver", "7.2.0"), ("redis-bits", "64")] {
        buf.put_u8(OP_AUX);
        put_string(&mut buf, key.as_bytes());
        put_string(&mut buf, value.as_bytes());
    }

    buf.put_u8(OP_SELECTDB);
    put_length(&mut buf, 0);
    buf.put_u8(OP_RESIZEDB);
    put_length(&mut buf, entries.len() as u64);
    put_length(&mut buf, expiring as u64);

    for (key, entry) in &entries {
        if let Some(at) = entry.expires_at {
            buf.put_u8(OP_EXPIRETIME_MS);
            buf.put_u64_le(at as u64);
        }
        buf.put_u8(TYPE_STRING);
        put_string(&mut buf, key);
        put_string(&mut buf, &entry.value);
    }

    buf.put_u8(OP_EOF);
    buf.put_u64_le(0);
    buf.freeze()
}

/// Parse a snapshot into a store, dropping expired keys
pub fn decode(data: &[u8]) -> Result<Store> {
    let mut reader = Reader { data };

    let header = reader.take(MAGIC.len() + VERSION.len())?;
    if &header[..MAGIC.len()] != MAGIC {
        return Err(Error::Snapshot("missing REDIS magic".into()));
    }

    let mut entries = Vec::new();
    let mut expires_at: Option<i64> = None;

    loop {
        let op = reader.u8()?;
        match op {
            OP_AUX => {
                reader.string()?;
                reader.string()?;
            }
            OP_SELECTDB => {
                reader.length()?;
            }
            OP_RESIZEDB => {
                reader.length()?;
                reader.length()?;
            }
            OP_EXPIRETIME_MS => {
                expires_at = Some(reader.u64_le()? as i64);
            }
            OP_EXPIRETIME => {
                expires_at = Some(reader.u32_le()? as i64 * 1000);
            }
            OP_EOF => break,
            TYPE_STRING => {
                let key = reader.string()?;
                let value = reader.string()?;
                entries.push((
                    key,
                    Entry {
                        value,
                        expires_at: expires_at.take(),
                    },
                ));
            }
            other => {
                return Err(Error::Snapshot(format!(
                    "unsupported value type 0x{:02x}",
                    other
                )));
            }
        }
    }

    Ok(Store::from_entries(entries))
}

/// Load a snapshot file; a missing file is an empty store
pub fn load_file(path: &Path) -> Result<Store> {
    match std::fs::read(path) {
        Ok(data) => decode(&data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Store::new()),
        Err(e) => Err(e.into()),
    }
}

fn put_length(buf: &mut BytesMut, len: u64) {
    if len < 1 << 6 {
        buf.put_u8(len as u8);
    } else if len < 1 << 14 {
        buf.put_u8(0x40 | (len >> 8) as u8);
        buf.put_u8(len as u8);
    } else if len <= u32::MAX as u64 {
        buf.put_u8(0x80);
        buf.put_u32(len as u32);
    } else {
        buf.put_u8(0x81);
        buf.put_u64(len);
    }
}

fn put_string(buf: &mut BytesMut, data: &[u8]) {
    put_length(buf, data.len() as u64);
    buf.put_slice(data);
}

enum Length {
    Len(u64),
    Encoded(u8),
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Error::Snapshot("unexpected end of snapshot".into()));
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32> {
        Ok(self.take(4)?.get_u32_le())
    }

    fn u64_le(&mut self) -> Result<u64> {
        Ok(self.take(8)?.get_u64_le())
    }

    fn raw_length(&mut self) -> Result<Length> {
        let first = self.u8()?;
        match first >> 6 {
            0b00 => Ok(Length::Len((first & 0x3F) as u64)),
            0b01 => {
                let next = self.u8()?;
                Ok(Length::Len((((first & 0x3F) as u64) << 8) | next as u64))
            }
            0b10 => match first {
                0x80 => Ok(Length::Len(self.take(4)?.get_u32() as u64)),
                0x81 => Ok(Length::Len(self.take(8)?.get_u64())),
                other => Err(Error::Snapshot(format!(
                    "invalid length prefix 0x{:02x}",
                    other
                ))),
            },
            _ => Ok(Length::Encoded(first & 0x3F)),
        }
    }

    fn length(&mut self) -> Result<u64> {
        match self.raw_length()? {
            Length::Len(len) => Ok(len),
            Length::Encoded(_) => Err(Error::Snapshot("expected a plain length".into())),
        }
    }

    fn string(&mut self) -> Result<Bytes> {
        match self.raw_length()? {
            Length::Len(len) => {
                let len = usize::try_from(len)
                    .map_err(|_| Error::Snapshot("string length overflows".into()))?;
                Ok(Bytes::copy_from_slice(self.take(len)?))
            }
            Length::Encoded(ENC_INT8) => Ok(Bytes::from((self.u8()? as i8).to_string())),
            Length::Encoded(ENC_INT16) => {
                Ok(Bytes::from(self.take(2)?.get_i16_le().to_string()))
            }
            Length::Encoded(ENC_INT32) => {
                Ok(Bytes::from(self.take(4)?.get_i32_le().to_string()))
            }
            Length::Encoded(ENC_LZF) => {
                Err(Error::Snapshot("LZF-compressed strings are not supported".into()))
            }
            Length::Encoded(other) => Err(Error::Snapshot(format!(
                "unknown string encoding {}",
                other
            ))),
        }
    }
}
