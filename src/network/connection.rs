//! Connection
//!
//! One accepted or outbound socket. Reads are buffered and offset-aware:
//! every value handed out carries the number of stream bytes consumed
//! before it, which is what a follower reports back in REPLCONF ACK.

use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::{parse_snapshot, parse_value, RespValue};

/// Process-unique connection identity, increasing in accept order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write half shared between the command loop and helper tasks
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<BufWriter<OwnedWriteHalf>>>,
}

impl SharedWriter {
    fn new(half: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufWriter::new(half))),
        }
    }

    /// Write and flush one buffer
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write and flush a buffer produced while the writer is held
    ///
    /// Lets a caller sample state and emit it without another writer
    /// interleaving between the two.
    pub async fn write_with<F>(&self, produce: F) -> Result<()>
    where
        F: FnOnce() -> Bytes,
    {
        let mut writer = self.inner.lock().await;
        let data = produce();
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut down the write direction
    pub async fn close(&self) {
        let mut writer = self.inner.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// A buffered, offset-tracking connection
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    reader: OwnedReadHalf,
    writer: SharedWriter,
    buffer: BytesMut,
    consumed: u64,
    closed: bool,
}

impl Connection {
    /// Wrap a connected socket
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            id: ConnectionId::next(),
            peer,
            reader,
            writer: SharedWriter::new(writer),
            buffer: BytesMut::with_capacity(4096),
            consumed: 0,
            closed: false,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn writer(&self) -> SharedWriter {
        self.writer.clone()
    }

    /// Stream bytes handed out as values so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Restart offset accounting at `base` (after a full resync)
    pub fn set_offset(&mut self, base: u64) {
        self.consumed = base;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Pull whatever the socket has ready without waiting
    ///
    /// Returns the number of bytes read. End of stream marks the
    /// connection closed.
    pub fn fill_available(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            if self.buffer.capacity() - self.buffer.len() < 1024 {
                self.buffer.reserve(4096);
            }
            match self.reader.try_read_buf(&mut self.buffer) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(total);
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Take the next complete value from the buffer, with the offset it started at
    pub fn next_value(&mut self) -> Result<Option<(RespValue, u64)>> {
        match parse_value(&self.buffer)? {
            Some((value, used)) => {
                let start = self.consumed;
                self.buffer.advance(used);
                self.consumed += used as u64;
                Ok(Some((value, start)))
            }
            None => Ok(None),
        }
    }

    /// Wait for the next complete value
    pub async fn read_value(&mut self) -> Result<(RespValue, u64)> {
        loop {
            if let Some(found) = self.next_value()? {
                return Ok(found);
            }
            self.fill().await?;
        }
    }

    /// Wait for a snapshot payload
    pub async fn read_snapshot(&mut self) -> Result<Bytes> {
        loop {
            if let Some((data, used)) = parse_snapshot(&self.buffer)? {
                self.buffer.advance(used);
                self.consumed += used as u64;
                return Ok(data);
            }
            self.fill().await?;
        }
    }

    /// Write and flush a value
    pub async fn send(&self, value: &RespValue) -> Result<()> {
        self.writer.write(&value.to_bytes()).await
    }

    /// Close both directions
    pub async fn close(&mut self) {
        self.closed = true;
        self.writer.close().await;
    }

    async fn fill(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        let n = self.reader.read_buf(&mut self.buffer).await?;
        if n == 0 {
            self.closed = true;
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("consumed", &self.consumed)
            .field("buffered", &self.buffer.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::new(server).unwrap(), client)
    }

    #[tokio::test]
    async fn test_offsets_track_consumed_bytes() {
        let (mut conn, mut client) = pair().await;
        let ping = RespValue::command(&["PING"]).to_bytes();
        let set = RespValue::command(&["SET", "a", "1"]).to_bytes();
        client.write_all(&ping).await.unwrap();
        client.write_all(&set).await.unwrap();

        let (first, start) = conn.read_value().await.unwrap();
        assert_eq!(first, RespValue::command(&["PING"]));
        assert_eq!(start, 0);

        let (_, start) = conn.read_value().await.unwrap();
        assert_eq!(start, ping.len() as u64);
        assert_eq!(conn.consumed(), (ping.len() + set.len()) as u64);
    }

    #[tokio::test]
    async fn test_fill_detects_close() {
        let (mut conn, client) = pair().await;
        drop(client);

        for _ in 0..100 {
            conn.fill_available().unwrap();
            if conn.is_closed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_snapshot_then_stream() {
        let (mut conn, mut client) = pair().await;
        client.write_all(b"$3\r\nabc*1\r\n$4\r\nPING\r\n").await.unwrap();

        assert_eq!(&conn.read_snapshot().await.unwrap()[..], b"abc");
        conn.set_offset(100);
        let (value, start) = conn.read_value().await.unwrap();
        assert_eq!(value, RespValue::command(&["PING"]));
        assert_eq!(start, 100);
        assert_eq!(conn.consumed(), 114);
    }
}
