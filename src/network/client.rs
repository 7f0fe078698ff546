//! RESP Client
//!
//! Small request/response client used by `relayctl` and the end-to-end
//! tests.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::protocol::{RespCodec, RespValue};

/// Connect with a timeout, mapping failures onto network errors
pub async fn connect_with_timeout(address: &str, limit: Duration) -> Result<TcpStream> {
    match timeout(limit, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(Error::ConnectionFailed {
            address: address.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
    }
}

/// A single client connection
pub struct RespClient {
    address: String,
    framed: Framed<TcpStream, RespCodec>,
    request_timeout: Duration,
}

impl RespClient {
    /// Connect to a node
    pub async fn connect(address: &str, connect_timeout: Duration) -> Result<Self> {
        let stream = connect_with_timeout(address, connect_timeout).await?;
        Ok(Self {
            address: address.to_string(),
            framed: Framed::new(stream, RespCodec::new()),
            request_timeout: Duration::from_secs(30),
        })
    }

    /// Bound each reply wait
    pub fn with_request_timeout(mut self, limit: Duration) -> Self {
        self.request_timeout = limit;
        self
    }

    /// Send a command and wait for its reply
    pub async fn request(&mut self, args: &[&str]) -> Result<RespValue> {
        self.send_raw(RespValue::command(args)).await?;
        self.read_value().await
    }

    /// Send any value without waiting
    pub async fn send_raw(&mut self, value: RespValue) -> Result<()> {
        self.framed.send(value).await
    }

    /// Expect the next frame to be a snapshot payload
    pub fn expect_snapshot(&mut self) {
        self.framed.codec_mut().expect_snapshot();
    }

    /// Wait for the next value from the server
    pub async fn read_value(&mut self) -> Result<RespValue> {
        match timeout(self.request_timeout, self.framed.next()).await {
            Ok(Some(result)) => result,
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::ConnectionTimeout(self.address.clone())),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}
