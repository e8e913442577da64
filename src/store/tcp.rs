//! TCP transport: every RPC is one length-prefixed MessagePack frame each way.

use super::client::{Connector, StoreConnection};
use super::{StoreRequest, StoreResponse};
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::trace;

/// Largest frame accepted from the store.
const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Connects to a fixed `host:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = FramedConnection;

    async fn connect(&self) -> Result<Self::Connection, StoreError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", self.address),
                )
            })??;
        stream.set_nodelay(true)?;
        trace!("Connected to store at {}", self.address);
        Ok(FramedConnection::new(stream))
    }
}

/// A framed, buffered connection to the store.
pub struct FramedConnection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl FramedConnection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            framed: Framed::new(stream, frame_codec()),
        }
    }
}

#[async_trait]
impl StoreConnection for FramedConnection {
    async fn call(&mut self, request: &StoreRequest) -> Result<StoreResponse, StoreError> {
        let payload = rmp_serde::to_vec_named(request)?;
        self.framed.send(Bytes::from(payload)).await?;

        match self.framed.next().await {
            Some(Ok(frame)) => Ok(rmp_serde::from_slice(&frame)?),
            Some(Err(e)) => Err(StoreError::Transport(e)),
            None => Err(StoreError::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "store closed the connection",
            ))),
        }
    }

    async fn close(&mut self) {
        let _ = SinkExt::<Bytes>::close(&mut self.framed).await;
    }
}
