//! Framed TCP transport
//!
//! Every frame is a length-prefixed postcard encoding of a
//! [`WireMessage`]. A [`Connection`] carries one request and, for change
//! streams, everything that follows it.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::trace;

use super::protocol::{SyncMessage, WireMessage};
use crate::error::{SyncError, SyncResult};

/// Largest frame accepted; bounds a single file transfer
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Largest file body sent in one change, leaving room in the frame for the
/// paths and the envelope
pub const MAX_FILE_LEN: usize = MAX_FRAME_LEN - 64 * 1024;

/// Length-delimited postcard codec for [`SyncMessage`]
#[derive(Debug)]
pub struct WireCodec {
    length_codec: LengthDelimitedCodec,
}

impl WireCodec {
    /// Create a codec with the default frame limit
    pub fn new() -> Self {
        Self {
            length_codec: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = SyncMessage;
    type Error = SyncError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.length_codec.decode(src)? else {
            return Ok(None);
        };
        let wire = WireMessage::decode(&frame)?;
        Ok(Some(wire.into_inner()))
    }
}

impl Encoder<SyncMessage> for WireCodec {
    type Error = SyncError;

    fn encode(&mut self, item: SyncMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = WireMessage::new(item).encode()?;
        self.length_codec.encode(Bytes::from(bytes), dst)?;
        Ok(())
    }
}

/// Sending half of a connection
#[derive(Debug)]
pub struct FrameWriter {
    inner: FramedWrite<OwnedWriteHalf, WireCodec>,
}

impl FrameWriter {
    /// Send one message and flush it
    pub async fn send(&mut self, msg: SyncMessage) -> SyncResult<()> {
        trace!(kind = msg.kind(), "Sending frame");
        self.inner.send(msg).await
    }

    /// Flush and shut down the write side
    pub async fn close(&mut self) -> SyncResult<()> {
        self.inner.close().await
    }
}

/// Receiving half of a connection
#[derive(Debug)]
pub struct FrameReader {
    inner: FramedRead<OwnedReadHalf, WireCodec>,
}

impl FrameReader {
    /// Next message, or `None` once the peer closed the connection
    pub async fn recv(&mut self) -> SyncResult<Option<SyncMessage>> {
        match self.inner.next().await {
            Some(Ok(msg)) => {
                trace!(kind = msg.kind(), "Received frame");
                Ok(Some(msg))
            }
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }
}

/// A framed TCP connection
#[derive(Debug)]
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    peer: SocketAddr,
}

impl Connection {
    /// Connect to a server
    pub async fn connect(addr: impl ToSocketAddrs) -> SyncResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SyncError::Transport(format!("connect failed: {e}")))?;
        Self::from_stream(stream)
    }

    /// Wrap an accepted stream
    pub fn from_stream(stream: TcpStream) -> SyncResult<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: FrameReader {
                inner: FramedRead::new(read, WireCodec::new()),
            },
            writer: FrameWriter {
                inner: FramedWrite::new(write, WireCodec::new()),
            },
            peer,
        })
    }

    /// Address of the other end
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one message
    pub async fn send(&mut self, msg: SyncMessage) -> SyncResult<()> {
        self.writer.send(msg).await
    }

    /// Receive one message, `None` on a clean close
    pub async fn recv(&mut self) -> SyncResult<Option<SyncMessage>> {
        self.reader.recv().await
    }

    /// Send a request and wait for exactly one reply
    pub async fn request(&mut self, msg: SyncMessage) -> SyncResult<SyncMessage> {
        self.send(msg).await?;
        self.recv()
            .await?
            .ok_or_else(|| SyncError::Transport("connection closed before reply".into()))
    }

    /// Split into independently owned halves
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}
