//! Framed peer connections.
//!
//! Frames are a 4-byte big-endian length followed by a bincode payload.
//! The frame limit bounds memory per peer; a peer exceeding it is dropped.
//!
//! A [`Connection`] splits into independent read and write halves so a
//! session can await inbound frames while answering timers on the write
//! side.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::NetworkError;
use crate::message::Message;

/// Maximum frame payload size.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A framed, message-oriented peer connection.
pub struct Connection {
    addr: SocketAddr,
    reader: MessageReader,
    writer: MessageWriter,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Result<Self, NetworkError> {
        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr,
            reader: MessageReader { reader },
            writer: MessageWriter { writer },
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Split into independent halves.
    pub fn split(self) -> (SocketAddr, MessageReader, MessageWriter) {
        (self.addr, self.reader, self.writer)
    }

    /// Write one framed message.
    pub async fn send(&mut self, message: &Message) -> Result<(), NetworkError> {
        self.writer.send(message).await
    }

    /// Read one framed message. Callers bound this with a timeout.
    pub async fn recv(&mut self) -> Result<Message, NetworkError> {
        self.reader.recv().await
    }
}

/// The inbound half of a framed connection.
pub struct MessageReader {
    reader: OwnedReadHalf,
}

impl MessageReader {
    pub async fn recv(&mut self) -> Result<Message, NetworkError> {
        let mut len_bytes = [0u8; 4];
        self.reader.read_exact(&mut len_bytes).await?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload).await?;
        bincode::deserialize(&payload).map_err(|err| NetworkError::Codec(err.to_string()))
    }
}

/// The outbound half of a framed connection.
pub struct MessageWriter {
    writer: OwnedWriteHalf,
}

impl MessageWriter {
    pub async fn send(&mut self, message: &Message) -> Result<(), NetworkError> {
        let payload =
            bincode::serialize(message).map_err(|err| NetworkError::Codec(err.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge(payload.len()));
        }
        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
