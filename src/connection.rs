//! The message-level connection handed to the RPC layer
//!
//! [`MessageStream`] frames whole messages on top of one reader/writer pair.
//! Both roles wrap it in their own [`Connection`] implementation, which adds
//! the role-specific teardown.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ble::BleError;
use crate::stream::{ChunkReader, ChunkWriter};

/// Largest message a length prefix may announce.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A varint never needs more than 10 bytes for a u64.
const MAX_VARINT_LEN: usize = 10;

/// What the RPC layer sees of a link.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one whole message. Returns once every chunk was acknowledged.
    async fn send_message(&self, message: &[u8]) -> Result<(), BleError>;

    /// Receive the next whole message.
    async fn receive_message(&self) -> Result<Vec<u8>, BleError>;

    /// Tear the link down. Idempotent.
    async fn close(&self) -> Result<(), BleError>;

    fn is_closed(&self) -> bool;
}

/// How message boundaries are marked on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Each message is preceded by its length as a base-128 varint.
    Delimited,
    /// One message per stream; the receiver reads until the stream ends.
    Raw,
}

impl Framing {
    pub fn from_delimited_flag(delimited: bool) -> Self {
        if delimited {
            Self::Delimited
        } else {
            Self::Raw
        }
    }
}

pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Reader/writer pair plus framing, shared by both roles.
pub struct MessageStream {
    reader: Arc<ChunkReader>,
    writer: Arc<ChunkWriter>,
    framing: Framing,
}

impl MessageStream {
    pub fn new(reader: Arc<ChunkReader>, writer: Arc<ChunkWriter>, framing: Framing) -> Self {
        Self {
            reader,
            writer,
            framing,
        }
    }

    pub fn reader(&self) -> &Arc<ChunkReader> {
        &self.reader
    }

    pub fn writer(&self) -> &Arc<ChunkWriter> {
        &self.writer
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub async fn send(&self, message: &[u8]) -> Result<(), BleError> {
        match self.framing {
            Framing::Delimited => {
                if message.len() > MAX_MESSAGE_SIZE {
                    return Err(BleError::Framing(format!(
                        "message of {} bytes exceeds {} byte limit",
                        message.len(),
                        MAX_MESSAGE_SIZE
                    )));
                }
                let mut framed = Vec::with_capacity(message.len() + MAX_VARINT_LEN);
                encode_varint(message.len() as u64, &mut framed);
                framed.extend_from_slice(message);
                self.writer.write(&framed).await
            }
            Framing::Raw => self.writer.write(message).await,
        }
    }

    pub async fn receive(&self) -> Result<Vec<u8>, BleError> {
        match self.framing {
            Framing::Delimited => {
                let len = self.read_length_prefix().await?;
                self.reader.read_exact(len).await
            }
            Framing::Raw => self.read_to_end().await,
        }
    }

    async fn read_length_prefix(&self) -> Result<usize, BleError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.reader.read().await?;
            // The tenth byte may only carry bit 63.
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(BleError::Framing("varint length prefix overflows 64 bits".into()));
            }
            value |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                if value > MAX_MESSAGE_SIZE as u64 {
                    return Err(BleError::Framing(format!(
                        "length prefix {} exceeds {} byte limit",
                        value, MAX_MESSAGE_SIZE
                    )));
                }
                return Ok(value as usize);
            }
        }
        Err(BleError::Framing("malformed varint length prefix".into()))
    }

    /// Collect bytes until the stream ends. A message with no bytes before
    /// the end is reported as the end-of-stream error itself.
    async fn read_to_end(&self) -> Result<Vec<u8>, BleError> {
        let mut message = Vec::new();
        loop {
            match self.reader.read().await {
                Ok(byte) => {
                    message.push(byte);
                    let rest = self.reader.available();
                    if rest > 0 {
                        message.extend(self.reader.read_exact(rest).await?);
                    }
                }
                Err(e) if e.is_end_of_stream() && !message.is_empty() => return Ok(message),
                Err(e) => return Err(e),
            }
        }
    }

    /// Close both directions. Idempotent.
    pub fn close(&self) {
        self.writer.close();
        self.reader.close();
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_closed() && self.writer.is_closed()
    }
}
