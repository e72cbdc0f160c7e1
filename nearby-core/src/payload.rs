//! Payload model: incoming descriptors, outgoing content, completed payloads, stream pipes.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointId;

/// Payload identifier. Unique per sender; random for payloads created by this core.
pub type PayloadId = u64;

/// Generate a fresh payload id.
pub fn next_payload_id() -> PayloadId {
    rand::random()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    Bytes,
    File,
    Stream,
}

/// Create a stream pipe. The transport keeps the writer and hands the reader to the core.
pub fn stream_pipe() -> (StreamWriter, StreamReader) {
    let (tx, rx) = mpsc::channel();
    (StreamWriter { tx }, StreamReader { rx })
}

/// Transport side of a stream payload.
#[derive(Debug, Clone)]
pub struct StreamWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl StreamWriter {
    pub fn write(&self, chunk: Vec<u8>) -> Result<(), StreamError> {
        self.tx.send(chunk).map_err(|_| StreamError::Closed)
    }
}

/// Readable handle for an incoming stream payload. Never blocks.
#[derive(Debug)]
pub struct StreamReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl StreamReader {
    /// Drain every byte currently buffered in the pipe.
    pub fn read_available(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream reader dropped")]
    Closed,
}

/// Content of a payload announced by the transport.
#[derive(Debug)]
pub enum IncomingContent {
    Bytes(Bytes),
    File(PathBuf),
    Stream(StreamReader),
}

/// Descriptor of one incoming transfer, created on first notification.
#[derive(Debug)]
pub struct IncomingPayload {
    pub id: PayloadId,
    pub total_bytes: Option<u64>,
    pub content: IncomingContent,
}

impl IncomingPayload {
    pub fn kind(&self) -> PayloadKind {
        match self.content {
            IncomingContent::Bytes(_) => PayloadKind::Bytes,
            IncomingContent::File(_) => PayloadKind::File,
            IncomingContent::Stream(_) => PayloadKind::Stream,
        }
    }
}

/// Content handed to `send`.
pub enum OutgoingContent {
    Bytes(Bytes),
    File(PathBuf),
    Stream(Box<dyn Read + Send>),
}

impl OutgoingContent {
    pub fn kind(&self) -> PayloadKind {
        match self {
            OutgoingContent::Bytes(_) => PayloadKind::Bytes,
            OutgoingContent::File(_) => PayloadKind::File,
            OutgoingContent::Stream(_) => PayloadKind::Stream,
        }
    }
}

impl fmt::Debug for OutgoingContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutgoingContent::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            OutgoingContent::File(p) => f.debug_tuple("File").field(p).finish(),
            OutgoingContent::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct OutgoingPayload {
    pub id: PayloadId,
    pub content: OutgoingContent,
}

/// A completed incoming payload, published on the payload channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPayload {
    pub endpoint_id: EndpointId,
    pub payload_id: PayloadId,
    pub content: ReceivedContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceivedContent {
    Bytes(Bytes),
    File(PathBuf),
    /// Reassembled stream chunks, in arrival order.
    Stream(Bytes),
}

impl ReceivedContent {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ReceivedContent::Bytes(_) => PayloadKind::Bytes,
            ReceivedContent::File(_) => PayloadKind::File,
            ReceivedContent::Stream(_) => PayloadKind::Stream,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Success,
    Failure,
}

/// Progress notification for one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferUpdate {
    pub payload_id: PayloadId,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
}
