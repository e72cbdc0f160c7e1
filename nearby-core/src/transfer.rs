//! Payload transfer engine: track incoming payloads, reassemble streams, hand off on success.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::endpoint::EndpointId;
use crate::payload::{
    IncomingContent, IncomingPayload, PayloadId, PayloadKind, ReceivedContent, ReceivedPayload,
    TransferStatus, TransferUpdate,
};

/// Accumulator for one in-flight stream payload.
#[derive(Debug, Default)]
pub struct TransferBuffer {
    pub payload_id: PayloadId,
    accumulated: Vec<u8>,
}

impl TransferBuffer {
    fn new(payload_id: PayloadId) -> Self {
        Self {
            payload_id,
            accumulated: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.accumulated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accumulated.is_empty()
    }
}

struct InFlight {
    endpoint_id: EndpointId,
    payload: IncomingPayload,
}

/// Incoming payload descriptors and stream buffers, keyed by payload id.
#[derive(Default)]
pub struct TransferEngine {
    incoming: HashMap<PayloadId, InFlight>,
    buffers: HashMap<PayloadId, TransferBuffer>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload descriptor. Streams get an empty buffer.
    pub fn on_payload_received(&mut self, endpoint_id: EndpointId, payload: IncomingPayload) {
        debug!(
            endpoint_id = %endpoint_id,
            payload_id = payload.id,
            kind = ?payload.kind(),
            total_bytes = ?payload.total_bytes,
            "payload received"
        );
        if payload.kind() == PayloadKind::Stream {
            self.buffers
                .insert(payload.id, TransferBuffer::new(payload.id));
        }
        self.incoming.insert(
            payload.id,
            InFlight {
                endpoint_id,
                payload,
            },
        );
    }

    /// Apply a progress update. Returns the completed payload on success.
    /// Updates for unknown ids (our own outgoing payloads, or already finished ones) are no-ops.
    pub fn on_transfer_update(&mut self, update: TransferUpdate) -> Option<ReceivedPayload> {
        match update.status {
            TransferStatus::InProgress => {
                let Some(entry) = self.incoming.get_mut(&update.payload_id) else {
                    debug!(payload_id = update.payload_id, "progress for untracked payload");
                    return None;
                };
                if let IncomingContent::Stream(reader) = &mut entry.payload.content {
                    let chunk = reader.read_available();
                    if let Some(buffer) = self.buffers.get_mut(&update.payload_id) {
                        buffer.accumulated.extend_from_slice(&chunk);
                        debug!(
                            payload_id = update.payload_id,
                            read = chunk.len(),
                            buffered = buffer.len(),
                            transferred = update.bytes_transferred,
                            "stream chunk"
                        );
                    }
                }
                None
            }
            TransferStatus::Failure => {
                let removed = self.incoming.remove(&update.payload_id);
                let buffered = self
                    .buffers
                    .remove(&update.payload_id)
                    .map_or(0, |buffer| buffer.len());
                if let Some(entry) = removed {
                    warn!(
                        endpoint_id = %entry.endpoint_id,
                        payload_id = update.payload_id,
                        transferred = update.bytes_transferred,
                        buffered,
                        "payload transfer failed, discarded"
                    );
                }
                None
            }
            TransferStatus::Success => {
                let Some(entry) = self.incoming.remove(&update.payload_id) else {
                    debug!(payload_id = update.payload_id, "success for untracked payload");
                    return None;
                };
                let content = match entry.payload.content {
                    IncomingContent::Bytes(bytes) => ReceivedContent::Bytes(bytes),
                    IncomingContent::File(path) => ReceivedContent::File(path),
                    IncomingContent::Stream(mut reader) => {
                        let mut buffer = self
                            .buffers
                            .remove(&update.payload_id)
                            .unwrap_or_else(|| TransferBuffer::new(update.payload_id));
                        buffer.accumulated.extend_from_slice(&reader.read_available());
                        if buffer.is_empty() {
                            debug!(payload_id = update.payload_id, "stream ended without data");
                        }
                        ReceivedContent::Stream(Bytes::from(buffer.accumulated))
                    }
                };
                debug!(
                    endpoint_id = %entry.endpoint_id,
                    payload_id = update.payload_id,
                    kind = ?content.kind(),
                    "payload complete"
                );
                Some(ReceivedPayload {
                    endpoint_id: entry.endpoint_id,
                    payload_id: update.payload_id,
                    content,
                })
            }
        }
    }

    /// Drop every in-flight payload from one endpoint. Returns how many were dropped.
    pub fn discard_endpoint(&mut self, endpoint_id: &EndpointId) -> usize {
        let ids: Vec<PayloadId> = self
            .incoming
            .iter()
            .filter(|(_, e)| e.endpoint_id == *endpoint_id)
            .map(|(&id, _)| id)
            .collect();
        for id in &ids {
            self.incoming.remove(id);
            self.buffers.remove(id);
        }
        ids.len()
    }

    pub fn clear(&mut self) {
        self.incoming.clear();
        self.buffers.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.incoming.len()
    }

    pub fn buffer(&self, payload_id: PayloadId) -> Option<&TransferBuffer> {
        self.buffers.get(&payload_id)
    }
}
