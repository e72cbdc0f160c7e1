//! LAN wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointId;
use crate::identity::PublicKey;
use crate::payload::{PayloadId, PayloadKind};

/// Current protocol version. Carried in advertisements and the link handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Multicast beacon: an endpoint accepting connections for `service_id`.
    Advertisement {
        protocol_version: u8,
        service_id: String,
        endpoint_id: EndpointId,
        endpoint_name: String,
        listen_port: u16,
    },
    /// First frame in each direction on a new link, in plaintext.
    Hello {
        protocol_version: u8,
        endpoint_id: EndpointId,
        endpoint_name: String,
        public_key: PublicKey,
    },
    /// Local side accepted the connection.
    Accept,
    /// Local side rejected the connection; the link closes after this.
    Reject,
    /// Start of a payload.
    PayloadHeader {
        payload_id: PayloadId,
        kind: PayloadKind,
        total_bytes: Option<u64>,
        file_name: Option<String>,
    },
    PayloadChunk {
        payload_id: PayloadId,
        body: Vec<u8>,
    },
    /// Payload complete; `digest` is SHA-256 over every chunk body in order.
    PayloadEnd {
        payload_id: PayloadId,
        digest: [u8; 32],
    },
    /// Sender gave up on the payload.
    PayloadCancel {
        payload_id: PayloadId,
    },
    /// Graceful disconnect.
    Goodbye,
}
