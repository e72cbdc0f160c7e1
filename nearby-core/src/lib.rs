//! Nearby peer connection core.
//! Host-driven: no I/O; host passes transport events and receives actions.

pub mod endpoint;
pub mod event;
pub mod identity;
pub mod integrity;
pub mod manager;
pub mod payload;
pub mod protocol;
pub mod transfer;
pub mod wire;

pub use endpoint::{ConnectionInfo, DiscoveredEndpointInfo, Endpoint, EndpointId};
pub use event::{ConnectionEvent, ConnectionStatus, TransportEvent};
pub use identity::{Keypair, PublicKey};
pub use manager::{
    Action, ConnectionManager, ConnectionPhase, ManagerSettings, ManagerSnapshot,
    TransportCommand, SERVICE_ID,
};
pub use payload::{
    stream_pipe, IncomingContent, IncomingPayload, OutgoingContent, OutgoingPayload, PayloadId,
    PayloadKind, ReceivedContent, ReceivedPayload, StreamReader, StreamWriter, TransferStatus,
    TransferUpdate,
};
pub use protocol::{Message, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
