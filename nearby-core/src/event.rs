//! Events flowing into the core (transport callbacks) and out of it (connection events).

use crate::endpoint::{ConnectionInfo, DiscoveredEndpointInfo, EndpointId};
use crate::payload::{IncomingPayload, TransferUpdate};

/// Outcome of a connection negotiation as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Ok,
    /// One side rejected the connection.
    Rejected,
    /// Link failed before both sides accepted.
    Error,
}

impl ConnectionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ConnectionStatus::Ok)
    }
}

/// One transport callback, as a message. Processed in arrival order.
#[derive(Debug)]
pub enum TransportEvent {
    AdvertisingStarted(Result<(), String>),
    DiscoveryStarted(Result<(), String>),
    EndpointFound {
        endpoint_id: EndpointId,
        info: DiscoveredEndpointInfo,
    },
    EndpointLost {
        endpoint_id: EndpointId,
    },
    /// `request_connection` could not be issued (endpoint unreachable, etc.).
    ConnectionRequestFailed {
        endpoint_id: EndpointId,
        reason: String,
    },
    ConnectionInitiated {
        endpoint_id: EndpointId,
        info: ConnectionInfo,
    },
    ConnectionResult {
        endpoint_id: EndpointId,
        status: ConnectionStatus,
    },
    Disconnected {
        endpoint_id: EndpointId,
    },
    PayloadReceived {
        endpoint_id: EndpointId,
        payload: IncomingPayload,
    },
    PayloadTransferUpdate {
        endpoint_id: EndpointId,
        update: TransferUpdate,
    },
}

/// Published to connection-event subscribers. Subscribers decide what happens next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Result {
        success: bool,
        established_count: usize,
    },
    Disconnect {
        established_count: usize,
    },
}
