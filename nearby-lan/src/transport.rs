//! Peer transport capability: the primitives the service drives, and the sink callbacks flow back through.

use nearby_core::{EndpointId, OutgoingPayload, TransportCommand, TransportEvent};
use tokio::sync::mpsc;

use crate::service::Command;

/// Advertise/discover/connect/send primitives. Every call returns immediately;
/// outcomes arrive later as `TransportEvent`s pushed into the transport's `EventSink`.
pub trait PeerTransport: Send + 'static {
    fn start_advertising(&mut self, name: &str, service_id: &str);
    fn start_discovery(&mut self, service_id: &str);
    fn stop_advertising(&mut self);
    fn stop_discovery(&mut self);
    /// Abandon discovery, advertising and every link.
    fn stop_all(&mut self);
    fn request_connection(&mut self, local_name: &str, endpoint_id: &EndpointId);
    /// Accept a negotiated connection; payloads from the endpoint are delivered from then on.
    fn accept_connection(&mut self, endpoint_id: &EndpointId);
    fn reject_connection(&mut self, endpoint_id: &EndpointId);
    fn send_payload(&mut self, endpoint_ids: &[EndpointId], payload: OutgoingPayload);
}

/// Run one core command against a transport.
pub fn execute<T: PeerTransport + ?Sized>(transport: &mut T, command: TransportCommand) {
    match command {
        TransportCommand::StartAdvertising { name, service_id } => {
            transport.start_advertising(&name, &service_id)
        }
        TransportCommand::StartDiscovery { service_id } => transport.start_discovery(&service_id),
        TransportCommand::StopAdvertising => transport.stop_advertising(),
        TransportCommand::StopDiscovery => transport.stop_discovery(),
        TransportCommand::StopAll => transport.stop_all(),
        TransportCommand::RequestConnection {
            local_name,
            endpoint_id,
        } => transport.request_connection(&local_name, &endpoint_id),
        TransportCommand::AcceptConnection { endpoint_id } => {
            transport.accept_connection(&endpoint_id)
        }
        TransportCommand::RejectConnection { endpoint_id } => {
            transport.reject_connection(&endpoint_id)
        }
        TransportCommand::SendPayload {
            endpoint_ids,
            payload,
        } => transport.send_payload(&endpoint_ids, payload),
    }
}

/// Callback path from a transport into the service queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Command>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    /// Queue a callback. Dropped silently once the service has stopped.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(Command::Transport(event));
    }
}
