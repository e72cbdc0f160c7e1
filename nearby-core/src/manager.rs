//! Host-driven API: ConnectionManager receives transport events from host, returns actions.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::endpoint::{ConnectionInfo, DiscoveredEndpointInfo, Endpoint, EndpointId};
use crate::event::{ConnectionEvent, ConnectionStatus, TransportEvent};
use crate::payload::{
    next_payload_id, IncomingPayload, OutgoingContent, OutgoingPayload, PayloadId,
    ReceivedPayload, TransferUpdate,
};
use crate::transfer::TransferEngine;

/// Service id advertised and expected during discovery.
pub const SERVICE_ID: &str = "com.kanawish.nearby";

/// Default endpoint name when the host does not supply one.
pub const DEFAULT_ENDPOINT: &str = "defaultEndpoint";

/// Default bound on discovery restarts after transport failures, per connection or reset.
pub const DEFAULT_MAX_DISCOVERY_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    pub endpoint_name: String,
    pub service_id: String,
    pub max_discovery_retries: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            endpoint_name: DEFAULT_ENDPOINT.to_owned(),
            service_id: SERVICE_ID.to_owned(),
            max_discovery_retries: DEFAULT_MAX_DISCOVERY_RETRIES,
        }
    }
}

/// Coarse connection status, always derived from the manager's sets and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionPhase {
    Idle,
    Searching,
    Connected,
    /// A connection attempt is outstanding but nothing is tracked. Resolve with `reset`.
    Unknown,
}

/// Point-in-time view of the manager's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSnapshot {
    pub phase: ConnectionPhase,
    pub discovered: usize,
    pub pending: usize,
    pub established: usize,
    pub advertising: bool,
    pub discovering: bool,
    pub connecting: bool,
    pub incoming_payloads: usize,
}

/// Instruction for the peer transport.
#[derive(Debug)]
pub enum TransportCommand {
    StartAdvertising { name: String, service_id: String },
    StartDiscovery { service_id: String },
    StopAdvertising,
    StopDiscovery,
    StopAll,
    RequestConnection { local_name: String, endpoint_id: EndpointId },
    AcceptConnection { endpoint_id: EndpointId },
    RejectConnection { endpoint_id: EndpointId },
    SendPayload { endpoint_ids: Vec<EndpointId>, payload: OutgoingPayload },
}

/// Action for host to perform, in order.
#[derive(Debug)]
pub enum Action {
    Transport(TransportCommand),
    Publish(ConnectionEvent),
    Deliver(ReceivedPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Roles {
    Both,
    Advertise,
    Discover,
}

/// Main coordinator. Host passes transport events and entry-point calls; core returns actions.
pub struct ConnectionManager {
    settings: ManagerSettings,
    advertising: bool,
    discovering: bool,
    connecting: bool,
    discovered: HashMap<EndpointId, Endpoint>,
    pending: HashMap<EndpointId, Endpoint>,
    established: HashMap<EndpointId, Endpoint>,
    /// Discovery restarts since the last established connection or reset.
    discovery_retries: u32,
    transfers: TransferEngine,
}

impl ConnectionManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self {
            settings,
            advertising: false,
            discovering: false,
            connecting: false,
            discovered: HashMap::new(),
            pending: HashMap::new(),
            established: HashMap::new(),
            discovery_retries: 0,
            transfers: TransferEngine::new(),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Derive the phase. First match wins.
    pub fn phase(&self) -> ConnectionPhase {
        if !self.discovered.is_empty()
            || !self.pending.is_empty()
            || self.discovering
            || self.advertising
        {
            ConnectionPhase::Searching
        } else if !self.established.is_empty() {
            ConnectionPhase::Connected
        } else if !self.connecting {
            ConnectionPhase::Idle
        } else {
            ConnectionPhase::Unknown
        }
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            phase: self.phase(),
            discovered: self.discovered.len(),
            pending: self.pending.len(),
            established: self.established.len(),
            advertising: self.advertising,
            discovering: self.discovering,
            connecting: self.connecting,
            incoming_payloads: self.transfers.in_flight(),
        }
    }

    pub fn established_count(&self) -> usize {
        self.established.len()
    }

    /// Ids of established endpoints, sorted.
    pub fn established_endpoints(&self) -> Vec<EndpointId> {
        let mut ids: Vec<EndpointId> = self.established.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Start advertising and discovery when idle; reset first when the state is inconsistent.
    /// No-op while searching or connected.
    pub fn auto_connect(&mut self) -> Vec<Action> {
        self.auto_start(Roles::Both)
    }

    /// `auto_connect` for the advertiser only: wait for a discoverer to request a link.
    pub fn auto_advertise(&mut self) -> Vec<Action> {
        self.auto_start(Roles::Advertise)
    }

    /// `auto_connect` for the discoverer only: request a link to the first advertiser found.
    pub fn auto_discover(&mut self) -> Vec<Action> {
        self.auto_start(Roles::Discover)
    }

    fn auto_start(&mut self, roles: Roles) -> Vec<Action> {
        let phase = self.phase();
        debug!(?phase, ?roles, "auto start");
        let mut actions = Vec::new();
        match phase {
            ConnectionPhase::Idle => {}
            ConnectionPhase::Unknown => actions.extend(self.reset()),
            ConnectionPhase::Searching | ConnectionPhase::Connected => {
                debug!("waiting on connection");
                return actions;
            }
        }
        if roles != Roles::Discover {
            self.start_advertising(&mut actions);
        }
        if roles != Roles::Advertise {
            self.start_discovery(&mut actions);
        }
        actions
    }

    /// Stop all transport activity and forget every endpoint and in-flight payload.
    /// Idempotent: the resulting state is always empty.
    pub fn reset(&mut self) -> Vec<Action> {
        info!(
            discovered = self.discovered.len(),
            pending = self.pending.len(),
            established = self.established.len(),
            "reset"
        );
        self.advertising = false;
        self.discovering = false;
        self.connecting = false;
        self.discovered.clear();
        self.pending.clear();
        self.established.clear();
        self.discovery_retries = 0;
        self.transfers.clear();
        vec![Action::Transport(TransportCommand::StopAll)]
    }

    /// Send to every established endpoint. None when nothing is established.
    pub fn send(&mut self, content: OutgoingContent) -> Option<(PayloadId, Action)> {
        if self.established.is_empty() {
            debug!(kind = ?content.kind(), "send with no established endpoints");
            return None;
        }
        let payload = OutgoingPayload {
            id: next_payload_id(),
            content,
        };
        let id = payload.id;
        debug!(payload_id = id, kind = ?payload.content.kind(), "send");
        Some((
            id,
            Action::Transport(TransportCommand::SendPayload {
                endpoint_ids: self.established_endpoints(),
                payload,
            }),
        ))
    }

    /// Dispatch one transport callback.
    pub fn handle(&mut self, event: TransportEvent) -> Vec<Action> {
        match event {
            TransportEvent::AdvertisingStarted(result) => self.on_advertising_started(result),
            TransportEvent::DiscoveryStarted(result) => self.on_discovery_started(result),
            TransportEvent::EndpointFound { endpoint_id, info } => {
                self.on_endpoint_found(endpoint_id, &info)
            }
            TransportEvent::EndpointLost { endpoint_id } => {
                self.on_endpoint_lost(&endpoint_id);
                Vec::new()
            }
            TransportEvent::ConnectionRequestFailed {
                endpoint_id,
                reason,
            } => self.on_connection_request_failed(&endpoint_id, &reason),
            TransportEvent::ConnectionInitiated { endpoint_id, info } => {
                self.on_connection_initiated(endpoint_id, &info)
            }
            TransportEvent::ConnectionResult {
                endpoint_id,
                status,
            } => self.on_connection_result(&endpoint_id, status),
            TransportEvent::Disconnected { endpoint_id } => self.on_disconnected(&endpoint_id),
            TransportEvent::PayloadReceived {
                endpoint_id,
                payload,
            } => {
                self.on_payload_received(endpoint_id, payload);
                Vec::new()
            }
            TransportEvent::PayloadTransferUpdate {
                endpoint_id,
                update,
            } => self.on_payload_transfer_update(&endpoint_id, update),
        }
    }

    pub fn on_advertising_started(&mut self, result: Result<(), String>) -> Vec<Action> {
        let mut actions = Vec::new();
        match result {
            Ok(()) => info!(name = %self.settings.endpoint_name, "now advertising"),
            Err(reason) => {
                warn!(%reason, "failed to advertise");
                self.advertising = false;
                self.retry_discovery(&mut actions);
            }
        }
        actions
    }

    pub fn on_discovery_started(&mut self, result: Result<(), String>) -> Vec<Action> {
        let mut actions = Vec::new();
        match result {
            Ok(()) => info!(service_id = %self.settings.service_id, "now discovering"),
            Err(reason) => {
                warn!(%reason, "failed to discover");
                self.discovering = false;
                self.retry_discovery(&mut actions);
            }
        }
        actions
    }

    /// First matching endpoint wins: stop discovery and request a connection to it.
    pub fn on_endpoint_found(
        &mut self,
        endpoint_id: EndpointId,
        info: &DiscoveredEndpointInfo,
    ) -> Vec<Action> {
        debug!(
            endpoint_id = %endpoint_id,
            service_id = %info.service_id,
            endpoint_name = %info.endpoint_name,
            "endpoint found"
        );
        let mut actions = Vec::new();
        if info.service_id != self.settings.service_id {
            return actions;
        }
        if !self.discovered.is_empty() || !self.pending.is_empty() || !self.established.is_empty()
        {
            debug!(endpoint_id = %endpoint_id, "already pursuing a connection, ignored");
            return actions;
        }
        let endpoint = Endpoint::new(endpoint_id.clone(), info.endpoint_name.clone());
        self.discovered.insert(endpoint_id.clone(), endpoint);
        self.stop_discovery(&mut actions);
        self.connecting = true;
        actions.push(Action::Transport(TransportCommand::RequestConnection {
            local_name: self.settings.endpoint_name.clone(),
            endpoint_id,
        }));
        actions
    }

    pub fn on_endpoint_lost(&mut self, endpoint_id: &EndpointId) {
        debug!(endpoint_id = %endpoint_id, "endpoint lost");
    }

    /// The connection request could not be issued; forget the candidate and look again.
    pub fn on_connection_request_failed(
        &mut self,
        endpoint_id: &EndpointId,
        reason: &str,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.discovered.remove(endpoint_id).is_none() {
            debug!(endpoint_id = %endpoint_id, "request failure for untracked endpoint");
            return actions;
        }
        warn!(endpoint_id = %endpoint_id, %reason, "request_connection failed");
        self.connecting = false;
        self.retry_discovery(&mut actions);
        actions
    }

    /// Either role: move into pending, accept, and stop looking for other peers.
    pub fn on_connection_initiated(
        &mut self,
        endpoint_id: EndpointId,
        info: &ConnectionInfo,
    ) -> Vec<Action> {
        info!(
            endpoint_id = %endpoint_id,
            endpoint_name = %info.endpoint_name,
            token = %info.authentication_token,
            incoming = info.is_incoming,
            "connection initiated"
        );
        let mut actions = Vec::new();
        if self.pending.contains_key(&endpoint_id) || self.established.contains_key(&endpoint_id)
        {
            debug!(endpoint_id = %endpoint_id, "duplicate initiation ignored");
            return actions;
        }
        if !self.pending.is_empty() || !self.established.is_empty() {
            debug!(endpoint_id = %endpoint_id, "busy with another endpoint, rejecting");
            actions.push(Action::Transport(TransportCommand::RejectConnection {
                endpoint_id,
            }));
            return actions;
        }
        // Other discovered candidates are abandoned: only one peer is pursued.
        self.discovered.clear();
        self.pending.insert(
            endpoint_id.clone(),
            Endpoint::new(endpoint_id.clone(), info.endpoint_name.clone()),
        );
        self.stop_advertising(&mut actions);
        self.stop_discovery(&mut actions);
        actions.push(Action::Transport(TransportCommand::AcceptConnection {
            endpoint_id,
        }));
        actions
    }

    pub fn on_connection_result(
        &mut self,
        endpoint_id: &EndpointId,
        status: ConnectionStatus,
    ) -> Vec<Action> {
        let Some(endpoint) = self
            .pending
            .remove(endpoint_id)
            .or_else(|| self.discovered.remove(endpoint_id))
        else {
            debug!(endpoint_id = %endpoint_id, ?status, "result for untracked endpoint");
            return Vec::new();
        };
        self.connecting = false;
        let success = status.is_success();
        if success {
            info!(endpoint_id = %endpoint_id, name = %endpoint.name, "connected");
            self.established.insert(endpoint.id.clone(), endpoint);
            self.discovery_retries = 0;
        } else {
            info!(endpoint_id = %endpoint_id, ?status, "connection failed");
        }
        vec![Action::Publish(ConnectionEvent::Result {
            success,
            established_count: self.established.len(),
        })]
    }

    /// Remove from established. Rediscovery is left to subscribers.
    pub fn on_disconnected(&mut self, endpoint_id: &EndpointId) -> Vec<Action> {
        if self.established.remove(endpoint_id).is_none() {
            debug!(endpoint_id = %endpoint_id, "disconnect for untracked endpoint");
            return Vec::new();
        }
        let dropped = self.transfers.discard_endpoint(endpoint_id);
        info!(endpoint_id = %endpoint_id, dropped_payloads = dropped, "disconnected");
        vec![Action::Publish(ConnectionEvent::Disconnect {
            established_count: self.established.len(),
        })]
    }

    pub fn on_payload_received(&mut self, endpoint_id: EndpointId, payload: IncomingPayload) {
        if !self.established.contains_key(&endpoint_id) && !self.pending.contains_key(&endpoint_id)
        {
            debug!(endpoint_id = %endpoint_id, payload_id = payload.id, "payload from untracked endpoint");
            return;
        }
        self.transfers.on_payload_received(endpoint_id, payload);
    }

    pub fn on_payload_transfer_update(
        &mut self,
        endpoint_id: &EndpointId,
        update: TransferUpdate,
    ) -> Vec<Action> {
        match self.transfers.on_transfer_update(update) {
            Some(received) => {
                debug!(endpoint_id = %endpoint_id, payload_id = received.payload_id, "delivering payload");
                vec![Action::Deliver(received)]
            }
            None => Vec::new(),
        }
    }

    fn start_advertising(&mut self, actions: &mut Vec<Action>) {
        self.advertising = true;
        actions.push(Action::Transport(TransportCommand::StartAdvertising {
            name: self.settings.endpoint_name.clone(),
            service_id: self.settings.service_id.clone(),
        }));
    }

    fn start_discovery(&mut self, actions: &mut Vec<Action>) {
        self.discovering = true;
        actions.push(Action::Transport(TransportCommand::StartDiscovery {
            service_id: self.settings.service_id.clone(),
        }));
    }

    fn stop_advertising(&mut self, actions: &mut Vec<Action>) {
        if self.advertising {
            self.advertising = false;
            actions.push(Action::Transport(TransportCommand::StopAdvertising));
        }
    }

    fn stop_discovery(&mut self, actions: &mut Vec<Action>) {
        if self.discovering {
            self.discovering = false;
            actions.push(Action::Transport(TransportCommand::StopDiscovery));
        }
    }

    /// Restart discovery after a transport failure, bounded by `max_discovery_retries`.
    fn retry_discovery(&mut self, actions: &mut Vec<Action>) {
        if self.discovering
            || !self.discovered.is_empty()
            || !self.pending.is_empty()
            || !self.established.is_empty()
        {
            return;
        }
        if self.discovery_retries >= self.settings.max_discovery_retries {
            warn!(
                retries = self.discovery_retries,
                "discovery retry limit reached, giving up until reset"
            );
            return;
        }
        self.discovery_retries += 1;
        debug!(attempt = self.discovery_retries, "restarting discovery");
        self.start_discovery(actions);
    }

    #[cfg(test)]
    fn membership(&self, id: &EndpointId) -> usize {
        [&self.discovered, &self.pending, &self.established]
            .iter()
            .filter(|set| set.contains_key(id))
            .count()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ManagerSettings::default())
    }
}
