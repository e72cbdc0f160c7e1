//! Connection service: one task owns the manager and the transport; everything else sends it messages.

use nearby_core::{
    Action, ConnectionEvent, ConnectionManager, ConnectionPhase, ManagerSettings,
    ManagerSnapshot, OutgoingContent, PayloadId, ReceivedPayload, TransportEvent,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::EventBus;
use crate::transport::{execute, EventSink, PeerTransport};

/// Messages processed by the service task, strictly in arrival order.
pub(crate) enum Command {
    AutoConnect,
    AutoAdvertise,
    AutoDiscover,
    Reset,
    Send {
        content: OutgoingContent,
        reply: oneshot::Sender<Option<PayloadId>>,
    },
    Snapshot(oneshot::Sender<ManagerSnapshot>),
    Transport(TransportEvent),
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("connection service has stopped")]
    Stopped,
}

/// Cheap, cloneable front door to a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    tx: mpsc::UnboundedSender<Command>,
    bus: EventBus,
    phase: watch::Receiver<ConnectionPhase>,
}

impl ServiceHandle {
    pub fn auto_connect(&self) -> Result<(), ServiceError> {
        self.submit(Command::AutoConnect)
    }

    /// Advertise only; a discovering peer initiates the link.
    pub fn auto_advertise(&self) -> Result<(), ServiceError> {
        self.submit(Command::AutoAdvertise)
    }

    /// Discover only; links are requested to advertising peers.
    pub fn auto_discover(&self) -> Result<(), ServiceError> {
        self.submit(Command::AutoDiscover)
    }

    pub fn reset(&self) -> Result<(), ServiceError> {
        self.submit(Command::Reset)
    }

    /// Send to every established endpoint. `None` when nothing is established.
    pub async fn send(&self, content: OutgoingContent) -> Result<Option<PayloadId>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Send { content, reply })?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    /// Phase as of the last message the service finished processing.
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.borrow()
    }

    /// Wait until the phase satisfies `f`.
    pub async fn wait_for_phase<F>(&self, mut f: F) -> Result<ConnectionPhase, ServiceError>
    where
        F: FnMut(ConnectionPhase) -> bool,
    {
        let mut rx = self.phase.clone();
        let phase = rx
            .wait_for(|p| f(*p))
            .await
            .map_err(|_| ServiceError::Stopped)?;
        Ok(*phase)
    }

    /// Snapshot taken after every message queued before this call.
    pub async fn snapshot(&self) -> Result<ManagerSnapshot, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Snapshot(reply))?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.bus.connection_events()
    }

    pub fn received_payloads(&self) -> broadcast::Receiver<ReceivedPayload> {
        self.bus.received_payloads()
    }

    /// Reset and stop the service task.
    pub fn shutdown(&self) -> Result<(), ServiceError> {
        self.submit(Command::Shutdown)
    }

    fn submit(&self, command: Command) -> Result<(), ServiceError> {
        self.tx.send(command).map_err(|_| ServiceError::Stopped)
    }
}

pub struct ConnectionService<T> {
    manager: ConnectionManager,
    transport: T,
    bus: EventBus,
    phase: watch::Sender<ConnectionPhase>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl<T: PeerTransport> ConnectionService<T> {
    /// Build the transport around the service's sink and start the service task.
    pub fn spawn<F>(
        settings: ManagerSettings,
        bus: EventBus,
        make_transport: F,
    ) -> (ServiceHandle, JoinHandle<()>)
    where
        F: FnOnce(EventSink) -> T,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = make_transport(EventSink::new(tx.clone()));
        let manager = ConnectionManager::new(settings);
        let (phase_tx, phase_rx) = watch::channel(manager.phase());
        let service = Self {
            manager,
            transport,
            bus: bus.clone(),
            phase: phase_tx,
            rx,
        };
        let task = tokio::spawn(service.run());
        let handle = ServiceHandle {
            tx,
            bus,
            phase: phase_rx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        info!(
            endpoint_name = %self.manager.settings().endpoint_name,
            service_id = %self.manager.settings().service_id,
            "connection service started"
        );
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::AutoConnect => {
                    let actions = self.manager.auto_connect();
                    self.apply(actions);
                }
                Command::AutoAdvertise => {
                    let actions = self.manager.auto_advertise();
                    self.apply(actions);
                }
                Command::AutoDiscover => {
                    let actions = self.manager.auto_discover();
                    self.apply(actions);
                }
                Command::Reset => {
                    let actions = self.manager.reset();
                    self.apply(actions);
                }
                Command::Send { content, reply } => {
                    let id = match self.manager.send(content) {
                        Some((id, action)) => {
                            self.apply(vec![action]);
                            Some(id)
                        }
                        None => None,
                    };
                    let _ = reply.send(id);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.manager.snapshot());
                }
                Command::Transport(event) => {
                    let actions = self.manager.handle(event);
                    self.apply(actions);
                }
                Command::Shutdown => {
                    let actions = self.manager.reset();
                    self.apply(actions);
                    self.publish_phase();
                    break;
                }
            }
            self.publish_phase();
        }
        info!("connection service stopped");
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transport(command) => {
                    debug!(?command, "transport command");
                    execute(&mut self.transport, command);
                }
                Action::Publish(event) => self.bus.publish_connection(event),
                Action::Deliver(payload) => self.bus.publish_payload(payload),
            }
        }
    }

    fn publish_phase(&self) {
        let phase = self.manager.phase();
        self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                debug!(from = ?*current, to = ?phase, "phase changed");
                *current = phase;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use nearby_core::{
        stream_pipe, ConnectionInfo, ConnectionStatus, DiscoveredEndpointInfo, EndpointId,
        IncomingContent, IncomingPayload, OutgoingPayload, ReceivedContent, TransferStatus,
        TransferUpdate, SERVICE_ID,
    };
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        StartAdvertising,
        StartDiscovery,
        StopAdvertising,
        StopDiscovery,
        StopAll,
        Request(EndpointId),
        Accept(EndpointId),
        Reject(EndpointId),
        Send(Vec<EndpointId>),
    }

    /// Records calls; callbacks are injected by the test through the sink.
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl PeerTransport for RecordingTransport {
        fn start_advertising(&mut self, _name: &str, _service_id: &str) {
            self.calls.lock().push(Call::StartAdvertising);
        }
        fn start_discovery(&mut self, _service_id: &str) {
            self.calls.lock().push(Call::StartDiscovery);
        }
        fn stop_advertising(&mut self) {
            self.calls.lock().push(Call::StopAdvertising);
        }
        fn stop_discovery(&mut self) {
            self.calls.lock().push(Call::StopDiscovery);
        }
        fn stop_all(&mut self) {
            self.calls.lock().push(Call::StopAll);
        }
        fn request_connection(&mut self, _local_name: &str, endpoint_id: &EndpointId) {
            self.calls.lock().push(Call::Request(endpoint_id.clone()));
        }
        fn accept_connection(&mut self, endpoint_id: &EndpointId) {
            self.calls.lock().push(Call::Accept(endpoint_id.clone()));
        }
        fn reject_connection(&mut self, endpoint_id: &EndpointId) {
            self.calls.lock().push(Call::Reject(endpoint_id.clone()));
        }
        fn send_payload(&mut self, endpoint_ids: &[EndpointId], _payload: OutgoingPayload) {
            self.calls.lock().push(Call::Send(endpoint_ids.to_vec()));
        }
    }

    struct Harness {
        handle: ServiceHandle,
        sink: EventSink,
        calls: Arc<Mutex<Vec<Call>>>,
    }

    fn harness() -> Harness {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut sink_slot = None;
        let recorder = calls.clone();
        let (handle, _task) =
            ConnectionService::spawn(ManagerSettings::default(), EventBus::default(), |sink| {
                sink_slot = Some(sink);
                RecordingTransport { calls: recorder }
            });
        Harness {
            handle,
            sink: sink_slot.unwrap(),
            calls,
        }
    }

    fn e1() -> EndpointId {
        EndpointId::new("E1")
    }

    fn found(id: EndpointId) -> TransportEvent {
        TransportEvent::EndpointFound {
            endpoint_id: id,
            info: DiscoveredEndpointInfo {
                service_id: SERVICE_ID.to_owned(),
                endpoint_name: "robot".to_owned(),
            },
        }
    }

    fn initiated(id: EndpointId) -> TransportEvent {
        TransportEvent::ConnectionInitiated {
            endpoint_id: id,
            info: ConnectionInfo {
                endpoint_name: "robot".to_owned(),
                authentication_token: "0042".to_owned(),
                is_incoming: false,
            },
        }
    }

    fn result(id: EndpointId, status: ConnectionStatus) -> TransportEvent {
        TransportEvent::ConnectionResult {
            endpoint_id: id,
            status,
        }
    }

    async fn connect(h: &Harness) {
        h.handle.auto_connect().unwrap();
        h.sink.emit(found(e1()));
        h.sink.emit(initiated(e1()));
        h.sink.emit(result(e1(), ConnectionStatus::Ok));
        h.handle.snapshot().await.unwrap();
    }

    #[tokio::test]
    async fn found_then_connected_publishes_result() {
        let h = harness();
        let mut events = h.handle.connection_events();
        h.handle.auto_connect().unwrap();
        h.sink.emit(found(e1()));
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.phase, ConnectionPhase::Searching);
        assert!(snap.connecting);

        h.sink.emit(initiated(e1()));
        h.sink.emit(result(e1(), ConnectionStatus::Ok));
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.phase, ConnectionPhase::Connected);
        assert_eq!(snap.established, 1);
        assert_eq!(h.handle.phase(), ConnectionPhase::Connected);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Result {
                success: true,
                established_count: 1
            }
        );
        assert_eq!(
            *h.calls.lock(),
            vec![
                Call::StartAdvertising,
                Call::StartDiscovery,
                Call::StopDiscovery,
                Call::Request(e1()),
                Call::StopAdvertising,
                Call::Accept(e1()),
            ]
        );
    }

    #[tokio::test]
    async fn auto_connect_while_searching_makes_no_transport_calls() {
        let h = harness();
        h.handle.auto_connect().unwrap();
        h.handle.snapshot().await.unwrap();
        let before = h.calls.lock().len();
        h.handle.auto_connect().unwrap();
        h.handle.auto_connect().unwrap();
        h.handle.snapshot().await.unwrap();
        let calls = h.calls.lock();
        assert_eq!(calls.len(), before);
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, Call::StartDiscovery))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn auto_advertise_starts_advertiser_only() {
        let h = harness();
        h.handle.auto_advertise().unwrap();
        h.handle.auto_advertise().unwrap();
        h.handle.auto_connect().unwrap();
        h.handle.snapshot().await.unwrap();
        assert_eq!(h.handle.phase(), ConnectionPhase::Searching);
        assert_eq!(*h.calls.lock(), vec![Call::StartAdvertising]);
    }

    #[tokio::test]
    async fn auto_discover_requests_first_advertiser() {
        let h = harness();
        h.handle.auto_discover().unwrap();
        h.sink.emit(found(e1()));
        let snapshot = h.handle.snapshot().await.unwrap();
        assert!(!snapshot.advertising);
        assert_eq!(
            *h.calls.lock(),
            vec![Call::StartDiscovery, Call::StopDiscovery, Call::Request(e1())]
        );
    }

    #[tokio::test]
    async fn disconnect_returns_to_idle_and_publishes() {
        let h = harness();
        connect(&h).await;
        let mut events = h.handle.connection_events();
        h.sink.emit(TransportEvent::Disconnected { endpoint_id: e1() });
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.phase, ConnectionPhase::Idle);
        assert_eq!(snap.established, 0);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Disconnect {
                established_count: 0
            }
        );
    }

    #[tokio::test]
    async fn failed_result_returns_to_idle() {
        let h = harness();
        let mut events = h.handle.connection_events();
        h.handle.auto_connect().unwrap();
        h.sink.emit(found(e1()));
        h.sink.emit(initiated(e1()));
        h.sink.emit(result(e1(), ConnectionStatus::Rejected));
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.phase, ConnectionPhase::Idle);
        assert_eq!(snap.pending, 0);
        assert!(!snap.connecting);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Result {
                success: false,
                established_count: 0
            }
        );
    }

    #[tokio::test]
    async fn reset_twice_yields_same_empty_state() {
        let h = harness();
        connect(&h).await;
        h.handle.reset().unwrap();
        let first = h.handle.snapshot().await.unwrap();
        h.handle.reset().unwrap();
        let second = h.handle.snapshot().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.phase, ConnectionPhase::Idle);
        assert_eq!(
            h.calls
                .lock()
                .iter()
                .filter(|c| matches!(c, Call::StopAll))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn send_reaches_established_endpoints_only() {
        let h = harness();
        let none = h
            .handle
            .send(OutgoingContent::Bytes(Bytes::from_static(b"1,50,50")))
            .await
            .unwrap();
        assert!(none.is_none());
        connect(&h).await;
        let id = h
            .handle
            .send(OutgoingContent::Bytes(Bytes::from_static(b"1,50,50")))
            .await
            .unwrap();
        assert!(id.is_some());
        assert_eq!(h.calls.lock().last(), Some(&Call::Send(vec![e1()])));
    }

    #[tokio::test]
    async fn stream_payload_published_once() {
        let h = harness();
        connect(&h).await;
        let mut payloads = h.handle.received_payloads();
        let (writer, reader) = stream_pipe();
        h.sink.emit(TransportEvent::PayloadReceived {
            endpoint_id: e1(),
            payload: IncomingPayload {
                id: 11,
                total_bytes: None,
                content: IncomingContent::Stream(reader),
            },
        });
        let update = |status| TransportEvent::PayloadTransferUpdate {
            endpoint_id: e1(),
            update: TransferUpdate {
                payload_id: 11,
                status,
                bytes_transferred: 0,
                total_bytes: None,
            },
        };
        for chunk in [&b"b0"[..], b"b1", b"b2"] {
            writer.write(chunk.to_vec()).unwrap();
            h.sink.emit(update(TransferStatus::InProgress));
            // Let the service read this chunk before the next one lands.
            h.handle.snapshot().await.unwrap();
        }
        h.sink.emit(update(TransferStatus::Success));
        h.sink.emit(update(TransferStatus::Success));
        h.handle.snapshot().await.unwrap();

        let received = payloads.recv().await.unwrap();
        assert_eq!(received.payload_id, 11);
        assert_eq!(
            received.content,
            ReceivedContent::Stream(Bytes::from_static(b"b0b1b2"))
        );
        assert!(matches!(
            payloads.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn phase_watch_follows_state() {
        let h = harness();
        assert_eq!(h.handle.phase(), ConnectionPhase::Idle);
        h.handle.auto_connect().unwrap();
        let phase = h
            .handle
            .wait_for_phase(|p| p == ConnectionPhase::Searching)
            .await
            .unwrap();
        assert_eq!(phase, ConnectionPhase::Searching);
    }

    #[tokio::test]
    async fn shutdown_stops_transport_and_task() {
        let h = harness();
        connect(&h).await;
        h.handle.shutdown().unwrap();
        assert!(matches!(
            h.handle.snapshot().await,
            Err(ServiceError::Stopped)
        ));
        assert_eq!(h.calls.lock().last(), Some(&Call::StopAll));
    }
}
