//! LAN transport: multicast discovery plus encrypted TCP links, driven through `PeerTransport`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nearby_core::{EndpointId, Keypair, OutgoingContent, OutgoingPayload, TransportEvent};
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::discovery::{self, AdvertiseParams, DiscoverParams, PeerTable, SharedPeers};
use crate::link::{self, LinkContext, LinkControl, LinkRegistry, MAX_CHUNK_SIZE};
use crate::transport::{EventSink, PeerTransport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanSettings {
    pub discovery_port: u16,
    /// TCP port for incoming links; 0 picks an ephemeral port.
    pub transport_port: u16,
    pub beacon_interval: Duration,
    pub endpoint_timeout: Duration,
    pub chunk_size: usize,
    pub download_dir: PathBuf,
}

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            discovery_port: 45680,
            transport_port: 0,
            beacon_interval: Duration::from_millis(2000),
            endpoint_timeout: Duration::from_millis(8000),
            chunk_size: 32 * 1024,
            download_dir: std::env::temp_dir().join("nearby"),
        }
    }
}

pub struct LanTransport {
    settings: LanSettings,
    ctx: LinkContext,
    peers: SharedPeers,
    advertiser: Option<JoinHandle<()>>,
    discoverer: Option<JoinHandle<()>>,
    /// Outgoing handshakes; each open link then runs on its own task.
    handshakes: JoinSet<()>,
}

impl LanTransport {
    /// New transport with a fresh identity. Must be created inside a tokio runtime.
    pub fn new(settings: LanSettings, sink: EventSink) -> Self {
        Self::with_keypair(settings, Keypair::generate(), sink)
    }

    pub fn with_keypair(settings: LanSettings, keypair: Keypair, sink: EventSink) -> Self {
        let ctx = LinkContext {
            keypair: Arc::new(keypair),
            sink,
            links: LinkRegistry::default(),
            chunk_size: settings.chunk_size.clamp(1, MAX_CHUNK_SIZE),
            download_dir: settings.download_dir.clone(),
        };
        info!(endpoint_id = %ctx.keypair.endpoint_id(), "lan transport ready");
        Self {
            settings,
            ctx,
            peers: Arc::new(Mutex::new(PeerTable::default())),
            advertiser: None,
            discoverer: None,
            handshakes: JoinSet::new(),
        }
    }

    pub fn endpoint_id(&self) -> &EndpointId {
        self.ctx.keypair.endpoint_id()
    }

    fn control(&self, endpoint_id: &EndpointId, control: LinkControl) {
        if !self.ctx.links.control(endpoint_id, control) {
            warn!(endpoint_id = %endpoint_id, "no link to endpoint");
        }
    }
}

fn abort(task: &mut Option<JoinHandle<()>>) -> bool {
    match task.take() {
        Some(task) => {
            task.abort();
            true
        }
        None => false,
    }
}

/// Bytes and files can go to many endpoints; a stream is consumed by its first receiver.
fn duplicate(content: &OutgoingContent) -> Option<OutgoingContent> {
    match content {
        OutgoingContent::Bytes(b) => Some(OutgoingContent::Bytes(b.clone())),
        OutgoingContent::File(p) => Some(OutgoingContent::File(p.clone())),
        OutgoingContent::Stream(_) => None,
    }
}

impl PeerTransport for LanTransport {
    fn start_advertising(&mut self, name: &str, service_id: &str) {
        abort(&mut self.advertiser);
        let params = AdvertiseParams {
            name: name.to_owned(),
            service_id: service_id.to_owned(),
            transport_port: self.settings.transport_port,
            discovery_port: self.settings.discovery_port,
            beacon_interval: self.settings.beacon_interval,
        };
        self.advertiser = Some(tokio::spawn(discovery::advertise(self.ctx.clone(), params)));
    }

    fn start_discovery(&mut self, service_id: &str) {
        abort(&mut self.discoverer);
        self.peers.lock().clear();
        let params = DiscoverParams {
            local_id: self.endpoint_id().clone(),
            service_id: service_id.to_owned(),
            discovery_port: self.settings.discovery_port,
            endpoint_timeout: self.settings.endpoint_timeout,
        };
        self.discoverer = Some(tokio::spawn(discovery::discover(
            self.ctx.sink.clone(),
            self.peers.clone(),
            params,
        )));
    }

    fn stop_advertising(&mut self) {
        if abort(&mut self.advertiser) {
            info!("advertising stopped");
        }
    }

    fn stop_discovery(&mut self) {
        if abort(&mut self.discoverer) {
            info!("discovery stopped");
        }
    }

    fn stop_all(&mut self) {
        self.stop_advertising();
        self.stop_discovery();
        self.peers.lock().clear();
        self.ctx.links.close_all();
        while self.handshakes.try_join_next().is_some() {}
        if !self.handshakes.is_empty() {
            debug!(pending = self.handshakes.len(), "abandoning connection requests");
            self.handshakes.abort_all();
        }
    }

    fn request_connection(&mut self, local_name: &str, endpoint_id: &EndpointId) {
        let Some(addr) = self.peers.lock().address(endpoint_id) else {
            self.ctx.sink.emit(TransportEvent::ConnectionRequestFailed {
                endpoint_id: endpoint_id.clone(),
                reason: "endpoint address unknown".to_owned(),
            });
            return;
        };
        debug!(endpoint_id = %endpoint_id, %addr, "requesting connection");
        while self.handshakes.try_join_next().is_some() {}
        self.handshakes.spawn(link::connect(
            self.ctx.clone(),
            addr,
            local_name.to_owned(),
            endpoint_id.clone(),
            self.ctx.links.epoch(),
        ));
    }

    fn accept_connection(&mut self, endpoint_id: &EndpointId) {
        self.control(endpoint_id, LinkControl::Accept);
    }

    fn reject_connection(&mut self, endpoint_id: &EndpointId) {
        self.control(endpoint_id, LinkControl::Reject);
    }

    fn send_payload(&mut self, endpoint_ids: &[EndpointId], payload: OutgoingPayload) {
        let OutgoingPayload { id, content } = payload;
        let Some((last, rest)) = endpoint_ids.split_last() else {
            return;
        };
        for endpoint_id in rest {
            match duplicate(&content) {
                Some(content) => self.control(endpoint_id, LinkControl::Send(OutgoingPayload { id, content })),
                None => {
                    warn!(payload_id = id, endpoint_id = %endpoint_id, "stream payload sent to a single endpoint");
                    self.control(endpoint_id, LinkControl::Send(OutgoingPayload { id, content }));
                    return;
                }
            }
        }
        self.control(last, LinkControl::Send(OutgoingPayload { id, content }));
    }
}

impl Drop for LanTransport {
    fn drop(&mut self) {
        abort(&mut self.advertiser);
        abort(&mut self.discoverer);
        self.ctx.links.close_all();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    use bytes::Bytes;
    use nearby_core::{Message, PROTOCOL_VERSION, SERVICE_ID};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::service::Command;

    fn transport() -> (LanTransport, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            LanTransport::new(LanSettings::default(), EventSink::new(tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn request_to_unknown_endpoint_fails_immediately() {
        let (mut lan, mut rx) = transport();
        let target = EndpointId::new("a1b2c3d4");
        lan.request_connection("me", &target);
        let Some(Command::Transport(TransportEvent::ConnectionRequestFailed { endpoint_id, .. })) =
            rx.recv().await
        else {
            panic!("expected request failure");
        };
        assert_eq!(endpoint_id, target);
    }

    #[tokio::test]
    async fn stop_all_abandons_connection_in_progress() {
        let (mut lan, mut rx) = transport();
        let (remote, _remote_rx) = transport();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_port = listener.local_addr().unwrap().port();
        let remote_ctx = remote.ctx.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Slow acceptor: the requester is still in its handshake when stop_all runs.
            tokio::time::sleep(Duration::from_millis(300)).await;
            let epoch = remote_ctx.links.epoch();
            link::accept(remote_ctx, stream, "remote".to_owned(), epoch).await;
        });
        let advertisement = Message::Advertisement {
            protocol_version: PROTOCOL_VERSION,
            service_id: SERVICE_ID.to_owned(),
            endpoint_id: remote.endpoint_id().clone(),
            endpoint_name: "remote".to_owned(),
            listen_port,
        };
        let local_id = lan.endpoint_id().clone();
        assert!(lan
            .peers
            .lock()
            .observe(
                &advertisement,
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                &local_id,
                SERVICE_ID,
                Instant::now(),
            )
            .is_some());

        lan.request_connection("me", remote.endpoint_id());
        lan.stop_all();

        let initiated = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(command) = rx.recv().await {
                if let Command::Transport(TransportEvent::ConnectionInitiated { .. }) = command {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(!matches!(initiated, Ok(true)));
        assert!(lan.ctx.links.is_empty());
    }

    #[tokio::test]
    async fn stop_all_is_safe_when_idle() {
        let (mut lan, _rx) = transport();
        lan.stop_all();
        lan.stop_all();
        assert!(lan.ctx.links.is_empty());
        assert!(lan.peers.lock().is_empty());
    }

    #[test]
    fn only_bytes_and_files_duplicate() {
        assert!(duplicate(&OutgoingContent::Bytes(Bytes::from_static(b"x"))).is_some());
        assert!(duplicate(&OutgoingContent::File(PathBuf::from("/tmp/x"))).is_some());
        assert!(duplicate(&OutgoingContent::Stream(Box::new(std::io::empty()))).is_none());
    }

    #[test]
    fn default_settings() {
        let s = LanSettings::default();
        assert_eq!(s.discovery_port, 45680);
        assert_eq!(s.transport_port, 0);
        assert_eq!(s.chunk_size, 32768);
        assert!(s.download_dir.ends_with("nearby"));
    }
}
