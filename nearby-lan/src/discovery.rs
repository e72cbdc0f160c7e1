//! LAN discovery: UDP multicast advertisement beacons, endpoint table with expiry,
//! and the TCP listener that serves incoming links while advertising.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nearby_core::wire::{decode_frame, encode_frame};
use nearby_core::{DiscoveredEndpointInfo, EndpointId, Message, TransportEvent, PROTOCOL_VERSION};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::link::{self, LinkContext};
use crate::transport::EventSink;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 61, 61);
const MIN_TICK: Duration = Duration::from_millis(50);

struct PeerEntry {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Endpoints heard from since discovery last started.
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<EndpointId, PeerEntry>,
}

pub type SharedPeers = Arc<Mutex<PeerTable>>;

impl PeerTable {
    /// Record an advertisement. Returns the endpoint when it was not known yet.
    pub fn observe(
        &mut self,
        msg: &Message,
        from: IpAddr,
        local_id: &EndpointId,
        service_id: &str,
        now: Instant,
    ) -> Option<(EndpointId, DiscoveredEndpointInfo)> {
        let Message::Advertisement {
            protocol_version,
            service_id: advertised,
            endpoint_id,
            endpoint_name,
            listen_port,
        } = msg
        else {
            return None;
        };
        if *protocol_version != PROTOCOL_VERSION || advertised != service_id {
            return None;
        }
        if endpoint_id == local_id {
            return None;
        }
        let addr = SocketAddr::new(from, *listen_port);
        let is_new = self
            .peers
            .insert(
                endpoint_id.clone(),
                PeerEntry {
                    addr,
                    last_seen: now,
                },
            )
            .is_none();
        is_new.then(|| {
            (
                endpoint_id.clone(),
                DiscoveredEndpointInfo {
                    service_id: advertised.clone(),
                    endpoint_name: endpoint_name.clone(),
                },
            )
        })
    }

    /// Drop endpoints not heard from within `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<EndpointId> {
        let stale: Vec<EndpointId> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn address(&self, endpoint_id: &EndpointId) -> Option<SocketAddr> {
        self.peers.get(endpoint_id).map(|p| p.addr)
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Receive socket bound to the discovery port and joined to the multicast group.
/// Address reuse lets several endpoints on one host discover together.
fn multicast_listener(discovery_port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, discovery_port).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// Send-only socket for beacons; link-local scope.
fn multicast_sender() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

pub struct AdvertiseParams {
    pub name: String,
    pub service_id: String,
    pub transport_port: u16,
    pub discovery_port: u16,
    pub beacon_interval: Duration,
}

/// Bind the link listener, report the start, then beacon and accept until aborted.
pub async fn advertise(ctx: LinkContext, params: AdvertiseParams) {
    let started = async {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, params.transport_port)).await?;
        let sender = multicast_sender()?;
        let listen_port = listener.local_addr()?.port();
        let beacon = encode_frame(&Message::Advertisement {
            protocol_version: PROTOCOL_VERSION,
            service_id: params.service_id.clone(),
            endpoint_id: ctx.keypair.endpoint_id().clone(),
            endpoint_name: params.name.clone(),
            listen_port,
        })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok::<_, io::Error>((listener, sender, beacon, listen_port))
    }
    .await;
    let (listener, sender, beacon, listen_port) = match started {
        Ok(parts) => parts,
        Err(e) => {
            warn!(error = %e, "advertising failed to start");
            ctx.sink
                .emit(TransportEvent::AdvertisingStarted(Err(e.to_string())));
            return;
        }
    };
    info!(name = %params.name, listen_port, "advertising");
    ctx.sink.emit(TransportEvent::AdvertisingStarted(Ok(())));

    let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, params.discovery_port));
    let mut beacon_tick = tokio::time::interval(params.beacon_interval.max(MIN_TICK));
    // Aborted with this task; open links run on their own tasks.
    let mut handshakes = JoinSet::new();
    loop {
        while handshakes.try_join_next().is_some() {}
        tokio::select! {
            _ = beacon_tick.tick() => {
                if let Err(e) = sender.send_to(&beacon, dest).await {
                    debug!(error = %e, "beacon send failed");
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, from)) => {
                    debug!(%from, "incoming link");
                    let epoch = ctx.links.epoch();
                    handshakes.spawn(link::accept(
                        ctx.clone(),
                        stream,
                        params.name.clone(),
                        epoch,
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
}

pub struct DiscoverParams {
    pub local_id: EndpointId,
    pub service_id: String,
    pub discovery_port: u16,
    pub endpoint_timeout: Duration,
}

/// Join the group, report the start, then track advertisements until aborted.
pub async fn discover(sink: EventSink, peers: SharedPeers, params: DiscoverParams) {
    let socket = match multicast_listener(params.discovery_port) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(port = params.discovery_port, error = %e, "discovery failed to start");
            sink.emit(TransportEvent::DiscoveryStarted(Err(e.to_string())));
            return;
        }
    };
    info!(
        service_id = %params.service_id,
        port = params.discovery_port,
        "discovering"
    );
    sink.emit(TransportEvent::DiscoveryStarted(Ok(())));

    let mut buf = vec![0u8; 65536];
    let mut expiry_tick = tokio::time::interval((params.endpoint_timeout / 2).max(MIN_TICK));
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "discovery receive failed");
                        continue;
                    }
                };
                let Ok((msg, _)) = decode_frame(&buf[..n]) else {
                    continue;
                };
                let found = peers.lock().observe(
                    &msg,
                    from.ip(),
                    &params.local_id,
                    &params.service_id,
                    Instant::now(),
                );
                if let Some((endpoint_id, info)) = found {
                    sink.emit(TransportEvent::EndpointFound { endpoint_id, info });
                }
            }
            _ = expiry_tick.tick() => {
                let lost = peers.lock().expire(Instant::now(), params.endpoint_timeout);
                for endpoint_id in lost {
                    sink.emit(TransportEvent::EndpointLost { endpoint_id });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "com.kanawish.nearby";

    fn advertisement(id: &str, service_id: &str, port: u16) -> Message {
        Message::Advertisement {
            protocol_version: PROTOCOL_VERSION,
            service_id: service_id.to_owned(),
            endpoint_id: EndpointId::new(id),
            endpoint_name: format!("robot-{id}"),
            listen_port: port,
        }
    }

    fn lan_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))
    }

    #[test]
    fn first_advertisement_reports_endpoint_once() {
        let mut table = PeerTable::default();
        let me = EndpointId::new("00000000");
        let now = Instant::now();
        let msg = advertisement("a1b2c3d4", SERVICE, 45681);

        let (id, info) = table.observe(&msg, lan_ip(), &me, SERVICE, now).unwrap();
        assert_eq!(id, EndpointId::new("a1b2c3d4"));
        assert_eq!(info.endpoint_name, "robot-a1b2c3d4");
        assert_eq!(info.service_id, SERVICE);
        assert!(table.observe(&msg, lan_ip(), &me, SERVICE, now).is_none());
        assert_eq!(
            table.address(&id),
            Some(SocketAddr::new(lan_ip(), 45681))
        );
    }

    #[test]
    fn own_and_foreign_advertisements_ignored() {
        let mut table = PeerTable::default();
        let me = EndpointId::new("00000000");
        let now = Instant::now();
        let own = advertisement("00000000", SERVICE, 1);
        let foreign = advertisement("a1b2c3d4", "com.example.other", 1);
        assert!(table.observe(&own, lan_ip(), &me, SERVICE, now).is_none());
        assert!(table.observe(&foreign, lan_ip(), &me, SERVICE, now).is_none());
        assert!(table
            .observe(&Message::Goodbye, lan_ip(), &me, SERVICE, now)
            .is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn silent_endpoints_expire() {
        let mut table = PeerTable::default();
        let me = EndpointId::new("00000000");
        let start = Instant::now();
        let timeout = Duration::from_secs(8);
        table.observe(&advertisement("aaaaaaaa", SERVICE, 1), lan_ip(), &me, SERVICE, start);
        table.observe(
            &advertisement("bbbbbbbb", SERVICE, 2),
            lan_ip(),
            &me,
            SERVICE,
            start + Duration::from_secs(5),
        );

        let lost = table.expire(start + Duration::from_secs(9), timeout);
        assert_eq!(lost, vec![EndpointId::new("aaaaaaaa")]);
        assert_eq!(table.len(), 1);
        assert!(table
            .observe(
                &advertisement("aaaaaaaa", SERVICE, 1),
                lan_ip(),
                &me,
                SERVICE,
                start + Duration::from_secs(10)
            )
            .is_some());
    }
}
