//! Event bus: non-replaying broadcast of connection events and completed payloads.
//!
//! Every subscriber gets its own bounded buffer. Publishing never waits on a
//! subscriber; one that falls behind loses its oldest events and sees
//! `RecvError::Lagged` on its next receive. Subscribers only observe events
//! published after they subscribed.

use nearby_core::{ConnectionEvent, ReceivedPayload};
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    connections: broadcast::Sender<ConnectionEvent>,
    payloads: broadcast::Sender<ReceivedPayload>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (connections, _) = broadcast::channel(capacity);
        let (payloads, _) = broadcast::channel(capacity);
        Self {
            connections,
            payloads,
        }
    }

    pub fn publish_connection(&self, event: ConnectionEvent) {
        let _ = self.connections.send(event);
    }

    pub fn publish_payload(&self, payload: ReceivedPayload) {
        let _ = self.payloads.send(payload);
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    pub fn received_payloads(&self) -> broadcast::Receiver<ReceivedPayload> {
        self.payloads.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.connections.receiver_count() + self.payloads.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use nearby_core::{EndpointId, ReceivedContent};
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    use super::*;

    fn disconnect(n: usize) -> ConnectionEvent {
        ConnectionEvent::Disconnect {
            established_count: n,
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.connection_events();
        let mut rx2 = bus.connection_events();

        bus.publish_connection(ConnectionEvent::Result {
            success: true,
            established_count: 1,
        });

        let expected = ConnectionEvent::Result {
            success: true,
            established_count: 1,
        };
        assert_eq!(rx1.recv().await.unwrap(), expected);
        assert_eq!(rx2.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn late_subscriber_misses_history() {
        let bus = EventBus::default();
        bus.publish_connection(disconnect(0));
        let mut late = bus.connection_events();
        assert!(matches!(late.try_recv(), Err(TryRecvError::Empty)));
        bus.publish_connection(disconnect(1));
        assert_eq!(late.recv().await.unwrap(), disconnect(1));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish_connection(disconnect(0));
        bus.publish_payload(ReceivedPayload {
            endpoint_id: EndpointId::new("E1"),
            payload_id: 1,
            content: ReceivedContent::Bytes(Bytes::new()),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut slow = bus.connection_events();
        let mut fast = bus.connection_events();
        for n in 0..5 {
            bus.publish_connection(disconnect(n));
            assert_eq!(fast.recv().await.unwrap(), disconnect(n));
        }
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(3))));
        assert_eq!(slow.recv().await.unwrap(), disconnect(3));
        assert_eq!(slow.recv().await.unwrap(), disconnect(4));
    }

    #[tokio::test]
    async fn payload_channel_is_independent() {
        let bus = EventBus::default();
        let mut payloads = bus.received_payloads();
        let mut connections = bus.connection_events();
        let received = ReceivedPayload {
            endpoint_id: EndpointId::new("E1"),
            payload_id: 3,
            content: ReceivedContent::Stream(Bytes::from_static(b"frame")),
        };
        bus.publish_payload(received.clone());
        assert_eq!(payloads.recv().await.unwrap(), received);
        assert!(matches!(connections.try_recv(), Err(TryRecvError::Empty)));
    }
}
