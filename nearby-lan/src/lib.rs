//! Nearby connection service over the LAN.
//! The service task owns a `ConnectionManager`, drives a `PeerTransport`, and
//! publishes connection events and completed payloads on an `EventBus`.

pub mod bus;
pub mod config;
pub mod discovery;
pub mod lan;
pub mod link;
pub mod logging;
pub mod service;
pub mod transport;

pub use bus::EventBus;
pub use config::Config;
pub use lan::{LanSettings, LanTransport};
pub use link::LinkError;
pub use service::{ConnectionService, ServiceError, ServiceHandle};
pub use transport::{EventSink, PeerTransport};

/// Start the connection service over the LAN transport.
pub fn spawn_lan_service(config: &Config) -> (ServiceHandle, tokio::task::JoinHandle<()>) {
    let lan_settings = config.lan_settings();
    ConnectionService::spawn(
        config.manager_settings(),
        EventBus::new(config.event_capacity),
        move |sink| LanTransport::new(lan_settings, sink),
    )
}
