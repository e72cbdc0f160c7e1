// Nearby LAN daemon: connect to the first peer found, log what it sends, reconnect when it goes away.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use nearby_core::{ConnectionEvent, OutgoingContent, ReceivedContent, ReceivedPayload};
use nearby_lan::{config, logging, spawn_lan_service, Config, ServiceError, ServiceHandle};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Which side of the handshake this daemon plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Both,
    Advertise,
    Discover,
}

impl Role {
    fn start(self, handle: &ServiceHandle) -> Result<(), ServiceError> {
        match self {
            Role::Both => handle.auto_connect(),
            Role::Advertise => handle.auto_advertise(),
            Role::Discover => handle.auto_discover(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut send_path = None;
    let mut role = Role::Both;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("nearby-lan {}", VERSION);
                return Ok(());
            }
            "--send" => {
                let path = args.next().context("--send requires a file path")?;
                send_path = Some(PathBuf::from(path));
            }
            "--advertise" => role = Role::Advertise,
            "--discover" => role = Role::Discover,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let cfg = config::load();
    logging::init_logging(&cfg.log_level);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, role, send_path))
}

async fn run(cfg: Config, role: Role, mut send_path: Option<PathBuf>) -> anyhow::Result<()> {
    info!(
        version = VERSION,
        endpoint_name = %cfg.endpoint_name,
        service_id = %cfg.service_id,
        ?role,
        "starting"
    );
    let (handle, task) = spawn_lan_service(&cfg);
    let mut events = handle.connection_events();
    let mut payloads = handle.received_payloads();
    role.start(&handle)?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                res?;
                info!("shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(ConnectionEvent::Result { success: true, established_count }) => {
                    info!(established_count, "connected");
                    if let Some(path) = send_path.take() {
                        send_path = send_file(&handle, path).await?;
                    }
                }
                Ok(ConnectionEvent::Result { success: false, .. }) => {
                    info!("connection attempt failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                    role.start(&handle)?;
                }
                Ok(ConnectionEvent::Disconnect { established_count }) => {
                    info!(established_count, "peer disconnected, searching again");
                    role.start(&handle)?;
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "connection events lagged"),
                Err(RecvError::Closed) => break,
            },
            payload = payloads.recv() => match payload {
                Ok(payload) => log_payload(&payload),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "payloads lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if handle.shutdown().is_ok() {
        let _ = task.await;
    }
    Ok(())
}

/// Returns the path back when nothing was connected to receive it.
async fn send_file(handle: &ServiceHandle, path: PathBuf) -> anyhow::Result<Option<PathBuf>> {
    match handle.send(OutgoingContent::File(path.clone())).await? {
        Some(payload_id) => {
            info!(payload_id, path = %path.display(), "file sent");
            Ok(None)
        }
        None => {
            warn!(path = %path.display(), "no connected endpoint, will retry");
            Ok(Some(path))
        }
    }
}

fn log_payload(payload: &ReceivedPayload) {
    match &payload.content {
        ReceivedContent::Bytes(body) => info!(
            endpoint_id = %payload.endpoint_id,
            payload_id = payload.payload_id,
            len = body.len(),
            text = %String::from_utf8_lossy(body),
            "bytes received"
        ),
        ReceivedContent::File(path) => info!(
            endpoint_id = %payload.endpoint_id,
            payload_id = payload.payload_id,
            path = %path.display(),
            "file received"
        ),
        ReceivedContent::Stream(body) => info!(
            endpoint_id = %payload.endpoint_id,
            payload_id = payload.payload_id,
            len = body.len(),
            "stream received"
        ),
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
