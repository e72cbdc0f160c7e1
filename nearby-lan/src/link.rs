//! TCP links: plaintext hello, X25519 key exchange, encrypted frames, accept/reject negotiation
//! and payload transfer in both directions.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nearby_core::identity::{
    authentication_token, decrypt_wire, derive_session_keys, encrypt_wire, endpoint_id_for,
    SessionKeys, WireCryptoError,
};
use nearby_core::integrity::PayloadHasher;
use nearby_core::wire::{decode_message, encode_message, frame_len, len_prefix, LEN_SIZE};
use nearby_core::{
    encode_frame, stream_pipe, ConnectionInfo, ConnectionStatus, EndpointId, FrameDecodeError,
    FrameEncodeError, IncomingContent, IncomingPayload, Keypair, Message, OutgoingContent,
    OutgoingPayload, PayloadId, PayloadKind, StreamWriter, TransferStatus, TransferUpdate,
    TransportEvent, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::EventSink;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a closing link waits for queued frames (e.g. `Goodbye`) to reach the socket.
const CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Largest plaintext chunk per frame; leaves room under the frame cap for the payload
/// header and the AEAD tag.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;
const OUTBOUND_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Encode(#[from] FrameEncodeError),
    #[error("{0}")]
    Decode(#[from] FrameDecodeError),
    #[error("{0}")]
    Crypto(#[from] WireCryptoError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("link closed")]
    Closed,
}

/// Instruction for one running link.
#[derive(Debug)]
pub enum LinkControl {
    Accept,
    Reject,
    Send(OutgoingPayload),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Requester,
    Acceptor,
}

struct LinkHandle {
    control: mpsc::UnboundedSender<LinkControl>,
    link_no: u64,
}

#[derive(Default)]
struct Links {
    by_endpoint: HashMap<EndpointId, LinkHandle>,
    next_no: u64,
    /// Bumped by `close_all`; handshakes begun under an older epoch may not register.
    epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refused {
    Duplicate,
    Stale,
}

/// Live links keyed by remote endpoint. At most one link per endpoint; the first registered wins.
#[derive(Clone, Default)]
pub struct LinkRegistry {
    inner: Arc<Mutex<Links>>,
}

impl LinkRegistry {
    /// Current epoch. Capture it when a handshake starts and pass it to `connect` / `accept`.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    fn register(
        &self,
        endpoint_id: &EndpointId,
        control: mpsc::UnboundedSender<LinkControl>,
        epoch: u64,
    ) -> Result<u64, Refused> {
        let mut links = self.inner.lock();
        if links.epoch != epoch {
            return Err(Refused::Stale);
        }
        if links.by_endpoint.contains_key(endpoint_id) {
            return Err(Refused::Duplicate);
        }
        links.next_no += 1;
        let link_no = links.next_no;
        links
            .by_endpoint
            .insert(endpoint_id.clone(), LinkHandle { control, link_no });
        Ok(link_no)
    }

    fn release(&self, endpoint_id: &EndpointId, link_no: u64) {
        let mut links = self.inner.lock();
        if links
            .by_endpoint
            .get(endpoint_id)
            .is_some_and(|h| h.link_no == link_no)
        {
            links.by_endpoint.remove(endpoint_id);
        }
    }

    /// Queue an instruction for the endpoint's link. False when no link exists.
    pub fn control(&self, endpoint_id: &EndpointId, control: LinkControl) -> bool {
        self.inner
            .lock()
            .by_endpoint
            .get(endpoint_id)
            .is_some_and(|h| h.control.send(control).is_ok())
    }

    /// Close every link without reporting anything back. Handshakes still in flight
    /// are refused when they try to register.
    pub fn close_all(&self) {
        let links = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            std::mem::take(&mut inner.by_endpoint)
        };
        for (endpoint_id, handle) in links {
            debug!(endpoint_id = %endpoint_id, "closing link");
            let _ = handle.control.send(LinkControl::Close);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_endpoint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a link task needs from its transport.
#[derive(Clone)]
pub struct LinkContext {
    pub keypair: Arc<Keypair>,
    pub sink: EventSink,
    pub links: LinkRegistry,
    pub chunk_size: usize,
    pub download_dir: PathBuf,
}

struct Peer {
    endpoint_id: EndpointId,
    endpoint_name: String,
    keys: SessionKeys,
    token: String,
}

/// Open a link to an advertised endpoint. Failures before the handshake completes
/// are reported as `ConnectionRequestFailed`. Returns once the link is running on its
/// own task, so aborting this future only abandons the handshake.
pub async fn connect(
    ctx: LinkContext,
    addr: SocketAddr,
    local_name: String,
    endpoint_id: EndpointId,
    epoch: u64,
) {
    let opened: Result<(TcpStream, Peer), LinkError> = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = handshake(&mut stream, &ctx.keypair, &local_name, Role::Requester).await?;
        if peer.endpoint_id != endpoint_id {
            return Err(LinkError::Handshake(format!(
                "expected endpoint {endpoint_id}, reached {}",
                peer.endpoint_id
            )));
        }
        Ok((stream, peer))
    }
    .await;
    match opened {
        Ok((stream, peer)) => start_link(ctx, stream, peer, Role::Requester, epoch),
        Err(e) if ctx.links.epoch() != epoch => {
            debug!(endpoint_id = %endpoint_id, error = %e, "abandoned connection request failed");
        }
        Err(e) => {
            warn!(endpoint_id = %endpoint_id, %addr, error = %e, "connection request failed");
            ctx.sink.emit(TransportEvent::ConnectionRequestFailed {
                endpoint_id,
                reason: e.to_string(),
            });
        }
    }
}

/// Serve a link opened by a remote requester. Like `connect`, returns after the handshake.
pub async fn accept(ctx: LinkContext, mut stream: TcpStream, local_name: String, epoch: u64) {
    let _ = stream.set_nodelay(true);
    match handshake(&mut stream, &ctx.keypair, &local_name, Role::Acceptor).await {
        Ok(peer) => start_link(ctx, stream, peer, Role::Acceptor, epoch),
        Err(e) => debug!(error = %e, "incoming handshake failed"),
    }
}

async fn handshake(
    stream: &mut TcpStream,
    keypair: &Keypair,
    local_name: &str,
    role: Role,
) -> Result<Peer, LinkError> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange_hello(stream, keypair, local_name, role))
        .await
        .map_err(|_| LinkError::Handshake("timed out".to_owned()))?
}

async fn exchange_hello(
    stream: &mut TcpStream,
    keypair: &Keypair,
    local_name: &str,
    role: Role,
) -> Result<Peer, LinkError> {
    let hello = Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        endpoint_id: keypair.endpoint_id().clone(),
        endpoint_name: local_name.to_owned(),
        public_key: keypair.public_key().clone(),
    };
    let remote = match role {
        Role::Requester => {
            write_plain(stream, &hello).await?;
            read_plain(stream).await?
        }
        Role::Acceptor => {
            let remote = read_plain(stream).await?;
            write_plain(stream, &hello).await?;
            remote
        }
    };
    let Message::Hello {
        protocol_version,
        endpoint_id,
        endpoint_name,
        public_key,
    } = remote
    else {
        return Err(LinkError::Handshake("expected hello".to_owned()));
    };
    if protocol_version != PROTOCOL_VERSION {
        return Err(LinkError::Handshake(format!(
            "unsupported protocol version {protocol_version}"
        )));
    }
    if endpoint_id_for(&public_key) != endpoint_id {
        return Err(LinkError::Handshake(
            "endpoint id does not match public key".to_owned(),
        ));
    }
    if &endpoint_id == keypair.endpoint_id() {
        return Err(LinkError::Handshake("connected to self".to_owned()));
    }
    let secret = keypair.shared_secret(&public_key);
    Ok(Peer {
        endpoint_id,
        endpoint_name,
        keys: derive_session_keys(&secret, role == Role::Requester),
        token: authentication_token(&secret),
    })
}

fn start_link(ctx: LinkContext, stream: TcpStream, peer: Peer, role: Role, epoch: u64) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    match ctx.links.register(&peer.endpoint_id, control_tx, epoch) {
        Ok(link_no) => {
            tokio::spawn(run_link(ctx, stream, peer, role, control_rx, link_no));
        }
        Err(Refused::Duplicate) => {
            debug!(endpoint_id = %peer.endpoint_id, ?role, "duplicate link closed");
        }
        Err(Refused::Stale) => {
            debug!(endpoint_id = %peer.endpoint_id, ?role, "link opened after close, dropped");
        }
    }
}

async fn run_link(
    ctx: LinkContext,
    stream: TcpStream,
    peer: Peer,
    role: Role,
    mut control_rx: mpsc::UnboundedReceiver<LinkControl>,
    link_no: u64,
) {
    info!(
        endpoint_id = %peer.endpoint_id,
        endpoint_name = %peer.endpoint_name,
        token = %peer.token,
        ?role,
        "link open"
    );
    ctx.sink.emit(TransportEvent::ConnectionInitiated {
        endpoint_id: peer.endpoint_id.clone(),
        info: ConnectionInfo {
            endpoint_name: peer.endpoint_name.clone(),
            authentication_token: peer.token.clone(),
            is_incoming: role == Role::Acceptor,
        },
    });

    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (in_tx, mut in_rx) = mpsc::channel(INBOUND_QUEUE);
    let mut writer_task = tokio::spawn(write_loop(writer, out_rx, peer.keys.outbound));
    let reader_task = tokio::spawn(read_loop(reader, in_tx, peer.keys.inbound));

    let mut link = Link {
        ctx: ctx.clone(),
        peer_id: peer.endpoint_id.clone(),
        out: out_tx,
        local_accepted: false,
        remote_accepted: false,
        established: false,
        incoming: HashMap::new(),
        pumps: Vec::new(),
    };

    let exit = loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Some(control) => {
                    if let Some(exit) = link.on_control(control).await {
                        break exit;
                    }
                }
                None => break Exit::Local,
            },
            inbound = in_rx.recv() => match inbound {
                Some(Ok(msg)) => {
                    if let Some(exit) = link.on_message(msg).await {
                        break exit;
                    }
                }
                Some(Err(e)) => break Exit::Lost(e.to_string()),
                None => break Exit::Lost("reader stopped".to_owned()),
            },
        }
    };

    ctx.links.release(&peer.endpoint_id, link_no);
    link.finish(exit);
    drop(link);
    reader_task.abort();
    if tokio::time::timeout(CLOSE_GRACE, &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
}

enum Exit {
    /// Closed or rejected from this side; nothing to report.
    Local,
    Rejected,
    Lost(String),
}

struct Incoming {
    hasher: PayloadHasher,
    total_bytes: Option<u64>,
    sink: IncomingSink,
}

enum IncomingSink {
    Bytes(Vec<u8>),
    File { path: PathBuf, file: tokio::fs::File },
    Stream(StreamWriter),
}

struct Link {
    ctx: LinkContext,
    peer_id: EndpointId,
    out: mpsc::Sender<Message>,
    local_accepted: bool,
    remote_accepted: bool,
    established: bool,
    incoming: HashMap<PayloadId, Incoming>,
    pumps: Vec<JoinHandle<()>>,
}

impl Link {
    async fn on_control(&mut self, control: LinkControl) -> Option<Exit> {
        match control {
            LinkControl::Accept => {
                if self.local_accepted {
                    return None;
                }
                self.local_accepted = true;
                if self.out.send(Message::Accept).await.is_err() {
                    return Some(Exit::Lost("writer stopped".to_owned()));
                }
                self.maybe_establish();
                None
            }
            LinkControl::Reject => {
                info!(endpoint_id = %self.peer_id, "rejecting link");
                let _ = self.out.send(Message::Reject).await;
                Some(Exit::Local)
            }
            LinkControl::Send(payload) => {
                if !self.established {
                    warn!(endpoint_id = %self.peer_id, payload_id = payload.id, "send before link established, dropped");
                    return None;
                }
                self.spawn_pump(payload);
                None
            }
            LinkControl::Close => {
                let _ = self.out.send(Message::Goodbye).await;
                Some(Exit::Local)
            }
        }
    }

    async fn on_message(&mut self, msg: Message) -> Option<Exit> {
        match msg {
            Message::Accept => {
                self.remote_accepted = true;
                self.maybe_establish();
                None
            }
            Message::Reject => Some(Exit::Rejected),
            Message::Goodbye => Some(Exit::Lost("peer closed the link".to_owned())),
            Message::Hello { .. } | Message::Advertisement { .. } => {
                warn!(endpoint_id = %self.peer_id, "unexpected message on open link");
                None
            }
            _ if !self.established => {
                debug!(endpoint_id = %self.peer_id, "payload frame before establishment ignored");
                None
            }
            Message::PayloadHeader {
                payload_id,
                kind,
                total_bytes,
                file_name,
            } => {
                self.on_header(payload_id, kind, total_bytes, file_name.as_deref())
                    .await;
                None
            }
            Message::PayloadChunk { payload_id, body } => {
                self.on_chunk(payload_id, body).await;
                None
            }
            Message::PayloadEnd { payload_id, digest } => {
                self.on_end(payload_id, &digest).await;
                None
            }
            Message::PayloadCancel { payload_id } => {
                if let Some(incoming) = self.incoming.remove(&payload_id) {
                    debug!(endpoint_id = %self.peer_id, payload_id, "payload cancelled by sender");
                    self.fail(payload_id, incoming).await;
                }
                None
            }
        }
    }

    fn maybe_establish(&mut self) {
        if self.established || !self.local_accepted || !self.remote_accepted {
            return;
        }
        self.established = true;
        info!(endpoint_id = %self.peer_id, "link established");
        self.ctx.sink.emit(TransportEvent::ConnectionResult {
            endpoint_id: self.peer_id.clone(),
            status: ConnectionStatus::Ok,
        });
    }

    async fn on_header(
        &mut self,
        payload_id: PayloadId,
        kind: PayloadKind,
        total_bytes: Option<u64>,
        file_name: Option<&str>,
    ) {
        debug!(endpoint_id = %self.peer_id, payload_id, ?kind, ?total_bytes, "incoming payload");
        let sink = match kind {
            PayloadKind::Bytes => IncomingSink::Bytes(Vec::new()),
            PayloadKind::File => {
                let path = download_path(&self.ctx.download_dir, payload_id, file_name);
                let file = match create_file(&path).await {
                    Ok(file) => file,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot create download file");
                        return;
                    }
                };
                self.received(payload_id, total_bytes, IncomingContent::File(path.clone()));
                IncomingSink::File { path, file }
            }
            PayloadKind::Stream => {
                let (writer, reader) = stream_pipe();
                self.received(payload_id, total_bytes, IncomingContent::Stream(reader));
                IncomingSink::Stream(writer)
            }
        };
        self.incoming.insert(
            payload_id,
            Incoming {
                hasher: PayloadHasher::new(),
                total_bytes,
                sink,
            },
        );
    }

    async fn on_chunk(&mut self, payload_id: PayloadId, body: Vec<u8>) {
        let Some(incoming) = self.incoming.get_mut(&payload_id) else {
            debug!(endpoint_id = %self.peer_id, payload_id, "chunk for unknown payload");
            return;
        };
        incoming.hasher.update(&body);
        let written = match &mut incoming.sink {
            IncomingSink::Bytes(buf) => {
                buf.extend_from_slice(&body);
                return;
            }
            IncomingSink::File { file, .. } => file.write_all(&body).await.is_ok(),
            IncomingSink::Stream(writer) => writer.write(body).is_ok(),
        };
        let (bytes, total) = (incoming.hasher.bytes(), incoming.total_bytes);
        if written {
            self.update(payload_id, TransferStatus::InProgress, bytes, total);
        } else if let Some(incoming) = self.incoming.remove(&payload_id) {
            warn!(endpoint_id = %self.peer_id, payload_id, "incoming payload sink closed");
            self.fail(payload_id, incoming).await;
        }
    }

    async fn on_end(&mut self, payload_id: PayloadId, digest: &[u8; 32]) {
        let Some(incoming) = self.incoming.remove(&payload_id) else {
            debug!(endpoint_id = %self.peer_id, payload_id, "end for unknown payload");
            return;
        };
        let bytes = incoming.hasher.bytes();
        let total = incoming.total_bytes.or(Some(bytes));
        if !incoming.hasher.clone().verify(digest) {
            warn!(endpoint_id = %self.peer_id, payload_id, "payload digest mismatch");
            self.fail(payload_id, incoming).await;
            return;
        }
        match incoming.sink {
            IncomingSink::Bytes(buf) => {
                self.received(payload_id, total, IncomingContent::Bytes(Bytes::from(buf)));
            }
            IncomingSink::File { path, mut file } => {
                if let Err(e) = file.flush().await {
                    warn!(path = %path.display(), error = %e, "cannot flush download file");
                    self.update(payload_id, TransferStatus::Failure, bytes, total);
                    return;
                }
            }
            IncomingSink::Stream(writer) => drop(writer),
        }
        debug!(endpoint_id = %self.peer_id, payload_id, bytes, "payload complete");
        self.update(payload_id, TransferStatus::Success, bytes, total);
    }

    async fn fail(&self, payload_id: PayloadId, incoming: Incoming) {
        let bytes = incoming.hasher.bytes();
        if let IncomingSink::File { path, file } = incoming.sink {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
        }
        self.update(
            payload_id,
            TransferStatus::Failure,
            bytes,
            incoming.total_bytes,
        );
    }

    fn received(&self, id: PayloadId, total_bytes: Option<u64>, content: IncomingContent) {
        self.ctx.sink.emit(TransportEvent::PayloadReceived {
            endpoint_id: self.peer_id.clone(),
            payload: IncomingPayload {
                id,
                total_bytes,
                content,
            },
        });
    }

    fn update(
        &self,
        payload_id: PayloadId,
        status: TransferStatus,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    ) {
        self.ctx.sink.emit(TransportEvent::PayloadTransferUpdate {
            endpoint_id: self.peer_id.clone(),
            update: TransferUpdate {
                payload_id,
                status,
                bytes_transferred,
                total_bytes,
            },
        });
    }

    fn spawn_pump(&mut self, payload: OutgoingPayload) {
        self.pumps.retain(|p| !p.is_finished());
        let out = self.out.clone();
        let chunk_size = self.ctx.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let endpoint_id = self.peer_id.clone();
        self.pumps.push(tokio::spawn(async move {
            let payload_id = payload.id;
            match pump(&out, payload, chunk_size).await {
                Ok(bytes) => debug!(endpoint_id = %endpoint_id, payload_id, bytes, "payload sent"),
                Err(e) => {
                    warn!(endpoint_id = %endpoint_id, payload_id, error = %e, "payload send failed");
                    let _ = out.send(Message::PayloadCancel { payload_id }).await;
                }
            }
        }));
    }

    fn finish(&mut self, exit: Exit) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        let (status, reason) = match exit {
            Exit::Local => {
                info!(endpoint_id = %self.peer_id, "link closed locally");
                return;
            }
            Exit::Rejected => (ConnectionStatus::Rejected, "rejected by peer".to_owned()),
            Exit::Lost(reason) => (ConnectionStatus::Error, reason),
        };
        info!(endpoint_id = %self.peer_id, established = self.established, %reason, "link closed");
        if self.established {
            let open: Vec<(PayloadId, Incoming)> = self.incoming.drain().collect();
            for (payload_id, incoming) in open {
                self.update(
                    payload_id,
                    TransferStatus::Failure,
                    incoming.hasher.bytes(),
                    incoming.total_bytes,
                );
            }
            self.ctx.sink.emit(TransportEvent::Disconnected {
                endpoint_id: self.peer_id.clone(),
            });
        } else {
            self.ctx.sink.emit(TransportEvent::ConnectionResult {
                endpoint_id: self.peer_id.clone(),
                status,
            });
        }
    }
}

/// Stream one payload as header, chunks and end. Returns the number of body bytes sent.
async fn pump(
    out: &mpsc::Sender<Message>,
    payload: OutgoingPayload,
    chunk_size: usize,
) -> Result<u64, LinkError> {
    let OutgoingPayload { id, content } = payload;
    let kind = content.kind();
    let digest = match content {
        OutgoingContent::Bytes(bytes) => {
            send(out, header(id, kind, Some(bytes.len() as u64), None)).await?;
            let mut hasher = PayloadHasher::new();
            for chunk in bytes.chunks(chunk_size) {
                hasher.update(chunk);
                send(out, chunk_message(id, chunk)).await?;
            }
            hasher
        }
        OutgoingContent::File(path) => {
            let mut file = tokio::fs::File::open(&path).await?;
            let total = file.metadata().await?.len();
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned);
            send(out, header(id, kind, Some(total), file_name)).await?;
            let mut hasher = PayloadHasher::new();
            let mut buf = vec![0u8; chunk_size];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                send(out, chunk_message(id, &buf[..n])).await?;
            }
            hasher
        }
        OutgoingContent::Stream(reader) => {
            send(out, header(id, kind, None, None)).await?;
            let blocking_out = out.clone();
            tokio::task::spawn_blocking(move || {
                pump_stream(reader, &blocking_out, id, chunk_size)
            })
            .await
            .map_err(|e| LinkError::Io(io::Error::new(io::ErrorKind::Other, e)))??
        }
    };
    let bytes = digest.bytes();
    send(
        out,
        Message::PayloadEnd {
            payload_id: id,
            digest: digest.finish(),
        },
    )
    .await?;
    Ok(bytes)
}

fn pump_stream(
    mut reader: Box<dyn Read + Send>,
    out: &mpsc::Sender<Message>,
    payload_id: PayloadId,
    chunk_size: usize,
) -> Result<PayloadHasher, LinkError> {
    let mut hasher = PayloadHasher::new();
    let mut buf = vec![0u8; chunk_size];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        out.blocking_send(chunk_message(payload_id, &buf[..n]))
            .map_err(|_| LinkError::Closed)?;
    }
    Ok(hasher)
}

fn header(
    payload_id: PayloadId,
    kind: PayloadKind,
    total_bytes: Option<u64>,
    file_name: Option<String>,
) -> Message {
    Message::PayloadHeader {
        payload_id,
        kind,
        total_bytes,
        file_name,
    }
}

fn chunk_message(payload_id: PayloadId, body: &[u8]) -> Message {
    Message::PayloadChunk {
        payload_id,
        body: body.to_vec(),
    }
}

async fn send(out: &mpsc::Sender<Message>, msg: Message) -> Result<(), LinkError> {
    out.send(msg).await.map_err(|_| LinkError::Closed)
}

/// Incoming files land in `download_dir` as `<payload id>-<sender's file name>`.
fn download_path(download_dir: &Path, payload_id: PayloadId, file_name: Option<&str>) -> PathBuf {
    let name = file_name
        .and_then(|n| Path::new(n).file_name())
        .and_then(|n| n.to_str())
        .map(|n| format!("{payload_id}-{n}"))
        .unwrap_or_else(|| payload_id.to_string());
    download_dir.join(name)
}

async fn create_file(path: &Path) -> io::Result<tokio::fs::File> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::File::create(path).await
}

/// Encrypt and write queued messages. Nonces count up from zero per direction.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Message>,
    key: [u8; 32],
) -> Result<(), LinkError> {
    let mut nonce: u64 = 0;
    while let Some(msg) = rx.recv().await {
        let plain = encode_message(&msg)?;
        let cipher = encrypt_wire(&key, nonce, &plain)?;
        nonce = nonce.checked_add(1).ok_or(LinkError::Closed)?;
        writer.write_all(&len_prefix(cipher.len())?).await?;
        writer.write_all(&cipher).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Read, decrypt and decode frames until the first error, which is forwarded and ends the loop.
async fn read_loop(
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<Result<Message, LinkError>>,
    key: [u8; 32],
) {
    let mut nonce: u64 = 0;
    loop {
        let result: Result<Message, LinkError> = async {
            let cipher = read_frame(&mut reader).await?;
            let plain = decrypt_wire(&key, nonce, &cipher)?;
            Ok(decode_message(&plain)?)
        }
        .await;
        nonce = nonce.wrapping_add(1);
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, LinkError> {
    let mut prefix = [0u8; LEN_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = frame_len(&prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn write_plain<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<(), LinkError> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_plain<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, LinkError> {
    let body = read_frame(reader).await?;
    Ok(decode_message(&body)?)
}
