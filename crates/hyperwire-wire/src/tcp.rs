//! TcpTransport: length-prefixed envelopes over authenticated TCP.
//!
//! Every connection opens with a hello/hello_ack exchange carrying each
//! side's node name and an HMAC-SHA256 proof over a fresh nonce. After the
//! handshake the connection is cached under the peer's node name and used
//! in both directions: envelopes for that node are written to it, and every
//! frame read from it is forwarded to the node's inbound channel. A peer
//! that dialed us can therefore be answered without knowing its listen
//! address.

use crate::error::TransportError;
use crate::message::*;
use crate::registry::PeerDirectory;
use crate::transport::{destination_node, Transport};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Write half of an established connection, shared by concurrent senders.
type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Longest a connect plus hello exchange may take, in either direction.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Generate HMAC-SHA256 signature for connection authentication.
fn hmac_sign(secret: &str, data: &[u8]) -> Result<String, TransportError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| TransportError::HandshakeFailed(format!("invalid HMAC key: {e}")))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    match hmac_sign(secret, data) {
        Ok(expected) => subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into(),
        Err(_) => false,
    }
}

/// Write a framed envelope (4-byte length + JSON) to a TCP stream.
pub async fn write_frame(writer: &mut OwnedWriteHalf, msg: &Envelope) -> Result<(), TransportError> {
    let bytes = encode_frame(msg)?;
    write_raw(writer, &bytes).await?;
    Ok(())
}

async fn write_raw(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> Result<(), TransportError> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame body (without its length header) from a TCP stream.
pub async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransportError::ConnectionClosed);
        }
        Err(e) => return Err(TransportError::Io(e)),
    }

    let len = decode_length(&header);
    if len > MAX_MESSAGE_SIZE {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Read and decode one framed envelope.
pub async fn read_envelope(reader: &mut OwnedReadHalf) -> Result<Envelope, TransportError> {
    let body = read_frame(reader).await?;
    Ok(decode_envelope(&body)?)
}

struct TcpShared {
    our_node: String,
    shared_secret: String,
    directory: PeerDirectory,
    connections: Mutex<HashMap<String, SharedWriter>>,
    /// Per-node dial locks: concurrent senders to one node share a single
    /// new connection, while a slow node never blocks dials to the others.
    dial_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpShared {
    /// Our handshake frame body, signed over a fresh nonce.
    fn hello(&self) -> Result<Hello, TransportError> {
        let nonce = uuid::Uuid::new_v4().to_string();
        let auth_hmac = if self.shared_secret.is_empty() {
            String::new()
        } else {
            let auth_data = format!("{}{}", nonce, self.our_node);
            hmac_sign(&self.shared_secret, auth_data.as_bytes())?
        };
        Ok(Hello {
            node: self.our_node.clone(),
            protocol_version: PROTOCOL_VERSION,
            nonce,
            auth_hmac,
        })
    }

    fn verify(&self, hello: &Hello) -> bool {
        if self.shared_secret.is_empty() {
            return true;
        }
        let expected_data = format!("{}{}", hello.nonce, hello.node);
        hmac_verify(&self.shared_secret, expected_data.as_bytes(), &hello.auth_hmac)
    }

    fn connection(&self, node: &str) -> Option<SharedWriter> {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.get(node).cloned()
    }

    /// Forget `writer` if it is still the cached connection for `node`.
    fn drop_connection(&self, node: &str, writer: &SharedWriter) -> bool {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        match connections.get(node) {
            Some(current) if Arc::ptr_eq(current, writer) => {
                connections.remove(node);
                true
            }
            _ => false,
        }
    }

    fn dial_lock(&self, node: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.dial_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(node.to_string()).or_default())
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }
}

/// Cache an authenticated connection and start reading from it.
fn register(
    shared: &Arc<TcpShared>,
    peer: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
) -> SharedWriter {
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
    {
        let mut connections = shared.connections.lock().unwrap_or_else(|e| e.into_inner());
        if connections.insert(peer.clone(), Arc::clone(&writer)).is_some() {
            debug!("Replacing existing connection to {}", peer);
        }
    }
    shared.directory.mark_connected(&peer);

    let task = tokio::spawn(read_loop(
        Arc::clone(shared),
        peer,
        reader,
        Arc::clone(&writer),
    ));
    shared.track(task);
    writer
}

/// Forward frames from an authenticated peer until the connection ends.
async fn read_loop(
    shared: Arc<TcpShared>,
    peer: String,
    mut reader: OwnedReadHalf,
    writer: SharedWriter,
) {
    loop {
        let body = match read_frame(&mut reader).await {
            Ok(body) => body,
            Err(TransportError::ConnectionClosed) => break,
            Err(e) => {
                debug!("Read from {} failed: {}", peer, e);
                break;
            }
        };

        let envelope = match decode_envelope(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed frame from {}: {}", peer, e);
                continue;
            }
        };

        match envelope.source() {
            Some(source) if source.node() == peer => {}
            Some(source) => {
                warn!("Dropping frame from {} claiming source {}", peer, source);
                continue;
            }
            None => {
                warn!("Dropping unexpected frame {} from {} after handshake", envelope.id, peer);
                continue;
            }
        }

        shared.directory.touch(&peer);
        if shared.inbound.send(body).is_err() {
            debug!("Inbound channel closed, leaving {}", peer);
            break;
        }
    }

    if shared.drop_connection(&peer, &writer) {
        shared.directory.mark_disconnected(&peer);
    }
    debug!("Connection to {} closed", peer);
}

/// TCP transport between nodes that share a secret.
///
/// Cloning is cheap; clones share connections.
#[derive(Clone)]
pub struct TcpTransport {
    shared: Arc<TcpShared>,
}

impl TcpTransport {
    /// Create a transport for node `our_node`. Frames received from peers are
    /// delivered on the returned channel.
    pub fn new(
        our_node: &str,
        shared_secret: &str,
        directory: PeerDirectory,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        if shared_secret.is_empty() {
            warn!("No shared_secret configured for {}; connections are unauthenticated", our_node);
        }
        let (inbound, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(TcpShared {
            our_node: our_node.to_string(),
            shared_secret: shared_secret.to_string(),
            directory,
            connections: Mutex::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
            inbound,
            tasks: Mutex::new(Vec::new()),
        });
        (Self { shared }, rx)
    }

    /// Node name sent in our hello.
    pub fn our_node(&self) -> &str {
        &self.shared.our_node
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.shared.directory
    }

    /// Whether a live connection to `node` is cached.
    pub fn is_connected(&self, node: &str) -> bool {
        self.shared.connection(node).is_some()
    }

    /// Bind a listener and start accepting peers. Returns the bound address.
    pub async fn listen(
        &self,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("{} listening for peers on {}", self.shared.our_node, local_addr);

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(accept_loop(listener, shared));
        Ok((local_addr, task))
    }

    /// Connect to `node` at `addr` and authenticate, unless already connected.
    pub async fn connect(&self, node: &str, addr: SocketAddr) -> Result<(), TransportError> {
        self.shared.directory.add_peer(node, addr);
        self.connection_to(node).await.map(|_| ())
    }

    /// The cached connection to `node`, dialing it if needed.
    async fn connection_to(&self, node: &str) -> Result<SharedWriter, TransportError> {
        if let Some(writer) = self.shared.connection(node) {
            return Ok(writer);
        }
        let lock = self.shared.dial_lock(node);
        let _guard = lock.lock().await;
        // Another sender may have connected while we waited.
        if let Some(writer) = self.shared.connection(node) {
            return Ok(writer);
        }
        let addr = self
            .shared
            .directory
            .address_of(node)
            .ok_or_else(|| TransportError::Unreachable(node.to_string()))?;
        self.dial(node, addr).await
    }

    async fn dial(&self, node: &str, addr: SocketAddr) -> Result<SharedWriter, TransportError> {
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(node, addr)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                warn!("Handshake with {} at {} timed out", node, addr);
                Err(TransportError::HandshakeFailed(format!(
                    "{node} at {addr} did not complete the handshake within {HANDSHAKE_TIMEOUT:?}"
                )))
            }
        }
    }

    async fn handshake(&self, node: &str, addr: SocketAddr) -> Result<SharedWriter, TransportError> {
        debug!("Dialing {} at {}", node, addr);
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = Envelope {
            id: CorrelationId::HANDSHAKE,
            kind: EnvelopeKind::Hello(self.shared.hello()?),
        };
        write_frame(&mut writer, &hello).await?;

        let reply = read_envelope(&mut reader).await?;
        let ack = match reply.kind {
            EnvelopeKind::HelloAck(ack) => ack,
            EnvelopeKind::Rejected { code, message } => {
                return Err(TransportError::HandshakeFailed(format!(
                    "Remote rejected connection ({code}): {message}"
                )));
            }
            _ => {
                return Err(TransportError::HandshakeFailed(
                    "Unexpected reply to hello".to_string(),
                ));
            }
        };

        if ack.protocol_version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: ack.protocol_version,
            });
        }
        if !self.shared.verify(&ack) {
            return Err(TransportError::HandshakeFailed(
                "HMAC verification failed on hello_ack".into(),
            ));
        }
        if ack.node != node {
            return Err(TransportError::HandshakeFailed(format!(
                "Dialed {node} at {addr} but {} answered",
                ack.node
            )));
        }

        info!("Connected to {} at {}", node, addr);
        Ok(register(&self.shared, ack.node, reader, writer))
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<TcpShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handle_inbound(&shared, stream, addr)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Inbound connection from {} ended: {}", addr, e),
                        Err(_elapsed) => warn!("Inbound handshake from {} timed out", addr),
                    }
                });
            }
            Err(e) => {
                error!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn reject(
    writer: &mut OwnedWriteHalf,
    id: CorrelationId,
    code: u16,
    message: impl Into<String>,
) -> Result<(), TransportError> {
    let rejected = Envelope {
        id,
        kind: EnvelopeKind::Rejected {
            code,
            message: message.into(),
        },
    };
    write_frame(writer, &rejected).await
}

/// Authenticate an accepted connection, then hand it to the read loop.
async fn handle_inbound(
    shared: &Arc<TcpShared>,
    stream: TcpStream,
    addr: SocketAddr,
) -> Result<(), TransportError> {
    let (mut reader, mut writer) = stream.into_split();

    let first = read_envelope(&mut reader).await?;
    let hello = match first.kind {
        EnvelopeKind::Hello(hello) => hello,
        // Nothing is accepted before the handshake.
        _ => {
            warn!("Rejected frame from {} before handshake", addr);
            reject(
                &mut writer,
                first.id,
                401,
                "Authentication required: complete the hello handshake first",
            )
            .await?;
            return Err(TransportError::HandshakeFailed(
                "Rejected frame before handshake".into(),
            ));
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        reject(
            &mut writer,
            first.id,
            400,
            format!(
                "Protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, hello.protocol_version
            ),
        )
        .await?;
        return Err(TransportError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: hello.protocol_version,
        });
    }

    if hello.node.is_empty() || !shared.verify(&hello) {
        warn!("HMAC authentication failed for {:?} from {}", hello.node, addr);
        reject(&mut writer, first.id, 403, "HMAC authentication failed").await?;
        return Err(TransportError::HandshakeFailed(
            "HMAC verification failed on incoming hello".into(),
        ));
    }

    let ack = Envelope {
        id: first.id,
        kind: EnvelopeKind::HelloAck(shared.hello()?),
    };
    write_frame(&mut writer, &ack).await?;

    info!("Peer {} connected from {}", hello.node, addr);
    register(shared, hello.node, reader, writer);
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn deliver_outbound(&self, envelope: Envelope) -> Result<(), TransportError> {
        let node = destination_node(&envelope)?.to_string();

        if node == self.shared.our_node {
            let body = encode_envelope(&envelope)?;
            return self
                .shared
                .inbound
                .send(body)
                .map_err(|_| TransportError::Unreachable(node));
        }

        let frame = encode_frame(&envelope)?;
        let writer = self.connection_to(&node).await?;
        let first_attempt = {
            let mut w = writer.lock().await;
            write_raw(&mut w, &frame).await
        };
        match first_attempt {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("Write to {} failed, reconnecting: {}", node, e);
                if self.shared.drop_connection(&node, &writer) {
                    self.shared.directory.mark_disconnected(&node);
                }
            }
        }

        // One retry over a fresh connection.
        let writer = self.connection_to(&node).await?;
        let mut w = writer.lock().await;
        write_raw(&mut w, &frame).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        let dropped: Vec<String> = {
            let mut connections = self.shared.connections.lock().unwrap_or_else(|e| e.into_inner());
            connections.drain().map(|(node, _)| node).collect()
        };
        for node in &dropped {
            self.shared.directory.mark_disconnected(node);
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        info!("TCP transport for {} shut down ({} connections closed)", self.shared.our_node, dropped.len());
    }
}
