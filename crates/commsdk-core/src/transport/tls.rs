//! TLS session transport and blob service.
//!
//! One TCP+TLS connection carries login, signaling, call media and blob
//! transfers as length-prefixed postcard frames. After login the stream is
//! split into a writer task fed by a channel and a reader task that routes
//! frames to the inbound channel or to blob waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use commsdk_protocol::codec::{
    decode_server_msg, encode_client_msg, try_decode_frame, APP_VERSION, BLOB_CHUNK_SIZE,
    PROTOCOL_VERSION,
};
use commsdk_protocol::media::MediaPacket;
use commsdk_protocol::messages::{ClientMessage, ServerMessage, Signal};
use commsdk_protocol::types::{LoginReply, MediaKey};

use super::{
    BlobService, Credentials, Inbound, ProgressFn, SessionChannel, SessionHandle,
    SessionTransport,
};
use crate::error::TransportError;

const INBOUND_CAPACITY: usize = 256;
const OUTBOUND_CAPACITY: usize = 256;

enum BlobEvent {
    Chunk { offset: u64, total: u64, data: Vec<u8> },
    Missing,
}

#[derive(Default)]
struct BlobWaiters {
    uploads: DashMap<String, oneshot::Sender<()>>,
    downloads: DashMap<String, mpsc::UnboundedSender<BlobEvent>>,
}

struct Connection {
    handle: SessionHandle,
    tx: mpsc::Sender<Vec<u8>>,
    waiters: Arc<BlobWaiters>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    async fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let data = encode_client_msg(msg)?;
        self.tx
            .send(data)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// [`SessionTransport`] and [`BlobService`] over a single TLS connection.
pub struct TlsTransport {
    server_address: String,
    timeout: Duration,
    next_handle: AtomicU64,
    active: Mutex<Option<Arc<Connection>>>,
}

impl TlsTransport {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            timeout: Duration::from_secs(30),
            next_handle: AtomicU64::new(1),
            active: Mutex::new(None),
        }
    }

    /// Timeout for connecting, login and blob transfers.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn active(&self) -> Option<Arc<Connection>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn connection(&self, handle: SessionHandle) -> Result<Arc<Connection>, TransportError> {
        self.active()
            .filter(|c| c.handle == handle)
            .ok_or(TransportError::NotConnected)
    }

    async fn open_stream(&self) -> Result<TlsStream<TcpStream>, TransportError> {
        let (host, port) =
            parse_address(&self.server_address).map_err(TransportError::ConnectFailed)?;

        let tcp_stream = TcpStream::connect((&*host, port))
            .await
            .map_err(|e| {
                TransportError::ConnectFailed(format!("could not connect to {}: {e}", self.server_address))
            })?;
        info!("TCP connected to {}", self.server_address);

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            rustls::pki_types::ServerName::IpAddress(ip.into())
        } else {
            rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|e| TransportError::Tls(format!("invalid server name '{host}': {e}")))?
        };

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake failed: {e}")))?;
        info!("TLS handshake complete");
        Ok(tls_stream)
    }

    async fn login(
        &self,
        credentials: &Credentials,
    ) -> Result<(LoginReply, Option<SessionChannel>), TransportError> {
        let mut tls_stream = self.open_stream().await?;

        let login = ClientMessage::Login {
            address: credentials.address.clone(),
            secret: credentials.secret.clone(),
            protocol_version: PROTOCOL_VERSION,
            app_version: APP_VERSION.to_string(),
            push_token: credentials.push_token.clone(),
            sandbox: credentials.sandbox,
        };
        tls_stream.write_all(&encode_client_msg(&login)?).await?;

        // Read until the login reply arrives
        let mut buf = BytesMut::with_capacity(4096);
        let reply = 'read: loop {
            while let Some(payload) = try_decode_frame(&mut buf)? {
                match decode_server_msg(&payload)? {
                    ServerMessage::LoginReply(reply) => break 'read reply,
                    other => warn!("unexpected message during login: {:?}", other),
                }
            }
            if tls_stream.read_buf(&mut buf).await? == 0 {
                return Err(TransportError::Closed);
            }
        };

        if reply.user_id.is_none() || reply.code != commsdk_protocol::types::login_code::SUCCESS {
            let _ = tls_stream.shutdown().await;
            return Ok((reply, None));
        }

        let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (read_half, write_half) = tokio::io::split(tls_stream);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let waiters = Arc::new(BlobWaiters::default());

        let writer = tokio::spawn(writer_task(write_half, out_rx));
        let reader = tokio::spawn(reader_task(read_half, buf, in_tx, waiters.clone()));

        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::new(Connection {
                handle,
                tx: out_tx,
                waiters,
                tasks: vec![writer, reader],
            }));
        if let Some(old) = previous {
            for task in &old.tasks {
                task.abort();
            }
        }

        info!(handle = handle.0, "session established");
        Ok((
            reply,
            Some(SessionChannel {
                handle,
                inbound: in_rx,
            }),
        ))
    }
}

#[async_trait]
impl SessionTransport for TlsTransport {
    async fn connect(
        &self,
        credentials: &Credentials,
    ) -> Result<(LoginReply, Option<SessionChannel>), TransportError> {
        tokio::time::timeout(self.timeout, self.login(credentials))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn disconnect(&self, handle: SessionHandle) {
        let conn = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            match active.as_ref() {
                Some(c) if c.handle == handle => active.take(),
                _ => None,
            }
        };
        let Some(conn) = conn else {
            return;
        };
        let _ = conn.send(&ClientMessage::Disconnect).await;
        // Let the writer flush the disconnect frame
        tokio::time::sleep(Duration::from_millis(50)).await;
        for task in &conn.tasks {
            task.abort();
        }
        info!(handle = handle.0, "session closed");
    }

    async fn send_signal(&self, handle: SessionHandle, signal: Signal) -> Result<(), TransportError> {
        self.connection(handle)?
            .send(&ClientMessage::Signal(signal))
            .await
    }

    async fn send_media(
        &self,
        handle: SessionHandle,
        packet: MediaPacket,
    ) -> Result<(), TransportError> {
        let conn = self.connection(handle)?;
        let data = encode_client_msg(&ClientMessage::Media(packet.to_bytes()))?;
        // Media is best-effort: drop rather than queue behind a full writer.
        match conn.tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("writer queue full, dropping media packet");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    async fn refresh(&self, handle: SessionHandle) -> Result<(), TransportError> {
        self.connection(handle)?
            .send(&ClientMessage::Ping {
                timestamp: crate::unix_millis(),
            })
            .await
    }

    async fn register_push_token(
        &self,
        handle: SessionHandle,
        token: &str,
        sandbox: bool,
    ) -> Result<(), TransportError> {
        self.connection(handle)?
            .send(&ClientMessage::RegisterPush {
                token: token.to_string(),
                sandbox,
            })
            .await
    }
}

impl TlsTransport {
    async fn receive_blob(
        &self,
        conn: &Connection,
        key: &MediaKey,
        events: &mut mpsc::UnboundedReceiver<BlobEvent>,
        progress: &ProgressFn,
    ) -> Result<Vec<u8>, TransportError> {
        conn.send(&ClientMessage::GetBlob {
            key: key.to_string(),
        })
        .await?;

        let mut data = Vec::new();
        loop {
            let event = tokio::time::timeout(self.timeout, events.recv())
                .await
                .map_err(|_| TransportError::Timeout)?
                .ok_or(TransportError::Closed)?;
            match event {
                BlobEvent::Missing => return Err(TransportError::BlobMissing(key.to_string())),
                BlobEvent::Chunk { offset, total, data: chunk } => {
                    if offset != data.len() as u64 {
                        return Err(TransportError::SendFailed(format!(
                            "out-of-order blob chunk at {offset}"
                        )));
                    }
                    data.extend_from_slice(&chunk);
                    progress(data.len() as u64, total);
                    if data.len() as u64 >= total {
                        return Ok(data);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BlobService for TlsTransport {
    async fn upload(&self, key: &MediaKey, data: Vec<u8>) -> Result<(), TransportError> {
        let conn = self.active().ok_or(TransportError::NotConnected)?;
        let (done_tx, done_rx) = oneshot::channel();
        conn.waiters.uploads.insert(key.to_string(), done_tx);

        let total = data.len() as u64;
        let mut offset = 0u64;
        // An empty blob still sends one chunk so the backend stores it.
        let mut chunks = data.chunks(BLOB_CHUNK_SIZE).peekable();
        if chunks.peek().is_none() {
            conn.send(&ClientMessage::PutBlobChunk {
                key: key.to_string(),
                offset: 0,
                total: 0,
                data: Vec::new(),
            })
            .await?;
        }
        for chunk in chunks {
            conn.send(&ClientMessage::PutBlobChunk {
                key: key.to_string(),
                offset,
                total,
                data: chunk.to_vec(),
            })
            .await?;
            offset += chunk.len() as u64;
        }

        let result = tokio::time::timeout(self.timeout, done_rx).await;
        conn.waiters.uploads.remove(key.as_str());
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn download(
        &self,
        key: &MediaKey,
        progress: &ProgressFn,
    ) -> Result<Vec<u8>, TransportError> {
        let conn = self.active().ok_or(TransportError::NotConnected)?;
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        conn.waiters.downloads.insert(key.to_string(), ev_tx);

        let result = self.receive_blob(&conn, key, &mut ev_rx, progress).await;
        conn.waiters.downloads.remove(key.as_str());
        result
    }
}

/// Writer task: sends encoded frames from the channel to the TLS stream.
async fn writer_task(
    mut write_half: tokio::io::WriteHalf<TlsStream<TcpStream>>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            error!("write error: {}", e);
            break;
        }
    }
    info!("writer task ended");
}

/// Reader task: decodes server frames and routes them.
async fn reader_task(
    mut read_half: tokio::io::ReadHalf<TlsStream<TcpStream>>,
    mut buf: BytesMut,
    inbound: mpsc::Sender<Inbound>,
    waiters: Arc<BlobWaiters>,
) {
    'outer: loop {
        loop {
            match try_decode_frame(&mut buf) {
                Ok(Some(payload)) => match decode_server_msg(&payload) {
                    Ok(msg) => {
                        if !route_server_message(msg, &inbound, &waiters).await {
                            break 'outer;
                        }
                    }
                    Err(e) => warn!("failed to decode server message: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("frame decode error: {}", e);
                    break 'outer;
                }
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                info!("server closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("read error: {}", e);
                break;
            }
        }
    }

    // Fail in-flight blob transfers
    waiters.uploads.clear();
    waiters.downloads.clear();
    let _ = inbound.send(Inbound::Closed).await;
    info!("reader task ended");
}

/// Returns false once the inbound receiver is gone.
async fn route_server_message(
    msg: ServerMessage,
    inbound: &mpsc::Sender<Inbound>,
    waiters: &BlobWaiters,
) -> bool {
    match msg {
        ServerMessage::Signal(signal) => inbound.send(Inbound::Signal(signal)).await.is_ok(),
        ServerMessage::Media(bytes) => match MediaPacket::from_bytes(&bytes) {
            Ok(packet) => inbound.send(Inbound::Media(packet)).await.is_ok(),
            Err(e) => {
                debug!("dropping malformed media packet: {}", e);
                true
            }
        },
        ServerMessage::BlobChunk {
            key,
            offset,
            total,
            data,
        } => {
            if let Some(tx) = waiters.downloads.get(&key) {
                let _ = tx.send(BlobEvent::Chunk { offset, total, data });
            }
            true
        }
        ServerMessage::BlobMissing { key } => {
            if let Some(tx) = waiters.downloads.get(&key) {
                let _ = tx.send(BlobEvent::Missing);
            }
            true
        }
        ServerMessage::BlobStored { key } => {
            if let Some((_, tx)) = waiters.uploads.remove(&key) {
                let _ = tx.send(());
            }
            true
        }
        ServerMessage::Pong { timestamp } => {
            debug!(rtt_ms = crate::unix_millis().saturating_sub(timestamp), "pong");
            true
        }
        ServerMessage::Error { message } => {
            warn!("server error: {}", message);
            true
        }
        ServerMessage::LoginReply(_) => {
            warn!("unexpected login reply on established session");
            true
        }
    }
}

/// Split `host:port`, accepting `[v6]:port`.
fn parse_address(address: &str) -> Result<(String, u16), String> {
    let (host, port_str) = if address.starts_with('[') {
        let bracket_end = address
            .find("]:")
            .ok_or("invalid IPv6 address format, expected [host]:port")?;
        (address[1..bracket_end].to_string(), &address[bracket_end + 2..])
    } else {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or("invalid address format, expected host:port")?;
        (host.to_string(), port)
    };
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("invalid port number {port_str:?}"))?;
    if host.is_empty() {
        return Err("host cannot be empty".into());
    }
    Ok((host, port))
}
