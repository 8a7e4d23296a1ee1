use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rmpv::Value;

use crate::auth::AuthTokenPayload;
use crate::wire::codec::{
    CodecError, CodecLimits, DecodeEvent, EncodedFrame, FrameDecoder, PING_BYTE, PONG_BYTE,
};
use crate::wire::frame::Frame;

/// One event subscription owned by a connection. `key` is the client's
/// unique handle for this registration; `info` is an opaque payload that
/// server-side emitters filter on.
#[derive(Clone, Debug, PartialEq)]
pub struct ListenerRegistration {
    pub key: String,
    pub event_name: String,
    pub info: Value,
}

#[derive(Debug)]
pub enum TransportError {
    ConfigureStream { source: io::Error },
    StreamClone { source: io::Error },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigureStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone TCP stream for full duplex IO: {source}")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Non-blocking full-duplex socket. Reader and writer are clones of the
/// same stream so polling reads never contend with outbound writes.
pub struct TransportSocket {
    id: u64,
    peer_addr: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
}

impl TransportSocket {
    pub fn new(id: u64, stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, TransportError> {
        stream
            .set_nodelay(true)
            .map_err(|source| TransportError::ConfigureStream { source })?;
        stream
            .set_nonblocking(true)
            .map_err(|source| TransportError::ConfigureStream { source })?;

        let writer = stream
            .try_clone()
            .map_err(|source| TransportError::StreamClone { source })?;

        Ok(Self {
            id,
            peer_addr,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn try_read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.reader
            .lock()
            .expect("socket reader lock poisoned")
            .read(buffer)
    }

    /// Writes the whole buffer, retrying on `WouldBlock`. Chunks must land
    /// on the wire intact or the peer's decoder desynchronizes.
    pub fn write_all(&self, payload: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().expect("socket writer lock poisoned");
        let mut written = 0;
        while written < payload.len() {
            match writer.write(&payload[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(count) => written += count,
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        Ok(written)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        let _ = self
            .reader
            .lock()
            .expect("socket reader lock poisoned")
            .shutdown(Shutdown::Both);
        self.writer
            .lock()
            .expect("socket writer lock poisoned")
            .shutdown(Shutdown::Both)
    }
}

/// An established client connection: identity from the handshake, live
/// auth state, keepalive flag, subscribed event keys, and the per-socket
/// frame decoder.
///
/// Sends against a closed connection return `Ok(0)` instead of failing so
/// broadcast paths never abort on a peer that just left.
pub struct Connection {
    socket: Arc<TransportSocket>,
    client_id: String,
    client_name: String,
    connected_at: DateTime<Utc>,
    open: AtomicBool,
    alive: AtomicBool,
    auth: Mutex<Option<AuthTokenPayload>>,
    listeners: Mutex<Vec<ListenerRegistration>>,
    decoder: Mutex<FrameDecoder>,
    limits: CodecLimits,
}

impl Connection {
    pub fn new(
        socket: Arc<TransportSocket>,
        client_id: impl Into<String>,
        client_name: impl Into<String>,
        limits: CodecLimits,
    ) -> Self {
        Self::with_decoder(
            socket,
            client_id,
            client_name,
            limits,
            FrameDecoder::new(limits),
        )
    }

    /// Adopts an existing decoder so bytes buffered during the handshake
    /// carry over into the established connection.
    pub fn with_decoder(
        socket: Arc<TransportSocket>,
        client_id: impl Into<String>,
        client_name: impl Into<String>,
        limits: CodecLimits,
        decoder: FrameDecoder,
    ) -> Self {
        Self {
            socket,
            client_id: client_id.into(),
            client_name: client_name.into(),
            connected_at: Utc::now(),
            open: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            auth: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            decoder: Mutex::new(decoder),
            limits,
        }
    }

    pub fn socket(&self) -> &Arc<TransportSocket> {
        &self.socket
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn limits(&self) -> CodecLimits {
        self.limits
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Any traffic from the peer proves liveness; the keepalive sweep
    /// clears the flag again before each ping round.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn mark_unalive(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn set_auth(&self, payload: AuthTokenPayload) {
        *self.auth.lock().expect("connection auth lock poisoned") = Some(payload);
    }

    pub fn auth_payload(&self) -> Option<AuthTokenPayload> {
        self.auth
            .lock()
            .expect("connection auth lock poisoned")
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth
            .lock()
            .expect("connection auth lock poisoned")
            .is_some()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.auth
            .lock()
            .expect("connection auth lock poisoned")
            .as_ref()
            .is_some_and(|payload| payload.has_role(role))
    }

    /// Registers a listener. Re-adding an existing key replaces its
    /// registration in place; otherwise registration order is kept.
    pub fn add_listener(&self, registration: ListenerRegistration) {
        let mut held = self
            .listeners
            .lock()
            .expect("connection listener lock poisoned");
        match held.iter_mut().find(|entry| entry.key == registration.key) {
            Some(existing) => *existing = registration,
            None => held.push(registration),
        }
    }

    pub fn remove_listener(&self, key: &str) -> bool {
        let mut held = self
            .listeners
            .lock()
            .expect("connection listener lock poisoned");
        let before = held.len();
        held.retain(|entry| entry.key != key);
        held.len() != before
    }

    pub fn listeners(&self) -> Vec<ListenerRegistration> {
        self.listeners
            .lock()
            .expect("connection listener lock poisoned")
            .clone()
    }

    pub fn listeners_for(&self, event_name: &str) -> Vec<ListenerRegistration> {
        self.listeners
            .lock()
            .expect("connection listener lock poisoned")
            .iter()
            .filter(|entry| entry.event_name == event_name)
            .cloned()
            .collect()
    }

    /// Subset of the candidate keys owned by this connection, in this
    /// connection's registration order.
    pub fn filter_keys(&self, candidates: &[String]) -> Vec<String> {
        self.listeners
            .lock()
            .expect("connection listener lock poisoned")
            .iter()
            .filter(|entry| candidates.contains(&entry.key))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Keys of listeners on `event_name` whose `info` satisfies the
    /// predicate, for server-initiated emission.
    pub fn matching_keys<F>(&self, event_name: &str, predicate: F) -> Vec<String>
    where
        F: Fn(&Value) -> bool,
    {
        self.listeners
            .lock()
            .expect("connection listener lock poisoned")
            .iter()
            .filter(|entry| entry.event_name == event_name && predicate(&entry.info))
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub fn feed_incoming(&self, bytes: &[u8]) -> Result<Vec<DecodeEvent>, CodecError> {
        self.decoder
            .lock()
            .expect("connection decoder lock poisoned")
            .feed(bytes)
    }

    pub fn send_frame(&self, frame: &Frame) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        let encoded = crate::wire::codec::encode(frame, &self.limits)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error.to_string()))?;
        self.send_encoded(&encoded)
    }

    pub fn send_encoded(&self, encoded: &EncodedFrame) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        let mut written = 0;
        for chunk in &encoded.chunks {
            written += self.socket.write_all(chunk)?;
        }
        Ok(written)
    }

    pub fn send_ping(&self) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        self.socket.write_all(&[PING_BYTE])
    }

    pub fn send_pong(&self) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        self.socket.write_all(&[PONG_BYTE])
    }

    /// Idempotent close: the socket shuts down and decoder state is freed
    /// exactly once, later calls are no-ops.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.socket.shutdown();
            self.decoder
                .lock()
                .expect("connection decoder lock poisoned")
                .dispose();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("client_name", &self.client_name)
            .field("peer_addr", &self.socket.peer_addr())
            .field("open", &self.is_open())
            .field("alive", &self.is_alive())
            .finish()
    }
}
