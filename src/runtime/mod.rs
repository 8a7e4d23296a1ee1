use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rmpv::Value;

use crate::connection::{Connection, TransportSocket};
use crate::logging::Logger;
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use crate::server::TcpServer;
use crate::wire::codec::{
    self, CodecLimits, DecodeEvent, FrameDecoder, OFFLOAD_THRESHOLD_BYTES,
};
use crate::wire::frame::{ErrorCode, Frame};
use crate::wire::handshake::{self, HandshakeOutcome};
use crate::workers::{CodecWorkerPool, JobOutcome};

const LOG_CONTEXT: &str = "runtime";
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long a fresh socket may sit without completing its handshake
/// before it is dropped.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

enum ReadOutcome {
    Data(Vec<u8>),
    Nothing,
    Closed,
}

/// A socket that has not completed its handshake. It owns its own decoder
/// until a valid `connect` promotes it to a registered Connection.
struct PendingSession {
    socket: Arc<TransportSocket>,
    decoder: FrameDecoder,
    accepted_at: Instant,
}

struct PendingDecode {
    connection: Arc<Connection>,
    receiver: Receiver<JobOutcome>,
}

struct PendingEncode {
    connection: Arc<Connection>,
    receiver: Receiver<JobOutcome>,
}

/// One pass of the accept/read/dispatch/keepalive machinery per `tick`.
/// All connection I/O happens on the thread driving the ticks; only the
/// codec worker pool runs elsewhere.
pub struct Runtime {
    tcp: TcpServer,
    registry: Arc<ConnectionRegistry>,
    router: Router,
    pool: Arc<CodecWorkerPool>,
    logger: Arc<Logger>,
    limits: CodecLimits,
    ping_interval: Duration,
    last_version: String,
    pending_sessions: Vec<PendingSession>,
    pending_decodes: Vec<PendingDecode>,
    pending_encodes: Vec<PendingEncode>,
    last_keepalive: Instant,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tcp: TcpServer,
        registry: Arc<ConnectionRegistry>,
        router: Router,
        pool: Arc<CodecWorkerPool>,
        logger: Arc<Logger>,
        limits: CodecLimits,
        ping_interval: Duration,
        last_version: String,
    ) -> Self {
        Self {
            tcp,
            registry,
            router,
            pool,
            logger,
            limits,
            ping_interval,
            last_version,
            pending_sessions: Vec::new(),
            pending_decodes: Vec::new(),
            pending_encodes: Vec::new(),
            last_keepalive: Instant::now(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn tick(&mut self) {
        self.accept_new();
        self.pump_pending();
        self.pump_established();
        self.poll_codec_jobs();
        if self.last_keepalive.elapsed() >= self.ping_interval {
            self.keepalive_sweep();
        }
    }

    fn accept_new(&mut self) {
        loop {
            match self.tcp.try_accept() {
                Ok(Some(socket)) => {
                    self.logger.verbose(
                        Some(LOG_CONTEXT),
                        &format!("accepted socket from {}", socket.peer_addr()),
                    );
                    self.pending_sessions.push(PendingSession {
                        socket,
                        decoder: FrameDecoder::new(self.limits),
                        accepted_at: Instant::now(),
                    });
                }
                Ok(None) => return,
                Err(error) => {
                    self.logger.warn(Some(LOG_CONTEXT), &error.to_string());
                    return;
                }
            }
        }
    }

    fn pump_pending(&mut self) {
        let sessions = std::mem::take(&mut self.pending_sessions);
        for mut session in sessions {
            if session.accepted_at.elapsed() > HANDSHAKE_DEADLINE {
                self.logger.debug(
                    Some(LOG_CONTEXT),
                    &format!(
                        "dropping socket {}, handshake never completed",
                        session.socket.id()
                    ),
                );
                let _ = session.socket.shutdown();
                continue;
            }
            match read_available(&session.socket) {
                ReadOutcome::Nothing => self.pending_sessions.push(session),
                ReadOutcome::Closed => {
                    let _ = session.socket.shutdown();
                }
                ReadOutcome::Data(bytes) => {
                    let events = match session.decoder.feed(&bytes) {
                        Ok(events) => events,
                        Err(error) => {
                            // Pre-handshake peers may speak the legacy wire
                            // format, which has no error channel. Drop.
                            self.logger.debug(
                                Some(LOG_CONTEXT),
                                &format!(
                                    "dropping unestablished socket {}: {error}",
                                    session.socket.id()
                                ),
                            );
                            let _ = session.socket.shutdown();
                            continue;
                        }
                    };
                    self.handle_pending_events(session, events);
                }
            }
        }
    }

    fn handle_pending_events(&mut self, session: PendingSession, events: Vec<DecodeEvent>) {
        let mut events = events.into_iter();
        while let Some(event) = events.next() {
            match event {
                DecodeEvent::Ping => {
                    let _ = session.socket.write_all(&[codec::PONG_BYTE]);
                }
                DecodeEvent::Pong | DecodeEvent::Progress { .. } => {}
                DecodeEvent::Message { payload } => {
                    let first = match codec::decode_payload(&payload, &self.limits) {
                        Ok(frame) => frame,
                        Err(error) => {
                            self.logger.debug(
                                Some(LOG_CONTEXT),
                                &format!(
                                    "dropping unestablished socket {}: {error}",
                                    session.socket.id()
                                ),
                            );
                            let _ = session.socket.shutdown();
                            return;
                        }
                    };
                    self.complete_handshake(session, first, events.collect());
                    return;
                }
            }
        }
        self.pending_sessions.push(session);
    }

    fn complete_handshake(
        &mut self,
        session: PendingSession,
        first: Frame,
        leftover: Vec<DecodeEvent>,
    ) {
        match handshake::evaluate_first_frame(&first) {
            HandshakeOutcome::Establish {
                client_id,
                client_name,
            } => {
                let connection = Arc::new(Connection::with_decoder(
                    Arc::clone(&session.socket),
                    client_id,
                    client_name,
                    self.limits,
                    session.decoder,
                ));
                self.logger.info(
                    Some(LOG_CONTEXT),
                    &format!(
                        "client '{}' ({}) connected from {}",
                        connection.client_id(),
                        connection.client_name(),
                        session.socket.peer_addr()
                    ),
                );
                self.registry.add(Arc::clone(&connection));
                let ack = Frame::response(
                    first.uuid,
                    Value::Map(vec![(
                        Value::from("serverVersion"),
                        Value::from(self.last_version.as_str()),
                    )]),
                );
                let _ = connection.send_frame(&ack);
                for event in leftover {
                    self.handle_connection_event(&connection, event);
                }
            }
            HandshakeOutcome::LegacyVersionQuery => {
                self.send_on_socket(
                    &session.socket,
                    &handshake::last_version_reply(&first, &self.last_version),
                );
                let _ = session.socket.shutdown();
            }
            HandshakeOutcome::UpgradeRequired => {
                self.send_on_socket(
                    &session.socket,
                    &Frame::error(
                        first.uuid,
                        ErrorCode::UpgradeRequired,
                        "Error",
                        "this protocol version is no longer supported, please upgrade",
                        None,
                    ),
                );
                let _ = session.socket.shutdown();
            }
            HandshakeOutcome::BadConnect { reason } => {
                self.send_on_socket(
                    &session.socket,
                    &Frame::error(first.uuid, ErrorCode::BadMessage, "Error", reason, None),
                );
                let _ = session.socket.shutdown();
            }
        }
    }

    fn send_on_socket(&self, socket: &TransportSocket, frame: &Frame) {
        match codec::encode(frame, &self.limits) {
            Ok(encoded) => {
                for chunk in &encoded.chunks {
                    if socket.write_all(chunk).is_err() {
                        return;
                    }
                }
            }
            Err(error) => self.logger.warn(Some(LOG_CONTEXT), &error.to_string()),
        }
    }

    fn pump_established(&mut self) {
        for connection in self.registry.snapshot() {
            if !connection.is_open() {
                self.registry.remove(&connection);
                continue;
            }
            match read_available(connection.socket()) {
                ReadOutcome::Nothing => {}
                ReadOutcome::Closed => {
                    self.logger.info(
                        Some(LOG_CONTEXT),
                        &format!("client '{}' disconnected", connection.client_id()),
                    );
                    self.registry.remove(&connection);
                }
                ReadOutcome::Data(bytes) => match connection.feed_incoming(&bytes) {
                    Ok(events) => {
                        for event in events {
                            self.handle_connection_event(&connection, event);
                        }
                    }
                    Err(error) => {
                        self.logger.warn(
                            Some(LOG_CONTEXT),
                            &format!(
                                "framing error from client '{}', closing: {error}",
                                connection.client_id()
                            ),
                        );
                        self.registry.remove(&connection);
                    }
                },
            }
        }
    }

    fn handle_connection_event(&mut self, connection: &Arc<Connection>, event: DecodeEvent) {
        connection.mark_alive();
        match event {
            DecodeEvent::Ping => {
                let _ = connection.send_pong();
            }
            DecodeEvent::Pong => {}
            DecodeEvent::Progress {
                uuid,
                total_size,
                completed_size,
            } => {
                let _ = connection.send_frame(&Frame::progress(
                    uuid,
                    total_size as u64,
                    completed_size as u64,
                ));
            }
            DecodeEvent::Message { payload } => {
                let payload = if payload.len() >= OFFLOAD_THRESHOLD_BYTES {
                    match self.pool.submit_decode(payload) {
                        Ok(receiver) => {
                            self.pending_decodes.push(PendingDecode {
                                connection: Arc::clone(connection),
                                receiver,
                            });
                            return;
                        }
                        // Budget pressure falls back to inline work rather
                        // than dropping the request.
                        Err((payload, error)) => {
                            self.logger.debug(Some(LOG_CONTEXT), &error.to_string());
                            payload
                        }
                    }
                } else {
                    payload
                };
                match codec::decode_payload(&payload, &self.limits) {
                    Ok(frame) => self.route(connection, frame),
                    Err(error) => {
                        self.logger.warn(
                            Some(LOG_CONTEXT),
                            &format!(
                                "undecodable payload from client '{}', closing: {error}",
                                connection.client_id()
                            ),
                        );
                        self.registry.remove(connection);
                    }
                }
            }
        }
    }

    fn route(&mut self, connection: &Arc<Connection>, request: Frame) {
        let reply = self.router.handle_frame(connection, &request);
        self.send_reply(connection, reply);
    }

    fn send_reply(&mut self, connection: &Arc<Connection>, reply: Frame) {
        let reply = if codec::estimated_payload_size(&reply) >= OFFLOAD_THRESHOLD_BYTES {
            match self.pool.submit_encode(reply) {
                Ok(receiver) => {
                    self.pending_encodes.push(PendingEncode {
                        connection: Arc::clone(connection),
                        receiver,
                    });
                    return;
                }
                Err((reply, error)) => {
                    self.logger.debug(Some(LOG_CONTEXT), &error.to_string());
                    reply
                }
            }
        } else {
            reply
        };
        if connection.send_frame(&reply).is_err() {
            self.registry.remove(connection);
        }
    }

    fn poll_codec_jobs(&mut self) {
        let decodes = std::mem::take(&mut self.pending_decodes);
        let mut routed = Vec::new();
        for job in decodes {
            match job.receiver.try_recv() {
                Ok(JobOutcome::Decoded(Ok(frame))) => routed.push((job.connection, frame)),
                Ok(JobOutcome::Decoded(Err(error))) => {
                    self.logger.warn(
                        Some(LOG_CONTEXT),
                        &format!(
                            "offloaded decode failed for client '{}', closing: {error}",
                            job.connection.client_id()
                        ),
                    );
                    self.registry.remove(&job.connection);
                }
                Ok(JobOutcome::Encoded(_)) => {}
                Err(TryRecvError::Empty) => self.pending_decodes.push(job),
                Err(TryRecvError::Disconnected) => {}
            }
        }
        for (connection, frame) in routed {
            self.route(&connection, frame);
        }

        let encodes = std::mem::take(&mut self.pending_encodes);
        for job in encodes {
            match job.receiver.try_recv() {
                Ok(JobOutcome::Encoded(Ok(encoded))) => {
                    if job.connection.send_encoded(&encoded).is_err() {
                        self.registry.remove(&job.connection);
                    }
                }
                Ok(JobOutcome::Encoded(Err(error))) => {
                    self.logger
                        .warn(Some(LOG_CONTEXT), &format!("offloaded encode failed: {error}"));
                }
                Ok(JobOutcome::Decoded(_)) => {}
                Err(TryRecvError::Empty) => self.pending_encodes.push(job),
                Err(TryRecvError::Disconnected) => {}
            }
        }
    }

    /// One keepalive round: a connection that has shown no traffic since
    /// the previous round is evicted without being sent anything further;
    /// everyone else is marked unalive and pinged.
    pub fn keepalive_sweep(&mut self) {
        self.last_keepalive = Instant::now();
        for connection in self.registry.snapshot() {
            if !connection.is_alive() {
                self.logger.info(
                    Some(LOG_CONTEXT),
                    &format!(
                        "evicting client '{}', no keepalive response",
                        connection.client_id()
                    ),
                );
                self.registry.remove(&connection);
                continue;
            }
            connection.mark_unalive();
            if connection.send_ping().is_err() {
                self.registry.remove(&connection);
            }
        }
    }
}

fn read_available(socket: &TransportSocket) -> ReadOutcome {
    let mut collected = Vec::new();
    let mut buffer = [0_u8; READ_BUFFER_SIZE];
    loop {
        match socket.try_read(&mut buffer) {
            Ok(0) => return ReadOutcome::Closed,
            Ok(count) => {
                collected.extend_from_slice(&buffer[..count]);
                if count < buffer.len() {
                    break;
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return ReadOutcome::Closed,
        }
    }
    if collected.is_empty() {
        ReadOutcome::Nothing
    } else {
        ReadOutcome::Data(collected)
    }
}
