use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use serde_json::json;

use crate::auth::{AuthError, AuthTokenPayload, TokenSigner};
use crate::config::AppConfig;
use crate::connection::{TransportError, TransportSocket};
use crate::events::{EventEmitter, SERVER_SHUTDOWN_EVENT, SERVER_STARTED_EVENT};
use crate::logging::{LogLevel, Logger, LoggerConfig};
use crate::registry::ConnectionRegistry;
use crate::router::Router;
use crate::runtime::Runtime;
use crate::services::{ServiceDefinition, ServiceTable};
use crate::shutdown::{ForceExitWatchdog, ShutdownHooks};
use crate::wire::codec::CodecLimits;
use crate::wire::frame::Frame;
use crate::workers::CodecWorkerPool;

const LOG_CONTEXT: &str = "server";

#[derive(Debug)]
pub enum ServerError {
    Bind { address: String, source: io::Error },
    SetNonBlocking { source: io::Error },
    Accept { source: io::Error },
    Transport(TransportError),
    Auth(AuthError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::Transport(source) => write!(f, "transport error: {source}"),
            Self::Auth(source) => write!(f, "auth error: {source}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<TransportError> for ServerError {
    fn from(source: TransportError) -> Self {
        Self::Transport(source)
    }
}

/// Non-blocking acceptor. Accepted sockets are wrapped for full-duplex
/// polling I/O; connection identity arrives later with the handshake.
pub struct TcpServer {
    listener: TcpListener,
    next_socket_id: AtomicU64,
}

impl TcpServer {
    pub fn bind(host: &str, port: u16) -> Result<Self, ServerError> {
        let address = format!("{host}:{port}");
        let listener =
            TcpListener::bind(&address).map_err(|source| ServerError::Bind { address, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_socket_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn try_accept(&self) -> Result<Option<Arc<TransportSocket>>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
                let socket = TransportSocket::new(id, stream, peer_addr)?;
                Ok(Some(Arc::new(socket)))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::Accept { source }),
        }
    }
}

/// The assembled transport core. Owns the registry, service table, codec
/// worker pool and token signer; external collaborators (build watchers,
/// application bootstrap) interact through this type only.
pub struct Server {
    config: AppConfig,
    logger: Arc<Logger>,
    emitter: Arc<EventEmitter>,
    registry: Arc<ConnectionRegistry>,
    services: Arc<ServiceTable>,
    signer: Option<TokenSigner>,
    pool: Arc<CodecWorkerPool>,
    last_version: String,
}

impl Server {
    pub fn new(config: AppConfig) -> Result<Self, ServerError> {
        let min_level =
            LogLevel::parse(&config.logging.level).unwrap_or(LoggerConfig::default().min_level);
        let logger = Arc::new(Logger::new(LoggerConfig {
            min_level,
            human_friendly: config.logging.human_friendly,
        }));

        let signer = if config.auth.secret.is_empty() {
            logger.warn(
                Some(LOG_CONTEXT),
                "auth.secret is empty, token operations are disabled",
            );
            None
        } else {
            Some(
                TokenSigner::new(
                    config.auth.secret.clone(),
                    config.auth.token_ttl_hours as i64,
                )
                .map_err(ServerError::Auth)?,
            )
        };

        let limits = CodecLimits {
            max_frame_size_bytes: config.wire.max_frame_size_bytes,
            chunk_size_bytes: config.wire.chunk_size_bytes,
        };
        let pool = Arc::new(CodecWorkerPool::new(
            config.wire.codec_workers,
            config.wire.codec_queue_budget_bytes,
            limits,
        ));

        let emitter = Arc::new(EventEmitter::new());
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(&emitter)));
        let services = Arc::new(ServiceTable::new());

        Ok(Self {
            config,
            logger,
            emitter,
            registry,
            services,
            signer,
            pool,
            last_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn emitter(&self) -> &Arc<EventEmitter> {
        &self.emitter
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn register_service(&self, definition: ServiceDefinition) {
        self.logger.debug(
            Some(LOG_CONTEXT),
            &format!("registered service '{}'", definition.name()),
        );
        self.services.register(definition);
    }

    /// Pushes a `reload` frame: to one client when `client_name` is given,
    /// otherwise to every live connection.
    pub fn broadcast_reload(
        &self,
        client_name: Option<&str>,
        changed_files: Vec<String>,
    ) -> usize {
        let frame = Frame::reload(client_name, changed_files);
        match client_name {
            Some(name) => self
                .registry
                .emit(&frame, |connection| connection.client_name() == name),
            None => self.registry.broadcast(&frame),
        }
    }

    /// Server-initiated pub-sub emission by event name and info predicate.
    pub fn emit_event<F>(&self, event_name: &str, predicate: F, data: &Value) -> usize
    where
        F: Fn(&Value) -> bool,
    {
        self.registry.emit_event(event_name, predicate, data)
    }

    pub fn generate_auth_token(
        &self,
        roles: Vec<String>,
        data: serde_json::Value,
    ) -> Result<String, AuthError> {
        let signer = self.signer.as_ref().ok_or(AuthError::EmptySecret)?;
        Ok(signer.generate(roles, data))
    }

    pub fn verify_auth_token(&self, token: &str) -> Result<AuthTokenPayload, AuthError> {
        let signer = self.signer.as_ref().ok_or(AuthError::EmptySecret)?;
        signer.verify(token)
    }

    pub fn router(&self) -> Router {
        Router::new(
            Arc::clone(&self.services),
            Arc::clone(&self.registry),
            self.signer.clone(),
            Arc::clone(&self.logger),
        )
    }

    pub fn build_runtime(&self) -> Result<Runtime, ServerError> {
        let tcp = TcpServer::bind(&self.config.server.host, self.config.server.port)?;
        Ok(self.build_runtime_with(tcp))
    }

    pub fn build_runtime_with(&self, tcp: TcpServer) -> Runtime {
        Runtime::new(
            tcp,
            Arc::clone(&self.registry),
            self.router(),
            Arc::clone(&self.pool),
            Arc::clone(&self.logger),
            CodecLimits {
                max_frame_size_bytes: self.config.wire.max_frame_size_bytes,
                chunk_size_bytes: self.config.wire.chunk_size_bytes,
            },
            Duration::from_millis(self.config.keepalive.ping_interval_ms),
            self.last_version.clone(),
        )
    }

    /// Accept-and-poll loop. Returns after a termination signal once the
    /// registry has been drained; the force-exit watchdog guarantees the
    /// process dies if that drain hangs.
    pub fn run(&self, hooks: &ShutdownHooks) -> Result<(), ServerError> {
        let mut runtime = self.build_runtime()?;
        let bound = runtime
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "<unknown>".to_owned());
        self.logger.log(
            LogLevel::Info,
            Some(LOG_CONTEXT),
            "listening",
            Some(json!({"address": bound})),
        );
        if let Err(error) = self
            .emitter
            .emit(SERVER_STARTED_EVENT, Some(json!({"address": bound})))
        {
            self.logger.warn(Some(LOG_CONTEXT), &error.to_string());
        }

        let poll_interval = Duration::from_millis(self.config.server.poll_interval_ms);
        while !hooks.is_triggered() {
            runtime.tick();
            std::thread::sleep(poll_interval);
        }

        self.logger.info(Some(LOG_CONTEXT), "termination signal received");
        if let Err(error) = self.emitter.emit(SERVER_SHUTDOWN_EVENT, None) {
            self.logger.warn(Some(LOG_CONTEXT), &error.to_string());
        }
        let watchdog = ForceExitWatchdog::new(Duration::from_millis(
            self.config.shutdown.force_exit_after_ms,
        ));
        watchdog.arm();
        self.shutdown(runtime);
        watchdog.disarm();
        self.logger.info(Some(LOG_CONTEXT), "shutdown complete");
        Ok(())
    }

    fn shutdown(&self, runtime: Runtime) {
        // Dropping the runtime stops accepting; closing the registry
        // tears down every live socket and fires close events.
        drop(runtime);
        self.registry.close_all();
    }
}
