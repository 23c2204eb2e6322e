//! Loopback TLS listener and HTTP routing for session websockets.
//!
//! Routes:
//! - `GET /health/{id}`: 200 if a client could attach, else 404/409. CORS enabled.
//! - `GET /pty/ws/{id}`: websocket upgrade into [`endpoint::serve`].

use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::daemon::endpoint::{self, KEEPALIVE_PERIOD};
use crate::daemon::registry::Registry;
use crate::daemon::session::{SessionError, SessionId};

/// First port probed when none is configured.
pub const DEFAULT_PORT_START: u16 = 34373;

/// Handshakes that take longer than this are dropped.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from setting up the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("TLS certificate not found at {}", .0.display())]
    CertificateMissing(PathBuf),

    #[error("TLS private key not found at {}", .0.display())]
    KeyMissing(PathBuf),

    #[error("failed to read PEM from {}: {source}", path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("no free port on 127.0.0.1 between {0} and 65535")]
    NoFreePort(u16),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tunables for the streaming endpoint.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    pub keepalive: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            keepalive: KEEPALIVE_PERIOD,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match self {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::AlreadyConnected(_) => StatusCode::CONFLICT,
            SessionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Build a rustls server config from PEM files.
///
/// Accepts PKCS#8, PKCS#1 (RSA) and SEC1 (EC) private keys.
pub fn load_tls_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, TransportError> {
    if !cert.is_file() {
        return Err(TransportError::CertificateMissing(cert.to_path_buf()));
    }
    if !key.is_file() {
        return Err(TransportError::KeyMissing(key.to_path_buf()));
    }

    let pem_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| TransportError::Pem { path, source }
    };

    let mut reader = BufReader::new(File::open(cert).map_err(pem_error(cert))?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(pem_error(cert))?;
    if certs.is_empty() {
        return Err(TransportError::NoCertificates(cert.to_path_buf()));
    }

    let mut reader = BufReader::new(File::open(key).map_err(pem_error(key))?);
    let key_der: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
        .map_err(pem_error(key))?
        .ok_or_else(|| TransportError::NoPrivateKey(key.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key_der)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Bind the first free port on 127.0.0.1 at or above `start`.
///
/// The bound listener is kept, so nothing else can take the port between
/// discovery and use.
pub async fn bind_loopback(start: u16) -> Result<TcpListener, TransportError> {
    for port in start..=u16::MAX {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                debug!("Port {} unavailable: {}", port, e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(TransportError::NoFreePort(start))
}

/// TCP listener that completes TLS handshakes before handing connections to
/// axum. Handshakes run concurrently; a stalled client only costs its own
/// task.
pub struct TlsListener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
    handshakes: JoinSet<Option<(TlsStream<TcpStream>, SocketAddr)>>,
    handshake_timeout: Duration,
}

impl TlsListener {
    pub fn new(tcp: TcpListener, config: Arc<ServerConfig>) -> Self {
        Self {
            tcp,
            acceptor: TlsAcceptor::from(config),
            handshakes: JoinSet::new(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Load the certificate pair and bind the first free loopback port.
    pub async fn bind(cert: &Path, key: &Path, port_start: u16) -> Result<Self, TransportError> {
        let config = load_tls_config(cert, key)?;
        let tcp = bind_loopback(port_start).await?;
        Ok(Self::new(tcp, config))
    }

    pub fn port(&self) -> std::io::Result<u16> {
        self.tcp.local_addr().map(|addr| addr.port())
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            tokio::select! {
                accepted = self.tcp.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let acceptor = self.acceptor.clone();
                        let limit = self.handshake_timeout;
                        self.handshakes.spawn(async move {
                            match tokio::time::timeout(limit, acceptor.accept(stream)).await {
                                Ok(Ok(tls)) => Some((tls, addr)),
                                Ok(Err(e)) => {
                                    debug!(%addr, "TLS handshake failed: {}", e);
                                    None
                                }
                                Err(_) => {
                                    debug!(%addr, "TLS handshake timed out");
                                    None
                                }
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(done) = self.handshakes.join_next(), if !self.handshakes.is_empty() => {
                    if let Ok(Some(conn)) = done {
                        return conn;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    options: TransportOptions,
}

pub fn router(registry: Arc<Registry>, options: TransportOptions) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health/{id}", get(health))
        .layer(cors)
        .route("/pty/ws/{id}", get(connect))
        .with_state(AppState { registry, options })
}

async fn health(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<SessionId>,
) -> Result<StatusCode, SessionError> {
    state.registry.check(id)?;
    Ok(StatusCode::OK)
}

async fn connect(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<SessionId>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let attachment = match state.registry.attach(id) {
        Ok(attachment) => attachment,
        Err(e) => {
            debug!(session = id, "Refusing connection: {}", e);
            return e.into_response();
        }
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        // Dropping the attachment here detaches again.
        Err(rejection) => return rejection.into_response(),
    };

    let token = state.registry.auth_token().clone();
    let keepalive = state.options.keepalive;
    upgrade.on_upgrade(move |socket| endpoint::serve(socket, attachment, token, keepalive))
}

/// Serve session websockets on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TlsListener,
    registry: Arc<Registry>,
    options: TransportOptions,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    if let Ok(addr) = axum::serve::Listener::local_addr(&listener) {
        info!("Transport listening on https://{}", addr);
    }
    axum::serve(listener, router(registry, options))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
