//! Unix socket control server for the daemon process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use ptyplex_core::error::ApiError;
use ptyplex_core::protocol::{Command, Request, Response, ResponseData};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::daemon::paths;
use crate::daemon::pty::TermSize;
use crate::daemon::registry::{Registry, REAPER_PERIOD};
use crate::daemon::session::SessionId;
use crate::daemon::transport::{self, TlsListener, TransportOptions};

/// Maximum number of concurrent client connections to prevent resource exhaustion.
const MAX_CONNECTIONS: usize = 100;

/// How long to wait for in-flight connections to complete during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The daemon server that listens for control connections and owns the
/// session registry and streaming transport.
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    registry: Arc<Registry>,
    transport: Option<TlsListener>,
    transport_options: TransportOptions,
    /// Semaphore to limit concurrent connections and prevent resource exhaustion.
    connection_semaphore: Arc<Semaphore>,
    /// Cancelled to stop the accept loop. Drop then removes the socket and PID files.
    stop: CancellationToken,
}

impl DaemonServer {
    /// Create a new daemon server bound to the default socket path.
    pub async fn bind(registry: Arc<Registry>) -> Result<Self> {
        paths::ensure_socket_dir().context("Failed to create socket directory")?;
        let socket_path = paths::get_socket_path(None);
        let pid_path = paths::get_pid_path(None);
        Self::bind_to(socket_path, pid_path, registry).await
    }

    /// Create a new daemon server bound to a specific socket path.
    ///
    /// Uses a bind-first approach to avoid TOCTOU race conditions:
    /// 1. Try to bind directly
    /// 2. If socket in use, check PID file to see if daemon is alive
    /// 3. If daemon dead, remove stale socket and retry
    /// 4. If daemon alive, return error
    pub async fn bind_to(
        socket_path: PathBuf,
        pid_path: PathBuf,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory for {:?}", socket_path)
            })?;
        }

        // The PID file is written right after bind so a concurrent client never
        // sees our socket without a live PID next to it.
        let write_pid = |pid_path: &PathBuf| -> Result<()> {
            std::fs::write(pid_path, std::process::id().to_string())
                .with_context(|| format!("Failed to write PID file: {:?}", pid_path))
        };

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => {
                write_pid(&pid_path)?;
                l
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_daemon_alive(&pid_path) {
                    anyhow::bail!(
                        "Daemon already running (socket {:?} in use, PID file valid)",
                        socket_path
                    );
                }

                // Don't follow symlinks
                let metadata = std::fs::symlink_metadata(&socket_path)
                    .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;

                if metadata.file_type().is_symlink() {
                    anyhow::bail!(
                        "Socket path {:?} is a symlink, refusing to delete",
                        socket_path
                    );
                }

                use std::os::unix::fs::FileTypeExt;
                if !metadata.file_type().is_socket() {
                    anyhow::bail!(
                        "Path {:?} exists but is not a socket file (type: {:?})",
                        socket_path,
                        metadata.file_type()
                    );
                }

                info!("Removing stale socket from dead daemon");
                std::fs::remove_file(&socket_path)
                    .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))?;

                let l = UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?;
                write_pid(&pid_path)?;
                l
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        info!("Daemon listening on {:?}", socket_path);

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            registry,
            transport: None,
            transport_options: TransportOptions::default(),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            stop: CancellationToken::new(),
        })
    }

    /// Serve session websockets on `listener` alongside the control socket.
    ///
    /// Records the listener's port so `details` can report it.
    pub fn with_transport(mut self, listener: TlsListener) -> Result<Self> {
        let port = listener.port().context("Failed to read transport port")?;
        self.registry.set_port(port);
        self.transport = Some(listener);
        Ok(self)
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run the server, accepting connections and handling requests.
    ///
    /// Starts the reaper and, if configured, the streaming transport. On
    /// stop, every session is shut down, the transport drains, and
    /// in-flight control connections get [`GRACEFUL_SHUTDOWN_TIMEOUT`] to
    /// finish.
    pub async fn run(&mut self) -> Result<()> {
        let reaper = self.registry.spawn_reaper(REAPER_PERIOD);

        let transport_stop = CancellationToken::new();
        let transport_task = self.transport.take().map(|listener| {
            let registry = Arc::clone(&self.registry);
            let options = self.transport_options;
            let stop = transport_stop.clone();
            tokio::spawn(async move {
                if let Err(e) = transport::serve(listener, registry, options, stop).await {
                    error!("Transport failed: {}", e);
                }
            })
        });

        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("Accepted new connection");
                            let registry = Arc::clone(&self.registry);
                            let stop = self.stop.clone();
                            connection_tasks.spawn(async move {
                                // Held for the lifetime of the connection handler
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, registry, stop).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                _ = self.stop.cancelled() => {
                    info!("Shutdown signal received, waiting for in-flight connections");
                    break;
                }
            }
        }

        let closed = self.registry.shutdown();
        if !closed.is_empty() {
            info!("Shut down {} session(s)", closed.len());
            let terminated = join_all(closed.iter().map(|session| session.wait_released()));
            if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, terminated).await.is_err() {
                warn!("Sessions did not terminate within {:?}", GRACEFUL_SHUTDOWN_TIMEOUT);
            }
        }
        reaper.abort();

        transport_stop.cancel();
        if let Some(task) = transport_task {
            if tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Transport did not stop within {:?}", GRACEFUL_SHUTDOWN_TIMEOUT);
            }
        }

        if !connection_tasks.is_empty() {
            info!(
                "Waiting for {} in-flight connection(s) to complete",
                connection_tasks.len()
            );

            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Graceful shutdown timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        Ok(())
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("Failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("Failed to remove PID file on shutdown");
        }
    }
}

/// Check if a daemon process is still alive by reading its PID file.
pub(crate) fn is_daemon_alive(pid_path: &Path) -> bool {
    let pid_str = match std::fs::read_to_string(pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    // SAFETY: signal 0 delivers nothing; it only checks that the process
    // exists and we may signal it.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Maximum request size in bytes.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Read a line with a maximum size limit.
///
/// Returns the number of bytes read (0 means EOF).
/// Returns an error if the line exceeds max_size before finding a newline.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from client")?;

        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            anyhow::bail!("Request too large: exceeded {} byte limit", max_size);
        }

        // UTF-8 is validated once at the end so split code points survive.
        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;
        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
    buf.push_str(line);
    Ok(total)
}

/// Handle a single client connection.
async fn handle_connection(
    stream: UnixStream,
    registry: Arc<Registry>,
    stop: CancellationToken,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        let bytes_read = read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE).await?;
        if bytes_read == 0 {
            debug!("Client disconnected");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!("Received: {} bytes", trimmed.len());

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => handle_request(request, &registry, &stop),
            Err(e) => Response::error(
                "unknown",
                ApiError::invalid_input_with_suggestion(
                    format!("Invalid JSON request: {}", e),
                    "Ensure the request is valid JSON with 'id' and 'command' fields. Example: {\"id\":\"1\",\"command\":{\"action\":\"list_sessions\"}}",
                ),
            ),
        };

        let response_json =
            serde_json::to_string(&response).context("Failed to serialize response")?;
        debug!("Sending: {}", response_json);

        writer
            .write_all(response_json.as_bytes())
            .await
            .context("Failed to write response")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        writer.flush().await.context("Failed to flush")?;
    }

    Ok(())
}

/// Handle a single request and return a response.
fn handle_request(request: Request, registry: &Arc<Registry>, stop: &CancellationToken) -> Response {
    debug!("Handling command: {:?}", request.command);

    match request.command {
        Command::Spawn {
            command,
            rows,
            cols,
            cwd,
        } => handle_spawn(&request.id, registry, command, rows, cols, cwd),

        Command::Details { keep } => handle_details(&request.id, registry, keep),

        Command::CloseAllExcept { keep } => handle_close_all_except(&request.id, registry, keep),

        Command::Kill { session } => handle_kill(&request.id, registry, session),

        Command::ListSessions => handle_list_sessions(&request.id, registry),

        Command::Shutdown => handle_shutdown(&request.id, stop),
    }
}

fn handle_spawn(
    request_id: &str,
    registry: &Arc<Registry>,
    command: Vec<String>,
    rows: Option<u16>,
    cols: Option<u16>,
    cwd: Option<String>,
) -> Response {
    if command.is_empty() {
        return Response::error(
            request_id,
            ApiError::invalid_input_with_suggestion(
                "No command specified",
                "Provide a command to run, e.g., 'ptyplex spawn bash' or 'ptyplex spawn -- vim file.txt'",
            ),
        );
    }

    let size = match (rows, cols) {
        (None, None) => None,
        (Some(rows), Some(cols)) if rows > 0 && cols > 0 => Some(TermSize { rows, cols }),
        _ => {
            return Response::error(
                request_id,
                ApiError::invalid_input_with_suggestion(
                    "Invalid terminal size",
                    "Give both --rows and --cols, each at least 1, or neither for 24x80",
                ),
            );
        }
    };

    match registry.create_session(&command, size, cwd.as_deref().map(Path::new)) {
        Ok(id) => {
            info!(session = id, "Created session for {:?}", command);
            Response::success(request_id, ResponseData::SessionCreated { session_id: id })
        }
        Err(e) => {
            warn!("Spawn failed: {}", e);
            Response::error(request_id, e.into())
        }
    }
}

fn handle_details(request_id: &str, registry: &Registry, keep: Option<SessionId>) -> Response {
    let Some(port) = registry.port() else {
        return Response::error(
            request_id,
            ApiError::internal("Streaming transport is not running"),
        );
    };

    if let Some(keep) = keep {
        let closed = registry.close_all_except(keep);
        debug!("Closed {} session(s) other than {}", closed, keep);
    }

    Response::success(
        request_id,
        ResponseData::Details {
            token: registry.auth_token().as_str().to_string(),
            port,
        },
    )
}

fn handle_close_all_except(request_id: &str, registry: &Registry, keep: SessionId) -> Response {
    let closed = registry.close_all_except(keep);
    Response::success(
        request_id,
        ResponseData::Ok {
            message: format!("Closed {} session(s)", closed),
        },
    )
}

fn handle_kill(request_id: &str, registry: &Registry, session: SessionId) -> Response {
    match registry.close_session(session) {
        Ok(()) => {
            info!(session, "Killed session");
            Response::success(
                request_id,
                ResponseData::Ok {
                    message: format!("Session {} killed", session),
                },
            )
        }
        Err(e) => Response::error(request_id, e.into()),
    }
}

fn handle_list_sessions(request_id: &str, registry: &Registry) -> Response {
    let sessions = registry.sessions().iter().map(|s| s.info()).collect();
    Response::success(request_id, ResponseData::Sessions { sessions })
}

fn handle_shutdown(request_id: &str, stop: &CancellationToken) -> Response {
    info!("Received shutdown command, stopping daemon");

    let stop = stop.clone();
    tokio::spawn(async move {
        // Let the response flush before the accept loop exits.
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.cancel();
    });

    Response::success(
        request_id,
        ResponseData::Ok {
            message: "Daemon shutting down".to_string(),
        },
    )
}
