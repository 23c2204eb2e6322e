//! Control-plane client for the daemon process.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ptyplex_core::protocol::{Command, Request, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::daemon::paths;

/// Maximum time to wait for daemon to start up.
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between socket connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default time to wait for a response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for communicating with the daemon.
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    /// Connect to the daemon, starting it if necessary.
    pub async fn connect() -> Result<Self> {
        let socket_path = paths::get_socket_path(None);

        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            debug!("Connected to existing daemon");
            return Ok(Self { stream });
        }

        info!("Daemon not running, starting...");
        let child = Self::start_daemon()?;

        let stream = Self::wait_for_daemon(&socket_path, child).await?;
        Ok(Self { stream })
    }

    /// Connect to a running daemon without starting one.
    ///
    /// Returns `None` if nothing is listening.
    pub async fn connect_existing() -> Result<Option<Self>> {
        let socket_path = paths::get_socket_path(None);
        Self::connect_to(&socket_path).await
    }

    pub async fn connect_to(socket_path: &Path) -> Result<Option<Self>> {
        match UnixStream::connect(socket_path).await {
            Ok(stream) => Ok(Some(Self { stream })),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to connect to {:?}", socket_path)),
        }
    }

    /// Start the daemon as a background process.
    ///
    /// Returns the child process handle so we can detect early crashes.
    fn start_daemon() -> Result<std::process::Child> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe().context("Failed to get current executable path")?;

        // process_group(0) keeps the daemon out of the CLI's terminal job
        // control, so it survives the terminal closing.
        let child = std::process::Command::new(exe)
            .arg("daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .context("Failed to spawn daemon process")?;

        Ok(child)
    }

    /// Wait for the daemon socket to become available, failing fast if the
    /// daemon process exits first.
    async fn wait_for_daemon(
        socket_path: &Path,
        mut child: std::process::Child,
    ) -> Result<UnixStream> {
        let start = std::time::Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    bail!(
                        "Daemon exited immediately with status: {} (check {:?} or run 'ptyplex daemon' directly to diagnose)",
                        status,
                        paths::get_log_path(None)
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    debug!("Error checking daemon status: {}", e);
                }
            }

            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    info!("Connected to daemon after {:?}", start.elapsed());
                    return Ok(stream);
                }
                Err(_) => {
                    if start.elapsed() > DAEMON_STARTUP_TIMEOUT {
                        bail!("Daemon failed to start within {:?}", DAEMON_STARTUP_TIMEOUT);
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Send `command` under a fresh request id.
    pub async fn send(&mut self, command: Command) -> Result<Response> {
        let request = Request {
            id: uuid::Uuid::new_v4().to_string(),
            command,
        };
        self.request(request).await
    }

    /// Send a request and wait for a response.
    pub async fn request(&mut self, request: Request) -> Result<Response> {
        self.request_with_timeout(request, REQUEST_TIMEOUT).await
    }

    /// Send a request and wait for a response with a custom timeout.
    pub async fn request_with_timeout(
        &mut self,
        request: Request,
        timeout_duration: Duration,
    ) -> Result<Response> {
        let request_json =
            serde_json::to_string(&request).context("Failed to serialize request")?;
        debug!("Sending: {}", request_json);

        self.stream
            .write_all(request_json.as_bytes())
            .await
            .context("Failed to write request")?;
        self.stream
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        self.stream.flush().await.context("Failed to flush")?;

        let (reader, _writer) = self.stream.split();
        let mut reader = BufReader::new(reader);
        let mut response_line = String::new();

        let bytes_read = timeout(timeout_duration, reader.read_line(&mut response_line))
            .await
            .context("Request timed out")?
            .context("Failed to read response")?;

        if bytes_read == 0 {
            bail!("Daemon closed connection unexpectedly");
        }

        debug!("Received: {}", response_line.trim());

        let response: Response =
            serde_json::from_str(&response_line).context("Failed to parse response")?;
        if response.id != request.id {
            bail!(
                "Response id {:?} does not match request id {:?}",
                response.id,
                request.id
            );
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::auth::AuthToken;
    use crate::daemon::registry::Registry;
    use crate::daemon::DaemonServer;
    use ptyplex_core::protocol::ResponseData;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_client_connects_to_running_daemon() {
        let short_id = uuid::Uuid::new_v4().simple().to_string();
        let socket_path = PathBuf::from("/tmp").join(format!("ptyplex-client-{}.sock", &short_id[..8]));
        let pid_path = socket_path.with_extension("pid");

        let registry = Registry::new(AuthToken::generate(), None);
        let mut server = DaemonServer::bind_to(socket_path.clone(), pid_path.clone(), registry)
            .await
            .expect("Failed to bind server");
        let stop = server.stop_token();
        let server_handle = tokio::spawn(async move {
            let _ = timeout(Duration::from_secs(5), server.run()).await;
        });

        let mut client = DaemonClient::connect_to(&socket_path)
            .await
            .expect("connect")
            .expect("daemon is listening");

        let request = Request {
            id: "client-test-1".to_string(),
            command: Command::ListSessions,
        };
        let response = client.request(request).await.expect("Request failed");
        assert!(response.success);
        assert_eq!(response.id, "client-test-1");

        let response = client.send(Command::ListSessions).await.expect("Request failed");
        assert!(matches!(response.data, Some(ResponseData::Sessions { .. })));

        stop.cancel();
        let _ = server_handle.await;
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = DaemonClient::connect_to(&dir.path().join("absent.sock"))
            .await
            .expect("missing socket is not an error");
        assert!(client.is_none());
    }
}
