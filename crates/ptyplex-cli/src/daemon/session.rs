//! A PTY session: one child process, its pumps, and its attach state.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use ptyplex_core::error::ApiError;
use ptyplex_core::protocol::SessionInfo;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::lifecycle::{ExitCause, FlowGate, Lifecycle};
use crate::daemon::pty::{PtyControl, PtySession, TermSize};
use crate::daemon::pump;
use crate::daemon::registry::Registry;

/// Unique identifier for a session. Assigned by the registry, never reused.
pub type SessionId = u64;

/// Channel capacity between pumps and the endpoint. One slot keeps a slow
/// client pushing back on the PTY instead of buffering in the daemon.
const CHANNEL_CAPACITY: usize = 1;

/// Errors from session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to spawn {}: {reason}", command.join(" "))]
    Spawn { command: Vec<String>, reason: String },

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {0} already has a connected client")]
    AlreadyConnected(SessionId),

    #[error("daemon is shutting down")]
    ShuttingDown,
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Spawn { command, reason } => ApiError::spawn_failed(&command, &reason),
            SessionError::NotFound(id) => ApiError::session_not_found(id),
            SessionError::AlreadyConnected(id) => ApiError::already_connected(id),
            SessionError::ShuttingDown => ApiError::shutting_down(),
        }
    }
}

#[derive(Debug, Default)]
struct AttachState {
    connected: bool,
    missed_sweeps: u32,
}

/// A running PTY session.
pub struct Session {
    id: SessionId,
    command: Vec<String>,
    created_at: DateTime<Utc>,
    pid: Option<u32>,
    lifecycle: Lifecycle,
    flow: Arc<FlowGate>,
    state: Mutex<AttachState>,
    pty: Arc<PtyControl>,
    /// Bytes to write to the child. Taken on release.
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    /// Bytes produced by the child. Held by the attached endpoint.
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    released: AtomicBool,
    done: CancellationToken,
}

impl Session {
    /// Spawn the child and start its three pumps.
    ///
    /// On failure nothing is left running.
    pub(crate) fn spawn(
        id: SessionId,
        command: &[String],
        size: TermSize,
        cwd: Option<&Path>,
        parent: &CancellationToken,
    ) -> Result<Arc<Self>, SessionError> {
        let spawn_error = |e: anyhow::Error| SessionError::Spawn {
            command: command.to_vec(),
            reason: format!("{:#}", e),
        };

        let pty = PtySession::spawn(command, size, cwd).map_err(spawn_error)?;
        let pid = pty.process_id();
        let io = pty.reader().and_then(|r| pty.writer().map(|w| (r, w)));
        let (control, mut child) = pty.into_parts();
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                abandon(id, &control);
                if let Err(e) = child.wait() {
                    debug!(session = id, "Failed to reap half-spawned child: {}", e);
                }
                return Err(spawn_error(e));
            }
        };

        let lifecycle = Lifecycle::child_of(parent);
        let flow = Arc::new(FlowGate::new());
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let started = pump::spawn_writer(id, writer, outbound_rx, lifecycle.clone())
            .and_then(|_| {
                pump::spawn_reader(id, reader, inbound_tx, flow.clone(), lifecycle.clone())
            })
            .and_then(|_| pump::spawn_waiter(id, child, lifecycle.clone()));
        if let Err(e) = started {
            lifecycle.cancel(ExitCause::Shutdown);
            abandon(id, &control);
            return Err(spawn_error(e));
        }

        info!(session = id, ?pid, "Spawned {:?}", command);

        Ok(Arc::new(Self {
            id,
            command: command.to_vec(),
            created_at: Utc::now(),
            pid,
            lifecycle,
            flow,
            state: Mutex::new(AttachState::default()),
            pty: Arc::new(control),
            outbound: Mutex::new(Some(outbound_tx)),
            inbound: tokio::sync::Mutex::new(inbound_rx),
            released: AtomicBool::new(false),
            done: CancellationToken::new(),
        }))
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> TermSize {
        self.pty.size()
    }

    pub fn info(&self) -> SessionInfo {
        let size = self.size();
        SessionInfo {
            id: self.id,
            command: self.command.clone(),
            created_at: self.created_at.to_rfc3339(),
            connected: self.is_connected(),
            paused: self.flow.is_paused(),
            rows: size.rows,
            cols: size.cols,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn flow(&self) -> &FlowGate {
        &self.flow
    }

    pub fn is_connected(&self) -> bool {
        self.lock_state().connected
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Returns true if this call paused output.
    pub fn pause(&self) -> bool {
        self.flow.pause()
    }

    /// Returns true if this call resumed output.
    pub fn resume(&self) -> bool {
        self.flow.resume()
    }

    /// Queue bytes for the child's stdin.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), SessionError> {
        let tx = self
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::NotFound(self.id))?;
        tokio::select! {
            _ = self.lifecycle.cancelled() => Err(SessionError::NotFound(self.id)),
            res = tx.send(data) => res.map_err(|_| SessionError::NotFound(self.id)),
        }
    }

    pub fn resize(&self, size: TermSize) -> anyhow::Result<()> {
        self.pty.resize(size)
    }

    /// Cancel the session. Cleanup runs once the supervisor observes it.
    pub fn close(&self, cause: ExitCause) -> bool {
        self.lifecycle.cancel(cause)
    }

    /// Mark a client as connected.
    pub fn try_attach(self: &Arc<Self>) -> Result<Attachment, SessionError> {
        self.check_attachable()?;
        let mut state = self.lock_state();
        if state.connected {
            return Err(SessionError::AlreadyConnected(self.id));
        }
        state.connected = true;
        state.missed_sweeps = 0;
        debug!(session = self.id, "Client attached");
        Ok(Attachment {
            session: Arc::clone(self),
        })
    }

    /// Whether an attach would succeed right now, without attaching.
    pub fn check_attachable(&self) -> Result<(), SessionError> {
        if self.lifecycle.is_cancelled() || self.is_released() {
            return Err(SessionError::NotFound(self.id));
        }
        if self.lock_state().connected {
            return Err(SessionError::AlreadyConnected(self.id));
        }
        Ok(())
    }

    fn detach(&self) {
        self.lock_state().connected = false;
        debug!(session = self.id, "Client detached");
    }

    /// Count one reaper sweep. Returns the consecutive misses so far.
    pub(crate) fn note_missed_sweep(&self) -> u32 {
        let mut state = self.lock_state();
        if state.connected {
            state.missed_sweeps = 0;
        } else {
            state.missed_sweeps += 1;
        }
        state.missed_sweeps
    }

    /// Resolves once [`Session::release`] has completed and the child has
    /// been hung up or killed.
    pub async fn wait_released(&self) {
        self.done.cancelled().await
    }

    pub(crate) fn inbound(&self) -> &tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>> {
        &self.inbound
    }

    /// Release every resource the session owns. Safe to call from any number
    /// of places; only the first call does anything.
    pub(crate) fn release(&self, registry: Option<&Registry>) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lifecycle.cancel(ExitCause::Shutdown);
        let cause = self.lifecycle.cause().unwrap_or(ExitCause::Shutdown);

        // Leave the registry first so nothing can reach a half-released session.
        if cause.removes_entry() {
            if let Some(registry) = registry {
                registry.remove(self.id);
            }
        }

        self.flow.close();
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Ok(mut rx) = self.inbound.try_lock() {
            rx.close();
        }

        if cause.needs_kill() {
            self.terminate();
        } else {
            self.pty.close();
            self.done.cancel();
        }
        info!(session = self.id, ?cause, "Session released");
    }

    /// Kill the child on its own thread, since the kill waits out a grace
    /// period, then close the PTY.
    fn terminate(&self) {
        let id = self.id;
        let pty = Arc::clone(&self.pty);
        let done = self.done.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("pty-kill-{}", id))
            .spawn(move || {
                if let Err(e) = pty.kill() {
                    warn!(session = id, "Failed to kill child: {:#}", e);
                }
                pty.close();
                done.cancel();
            });
        if let Err(e) = spawned {
            warn!(session = id, "Failed to spawn kill thread, killing inline: {}", e);
            if let Err(e) = self.pty.kill() {
                warn!(session = id, "Failed to kill child: {:#}", e);
            }
            self.pty.close();
            self.done.cancel();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AttachState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Kill and close a PTY whose session never came to life.
fn abandon(id: SessionId, control: &PtyControl) {
    if let Err(e) = control.kill() {
        warn!(session = id, "Failed to kill half-spawned child: {:#}", e);
    }
    control.close();
}

/// Exclusive claim on a session's I/O. Dropping it detaches the client.
pub struct Attachment {
    session: Arc<Session>,
}

impl Attachment {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl std::ops::Deref for Attachment {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.session.detach();
    }
}
