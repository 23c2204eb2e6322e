//! Per-session cancellation and output flow control.
//!
//! Every activity belonging to a session (the three PTY pumps, the streaming
//! endpoint, the registry entry) observes one [`Lifecycle`]. The first caller
//! of [`Lifecycle::cancel`] decides the [`ExitCause`]; everyone else only sees
//! that the session is gone.

use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The child process exited or its PTY hit EOF.
    ProcessExited,
    /// A client asked for the session to be closed.
    ClientClosed,
    /// The daemon is shutting down, or the session was swept or evicted.
    Shutdown,
}

impl ExitCause {
    /// Whether the child still needs to be killed during cleanup.
    pub fn needs_kill(self) -> bool {
        !matches!(self, ExitCause::ProcessExited)
    }

    /// Whether cleanup should remove the registry entry itself.
    ///
    /// Shutdown paths remove entries in bulk before releasing them.
    pub fn removes_entry(self) -> bool {
        !matches!(self, ExitCause::Shutdown)
    }
}

/// Cancellation scope shared by everything that belongs to one session.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    token: CancellationToken,
    cause: Arc<OnceLock<ExitCause>>,
}

impl Lifecycle {
    /// Create a scope that is also cancelled when `parent` is.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: Arc::new(OnceLock::new()),
        }
    }

    /// Cancel with `cause`. Returns true if this call decided the cause.
    pub fn cancel(&self, cause: ExitCause) -> bool {
        if self.token.is_cancelled() {
            // Cancelled through the parent; that already decided the cause.
            let _ = self.cause.set(ExitCause::Shutdown);
        }
        let won = self.cause.set(cause).is_ok();
        self.token.cancel();
        won
    }

    /// The recorded cause, if cancelled.
    ///
    /// A scope cancelled through its parent has no explicit cause and
    /// reports [`ExitCause::Shutdown`].
    pub fn cause(&self) -> Option<ExitCause> {
        match self.cause.get() {
            Some(cause) => Some(*cause),
            None if self.token.is_cancelled() => Some(ExitCause::Shutdown),
            None => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Output state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Running,
    Paused,
    Closed,
}

/// Pause/resume gate between the PTY reader and the outbound channel.
///
/// Sessions start paused so nothing is read before a client is attached.
/// Pausing stops the reader from pulling more bytes off the PTY, which lets
/// the kernel buffer fill and the child block on write.
#[derive(Debug)]
pub struct FlowGate {
    state: watch::Sender<FlowState>,
}

impl Default for FlowGate {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(FlowState::Paused);
        Self { state }
    }

    /// Returns true if the gate was running.
    pub fn pause(&self) -> bool {
        self.transition(FlowState::Running, FlowState::Paused)
    }

    /// Returns true if the gate was paused.
    pub fn resume(&self) -> bool {
        self.transition(FlowState::Paused, FlowState::Running)
    }

    /// Close for good. Waiters wake up and see the gate closed.
    pub fn close(&self) {
        self.state.send_replace(FlowState::Closed);
    }

    pub fn state(&self) -> FlowState {
        *self.state.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.state() == FlowState::Paused
    }

    pub fn subscribe(&self) -> watch::Receiver<FlowState> {
        self.state.subscribe()
    }

    /// Wait until output may flow. Returns false if the gate closed instead.
    pub async fn wait_running(&self) -> bool {
        let mut rx = self.state.subscribe();
        let running = match rx.wait_for(|s| *s != FlowState::Paused).await {
            Ok(state) => *state == FlowState::Running,
            Err(_) => false,
        };
        running
    }

    fn transition(&self, from: FlowState, to: FlowState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}
