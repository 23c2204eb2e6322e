//! Pump tasks bridging a PTY to a session's channels.
//!
//! PTY reads, writes and process waits are blocking OS calls, so each pump
//! runs on its own thread and drives async waits with [`Handle::block_on`].
//! Every blocking wait is raced against the session's [`Lifecycle`] so that
//! cancellation is observed while the pump sits in a channel operation.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use portable_pty::Child;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::daemon::lifecycle::{ExitCause, FlowGate, Lifecycle};
use crate::daemon::session::SessionId;

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Whether a read error means the other side of the PTY has gone away.
///
/// Linux reports a closed slave as `EIO` on the master rather than EOF.
fn is_end_of_stream(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

/// Spawn the read pump: PTY output → `tx`, gated by `flow`.
pub fn spawn_reader(
    id: SessionId,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
    flow: Arc<FlowGate>,
    lifecycle: Lifecycle,
) -> Result<JoinHandle<()>> {
    let handle = Handle::try_current().context("Read pump needs a Tokio runtime")?;
    std::thread::Builder::new()
        .name(format!("pty-read-{}", id))
        .spawn(move || {
            let mut buf = vec![0u8; READ_BUFFER_SIZE];
            loop {
                let running = handle.block_on(async {
                    tokio::select! {
                        _ = lifecycle.cancelled() => false,
                        running = flow.wait_running() => running,
                    }
                });
                if !running {
                    break;
                }

                let n = match reader.read(&mut buf) {
                    Ok(0) => {
                        debug!(session = id, "PTY reader EOF");
                        break;
                    }
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) if is_end_of_stream(&e) => {
                        debug!(session = id, "PTY reader closed");
                        break;
                    }
                    Err(e) => {
                        warn!(session = id, "PTY read error: {}", e);
                        break;
                    }
                };

                let chunk = buf[..n].to_vec();
                let sent = handle.block_on(async {
                    tokio::select! {
                        _ = lifecycle.cancelled() => false,
                        res = tx.send(chunk) => res.is_ok(),
                    }
                });
                if !sent {
                    break;
                }
            }
            debug!(session = id, "PTY reader exiting");
        })
        .context("Failed to spawn PTY reader thread")
}

/// Spawn the write pump: `rx` → PTY input.
pub fn spawn_writer(
    id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    lifecycle: Lifecycle,
) -> Result<JoinHandle<()>> {
    let handle = Handle::try_current().context("Write pump needs a Tokio runtime")?;
    std::thread::Builder::new()
        .name(format!("pty-write-{}", id))
        .spawn(move || {
            loop {
                let next = handle.block_on(async {
                    tokio::select! {
                        _ = lifecycle.cancelled() => None,
                        data = rx.recv() => data,
                    }
                });
                let Some(data) = next else {
                    break;
                };
                if let Err(e) = write_fully(&mut writer, &data) {
                    warn!(session = id, "PTY write error: {}", e);
                    break;
                }
            }
            debug!(session = id, "PTY writer exiting");
        })
        .context("Failed to spawn PTY writer thread")
}

/// Write the whole buffer, looping on partial writes.
fn write_fully(writer: &mut dyn Write, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

/// Spawn the wait pump: child exit → cancel with [`ExitCause::ProcessExited`].
pub fn spawn_waiter(
    id: SessionId,
    mut child: Box<dyn Child + Send + Sync>,
    lifecycle: Lifecycle,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", id))
        .spawn(move || {
            match child.wait() {
                Ok(status) => debug!(session = id, "Child exited: {:?}", status),
                Err(e) => warn!(session = id, "Failed to wait for child: {}", e),
            }
            if lifecycle.cancel(ExitCause::ProcessExited) {
                info!(session = id, "Process exited");
            }
        })
        .context("Failed to spawn PTY wait thread")
}
