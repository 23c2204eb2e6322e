//! PTY allocation and control using portable-pty.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use ptyplex_core::wire::WindowSize;
use tracing::debug;

/// Terminal size in rows and columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl From<WindowSize> for TermSize {
    fn from(size: WindowSize) -> Self {
        Self {
            rows: size.rows,
            cols: size.cols,
        }
    }
}

/// Working directory for sessions spawned without an explicit one.
///
/// Development mode starts in the daemon's own directory; otherwise the
/// user's home directory.
pub fn default_cwd(dev: bool) -> Option<PathBuf> {
    if dev {
        std::env::current_dir().ok()
    } else {
        dirs::home_dir().or_else(|| std::env::current_dir().ok())
    }
}

/// How long a hung-up child gets before SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_millis(250);

const KILL_POLLS: u32 = 5;

/// A freshly spawned PTY: master side plus child process.
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    size: TermSize,
}

impl PtySession {
    /// Spawn a command in a new PTY.
    pub fn spawn(command: &[String], size: TermSize, cwd: Option<&Path>) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            anyhow::bail!("Command cannot be empty");
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(size.into())
            .context("Failed to open PTY")?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.env("TERM", "xterm-256color");
        cmd.env("TERM_PROGRAM", "ptyplex");
        if let Some(dir) = cwd {
            if !dir.is_dir() {
                anyhow::bail!("Working directory {} does not exist", dir.display());
            }
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .context("Failed to spawn command")?;
        // Only the child keeps the slave open, so EOF on the master tracks it.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child,
            size,
        })
    }

    /// Get a reader for the PTY output.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>> {
        self.master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
    }

    /// Get a writer for the PTY input. Can only be taken once.
    pub fn writer(&self) -> Result<Box<dyn Write + Send>> {
        self.master
            .take_writer()
            .context("Failed to take PTY writer")
    }

    pub fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Split into the control half (resize, kill, close) and the child, which
    /// goes to whoever waits on it.
    pub fn into_parts(self) -> (PtyControl, Box<dyn Child + Send + Sync>) {
        let control = PtyControl {
            pid: self.child.process_id(),
            killer: Mutex::new(self.child.clone_killer()),
            master: Mutex::new(Some(self.master)),
            size: Mutex::new(self.size),
        };
        (control, self.child)
    }
}

/// Synchronous control over a running PTY.
pub struct PtyControl {
    pid: Option<u32>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    size: Mutex<TermSize>,
}

impl PtyControl {
    /// Resize the PTY; the kernel delivers SIGWINCH to the child.
    pub fn resize(&self, size: TermSize) -> Result<()> {
        if size.rows == 0 || size.cols == 0 {
            anyhow::bail!("Terminal size must be non-zero, got {}x{}", size.rows, size.cols);
        }
        let master = self
            .master
            .lock()
            .map_err(|_| anyhow::anyhow!("Master PTY mutex poisoned"))?;
        let Some(master) = master.as_ref() else {
            anyhow::bail!("PTY is closed");
        };
        master.resize(size.into()).context("Failed to resize PTY")?;
        *self
            .size
            .lock()
            .map_err(|_| anyhow::anyhow!("Size mutex poisoned"))? = size;
        Ok(())
    }

    pub fn size(&self) -> TermSize {
        self.size.lock().map(|s| *s).unwrap_or_default()
    }

    /// Terminate the child and everything in its process group.
    ///
    /// The group gets SIGHUP first so an interactive shell can hang up its
    /// own jobs. Whatever is still running after [`KILL_GRACE`] gets
    /// SIGKILL. Blocks for up to the grace period; call it off the runtime.
    pub fn kill(&self) -> Result<()> {
        let Some(pid) = self.pid.and_then(|p| libc::pid_t::try_from(p).ok()) else {
            return self
                .killer
                .lock()
                .map_err(|_| anyhow::anyhow!("Child killer mutex poisoned"))?
                .kill()
                .context("Failed to hang up child process");
        };

        // The child is a session leader, so its pgid is its pid.
        signal(-pid, libc::SIGHUP).context("Failed to hang up process group")?;
        signal(pid, libc::SIGHUP).context("Failed to hang up child process")?;

        for _ in 0..KILL_POLLS {
            if !is_alive(pid) {
                return Ok(());
            }
            std::thread::sleep(KILL_GRACE / KILL_POLLS);
        }

        debug!(pid, "Child ignored SIGHUP, sending SIGKILL");
        signal(-pid, libc::SIGKILL).context("Failed to kill process group")?;
        signal(pid, libc::SIGKILL).context("Failed to kill child process")
    }

    /// Drop the master side. Later resizes fail.
    pub fn close(&self) {
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
    }
}

/// kill(2). A target that is already gone is not an error.
fn signal(pid: libc::pid_t, sig: libc::c_int) -> std::io::Result<()> {
    // SAFETY: kill(2) takes no pointers.
    if unsafe { libc::kill(pid, sig) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether `pid` still exists. A zombie counts until its parent reaps it.
fn is_alive(pid: libc::pid_t) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Read until `needle` shows up or the deadline passes.
    fn read_until(reader: &mut Box<dyn Read + Send>, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut output = Vec::new();
        let mut buf = [0u8; 1024];
        while Instant::now() < deadline {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    output.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&output).into_owned()
    }

    #[test]
    fn test_spawn_echo_and_read_output() {
        let session = PtySession::spawn(
            &["echo".to_string(), "hello".to_string()],
            TermSize::default(),
            None,
        )
        .expect("Failed to spawn echo");

        let mut reader = session.reader().expect("Failed to get reader");
        let output = read_until(&mut reader, "hello");
        assert!(output.contains("hello"), "got: {:?}", output);
    }

    #[test]
    fn test_spawn_and_write_input() {
        let session = PtySession::spawn(&["cat".to_string()], TermSize::default(), None)
            .expect("Failed to spawn cat");

        let mut writer = session.writer().expect("Failed to get writer");
        let mut reader = session.reader().expect("Failed to get reader");

        writer.write_all(b"test input\n").expect("Failed to write");
        writer.flush().expect("Failed to flush");

        let output = read_until(&mut reader, "test input");
        assert!(output.contains("test input"), "got: {:?}", output);

        let (control, _child) = session.into_parts();
        control.kill().expect("kill");
    }

    #[test]
    fn test_spawn_sets_term_environment() {
        let session = PtySession::spawn(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "echo \"T=$TERM P=$TERM_PROGRAM\"".to_string(),
            ],
            TermSize::default(),
            None,
        )
        .expect("spawn");
        let mut reader = session.reader().expect("reader");
        let output = read_until(&mut reader, "P=ptyplex");
        assert!(output.contains("T=xterm-256color"), "got: {:?}", output);
        assert!(output.contains("P=ptyplex"), "got: {:?}", output);
    }

    #[test]
    fn test_spawn_in_working_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let canonical = dir.path().canonicalize().expect("canonicalize");
        let session = PtySession::spawn(&["pwd".to_string()], TermSize::default(), Some(&canonical))
            .expect("spawn");
        let mut reader = session.reader().expect("reader");
        let expected = canonical.display().to_string();
        let output = read_until(&mut reader, &expected);
        assert!(output.contains(&expected), "got: {:?}", output);
    }

    #[test]
    fn test_spawn_rejects_missing_working_directory() {
        let result = PtySession::spawn(
            &["sh".to_string()],
            TermSize::default(),
            Some(Path::new("/definitely/not/a/real/dir")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_spawn_empty_command_fails() {
        assert!(PtySession::spawn(&[], TermSize::default(), None).is_err());
    }

    #[test]
    fn test_resize_updates_size_and_rejects_zero() {
        let session = PtySession::spawn(&["cat".to_string()], TermSize::default(), None)
            .expect("spawn");
        let (control, _child) = session.into_parts();

        control.resize(TermSize { rows: 40, cols: 120 }).expect("resize");
        assert_eq!(control.size(), TermSize { rows: 40, cols: 120 });

        assert!(control.resize(TermSize { rows: 0, cols: 80 }).is_err());
        assert_eq!(control.size(), TermSize { rows: 40, cols: 120 });

        control.close();
        assert!(control.resize(TermSize { rows: 10, cols: 10 }).is_err());
        control.kill().expect("kill");
    }

    #[test]
    fn test_kill_terminates_child() {
        let session = PtySession::spawn(&["sleep".to_string(), "30".to_string()], TermSize::default(), None)
            .expect("spawn");
        let (control, mut child) = session.into_parts();
        control.kill().expect("kill");
        let status = child.wait().expect("wait");
        assert!(!status.success());
    }

    #[test]
    fn test_kill_escalates_when_hangup_is_ignored() {
        let session = PtySession::spawn(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "trap '' HUP; echo ready; sleep 30".to_string(),
            ],
            TermSize::default(),
            None,
        )
        .expect("spawn");
        let mut reader = session.reader().expect("reader");
        read_until(&mut reader, "ready");

        let (control, mut child) = session.into_parts();
        let waiter = std::thread::spawn(move || child.wait());

        let started = Instant::now();
        control.kill().expect("kill");
        assert!(started.elapsed() >= KILL_GRACE);

        let status = waiter.join().expect("join").expect("wait");
        assert!(!status.success());
    }
}
