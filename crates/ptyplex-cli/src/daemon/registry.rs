//! Session registry and reaper.
//!
//! The registry is the single source of truth for whether a session exists:
//! an entry is present exactly while the session's PTY and child have not
//! been released. All map operations run under one mutex and never hold it
//! across a kill, close or other blocking call.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::daemon::auth::AuthToken;
use crate::daemon::lifecycle::ExitCause;
use crate::daemon::pty::TermSize;
use crate::daemon::session::{Attachment, Session, SessionError, SessionId};

/// How often the reaper looks for abandoned sessions.
pub const REAPER_PERIOD: Duration = Duration::from_secs(10);

/// Consecutive disconnected sweeps before a session is reaped.
pub const REAPER_THRESHOLD: u32 = 2;

/// Owns every live session plus the process-wide auth secret and port.
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    auth_token: AuthToken,
    port: OnceLock<u16>,
    root: CancellationToken,
    default_cwd: Option<PathBuf>,
}

impl Registry {
    pub fn new(auth_token: AuthToken, default_cwd: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            auth_token,
            port: OnceLock::new(),
            root: CancellationToken::new(),
            default_cwd,
        })
    }

    pub fn auth_token(&self) -> &AuthToken {
        &self.auth_token
    }

    /// The transport port, once the listener is bound.
    pub fn port(&self) -> Option<u16> {
        self.port.get().copied()
    }

    pub fn set_port(&self, port: u16) {
        if self.port.set(port).is_err() {
            debug!("Transport port already recorded, ignoring {}", port);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Spawn a session and register it.
    ///
    /// `cwd` falls back to the registry's default working directory.
    pub fn create_session(
        self: &Arc<Self>,
        command: &[String],
        size: Option<TermSize>,
        cwd: Option<&Path>,
    ) -> Result<SessionId, SessionError> {
        if self.is_shutting_down() {
            return Err(SessionError::ShuttingDown);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cwd = cwd.or(self.default_cwd.as_deref());
        let session = Session::spawn(id, command, size.unwrap_or_default(), cwd, &self.root)?;

        let inserted = {
            let mut sessions = self.lock();
            // Checked under the lock so shutdown's drain cannot miss us.
            if self.root.is_cancelled() {
                false
            } else {
                sessions.insert(id, Arc::clone(&session));
                true
            }
        };
        if !inserted {
            session.close(ExitCause::Shutdown);
            session.release(None);
            return Err(SessionError::ShuttingDown);
        }

        self.supervise(&session);
        Ok(id)
    }

    /// Release the session as soon as its lifecycle is cancelled, whoever
    /// cancels it.
    fn supervise(self: &Arc<Self>, session: &Arc<Session>) {
        let registry = Arc::downgrade(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            session.lifecycle().cancelled().await;
            let registry = registry.upgrade();
            session.release(registry.as_deref());
        });
    }

    pub fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        self.lock().remove(&id)
    }

    pub fn snapshot_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.lock().values().cloned().collect();
        sessions.sort_unstable_by_key(|s| s.id());
        sessions
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Claim a session for a client connection.
    pub fn attach(&self, id: SessionId) -> Result<Attachment, SessionError> {
        self.lookup(id)
            .ok_or(SessionError::NotFound(id))?
            .try_attach()
    }

    /// Report whether `attach` would succeed, without attaching.
    pub fn check(&self, id: SessionId) -> Result<(), SessionError> {
        self.lookup(id)
            .ok_or(SessionError::NotFound(id))?
            .check_attachable()
    }

    /// Close one session as if its client asked for it.
    pub fn close_session(&self, id: SessionId) -> Result<(), SessionError> {
        let session = self.lookup(id).ok_or(SessionError::NotFound(id))?;
        session.close(ExitCause::ClientClosed);
        session.release(Some(self));
        Ok(())
    }

    /// Close every session except `keep`. Returns how many were closed.
    pub fn close_all_except(&self, keep: SessionId) -> usize {
        let evicted: Vec<Arc<Session>> = {
            let mut sessions = self.lock();
            let ids: Vec<SessionId> = sessions.keys().copied().filter(|id| *id != keep).collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &evicted {
            session.close(ExitCause::Shutdown);
            session.release(Some(self));
        }
        if !evicted.is_empty() {
            info!("Closed {} session(s), kept {}", evicted.len(), keep);
        }
        evicted.len()
    }

    /// Shut every session down and refuse new ones. Returns the sessions
    /// that were shut down.
    pub fn shutdown(&self) -> Vec<Arc<Session>> {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.lock();
            self.root.cancel();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in &drained {
            session.close(ExitCause::Shutdown);
            session.release(Some(self));
        }
        info!("Registry shut down, released {} session(s)", drained.len());
        drained
    }

    /// One reaper pass. Returns the ids that were reaped.
    pub fn sweep(&self) -> Vec<SessionId> {
        let reaped: Vec<Arc<Session>> = {
            let mut sessions = self.lock();
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, s)| s.note_missed_sweep() >= REAPER_THRESHOLD)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &reaped {
            info!(session = session.id(), "Reaping disconnected session");
            session.close(ExitCause::Shutdown);
            session.release(Some(self));
        }
        reaped.iter().map(|s| s.id()).collect()
    }

    /// Run [`Registry::sweep`] every `period` until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let root = self.root.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = root.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let reaped = registry.sweep();
                if !reaped.is_empty() {
                    debug!("Reaper released {:?}", reaped);
                }
            }
            debug!("Reaper stopped");
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<Registry> {
        Registry::new(AuthToken::generate(), None)
    }

    fn cat() -> Vec<String> {
        vec!["cat".to_string()]
    }

    /// Poll until `pid` is gone (reaped), or fail after five seconds.
    async fn assert_process_gone(pid: u32) {
        let pid = pid as libc::pid_t;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        // SAFETY: signal 0 only checks for existence.
        while unsafe { libc::kill(pid, 0) } == 0 {
            assert!(tokio::time::Instant::now() < deadline, "process {} still alive", pid);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn wait_until_removed(registry: &Registry, id: SessionId) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.lookup(id).is_some() {
            assert!(tokio::time::Instant::now() < deadline, "session {} not removed", id);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ids_are_monotonic() {
        let registry = registry();
        let a = registry.create_session(&cat(), None, None).expect("spawn a");
        let b = registry.create_session(&cat(), None, None).expect("spawn b");
        assert!(b > a);
        assert_eq!(registry.snapshot_ids(), vec![a, b]);
        registry.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spawn_failure_leaves_nothing() {
        let registry = registry();
        let err = registry
            .create_session(&["/definitely/not/a/binary".to_string()], None, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Spawn { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_twice_then_reattach() {
        let registry = registry();
        let id = registry.create_session(&cat(), None, None).expect("spawn");

        let first = registry.attach(id).expect("attach");
        assert!(matches!(registry.attach(id), Err(SessionError::AlreadyConnected(_))));
        assert!(matches!(registry.check(id), Err(SessionError::AlreadyConnected(_))));
        drop(first);
        registry.check(id).expect("attachable after detach");
        let _second = registry.attach(id).expect("reattach");

        assert!(matches!(registry.attach(999), Err(SessionError::NotFound(999))));
        registry.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_process_exit_removes_session() {
        let registry = registry();
        let id = registry
            .create_session(
                &["sh".to_string(), "-c".to_string(), "exit 0".to_string()],
                None,
                None,
            )
            .expect("spawn");

        wait_until_removed(&registry, id).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_session_kills_and_removes() {
        let registry = registry();
        let id = registry.create_session(&cat(), None, None).expect("spawn");
        let session = registry.lookup(id).expect("lookup");
        let pid = session.pid().expect("pid");

        registry.close_session(id).expect("close");
        assert!(registry.lookup(id).is_none());
        assert_eq!(session.lifecycle().cause(), Some(ExitCause::ClientClosed));
        assert_process_gone(pid).await;

        assert!(matches!(
            registry.close_session(id),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sweep_reaps_after_two_misses() {
        let registry = registry();
        let id = registry.create_session(&cat(), None, None).expect("spawn");
        let pid = registry.lookup(id).and_then(|s| s.pid()).expect("pid");

        assert!(registry.sweep().is_empty());
        assert!(registry.lookup(id).is_some());
        assert_eq!(registry.sweep(), vec![id]);
        assert!(registry.lookup(id).is_none());
        assert_process_gone(pid).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sweep_spares_connected_and_resets_on_reattach() {
        let registry = registry();
        let id = registry.create_session(&cat(), None, None).expect("spawn");

        // One miss, then a reconnect resets the counter.
        assert!(registry.sweep().is_empty());
        let attachment = registry.attach(id).expect("attach");
        for _ in 0..3 {
            assert!(registry.sweep().is_empty());
        }
        drop(attachment);
        assert!(registry.sweep().is_empty());
        assert!(registry.lookup(id).is_some());

        registry.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reaper_task_reclaims_abandoned_session() {
        let registry = registry();
        let id = registry.create_session(&cat(), None, None).expect("spawn");
        let reaper = registry.spawn_reaper(Duration::from_millis(50));

        wait_until_removed(&registry, id).await;

        registry.shutdown();
        tokio::time::timeout(Duration::from_secs(1), reaper)
            .await
            .expect("reaper stops on shutdown")
            .expect("join");
    }

    /// Whether `pid` is running. An unreaped zombie does not count.
    fn is_running(pid: u32) -> bool {
        std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .ok()
            .and_then(|stat| {
                let (_, rest) = stat.rsplit_once(')')?;
                rest.trim_start().chars().next()
            })
            .is_some_and(|state| state != 'Z')
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_hangs_up_background_jobs() {
        let registry = registry();
        let dir = tempfile::tempdir().expect("tempdir");
        let pid_file = dir.path().join("job.pid");
        let shell = vec!["bash".to_string(), "--norc".to_string(), "-i".to_string()];
        let id = registry.create_session(&shell, None, None).expect("spawn bash");
        let session = registry.lookup(id).expect("session");

        let line = format!("unset HISTFILE; sleep 4242 & echo $! > {}\n", pid_file.display());
        session.write(line.into_bytes()).await.expect("write");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let job = loop {
            let pid = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|text| text.trim().parse::<u32>().ok());
            if let Some(pid) = pid {
                break pid;
            }
            assert!(tokio::time::Instant::now() < deadline, "background job never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert!(is_running(job));

        registry.close_session(id).expect("close");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while is_running(job) {
            assert!(tokio::time::Instant::now() < deadline, "background job {} survived", job);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), session.wait_released())
            .await
            .expect("released");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_all_except_keeps_one() {
        let registry = registry();
        let keep = registry.create_session(&cat(), None, None).expect("spawn");
        let others: Vec<_> = (0..3)
            .map(|_| registry.create_session(&cat(), None, None).expect("spawn"))
            .collect();

        assert_eq!(registry.close_all_except(keep), others.len());
        assert_eq!(registry.snapshot_ids(), vec![keep]);
        registry.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_refuses_new_sessions() {
        let registry = registry();
        let id = registry.create_session(&cat(), None, None).expect("spawn");
        let pid = registry.lookup(id).and_then(|s| s.pid()).expect("pid");

        assert_eq!(registry.shutdown().len(), 1);
        assert!(registry.is_empty());
        assert_process_gone(pid).await;

        assert!(matches!(
            registry.create_session(&cat(), None, None),
            Err(SessionError::ShuttingDown)
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_hundred_sessions_created_and_torn_down_concurrently() {
        let registry = registry();

        let mut spawns = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let registry = Arc::clone(&registry);
            spawns.spawn(async move {
                let id = registry.create_session(&cat(), None, None).expect("spawn");
                let pid = registry.lookup(id).and_then(|s| s.pid()).expect("pid");
                (id, pid)
            });
        }
        let mut created = Vec::new();
        while let Some(res) = spawns.join_next().await {
            created.push(res.expect("join"));
        }
        assert_eq!(registry.len(), 100);

        // Race every teardown path against the others.
        let mut closers = tokio::task::JoinSet::new();
        for (i, (id, _)) in created.iter().copied().enumerate() {
            let registry = Arc::clone(&registry);
            closers.spawn(async move {
                match i % 3 {
                    0 => {
                        let _ = registry.close_session(id);
                    }
                    1 => {
                        if let Some(session) = registry.lookup(id) {
                            session.close(ExitCause::ClientClosed);
                        }
                    }
                    _ => {
                        registry.sweep();
                    }
                }
            });
        }
        let shutdown = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.shutdown() })
        };
        while let Some(res) = closers.join_next().await {
            res.expect("join");
        }
        shutdown.await.expect("shutdown");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !registry.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "registry not drained");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for (_, pid) in created {
            assert_process_gone(pid).await;
        }
    }
}
