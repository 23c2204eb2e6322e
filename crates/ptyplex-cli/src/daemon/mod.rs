//! Daemon process: PTY sessions, their registry, the streaming transport,
//! and the control socket.

pub mod auth;
pub mod client;
pub mod endpoint;
pub mod lifecycle;
pub mod paths;
pub mod pty;
pub mod pump;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

use std::path::PathBuf;

// Public API - used by main.rs
pub use client::DaemonClient;
pub use server::DaemonServer;

/// Resolved daemon settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub port_start: u16,
    /// Working directory for sessions spawned without one.
    pub default_cwd: Option<PathBuf>,
}

impl DaemonConfig {
    /// Explicit `cert`/`key` win over the files in the certificate directory.
    pub fn resolve(
        dev: bool,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
        port_start: u16,
    ) -> Self {
        let cert_dir = paths::get_cert_dir(dev);
        Self {
            cert: cert.unwrap_or_else(|| cert_dir.join(paths::CERT_FILE)),
            key: key.unwrap_or_else(|| cert_dir.join(paths::KEY_FILE)),
            port_start,
            default_cwd: pty::default_cwd(dev),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::paths::tests::EnvGuard;

    #[test]
    fn test_dev_config_uses_local_certs() {
        let config = DaemonConfig::resolve(true, None, None, 34373);
        assert_eq!(config.cert, PathBuf::from("certs/localhost.pem"));
        assert_eq!(config.key, PathBuf::from("certs/localhost-key.pem"));
        assert_eq!(config.default_cwd, std::env::current_dir().ok());
    }

    #[test]
    fn test_cert_dir_from_env() {
        let _guard = EnvGuard::new(&["PTYPLEX_CERT_DIR"]);
        // SAFETY: We hold the env mutex via _guard
        unsafe { std::env::set_var("PTYPLEX_CERT_DIR", "/srv/tls") };

        let config = DaemonConfig::resolve(false, None, None, 40000);
        assert_eq!(config.cert, PathBuf::from("/srv/tls/localhost.pem"));
        assert_eq!(config.key, PathBuf::from("/srv/tls/localhost-key.pem"));
        assert_eq!(config.port_start, 40000);
    }

    #[test]
    fn test_explicit_files_override() {
        let config = DaemonConfig::resolve(
            true,
            Some(PathBuf::from("/a/cert.pem")),
            Some(PathBuf::from("/b/key.pem")),
            1,
        );
        assert_eq!(config.cert, PathBuf::from("/a/cert.pem"));
        assert_eq!(config.key, PathBuf::from("/b/key.pem"));
    }
}
