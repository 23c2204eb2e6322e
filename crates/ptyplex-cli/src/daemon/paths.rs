//! Socket, PID, log and certificate path resolution.
//!
//! Priority for socket directory:
//! 1. `PTYPLEX_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/ptyplex` (Linux standard)
//! 3. `~/.ptyplex` (home directory fallback)
//! 4. `/tmp/ptyplex` (last resort)
//!
//! Several daemons can run side by side via `PTYPLEX_INSTANCE` (default:
//! "default"). Each instance gets `{socket_dir}/{instance}.sock`, `.pid` and
//! `.log`.

use std::env;
use std::path::PathBuf;

/// Certificate file name inside the certificate directory.
pub const CERT_FILE: &str = "localhost.pem";

/// Private key file name inside the certificate directory.
pub const KEY_FILE: &str = "localhost-key.pem";

/// Get current instance name from env or default.
pub fn get_instance() -> String {
    env::var("PTYPLEX_INSTANCE").unwrap_or_else(|_| "default".to_string())
}

/// Get socket directory with priority fallback. Empty variables are ignored.
pub fn get_socket_dir() -> PathBuf {
    if let Ok(dir) = env::var("PTYPLEX_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("ptyplex");
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".ptyplex");
    }

    env::temp_dir().join("ptyplex")
}

/// Directory holding `localhost.pem` and `localhost-key.pem`.
///
/// `--dev` uses `./certs`; otherwise `PTYPLEX_CERT_DIR`, then
/// `~/.ptyplex/certs`, then `./certs`.
pub fn get_cert_dir(dev: bool) -> PathBuf {
    if dev {
        return PathBuf::from("certs");
    }

    if let Ok(dir) = env::var("PTYPLEX_CERT_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    match dirs::home_dir() {
        Some(home) => home.join(".ptyplex").join("certs"),
        None => PathBuf::from("certs"),
    }
}

/// Validate an instance name to prevent path traversal.
///
/// Names must be non-empty, contain only alphanumerics, hyphens and
/// underscores, and not start with a hyphen. Anything else becomes
/// "default".
pub(crate) fn sanitize_instance_name(name: &str) -> String {
    let is_valid = !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if is_valid {
        name.to_string()
    } else {
        tracing::warn!(
            "Invalid instance name '{}', using 'default'. Names must contain only alphanumeric, hyphen, underscore.",
            name
        );
        "default".to_string()
    }
}

fn instance_file(instance: Option<&str>, extension: &str) -> PathBuf {
    let name = instance.map(String::from).unwrap_or_else(get_instance);
    let safe_name = sanitize_instance_name(&name);
    get_socket_dir().join(format!("{}.{}", safe_name, extension))
}

/// Get socket path for an instance (default: the current one).
pub fn get_socket_path(instance: Option<&str>) -> PathBuf {
    instance_file(instance, "sock")
}

/// Get PID file path for an instance (default: the current one).
pub fn get_pid_path(instance: Option<&str>) -> PathBuf {
    instance_file(instance, "pid")
}

/// Get daemon log path for an instance (default: the current one).
pub fn get_log_path(instance: Option<&str>) -> PathBuf {
    instance_file(instance, "log")
}

/// Ensure socket directory exists with mode 0700.
pub fn ensure_socket_dir() -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = get_socket_dir();
    std::fs::create_dir_all(&dir)?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
