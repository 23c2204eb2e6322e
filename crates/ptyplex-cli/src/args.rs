//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::daemon::transport::DEFAULT_PORT_START;

/// PTY session multiplexer.
///
/// Spawns processes in pseudo-terminals owned by a background daemon and
/// streams each one to a single authenticated websocket client over
/// loopback TLS.
#[derive(Debug, Parser)]
#[command(name = "ptyplex", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Spawn a process in a new PTY session
    #[command(after_help = "\
Examples:
  ptyplex spawn bash                       # Login shell in the default directory
  ptyplex spawn --cwd /tmp bash            # Start bash in /tmp
  ptyplex spawn --rows 40 --cols 120 htop  # Custom initial size
  ptyplex spawn bash -c 'echo hello'       # Command with arguments")]
    Spawn(SpawnArgs),

    /// Close a session and kill its process
    Kill(KillArgs),

    /// List all live sessions
    ListSessions,

    /// Print the transport token and port as TOKEN:PORT
    #[command(after_help = "\
Examples:
  ptyplex details                          # e.g. 3f9c...e1:34373
  ptyplex details --keep 4                 # Also close every session except 4")]
    Details(DetailsArgs),

    /// Close every session except one
    CloseAllExcept(CloseAllExceptArgs),

    /// Start the daemon process (usually auto-started)
    Daemon(DaemonArgs),

    /// Stop the daemon process
    Stop,
}

#[derive(Debug, clap::Args)]
pub struct SpawnArgs {
    /// Command and arguments to run (e.g., bash, vim, htop)
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,

    /// Working directory for the spawned process.
    /// If omitted, uses the daemon's default directory.
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    /// Initial rows [default: 24]
    #[arg(long, requires = "cols")]
    pub rows: Option<u16>,

    /// Initial columns [default: 80]
    #[arg(long, requires = "rows")]
    pub cols: Option<u16>,
}

#[derive(Debug, clap::Args)]
pub struct KillArgs {
    /// Session ID
    pub session: u64,
}

#[derive(Debug, clap::Args)]
pub struct DetailsArgs {
    /// Close every other session first
    #[arg(long, value_name = "ID")]
    pub keep: Option<u64>,
}

#[derive(Debug, clap::Args)]
pub struct CloseAllExceptArgs {
    /// Session ID to keep
    pub keep: u64,
}

#[derive(Debug, clap::Args)]
pub struct DaemonArgs {
    /// Development mode: certificates from ./certs, sessions start in the
    /// current directory
    #[arg(long)]
    pub dev: bool,

    /// TLS certificate (PEM) [default: <cert dir>/localhost.pem]
    #[arg(long, value_name = "FILE")]
    pub cert: Option<PathBuf>,

    /// TLS private key (PEM) [default: <cert dir>/localhost-key.pem]
    #[arg(long, value_name = "FILE")]
    pub key: Option<PathBuf>,

    /// First port probed on 127.0.0.1
    #[arg(long, default_value_t = DEFAULT_PORT_START, value_name = "PORT")]
    pub port_start: u16,
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_spawn_parses_hyphenated_args() {
        let cli = Cli::parse_from(["ptyplex", "spawn", "bash", "-c", "echo hello"]);

        match cli.command {
            Commands::Spawn(args) => {
                assert_eq!(args.command, vec!["bash", "-c", "echo hello"]);
                assert_eq!(args.rows, None);
            }
            _ => panic!("Expected spawn command"),
        }
    }

    #[test]
    fn test_spawn_size_needs_both_dimensions() {
        let cli = Cli::parse_from(["ptyplex", "spawn", "--rows", "40", "--cols", "120", "htop"]);
        match cli.command {
            Commands::Spawn(args) => {
                assert_eq!((args.rows, args.cols), (Some(40), Some(120)));
                assert_eq!(args.command, vec!["htop"]);
            }
            _ => panic!("Expected spawn command"),
        }

        assert!(Cli::try_parse_from(["ptyplex", "spawn", "--rows", "40", "htop"]).is_err());
    }

    #[test]
    fn test_details_and_close_all_except() {
        let cli = Cli::parse_from(["ptyplex", "details", "--keep", "3"]);
        assert!(matches!(cli.command, Commands::Details(ref args) if args.keep == Some(3)));

        let cli = Cli::parse_from(["ptyplex", "close-all-except", "7"]);
        assert!(matches!(cli.command, Commands::CloseAllExcept(ref args) if args.keep == 7));

        assert!(Cli::try_parse_from(["ptyplex", "kill", "not-a-number"]).is_err());
    }

    #[test]
    fn test_daemon_defaults() {
        let cli = Cli::parse_from(["ptyplex", "daemon"]);
        match cli.command {
            Commands::Daemon(args) => {
                assert!(!args.dev);
                assert_eq!(args.port_start, 34373);
                assert!(args.cert.is_none() && args.key.is_none());
            }
            _ => panic!("Expected daemon command"),
        }
    }
}
