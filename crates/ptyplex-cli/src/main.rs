//! ptyplex CLI and daemon entry point.

mod args;
mod daemon;

use std::fs::OpenOptions;
use std::sync::Mutex;

use clap::Parser;
use ptyplex_core::protocol::{Command, ResponseData};
use tracing::{error, info};

use crate::args::{Cli, Commands, DaemonArgs};
use crate::daemon::auth::AuthToken;
use crate::daemon::registry::Registry;
use crate::daemon::transport::TlsListener;
use crate::daemon::{paths, DaemonClient, DaemonConfig, DaemonServer};

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(args) => {
            init_daemon_logging();
            run_daemon(args);
        }
        command => {
            init_logging();
            if let Err(e) = run_client_command(command) {
                error!("{:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// The auto-started daemon has no terminal, so it appends to
/// `<socket dir>/<instance>.log`. Falls back to stderr if that fails.
fn init_daemon_logging() {
    let log_path = paths::get_log_path(None);
    let file = paths::ensure_socket_dir().and_then(|()| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    });

    match file {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        Err(e) => {
            init_logging();
            error!("Failed to open log file {:?}: {}", log_path, e);
        }
    }
}

/// Convert CLI args to a protocol Command.
///
/// Returns None for commands that don't go through the control socket.
fn to_command(command: &Commands) -> Option<Command> {
    match command {
        Commands::Spawn(args) => Some(Command::Spawn {
            command: args.command.clone(),
            rows: args.rows,
            cols: args.cols,
            cwd: args.cwd.clone(),
        }),
        Commands::Kill(args) => Some(Command::Kill {
            session: args.session,
        }),
        Commands::ListSessions => Some(Command::ListSessions),
        Commands::Details(args) => Some(Command::Details { keep: args.keep }),
        Commands::CloseAllExcept(args) => Some(Command::CloseAllExcept { keep: args.keep }),
        Commands::Stop => Some(Command::Shutdown),
        Commands::Daemon(_) => None,
    }
}

/// Run a client command by connecting to the daemon.
fn run_client_command(command: Commands) -> anyhow::Result<()> {
    let Some(request) = to_command(&command) else {
        return Ok(());
    };

    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let client = if matches!(request, Command::Shutdown) {
            DaemonClient::connect_existing().await?
        } else {
            // Auto-starts the daemon if it is not running
            Some(DaemonClient::connect().await?)
        };
        let Some(mut client) = client else {
            info!("Daemon is not running");
            return Ok(());
        };

        let response = client.send(request).await?;

        if response.success {
            match response.data {
                Some(ResponseData::Details { token, port }) => println!("{}:{}", token, port),
                Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
                None => {}
            }
        } else if let Some(err) = response.error {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }

        Ok(())
    })
}

/// Run the daemon: control socket plus TLS transport, until `stop`,
/// SIGINT or SIGTERM.
///
/// The DaemonServer's Drop impl cleans up socket and PID files.
fn run_daemon(args: DaemonArgs) {
    let config = DaemonConfig::resolve(args.dev, args.cert, args.key, args.port_start);
    info!(?config, "Starting daemon");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let registry = Registry::new(AuthToken::generate(), config.default_cwd.clone());

        // Control socket first, so a second daemon fails before taking a port.
        let server = match DaemonServer::bind(registry).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to start daemon: {:#}", e);
                std::process::exit(1);
            }
        };

        let listener = match TlsListener::bind(&config.cert, &config.key, config.port_start).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to start transport: {}", e);
                drop(server);
                std::process::exit(1);
            }
        };

        let mut server = match server.with_transport(listener) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to start transport: {:#}", e);
                std::process::exit(1);
            }
        };

        let stop = server.stop_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
                _ = sigterm() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
            }
            stop.cancel();
        });

        if let Err(e) = server.run().await {
            error!("Daemon error: {:#}", e);
        }
        info!("Daemon stopped");
        // Server is dropped here, triggering cleanup of socket and PID files
    });
}

/// Wait for SIGTERM.
///
/// If signal registration fails, logs a warning and waits indefinitely.
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, daemon will only respond to SIGINT",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}
