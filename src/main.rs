//! devdock - process supervisor for local React projects.
//!
//! `devdock serve` runs the daemon: preview servers and terminal sessions,
//! driven by the desktop UI over a Unix socket. The other subcommands are
//! thin clients for poking at a running daemon.

use std::path::PathBuf;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devdock::client::{Client, ClientError};
use devdock::config::{self, ConfigError, Settings};
use devdock::dispatch::Host;
use devdock::socket;

#[derive(ClapParser, Debug)]
#[command(name = "devdock", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Path to the Unix domain socket
        #[arg(long, env = "DEVDOCK_SOCKET")]
        socket: Option<PathBuf>,

        /// Path to the config file
        #[arg(long, env = "DEVDOCK_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print a project's preview server status
    Status {
        project_id: String,

        #[arg(long, env = "DEVDOCK_SOCKET")]
        socket: Option<PathBuf>,
    },

    /// Stop a project's preview server
    Stop {
        project_id: String,

        #[arg(long, env = "DEVDOCK_SOCKET")]
        socket: Option<PathBuf>,
    },

    /// List terminal sessions
    Sessions {
        #[arg(long, env = "DEVDOCK_SOCKET")]
        socket: Option<PathBuf>,
    },
}

#[derive(Error, Debug)]
enum DevdockError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("client error: {0}")]
    Client(#[from] ClientError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> Result<(), DevdockError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve { socket, config } => run_server(socket, config).await,
        Commands::Status { project_id, socket } => {
            let mut client = connect(socket).await?;
            let status = client.server_status(&project_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Commands::Stop { project_id, socket } => {
            let mut client = connect(socket).await?;
            let status = client.stop_server(&project_id).await?;
            println!("{} {}", status.project_id, status.status.as_str());
            Ok(())
        }
        Commands::Sessions { socket } => {
            let mut client = connect(socket).await?;
            for session in client.list_sessions().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    session.session_id,
                    if session.attached { "attached" } else { "detached" },
                    session.working_directory.display(),
                    session.command,
                );
            }
            Ok(())
        }
    }
}

/// Logs go to stderr; stdout is reserved for command output.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "devdock=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn connect(socket: Option<PathBuf>) -> Result<Client, DevdockError> {
    let path = socket.unwrap_or_else(socket::default_socket_path);
    Ok(Client::connect(&path).await?)
}

async fn run_server(socket: Option<PathBuf>, config: Option<PathBuf>) -> Result<(), DevdockError> {
    let config_path = config.unwrap_or_else(config::default_config_path);
    let settings = Settings::load(&config_path)?;
    tracing::info!(
        config = %config_path.display(),
        ports = %format!("{}-{}", settings.port_range_start, settings.port_range_end),
        "devdock daemon starting"
    );

    let host = Host::new(settings);
    let cancel = CancellationToken::new();

    let socket_path = socket.unwrap_or_else(socket::default_socket_path);
    let socket_host = host.clone();
    let socket_cancel = cancel.clone();
    let socket_path_for_task = socket_path.clone();
    let mut socket_handle = tokio::spawn(async move {
        socket::serve(socket_host, &socket_path_for_task, socket_cancel).await
    });

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut socket_handle => {
            // The listener only returns early on a bind or setup failure.
            let result = result.map_err(std::io::Error::other).and_then(|r| r);
            host.shutdown().await;
            if let Err(e) = result {
                tracing::error!(?e, "unix socket server failed");
                return Err(e.into());
            }
            return Ok(());
        }
    }

    cancel.cancel();
    host.shutdown().await;
    if let Err(e) = socket_handle.await {
        tracing::warn!(?e, "socket server task panicked");
    }

    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
        tracing::debug!(path = %socket_path.display(), "removed socket file");
    }

    tracing::info!("devdock daemon exiting");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(?e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
        _ = term.recv() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl+C");
}
