//! localsock Daemon - Local Socket Echo Server
//!
//! Exposes a Unix domain socket through `localsock-core` and echoes back
//! whatever each same-user (or root) client sends.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults ($XDG_RUNTIME_DIR/localsock/localsock.sock)
//! localsock-daemon
//!
//! # Custom socket path
//! localsock-daemon --socket-path /tmp/echo.sock
//!
//! # Abstract namespace socket
//! localsock-daemon --abstract-name localsock-echo
//!
//! # With config file
//! localsock-daemon --config ~/.config/localsock/localsock.toml
//!
//! # Verbose logging
//! RUST_LOG=debug localsock-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use localsock_core::{config, ConfigOverrides, ServerSettings};
use server::DaemonServer;

/// localsock Daemon - echo server on a local Unix domain socket
#[derive(Parser, Debug)]
#[command(name = "localsock-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path
    #[arg(short = 's', long, value_name = "PATH", conflicts_with = "abstract_name")]
    socket_path: Option<String>,

    /// Bind in the abstract namespace under this name instead of a file
    #[arg(short = 'a', long, value_name = "NAME")]
    abstract_name: Option<String>,

    /// Server title used in logs and the default socket name
    #[arg(short = 't', long)]
    title: Option<String>,

    /// Listen backlog (1-500)
    #[arg(short = 'b', long)]
    backlog: Option<i32>,

    /// Per-client receive timeout in milliseconds
    #[arg(long, value_name = "MS")]
    receive_timeout_ms: Option<u64>,

    /// Per-client send timeout in milliseconds
    #[arg(long, value_name = "MS")]
    send_timeout_ms: Option<u64>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "LOCALSOCK_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// PID file path
    #[arg(long, env = "LOCALSOCK_PID_FILE", value_name = "PATH")]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "LOCALSOCK_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            title: self.title.clone(),
            socket_path: self
                .abstract_name
                .as_ref()
                .map(|name| format!("\0{name}"))
                .or_else(|| self.socket_path.clone()),
            backlog: self.backlog,
            receive_timeout_ms: self.receive_timeout_ms,
            send_timeout_ms: self.send_timeout_ms,
        }
    }
}

/// Get the default PID file path, next to the default socket
fn default_pid_path(title: &str) -> PathBuf {
    config::default_socket_path(title).with_extension("pid")
}

/// Write PID file
fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create PID directory: {parent:?}"))?;
    }

    let pid = std::process::id();
    let mut file =
        fs::File::create(path).with_context(|| format!("Failed to create PID file: {path:?}"))?;
    writeln!(file, "{pid}")?;

    info!(pid = pid, path = ?path, "PID file created");
    Ok(())
}

/// Remove PID file
fn remove_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!(error = %e, path = ?path, "Failed to remove PID file");
        } else {
            info!(path = ?path, "PID file removed");
        }
    }
}

/// Refuse to start if the PID file names a live process
///
/// A stale PID file is removed.
fn check_existing_daemon(pid_path: &Path) -> Result<()> {
    if !pid_path.exists() {
        return Ok(());
    }

    let pid_str = fs::read_to_string(pid_path)
        .with_context(|| format!("Failed to read PID file: {pid_path:?}"))?;

    let pid: i32 = pid_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid PID in file: {pid_path:?}"))?;

    // Signal 0 only checks that the process exists
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => {
            anyhow::bail!(
                "Another localsock-daemon is already running (PID: {pid}). \
                 Stop it first or remove {pid_path:?} if it's stale."
            );
        }
        Err(_) => {
            warn!(pid = pid, "Removing stale PID file");
            fs::remove_file(pid_path)
                .with_context(|| format!("Failed to remove stale PID file: {pid_path:?}"))?;
            Ok(())
        }
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "localsock_daemon={level},localsock_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();
}

/// Resolve settings: defaults, then config file, then env, then CLI
fn resolve_settings(args: &Args) -> Result<ServerSettings> {
    let config_path = args.config.clone().or_else(config::default_config_path);
    let mut settings =
        config::load_settings_from_path(config_path).context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut settings)
        .context("Invalid command-line option")?;
    Ok(settings)
}

/// Resolve once SIGINT or SIGTERM arrives
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("localsock daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let settings = resolve_settings(&args)?;
    let pid_path = args
        .pid_file
        .clone()
        .unwrap_or_else(|| default_pid_path(&settings.title));

    info!(
        title = %settings.title,
        socket_path = %settings.socket_path.escape_debug(),
        socket_path_source = %settings.socket_path_source(),
        config_source = %settings.source(),
        backlog = settings.backlog,
        "Resolved configuration"
    );
    info!(pid_path = ?pid_path, "PID file path");

    check_existing_daemon(&pid_path)?;

    let mut server = DaemonServer::new(&settings)?;
    write_pid_file(&pid_path)?;

    let result = server
        .run(async {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Signal handling unavailable, stopping");
            }
        })
        .await;

    info!("Shutting down...");
    remove_pid_file(&pid_path);

    match result {
        Ok(()) => {
            info!("localsock daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses() {
        let args = Args::try_parse_from([
            "localsock-daemon",
            "--socket-path",
            "/tmp/echo.sock",
            "--backlog",
            "10",
            "--receive-timeout-ms",
            "500",
        ])
        .unwrap();

        let overrides = args.overrides();
        assert_eq!(overrides.socket_path.as_deref(), Some("/tmp/echo.sock"));
        assert_eq!(overrides.backlog, Some(10));
        assert_eq!(overrides.receive_timeout_ms, Some(500));
        assert_eq!(overrides.send_timeout_ms, None);
    }

    #[test]
    fn test_abstract_name_becomes_nul_path() {
        let args =
            Args::try_parse_from(["localsock-daemon", "--abstract-name", "echo"]).unwrap();
        assert_eq!(args.overrides().socket_path.as_deref(), Some("\0echo"));
    }

    #[test]
    fn test_socket_path_conflicts_with_abstract_name() {
        let parsed = Args::try_parse_from([
            "localsock-daemon",
            "--socket-path",
            "/tmp/a.sock",
            "--abstract-name",
            "a",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_default_pid_path() {
        let path = default_pid_path("echo");
        assert!(path.ends_with("echo.pid"));
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = TempDir::new().unwrap();
        let pid_path = dir.path().join("run").join("daemon.pid");

        // Nothing there yet
        check_existing_daemon(&pid_path).unwrap();

        write_pid_file(&pid_path).unwrap();
        let written = fs::read_to_string(&pid_path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        // Our own PID is alive
        assert!(check_existing_daemon(&pid_path).is_err());

        remove_pid_file(&pid_path);
        assert!(!pid_path.exists());
    }

    #[test]
    fn test_stale_pid_file_removed() {
        let dir = TempDir::new().unwrap();
        let pid_path = dir.path().join("stale.pid");
        // Above the default pid_max, so no process can have it
        fs::write(&pid_path, "2147483646\n").unwrap();

        check_existing_daemon(&pid_path).unwrap();
        assert!(!pid_path.exists());
    }

    #[test]
    fn test_garbage_pid_file_is_error() {
        let dir = TempDir::new().unwrap();
        let pid_path = dir.path().join("garbage.pid");
        fs::write(&pid_path, "not a pid").unwrap();

        assert!(check_existing_daemon(&pid_path).is_err());
        assert!(pid_path.exists());
    }
}
