//! Daemon Server Implementation
//!
//! Runs one local socket through [`LocalSocketManager`] and serves every
//! accepted client as a byte echo:
//! - Clients arrive over a [`ChannelHandler`] channel
//! - Each session runs on the blocking pool until EOF, timeout or error
//! - Live sessions are tracked in a registry for logging and shutdown
//!
//! ```text
//!     LocalSocketManager (accept thread)
//!                 │
//!          ChannelHandler
//!                 │
//!           DaemonServer::run
//!        ┌────────┼────────┐
//!   session-1  session-2  session-3   (spawn_blocking)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use localsock_core::{
    ChannelHandler, ClientSocket, LocalSocketError, LocalSocketManager, PeerCredential,
    ServerSettings,
};

/// Size of the buffer each echo session reads into
const ECHO_BUFFER_SIZE: usize = 4096;

/// Identifier of one served connection
pub type SessionId = u64;

/// Session tracking (internal to server)
#[derive(Debug)]
struct SessionState {
    /// When the connection was accepted
    connected_at: Instant,
    /// Kernel-reported identity of the peer
    peer: PeerCredential,
}

/// The main daemon server
pub struct DaemonServer {
    /// The managed socket
    manager: LocalSocketManager,
    /// Accepted clients from the manager
    clients: mpsc::UnboundedReceiver<ClientSocket>,
    /// Active sessions
    sessions: Arc<DashMap<SessionId, SessionState>>,
    /// Next session id
    next_session: AtomicU64,
    /// How long shutdown waits for sessions to finish
    shutdown_grace: Duration,
}

impl DaemonServer {
    /// Create a daemon server for the given settings
    pub fn new(settings: &ServerSettings) -> Result<Self> {
        let run_config = settings
            .to_run_config()
            .context("Invalid socket configuration")?;
        let (handler, clients) = ChannelHandler::new();

        Ok(Self {
            manager: LocalSocketManager::new(run_config, handler),
            clients,
            sessions: Arc::new(DashMap::new()),
            next_session: AtomicU64::new(1),
            shutdown_grace: settings.receive_timeout.max(settings.send_timeout),
        })
    }

    /// Number of sessions currently being served
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Run until `shutdown` resolves
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.manager
            .start()
            .with_context(|| format!("Failed to start \"{}\" server", self.manager.run_config().title()))?;

        info!(
            title = %self.manager.run_config().title(),
            path = %self.manager.run_config().path().escape_debug(),
            "Daemon server listening"
        );

        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                client = self.clients.recv() => {
                    let Some(client) = client else {
                        warn!("Client channel closed, stopping");
                        break;
                    };
                    self.spawn_session(&mut tasks, client);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Session task failed");
                    }
                }
            }
        }

        let stopped = self.manager.stop().context("Failed to stop server socket");

        if !tasks.is_empty() {
            info!(
                sessions = self.sessions.len(),
                grace_ms = u64::try_from(self.shutdown_grace.as_millis()).unwrap_or(u64::MAX),
                "Waiting for sessions to finish"
            );
            let drained = tokio::time::timeout(self.shutdown_grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(sessions = self.sessions.len(), "Sessions still running at shutdown");
            }
        }

        stopped
    }

    fn spawn_session(&self, tasks: &mut JoinSet<()>, client: ClientSocket) {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let peer = client.peer_credential().clone();

        info!(session = id, peer = %peer, fd = client.fd(), "Session started");
        self.sessions.insert(
            id,
            SessionState {
                connected_at: Instant::now(),
                peer,
            },
        );

        let sessions = Arc::clone(&self.sessions);
        tasks.spawn_blocking(move || {
            let result = serve_echo(&client);
            client.close_quietly();

            let duration_ms = sessions
                .remove(&id)
                .map(|(_, state)| {
                    debug!(session = id, peer_pid = state.peer.pid, "Session removed");
                    u64::try_from(state.connected_at.elapsed().as_millis()).unwrap_or(u64::MAX)
                })
                .unwrap_or_default();

            match result {
                Ok(bytes) => info!(session = id, bytes, duration_ms, "Session ended"),
                Err(e) if e.is_timeout() => {
                    info!(session = id, duration_ms, error = %e, "Session timed out");
                }
                Err(e) => warn!(session = id, duration_ms, code = e.code(), error = %e, "Session failed"),
            }
        });
    }
}

/// Echo everything the peer sends until it closes its side
///
/// Returns the number of bytes echoed.
fn serve_echo(client: &ClientSocket) -> Result<u64, LocalSocketError> {
    let mut buf = [0u8; ECHO_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = client.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        client.write(&buf[..n])?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;
    use tokio::sync::oneshot;

    fn settings_in(dir: &TempDir) -> ServerSettings {
        let mut settings = ServerSettings::default();
        settings.title = "daemon-test".to_string();
        settings.socket_path = dir.path().join("daemon.sock").to_string_lossy().into_owned();
        settings.receive_timeout = Duration::from_secs(2);
        settings.send_timeout = Duration::from_secs(2);
        settings
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_echo_sessions_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let settings = settings_in(&dir);
        let socket_path = dir.path().join("daemon.sock");

        let mut server = DaemonServer::new(&settings).unwrap();
        assert_eq!(server.active_sessions(), 0);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let run = tokio::spawn(async move {
            let result = server
                .run(async {
                    let _ = stop_rx.await;
                })
                .await;
            (result, server)
        });

        // Wait for the socket to appear
        let path = socket_path.clone();
        let echoed = tokio::task::spawn_blocking(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut peer = loop {
                match UnixStream::connect(&path) {
                    Ok(peer) => break peer,
                    Err(_) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(20));
                    }
                    Err(e) => panic!("daemon socket never appeared: {e}"),
                }
            };
            peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            peer.write_all(b"echo me").unwrap();
            peer.shutdown(std::net::Shutdown::Write).unwrap();
            let mut echoed = Vec::new();
            peer.read_to_end(&mut echoed).unwrap();
            echoed
        })
        .await
        .unwrap();
        assert_eq!(echoed, b"echo me");

        stop_tx.send(()).unwrap();
        let (result, server) = run.await.unwrap();
        result.unwrap();
        assert_eq!(server.active_sessions(), 0);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_start_failure_reported() {
        let dir = TempDir::new().unwrap();
        let mut settings = settings_in(&dir);
        settings.backlog = 0;

        let mut server = DaemonServer::new(&settings).unwrap();
        let err = server.run(std::future::pending()).await.unwrap_err();
        assert!(err.to_string().contains("daemon-test"));
    }

    #[test]
    fn test_invalid_path_rejected() {
        let mut settings = ServerSettings::default();
        settings.socket_path = String::new();
        assert!(DaemonServer::new(&settings).is_err());
    }
}
