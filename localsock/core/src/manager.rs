//! Local Socket Manager
//!
//! Owns one [`ServerSocket`] and guarantees that accepted clients reach the
//! user's handler on a dedicated thread, never on the accept thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::error::LocalSocketError;
use crate::handler::{ClientHandler, ThreadPerClient};
use crate::native::{LibcProvider, NativeSocketProvider};
use crate::run_config::RunConfig;
use crate::server::{ServerSocket, ServerState};

/// Runs a server socket for one [`RunConfig`]
#[derive(Debug)]
pub struct LocalSocketManager {
    run_config: Arc<RunConfig>,
    server: ServerSocket,
    running: AtomicBool,
}

impl LocalSocketManager {
    /// Create a manager using the libc provider
    pub fn new<H: ClientHandler>(run_config: impl Into<Arc<RunConfig>>, handler: H) -> Self {
        Self::with_provider(run_config, handler, Arc::new(LibcProvider))
    }

    /// Create a manager using a custom native provider
    pub fn with_provider<H: ClientHandler>(
        run_config: impl Into<Arc<RunConfig>>,
        handler: H,
        provider: Arc<dyn NativeSocketProvider>,
    ) -> Self {
        let run_config = run_config.into();
        let server = ServerSocket::with_provider(
            Arc::clone(&run_config),
            ThreadPerClient::new(handler),
            provider,
        );
        Self {
            run_config,
            server,
            running: AtomicBool::new(false),
        }
    }

    /// Override the uid allowed to connect besides root
    #[must_use]
    pub fn with_app_uid(mut self, app_uid: u32) -> Self {
        self.server = self.server.with_app_uid(app_uid);
        self
    }

    /// Start the server
    ///
    /// # Errors
    ///
    /// Whatever [`ServerSocket::start`] reports. A failed start leaves the
    /// running flag as it was, so a second `start()` on a running manager
    /// does not keep `stop()` from tearing the server down.
    pub fn start(&self) -> Result<(), LocalSocketError> {
        info!(title = %self.run_config.title(), "Starting local socket manager");
        self.server.start()?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the server if the manager is running
    ///
    /// # Errors
    ///
    /// Whatever [`ServerSocket::stop`] reports.
    pub fn stop(&self) -> Result<(), LocalSocketError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(title = %self.run_config.title(), "Stopping local socket manager");
        self.server.stop()
    }

    /// Whether `start()` succeeded and `stop()` has not been called since
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The managed endpoint
    #[must_use]
    pub fn run_config(&self) -> &Arc<RunConfig> {
        &self.run_config
    }

    /// State of the underlying server socket
    #[must_use]
    pub fn server_state(&self) -> ServerState {
        self.server.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSocket;
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_start_stop() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("manager-test", dir.path().join("m.sock").to_str().unwrap()).unwrap();
        let manager = LocalSocketManager::new(config, |client: ClientSocket| client.close_quietly());

        assert!(!manager.is_running());
        assert_eq!(manager.server_state(), ServerState::Unbound);

        // Not running yet, so nothing to stop
        manager.stop().unwrap();
        assert_eq!(manager.server_state(), ServerState::Unbound);

        manager.start().unwrap();
        assert!(manager.is_running());
        assert_eq!(manager.server_state(), ServerState::Listening);
        assert!(manager.run_config().socket_path().unwrap().exists());

        manager.stop().unwrap();
        assert!(!manager.is_running());
        assert_eq!(manager.server_state(), ServerState::Stopped);
        assert!(!dir.path().join("m.sock").exists());
    }

    #[test]
    fn test_failed_start_not_running() {
        let dir = TempDir::new().unwrap();
        let config = RunConfig::new("manager-test", dir.path().join("m.sock").to_str().unwrap())
            .unwrap()
            .with_backlog(501);
        let manager = LocalSocketManager::new(config, |client: ClientSocket| client.close_quietly());

        assert_eq!(manager.start().unwrap_err().code(), 153);
        assert!(!manager.is_running());
    }

    #[test]
    fn test_second_start_keeps_manager_stoppable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.sock");
        let config = RunConfig::new("manager-test", path.to_str().unwrap()).unwrap();
        let manager = LocalSocketManager::new(config, |client: ClientSocket| client.close_quietly());

        manager.start().unwrap();
        assert_eq!(manager.start().unwrap_err().code(), 163);
        assert!(manager.is_running());
        assert_eq!(manager.server_state(), ServerState::Listening);

        manager.stop().unwrap();
        assert!(!manager.is_running());
        assert_eq!(manager.server_state(), ServerState::Stopped);
        assert_eq!(manager.run_config().fd(), -1);
        assert!(!path.exists());
    }

    #[test]
    fn test_clients_served_off_accept_thread() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.sock");
        let config = RunConfig::new("manager-test", path.to_str().unwrap()).unwrap();

        let (tx, rx) = mpsc::channel();
        let manager = LocalSocketManager::new(config, move |client: ClientSocket| {
            let name = thread::current().name().map(str::to_string);
            client.write(b"hi").unwrap();
            tx.send(name).unwrap();
        });
        manager.start().unwrap();

        let mut peer = UnixStream::connect(&path).unwrap();
        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("manager-test-client-"), "served on {name}");

        manager.stop().unwrap();
    }
}
