//! Server Socket
//!
//! Binds a [`RunConfig`] endpoint, runs the accept loop on a dedicated thread
//! and hands authorized clients to a [`ClientHandler`].
//!
//! # Lifecycle
//!
//! ```text
//! Unbound --start()--> Listening --stop()--> Stopped
//!    |                                          ^
//!    +------------------stop()------------------+
//! ```
//!
//! A failed `start()` leaves the socket `Unbound`, so it can be retried once
//! the cause is fixed. `Stopped` is terminal.
//!
//! # Access Control
//!
//! Only peers whose kernel-reported uid equals the application uid (the
//! process uid unless overridden) or root are handed to the handler. Other
//! peers are reported through
//! [`ClientHandler::on_disallowed_client_connected`] and closed.

use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::ClientSocket;
use crate::error::{LocalSocketError, NativeError};
use crate::handler::ClientHandler;
use crate::native::{current_uid, LibcProvider, NativeSocketProvider, MAX_BACKLOG};
use crate::path;
use crate::run_config::RunConfig;

/// Lifecycle state of a [`ServerSocket`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// Created, not yet listening
    Unbound,
    /// Bound and accepting connections
    Listening,
    /// Stopped; the socket cannot be restarted
    Stopped,
}

impl ServerState {
    /// Lowercase state name used in messages
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unbound => "unbound",
            Self::Listening => "listening",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A listening local socket server
pub struct ServerSocket {
    run_config: Arc<RunConfig>,
    provider: Arc<dyn NativeSocketProvider>,
    handler: Arc<dyn ClientHandler>,
    app_uid: u32,
    state: Mutex<ServerState>,
    interrupted: Arc<AtomicBool>,
    /// Held while the accept loop closes the listening fd or `stop()` wakes it
    listener_lock: Arc<Mutex<()>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    bound_path: Mutex<Option<PathBuf>>,
}

impl ServerSocket {
    /// Create a server using the libc provider
    pub fn new<H: ClientHandler>(run_config: impl Into<Arc<RunConfig>>, handler: H) -> Self {
        Self::with_provider(run_config, handler, Arc::new(LibcProvider))
    }

    /// Create a server using a custom native provider
    pub fn with_provider<H: ClientHandler>(
        run_config: impl Into<Arc<RunConfig>>,
        handler: H,
        provider: Arc<dyn NativeSocketProvider>,
    ) -> Self {
        Self {
            run_config: run_config.into(),
            provider,
            handler: Arc::new(handler),
            app_uid: current_uid(),
            state: Mutex::new(ServerState::Unbound),
            interrupted: Arc::new(AtomicBool::new(false)),
            listener_lock: Arc::new(Mutex::new(())),
            accept_thread: Mutex::new(None),
            bound_path: Mutex::new(None),
        }
    }

    /// Override the uid allowed to connect besides root
    #[must_use]
    pub fn with_app_uid(mut self, app_uid: u32) -> Self {
        self.app_uid = app_uid;
        self
    }

    /// The endpoint this server binds
    #[must_use]
    pub fn run_config(&self) -> &Arc<RunConfig> {
        &self.run_config
    }

    /// Uid allowed to connect besides root
    #[must_use]
    pub fn app_uid(&self) -> u32 {
        self.app_uid
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// Whether the server is accepting connections
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state() == ServerState::Listening
    }

    /// Bind, listen and start the accept thread
    ///
    /// For filesystem sockets the parent directory is created (or given
    /// missing owner `rwx` bits) and any file already at the socket path is
    /// deleted.
    ///
    /// # Errors
    ///
    /// - [`LocalSocketError::InvalidState`] unless the server is `Unbound`
    /// - path, backlog and file errors from validation
    /// - [`LocalSocketError::CreateServerSocketFailed`] if binding fails
    /// - [`LocalSocketError::ThreadSpawnFailed`] if the accept thread cannot start
    ///
    /// On error the server stays `Unbound` with no fd and no thread.
    pub fn start(&self) -> Result<(), LocalSocketError> {
        let mut state = self.state.lock();
        if *state != ServerState::Unbound {
            return Err(self.invalid_state("start", *state));
        }

        let title = self.run_config.title();
        let requested = self.run_config.path();
        if requested.is_empty() {
            return Err(LocalSocketError::PathEmpty {
                title: title.to_string(),
            });
        }

        // Re-resolve: symlinks may have changed since the run config was built
        let socket_file = if self.run_config.is_abstract() {
            path::validate_path_length(title, requested)?;
            None
        } else {
            let canonical = path::canonical_path(requested).map_err(|source| {
                LocalSocketError::CanonicalizeFailed {
                    title: title.to_string(),
                    path: requested.to_string(),
                    source,
                }
            })?;
            path::validate_path_length(title, &canonical.to_string_lossy())?;
            Some(canonical)
        };

        let backlog = self.run_config.backlog();
        if !(1..=MAX_BACKLOG).contains(&backlog) {
            return Err(LocalSocketError::BacklogInvalid {
                title: title.to_string(),
                backlog,
            });
        }

        if let Some(socket_file) = &socket_file {
            if !socket_file.is_absolute() {
                return Err(LocalSocketError::PathNotAbsolute {
                    title: title.to_string(),
                    path: socket_file.to_string_lossy().into_owned(),
                });
            }
            path::ensure_parent_directory(title, socket_file)?;
            path::delete_socket_file(title, socket_file)?;
        }

        let bind_path: &[u8] = match &socket_file {
            Some(file) => file.as_os_str().as_bytes(),
            None => requested.as_bytes(),
        };
        let fd = self
            .provider
            .create_and_listen(bind_path, backlog)
            .map_err(|source| LocalSocketError::CreateServerSocketFailed {
                title: title.to_string(),
                source,
            })?;
        if fd < 0 {
            return Err(LocalSocketError::ServerSocketFdInvalid {
                title: title.to_string(),
                fd,
            });
        }

        self.run_config.set_fd(fd);
        self.interrupted.store(false, Ordering::SeqCst);

        let accept_loop = AcceptLoop {
            run_config: Arc::clone(&self.run_config),
            provider: Arc::clone(&self.provider),
            handler: Arc::clone(&self.handler),
            interrupted: Arc::clone(&self.interrupted),
            listener_lock: Arc::clone(&self.listener_lock),
            app_uid: self.app_uid,
        };
        let spawned = thread::Builder::new()
            .name(title.replace('\0', ""))
            .spawn(move || accept_loop.run());

        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                if let Err(e) = self.close() {
                    warn!(title = %title, error = %e, "Failed to close server socket after spawn failure");
                }
                if let Some(socket_file) = &socket_file {
                    if let Err(e) = path::delete_socket_file(title, socket_file) {
                        warn!(title = %title, error = %e, "Failed to remove socket file after spawn failure");
                    }
                }
                return Err(LocalSocketError::ThreadSpawnFailed {
                    title: title.to_string(),
                    source,
                });
            }
        };

        *self.accept_thread.lock() = Some(handle);
        *self.bound_path.lock() = socket_file;
        *state = ServerState::Listening;

        info!(
            title = %title,
            path = %self.run_config.path().escape_debug(),
            fd,
            backlog,
            app_uid = self.app_uid,
            "Server socket listening"
        );
        Ok(())
    }

    /// Stop accepting, close the listening fd and remove the socket file
    ///
    /// Idempotent. Every cleanup step is attempted; the first failure is
    /// returned. When called from inside a handler running on the accept
    /// thread the thread is not joined; it exits on its next iteration.
    ///
    /// # Errors
    ///
    /// [`LocalSocketError::CloseServerSocketFailed`] or
    /// [`LocalSocketError::DeleteSocketFileFailed`].
    pub fn stop(&self) -> Result<(), LocalSocketError> {
        {
            let mut state = self.state.lock();
            let previous = *state;
            *state = ServerState::Stopped;
            if previous != ServerState::Listening {
                return Ok(());
            }
        }

        let title = self.run_config.title();
        info!(title = %title, "Stopping server socket");

        self.interrupted.store(true, Ordering::SeqCst);
        self.wake_accept();

        let handle = self.accept_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!(title = %title, "Stop requested from accept thread, not joining");
            } else if handle.join().is_err() {
                warn!(title = %title, "Accept thread panicked");
            }
        }

        let mut first_error = self.close().err();

        if let Some(socket_file) = self.bound_path.lock().take() {
            if let Err(e) = path::delete_socket_file(title, &socket_file) {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(title = %title, "Server socket stopped");
                Ok(())
            }
        }
    }

    /// Close the listening fd
    ///
    /// The fd slot is `-1` afterwards even if `close()` fails.
    ///
    /// # Errors
    ///
    /// [`LocalSocketError::CloseServerSocketFailed`] if the provider fails.
    pub fn close(&self) -> Result<(), LocalSocketError> {
        let fd = self.run_config.take_fd();
        if fd < 0 {
            return Ok(());
        }
        debug!(title = %self.run_config.title(), fd, "Closing server socket");
        self.provider
            .close(fd)
            .map_err(|source| LocalSocketError::CloseServerSocketFailed {
                title: self.run_config.title().to_string(),
                source,
            })
    }

    /// Unblock a thread sitting in `accept()`
    ///
    /// `shutdown()` makes a blocked `accept()` fail on Linux. Where it does
    /// not, connecting once to a filesystem socket has the same effect.
    ///
    /// Must run after the interrupt flag is raised. Under the listener lock
    /// the loop then either has already closed the fd (slot is `-1`) or will
    /// leave it to `stop()`, so the fd read here is never a reused number.
    fn wake_accept(&self) {
        let _listener = self.listener_lock.lock();
        let fd = self.run_config.fd();
        if fd < 0 {
            return;
        }
        let Err(e) = self.provider.shutdown(fd) else {
            return;
        };
        debug!(title = %self.run_config.title(), error = %e, "shutdown() on listening socket failed");

        if let Some(socket_file) = self.bound_path.lock().as_ref() {
            if let Err(e) = UnixStream::connect(socket_file) {
                debug!(title = %self.run_config.title(), error = %e, "Wake-up connect failed");
            }
        }
    }

    fn invalid_state(&self, operation: &'static str, state: ServerState) -> LocalSocketError {
        LocalSocketError::InvalidState {
            title: self.run_config.title().to_string(),
            operation,
            state: state.name(),
        }
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(title = %self.run_config.title(), error = %e, "Failed to stop server socket on drop");
        }
    }
}

impl fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("run_config", &self.run_config)
            .field("app_uid", &self.app_uid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Accept Loop
// =============================================================================

enum Flow {
    Continue,
    Exit,
}

struct AcceptLoop {
    run_config: Arc<RunConfig>,
    provider: Arc<dyn NativeSocketProvider>,
    handler: Arc<dyn ClientHandler>,
    interrupted: Arc<AtomicBool>,
    listener_lock: Arc<Mutex<()>>,
    app_uid: u32,
}

impl AcceptLoop {
    fn run(self) {
        let title = self.run_config.title().to_string();
        debug!(title = %title, "Accept loop started");

        loop {
            let fd = self.run_config.fd();
            if fd < 0 || self.is_interrupted() {
                break;
            }

            let iteration = panic::catch_unwind(AssertUnwindSafe(|| self.accept_one(fd)));
            match iteration {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    self.handler.on_error(&LocalSocketError::ListenerFailed {
                        title: title.clone(),
                        message,
                    });
                }
            }
        }

        // stop() owns the fd once it has raised the flag
        let _listener = self.listener_lock.lock();
        if !self.is_interrupted() {
            let fd = self.run_config.take_fd();
            if fd >= 0 {
                if let Err(e) = self.provider.close(fd) {
                    warn!(title = %title, fd, error = %e, "Failed to close listening socket");
                }
            }
        }

        debug!(title = %title, "Accept loop exited");
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn title(&self) -> String {
        self.run_config.title().to_string()
    }

    fn accept_one(&self, fd: RawFd) -> Flow {
        let client_fd = match self.provider.accept(fd) {
            Ok(client_fd) => client_fd,
            Err(e) => return self.accept_failed(e),
        };

        if self.is_interrupted() {
            self.close_raw(client_fd);
            return Flow::Exit;
        }

        if client_fd < 0 {
            self.handler.on_error(&LocalSocketError::ClientSocketFdInvalid {
                title: self.title(),
                fd: client_fd,
            });
            return Flow::Continue;
        }

        let peer_credential = match self.provider.peer_credential(client_fd) {
            Ok(cred) => cred,
            Err(source) => {
                self.close_raw(client_fd);
                self.handler.on_error(&LocalSocketError::PeerCredentialFailed {
                    title: self.title(),
                    source,
                });
                return Flow::Continue;
            }
        };

        if !peer_credential.is_filled() {
            self.close_raw(client_fd);
            self.handler.on_error(&LocalSocketError::PeerUidInvalid {
                title: self.title(),
                uid: peer_credential.uid,
            });
            return Flow::Continue;
        }

        let client = ClientSocket::new(
            client_fd,
            peer_credential,
            Arc::clone(&self.run_config),
            Arc::clone(&self.provider),
        );

        if !self.is_allowed(client.peer_credential().uid) {
            let error = LocalSocketError::PeerUidDisallowed {
                title: self.title(),
                peer: client.peer_credential().minimal_string(),
            };
            self.handler.on_disallowed_client_connected(&client, &error);
            client.close_quietly();
            return Flow::Continue;
        }

        if let Err(e) = client
            .set_read_timeout()
            .and_then(|()| client.set_write_timeout())
        {
            client.close_quietly();
            self.handler.on_error(&e);
            return Flow::Continue;
        }

        debug!(
            title = %self.run_config.title(),
            fd = client.fd(),
            peer = %client.peer_credential(),
            "Client accepted"
        );
        self.handler.on_client_accepted(client);
        Flow::Continue
    }

    fn accept_failed(&self, error: NativeError) -> Flow {
        if self.is_interrupted()
            || self.run_config.fd() < 0
            || error.errno == libc::EBADF
            || error.errno == libc::EINVAL
        {
            return Flow::Exit;
        }
        if !error.is_interrupted() {
            self.handler.on_error(&LocalSocketError::AcceptClientSocketFailed {
                title: self.title(),
                source: error,
            });
        }
        Flow::Continue
    }

    fn is_allowed(&self, uid: i32) -> bool {
        uid == 0 || u32::try_from(uid).is_ok_and(|uid| uid == self.app_uid)
    }

    fn close_raw(&self, fd: RawFd) {
        if let Err(e) = self.provider.close(fd) {
            warn!(title = %self.run_config.title(), fd, error = %e, "Failed to close client socket");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::PeerCredential;
    use crate::handler::CloseImmediately;
    use crate::native::NativeResult;
    use pretty_assertions::assert_eq;
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn socket_config(dir: &TempDir, name: &str) -> RunConfig {
        RunConfig::new("server-test", dir.path().join(name).to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_state_machine() {
        let dir = TempDir::new().unwrap();
        let server = ServerSocket::new(socket_config(&dir, "s.sock"), CloseImmediately);
        assert_eq!(server.state(), ServerState::Unbound);

        server.start().unwrap();
        assert!(server.is_listening());
        assert!(server.run_config().fd() >= 0);

        let err = server.start().unwrap_err();
        assert_eq!(err.code(), 163);

        server.stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.run_config().fd(), -1);

        server.stop().unwrap();
        assert!(matches!(
            server.start(),
            Err(LocalSocketError::InvalidState { state: "stopped", .. })
        ));
    }

    #[test]
    fn test_stop_before_start() {
        let dir = TempDir::new().unwrap();
        let server = ServerSocket::new(socket_config(&dir, "s.sock"), CloseImmediately);
        server.stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(!dir.path().join("s.sock").exists());
    }

    #[test]
    fn test_invalid_backlog_is_retryable_error() {
        let dir = TempDir::new().unwrap();
        let config = socket_config(&dir, "s.sock").with_backlog(0);
        let server = ServerSocket::new(config, CloseImmediately);

        for _ in 0..2 {
            let err = server.start().unwrap_err();
            assert_eq!(err.code(), 153);
            assert_eq!(server.state(), ServerState::Unbound);
            assert_eq!(server.run_config().fd(), -1);
        }
        assert!(!dir.path().join("s.sock").exists());
    }

    #[test]
    fn test_handler_receives_client_and_peer_can_talk() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let server = ServerSocket::new(socket_config(&dir, "talk.sock"), move |client: ClientSocket| {
            let mut buf = [0u8; 4];
            let n = client.read_fully(&mut buf, None).unwrap();
            client.write(&buf[..n]).unwrap();
            tx.send(client.peer_credential().uid).unwrap();
        });
        server.start().unwrap();

        let mut peer = UnixStream::connect(dir.path().join("talk.sock")).unwrap();
        peer.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");

        let uid = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(u32::try_from(uid).unwrap(), current_uid());

        server.stop().unwrap();
    }

    #[test]
    fn test_panicking_handler_does_not_kill_loop() {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let server = ServerSocket::new(socket_config(&dir, "panic.sock"), move |client: ClientSocket| {
            let mut byte = [0u8; 1];
            client.read(&mut byte).unwrap();
            if byte[0] == b'p' {
                panic!("boom");
            }
            tx.send(byte[0]).unwrap();
        });
        server.start().unwrap();

        let path = dir.path().join("panic.sock");
        let mut first = UnixStream::connect(&path).unwrap();
        first.write_all(b"p").unwrap();
        // The panicking client is closed while unwinding
        let mut rest = Vec::new();
        first.read_to_end(&mut rest).unwrap();

        let mut second = UnixStream::connect(&path).unwrap();
        second.write_all(b"k").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b'k');

        assert!(server.is_listening());
        server.stop().unwrap();
    }

    #[test]
    fn test_drop_stops_and_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("drop.sock");
        {
            let server = ServerSocket::new(socket_config(&dir, "drop.sock"), CloseImmediately);
            server.start().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_app_uid_override() {
        let dir = TempDir::new().unwrap();
        let server = ServerSocket::new(socket_config(&dir, "s.sock"), CloseImmediately)
            .with_app_uid(4242);
        assert_eq!(server.app_uid(), 4242);
    }

    /// Listener whose `accept()` reports the socket gone, recording fd calls
    #[derive(Default)]
    struct VanishingListener {
        shutdowns: Mutex<Vec<RawFd>>,
        closes: Mutex<Vec<RawFd>>,
    }

    impl NativeSocketProvider for VanishingListener {
        fn create_and_listen(&self, path: &[u8], backlog: i32) -> NativeResult<RawFd> {
            LibcProvider.create_and_listen(path, backlog)
        }

        fn accept(&self, _fd: RawFd) -> NativeResult<RawFd> {
            Err(NativeError::new("accept", libc::EBADF))
        }

        fn peer_credential(&self, fd: RawFd) -> NativeResult<PeerCredential> {
            LibcProvider.peer_credential(fd)
        }

        fn read(&self, fd: RawFd, buf: &mut [u8]) -> NativeResult<usize> {
            LibcProvider.read(fd, buf)
        }

        fn send(&self, fd: RawFd, buf: &[u8]) -> NativeResult<()> {
            LibcProvider.send(fd, buf)
        }

        fn available(&self, fd: RawFd) -> NativeResult<usize> {
            LibcProvider.available(fd)
        }

        fn set_recv_timeout(&self, fd: RawFd, timeout: Duration) -> NativeResult<()> {
            LibcProvider.set_recv_timeout(fd, timeout)
        }

        fn set_send_timeout(&self, fd: RawFd, timeout: Duration) -> NativeResult<()> {
            LibcProvider.set_send_timeout(fd, timeout)
        }

        fn shutdown(&self, fd: RawFd) -> NativeResult<()> {
            self.shutdowns.lock().push(fd);
            LibcProvider.shutdown(fd)
        }

        fn close(&self, fd: RawFd) -> NativeResult<()> {
            self.closes.lock().push(fd);
            LibcProvider.close(fd)
        }
    }

    #[test]
    fn test_stop_after_loop_exit_leaves_closed_fd_alone() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(VanishingListener::default());
        let server = ServerSocket::with_provider(
            socket_config(&dir, "gone.sock"),
            CloseImmediately,
            Arc::clone(&provider) as Arc<dyn NativeSocketProvider>,
        );
        server.start().unwrap();
        let listen_fd = server.run_config().fd();
        assert!(listen_fd >= 0);

        // The loop exits on its own and closes the listening fd
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while server.run_config().fd() >= 0 {
            assert!(std::time::Instant::now() < deadline, "accept loop never exited");
            thread::sleep(Duration::from_millis(10));
        }

        server.stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(provider.shutdowns.lock().is_empty());
        assert_eq!(*provider.closes.lock(), vec![listen_fd]);
        assert!(!dir.path().join("gone.sock").exists());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ServerState::Unbound.to_string(), "unbound");
        assert_eq!(ServerState::Listening.name(), "listening");
    }
}
