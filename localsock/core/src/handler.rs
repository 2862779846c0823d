//! Client Handoff
//!
//! The accept loop never performs client I/O itself. Every accepted and
//! authorized [`ClientSocket`] is handed to a [`ClientHandler`], which decides
//! where the connection is served:
//!
//! - any `Fn(ClientSocket)` closure runs inline on the accept thread
//! - [`ThreadPerClient`] serves each client on its own OS thread
//! - [`ChannelHandler`] pushes clients into a tokio channel for async code
//! - [`CloseImmediately`] closes every client it is given

use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::ClientSocket;
use crate::error::LocalSocketError;

/// Receives accepted clients and errors from a server's accept loop
///
/// All methods are called from the accept thread. `on_client_accepted`
/// should return quickly; a handler that blocks delays the next `accept()`.
pub trait ClientHandler: Send + Sync + 'static {
    /// A client passed access control; the handler now owns the connection
    fn on_client_accepted(&self, client: ClientSocket);

    /// A per-connection failure the accept loop absorbed
    fn on_error(&self, error: &LocalSocketError) {
        warn!(
            code = error.code(),
            category = error.category(),
            error = %error,
            "Local socket error"
        );
    }

    /// A peer failed the uid check
    ///
    /// The client is closed by the accept loop after this returns.
    fn on_disallowed_client_connected(&self, client: &ClientSocket, error: &LocalSocketError) {
        let peer = client.peer_credential();
        warn!(
            title = %client.run_config().title(),
            peer_pid = peer.pid,
            peer_uid = peer.uid,
            peer_gid = peer.gid,
            error = %error,
            "Disallowed client connected"
        );
    }
}

impl<F> ClientHandler for F
where
    F: Fn(ClientSocket) + Send + Sync + 'static,
{
    fn on_client_accepted(&self, client: ClientSocket) {
        self(client);
    }
}

// =============================================================================
// Thread Per Client
// =============================================================================

/// Serves every accepted client on a new OS thread
///
/// Errors and disallowed peers are forwarded to the wrapped handler on the
/// accept thread.
#[derive(Debug)]
pub struct ThreadPerClient<H> {
    inner: Arc<H>,
}

impl<H: ClientHandler> ThreadPerClient<H> {
    /// Wrap `handler`
    pub fn new(handler: H) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }
}

impl<H: ClientHandler> ClientHandler for ThreadPerClient<H> {
    fn on_client_accepted(&self, client: ClientSocket) {
        let inner = Arc::clone(&self.inner);
        let name = format!("{}-client-{}", client.run_config().title(), client.fd()).replace('\0', "");

        // The closure owns the client, so a failed spawn drops (closes) it
        let spawned = thread::Builder::new()
            .name(name)
            .spawn(move || inner.on_client_accepted(client));

        if let Err(e) = spawned {
            warn!(error = %e, "Failed to spawn client thread, connection dropped");
        }
    }

    fn on_error(&self, error: &LocalSocketError) {
        self.inner.on_error(error);
    }

    fn on_disallowed_client_connected(&self, client: &ClientSocket, error: &LocalSocketError) {
        self.inner.on_disallowed_client_connected(client, error);
    }
}

// =============================================================================
// Channel Handoff
// =============================================================================

/// Sends accepted clients into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ClientSocket>,
}

impl ChannelHandler {
    /// Create the handler and the receiving end of its channel
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientSocket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ClientHandler for ChannelHandler {
    fn on_client_accepted(&self, client: ClientSocket) {
        if let Err(mpsc::error::SendError(client)) = self.tx.send(client) {
            warn!(
                title = %client.run_config().title(),
                fd = client.fd(),
                "Client receiver dropped, closing connection"
            );
            client.close_quietly();
        }
    }
}

// =============================================================================
// Close Immediately
// =============================================================================

/// Closes every accepted client
#[derive(Debug, Clone, Copy, Default)]
pub struct CloseImmediately;

impl ClientHandler for CloseImmediately {
    fn on_client_accepted(&self, client: ClientSocket) {
        debug!(
            title = %client.run_config().title(),
            fd = client.fd(),
            "Closing accepted client"
        );
        client.close_quietly();
    }
}
