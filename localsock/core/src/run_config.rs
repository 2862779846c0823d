//! Run Configuration
//!
//! Immutable description of one socket endpoint plus the slot holding its
//! listening fd.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::error::LocalSocketError;
use crate::path;

/// Default listen backlog
pub const DEFAULT_BACKLOG: i32 = 50;

/// Default `SO_RCVTIMEO` applied to every accepted client
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Default `SO_SNDTIMEO` applied to every accepted client
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(10_000);

/// fd slot value meaning "not bound" or "closed"
pub const NO_FD: RawFd = -1;

/// Description of one local socket endpoint
///
/// For a filesystem socket the path is the canonical absolute path of the
/// socket file; the server needs write and search permission on its parent
/// directory, and clients need write permission on the file to connect.
///
/// For an abstract-namespace socket the first byte of the path is NUL and the
/// path is kept verbatim.
///
/// In both cases the path may be at most 108 bytes (`sun_path` on Linux).
#[derive(Debug)]
pub struct RunConfig {
    title: String,
    path: String,
    is_abstract: bool,
    backlog: i32,
    receive_timeout: Duration,
    send_timeout: Duration,
    fd: AtomicI32,
}

impl RunConfig {
    /// Create a run config, canonicalizing filesystem paths
    ///
    /// # Errors
    ///
    /// - [`LocalSocketError::PathEmpty`] if `path` is empty
    /// - [`LocalSocketError::CanonicalizeFailed`] if the path cannot be resolved
    /// - [`LocalSocketError::PathTooLong`] if the canonical path exceeds 108 bytes
    pub fn new(title: impl Into<String>, path: impl AsRef<str>) -> Result<Self, LocalSocketError> {
        let title = title.into();
        let requested = path.as_ref();

        if requested.is_empty() {
            return Err(LocalSocketError::PathEmpty { title });
        }

        let is_abstract = path::is_abstract_namespace(requested);
        let path = if is_abstract {
            requested.to_string()
        } else {
            let canonical = path::canonical_path(requested).map_err(|source| {
                LocalSocketError::CanonicalizeFailed {
                    title: title.clone(),
                    path: requested.to_string(),
                    source,
                }
            })?;
            canonical.to_string_lossy().into_owned()
        };

        path::validate_path_length(&title, &path)?;

        Ok(Self {
            title,
            path,
            is_abstract,
            backlog: DEFAULT_BACKLOG,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            fd: AtomicI32::new(NO_FD),
        })
    }

    /// Set the listen backlog (validated by `start()`)
    #[must_use]
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the receive and send timeouts applied to accepted clients
    #[must_use]
    pub fn with_timeouts(mut self, receive: Duration, send: Duration) -> Self {
        self.receive_timeout = receive;
        self.send_timeout = send;
        self
    }

    /// Socket title used in logs and errors
    #[must_use]
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Canonical path, or the verbatim abstract name
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this is an abstract-namespace socket
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Socket file path, for filesystem sockets only
    #[must_use]
    pub fn socket_path(&self) -> Option<&Path> {
        (!self.is_abstract).then(|| Path::new(&self.path))
    }

    /// Listen backlog
    #[must_use]
    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    /// `SO_RCVTIMEO` for accepted clients
    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    /// `SO_SNDTIMEO` for accepted clients
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Current listening fd, or [`NO_FD`]
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    /// Store a listening fd; negative values are stored as [`NO_FD`]
    pub fn set_fd(&self, fd: RawFd) {
        self.fd.store(if fd >= 0 { fd } else { NO_FD }, Ordering::SeqCst);
    }

    /// Atomically reset the slot to [`NO_FD`], returning what it held
    ///
    /// Only one caller ever receives a given fd, so it is closed once.
    pub fn take_fd(&self) -> RawFd {
        self.fd.swap(NO_FD, Ordering::SeqCst)
    }
}
