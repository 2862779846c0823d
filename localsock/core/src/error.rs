//! Error Types for the Local Socket Layer
//!
//! Two layers of errors live here:
//!
//! - [`NativeError`]: what the [`NativeSocketProvider`](crate::native::NativeSocketProvider)
//!   reports. It carries the failed syscall and its `errno`, nothing more.
//! - [`LocalSocketError`]: what the server and client sockets report to their
//!   callers. Every variant has a category, a stable numeric code and a
//!   message naming the socket title and the offending path, fd or uid.
//!
//! Codes 150-199 belong to the server socket and its path policy, codes
//! 200-249 to client sockets.

use std::path::PathBuf;

use thiserror::Error;

/// Category reported by socket lifecycle and I/O errors
pub const LOCAL_SOCKET_ERROR_CATEGORY: &str = "LocalSocket Error";

/// Category reported by filesystem errors around the socket file
pub const FILE_ERROR_CATEGORY: &str = "File Error";

// =============================================================================
// Native Errors
// =============================================================================

/// Failure reported by a native socket provider call
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("{op}() failed: {} (errno {errno})", errno_message(.errno))]
pub struct NativeError {
    /// Name of the syscall that failed (e.g. `"accept"`)
    pub op: &'static str,
    /// The `errno` value reported by the kernel
    pub errno: i32,
}

impl NativeError {
    /// Create an error for `op` with an explicit errno
    #[must_use]
    pub fn new(op: &'static str, errno: i32) -> Self {
        Self { op, errno }
    }

    /// Capture `errno` of the last failed syscall on this thread
    #[must_use]
    pub fn last_os_error(op: &'static str) -> Self {
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        Self { op, errno }
    }

    /// Whether the call gave up because a `SO_RCVTIMEO`/`SO_SNDTIMEO` elapsed
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.errno == libc::EAGAIN || self.errno == libc::EWOULDBLOCK
    }

    /// Whether the call was interrupted by a signal
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.errno == libc::EINTR
    }

    /// Convert into the equivalent `std::io::Error`
    #[must_use]
    pub fn to_io_error(&self) -> std::io::Error {
        std::io::Error::from_raw_os_error(self.errno)
    }
}

fn errno_message(errno: &i32) -> std::io::Error {
    std::io::Error::from_raw_os_error(*errno)
}

// =============================================================================
// Local Socket Errors
// =============================================================================

/// Errors reported by [`ServerSocket`](crate::ServerSocket),
/// [`ClientSocket`](crate::ClientSocket) and the path policy
#[derive(Debug, Error)]
pub enum LocalSocketError {
    /// The socket path was empty
    #[error("The \"{title}\" server socket path is null or empty.")]
    PathEmpty {
        /// Socket title
        title: String,
    },

    /// The canonical socket path does not fit `sun_path`
    #[error("The \"{title}\" server socket path \"{path}\" is {len} bytes, greater than 108 bytes.")]
    PathTooLong {
        /// Socket title
        title: String,
        /// The canonical path that was rejected
        path: String,
        /// Its UTF-8 byte length
        len: usize,
    },

    /// A filesystem socket path was not absolute
    #[error("The \"{title}\" server socket path \"{path}\" is not an absolute file path.")]
    PathNotAbsolute {
        /// Socket title
        title: String,
        /// The offending path
        path: String,
    },

    /// The listen backlog is out of range
    #[error("The \"{title}\" server socket backlog \"{backlog}\" is not between 1 and 500.")]
    BacklogInvalid {
        /// Socket title
        title: String,
        /// The rejected backlog
        backlog: i32,
    },

    /// create/bind/listen failed
    #[error("Create \"{title}\" server socket failed.\n{source}")]
    CreateServerSocketFailed {
        /// Socket title
        title: String,
        /// Provider failure
        source: NativeError,
    },

    /// The provider reported success but returned a negative fd
    #[error("Invalid file descriptor \"{fd}\" returned when creating \"{title}\" server socket.")]
    ServerSocketFdInvalid {
        /// Socket title
        title: String,
        /// The returned fd
        fd: i32,
    },

    /// Closing the listening fd failed
    #[error("Close \"{title}\" server socket failed.\n{source}")]
    CloseServerSocketFailed {
        /// Socket title
        title: String,
        /// Provider failure
        source: NativeError,
    },

    /// `accept()` failed
    #[error("Accepting new client on \"{title}\" server failed.\n{source}")]
    AcceptClientSocketFailed {
        /// Socket title
        title: String,
        /// Provider failure
        source: NativeError,
    },

    /// `accept()` reported success but returned a negative fd
    #[error("Invalid file descriptor \"{fd}\" returned when accepting new client on \"{title}\" server.")]
    ClientSocketFdInvalid {
        /// Socket title
        title: String,
        /// The returned fd
        fd: i32,
    },

    /// Peer credentials could not be read
    #[error("Getting peer credentials for new client on \"{title}\" server failed.\n{source}")]
    PeerCredentialFailed {
        /// Socket title
        title: String,
        /// Provider failure
        source: NativeError,
    },

    /// Peer credentials came back unfilled
    #[error("Invalid peer uid \"{uid}\" for new client on \"{title}\" server.")]
    PeerUidInvalid {
        /// Socket title
        title: String,
        /// The reported uid
        uid: i32,
    },

    /// The peer is neither the application user nor root
    #[error("Disallowed client connected on \"{title}\" server: {peer}")]
    PeerUidDisallowed {
        /// Socket title
        title: String,
        /// Peer description (`process=.., user=.., group=..`)
        peer: String,
    },

    /// A panic escaped while processing one accepted client
    #[error("The \"{title}\" client socket listener failed: {message}")]
    ListenerFailed {
        /// Socket title
        title: String,
        /// Panic payload, if it was a string
        message: String,
    },

    /// Operation not allowed in the current server state
    #[error("The \"{title}\" server socket cannot {operation} while {state}.")]
    InvalidState {
        /// Socket title
        title: String,
        /// What was attempted
        operation: &'static str,
        /// Current state name
        state: &'static str,
    },

    /// The accept-loop or client thread could not be spawned
    #[error("Spawning thread for \"{title}\" failed: {source}")]
    ThreadSpawnFailed {
        /// Socket title
        title: String,
        /// Spawn failure
        source: std::io::Error,
    },

    /// The socket parent directory could not be created or fixed up
    #[error("The \"{title}\" server socket file parent directory \"{}\" is not usable: {source}", path.display())]
    ParentDirectoryFailed {
        /// Socket title
        title: String,
        /// Directory path
        path: PathBuf,
        /// Filesystem failure
        source: std::io::Error,
    },

    /// A stale socket file could not be removed
    #[error("Deleting \"{title}\" server socket file \"{}\" failed: {source}", path.display())]
    DeleteSocketFileFailed {
        /// Socket title
        title: String,
        /// Socket file path
        path: PathBuf,
        /// Filesystem failure
        source: std::io::Error,
    },

    /// The socket path could not be canonicalized
    #[error("Resolving canonical path for \"{title}\" server socket \"{path}\" failed: {source}")]
    CanonicalizeFailed {
        /// Socket title
        title: String,
        /// Requested path
        path: String,
        /// Filesystem failure
        source: std::io::Error,
    },

    /// `SO_RCVTIMEO` could not be set
    #[error("Set \"{title}\" client socket read (SO_RCVTIMEO) timeout to \"{timeout_ms}\" failed.\n{source}")]
    SetReadTimeoutFailed {
        /// Socket title
        title: String,
        /// Requested timeout in milliseconds
        timeout_ms: u64,
        /// Provider failure
        source: NativeError,
    },

    /// `SO_SNDTIMEO` could not be set
    #[error("Set \"{title}\" client socket send (SO_SNDTIMEO) timeout \"{timeout_ms}\" failed.\n{source}")]
    SetSendTimeoutFailed {
        /// Socket title
        title: String,
        /// Requested timeout in milliseconds
        timeout_ms: u64,
        /// Provider failure
        source: NativeError,
    },

    /// The client socket has already been closed
    #[error("The \"{title}\" client socket is closed (invalid file descriptor).")]
    InvalidFd {
        /// Socket title
        title: String,
    },

    /// Reading from the client failed
    #[error("Reading from \"{title}\" client socket failed.\n{source}")]
    ReadFailed {
        /// Socket title
        title: String,
        /// Provider failure
        source: NativeError,
    },

    /// No data arrived before the receive timeout or deadline
    #[error("Reading from \"{title}\" client socket timed out after {timeout_ms} ms.")]
    ReadTimeout {
        /// Socket title
        title: String,
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Sending to the client failed
    #[error("Sending to \"{title}\" client socket failed.\n{source}")]
    SendFailed {
        /// Socket title
        title: String,
        /// Provider failure
        source: NativeError,
    },

    /// The peer did not drain data before the send timeout
    #[error("Sending to \"{title}\" client socket timed out after {timeout_ms} ms.")]
    SendTimeout {
        /// Socket title
        title: String,
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Querying pending bytes failed
    #[error("Checking available bytes on \"{title}\" client socket failed.\n{source}")]
    AvailableFailed {
        /// Socket title
        title: String,
        /// Provider failure
        source: NativeError,
    },

    /// Closing the client fd failed
    #[error("Close \"{title}\" client socket failed.\n{source}")]
    CloseClientSocketFailed {
        /// Socket title
        title: String,
        /// Provider failure
        source: NativeError,
    },
}

impl LocalSocketError {
    /// Stable numeric code of this error
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::PathEmpty { .. } => 150,
            Self::PathTooLong { .. } => 151,
            Self::PathNotAbsolute { .. } => 152,
            Self::BacklogInvalid { .. } => 153,
            Self::CreateServerSocketFailed { .. } => 154,
            Self::ServerSocketFdInvalid { .. } => 155,
            Self::CloseServerSocketFailed { .. } => 156,
            Self::AcceptClientSocketFailed { .. } => 157,
            Self::ClientSocketFdInvalid { .. } => 158,
            Self::PeerCredentialFailed { .. } => 159,
            Self::PeerUidInvalid { .. } => 160,
            Self::PeerUidDisallowed { .. } => 161,
            Self::ListenerFailed { .. } => 162,
            Self::InvalidState { .. } => 163,
            Self::ThreadSpawnFailed { .. } => 164,
            Self::ParentDirectoryFailed { .. } => 170,
            Self::DeleteSocketFileFailed { .. } => 171,
            Self::CanonicalizeFailed { .. } => 172,
            Self::SetReadTimeoutFailed { .. } => 200,
            Self::SetSendTimeoutFailed { .. } => 201,
            Self::InvalidFd { .. } => 202,
            Self::ReadFailed { .. } => 203,
            Self::ReadTimeout { .. } => 204,
            Self::SendFailed { .. } => 205,
            Self::SendTimeout { .. } => 206,
            Self::AvailableFailed { .. } => 207,
            Self::CloseClientSocketFailed { .. } => 208,
        }
    }

    /// Category of this error
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ParentDirectoryFailed { .. }
            | Self::DeleteSocketFileFailed { .. }
            | Self::CanonicalizeFailed { .. } => FILE_ERROR_CATEGORY,
            _ => LOCAL_SOCKET_ERROR_CATEGORY,
        }
    }

    /// Whether this is a read or send timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ReadTimeout { .. } | Self::SendTimeout { .. })
    }

    /// The native failure behind this error, if any
    #[must_use]
    pub fn native(&self) -> Option<&NativeError> {
        match self {
            Self::CreateServerSocketFailed { source, .. }
            | Self::CloseServerSocketFailed { source, .. }
            | Self::AcceptClientSocketFailed { source, .. }
            | Self::PeerCredentialFailed { source, .. }
            | Self::SetReadTimeoutFailed { source, .. }
            | Self::SetSendTimeoutFailed { source, .. }
            | Self::ReadFailed { source, .. }
            | Self::SendFailed { source, .. }
            | Self::AvailableFailed { source, .. }
            | Self::CloseClientSocketFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<LocalSocketError> for std::io::Error {
    fn from(err: LocalSocketError) -> Self {
        let kind = match &err {
            LocalSocketError::ReadTimeout { .. } | LocalSocketError::SendTimeout { .. } => {
                std::io::ErrorKind::TimedOut
            }
            LocalSocketError::InvalidFd { .. } => std::io::ErrorKind::NotConnected,
            other => other
                .native()
                .map_or(std::io::ErrorKind::Other, |n| n.to_io_error().kind()),
        };
        std::io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_codes_by_range() {
        let too_long = LocalSocketError::PathTooLong {
            title: "am".to_string(),
            path: "/x".to_string(),
            len: 109,
        };
        assert_eq!(too_long.code(), 151);
        assert_eq!(too_long.category(), LOCAL_SOCKET_ERROR_CATEGORY);

        let invalid_fd = LocalSocketError::InvalidFd {
            title: "am".to_string(),
        };
        assert_eq!(invalid_fd.code(), 202);
    }

    #[test]
    fn test_file_errors_category() {
        let err = LocalSocketError::DeleteSocketFileFailed {
            title: "am".to_string(),
            path: PathBuf::from("/tmp/am.sock"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(err.category(), FILE_ERROR_CATEGORY);
        assert_eq!(err.code(), 171);
    }

    #[test]
    fn test_message_names_title_and_path() {
        let err = LocalSocketError::PathNotAbsolute {
            title: "termux-am".to_string(),
            path: "relative.sock".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "The \"termux-am\" server socket path \"relative.sock\" is not an absolute file path."
        );
    }

    #[test]
    fn test_native_error_classification() {
        assert!(NativeError::new("recv", libc::EAGAIN).is_timeout());
        assert!(NativeError::new("accept", libc::EINTR).is_interrupted());
        assert!(!NativeError::new("send", libc::EPIPE).is_timeout());

        let msg = NativeError::new("bind", libc::EADDRINUSE).to_string();
        assert!(msg.starts_with("bind() failed:"));
        assert!(msg.contains(&format!("errno {}", libc::EADDRINUSE)));
    }

    #[test]
    fn test_native_error_is_source() {
        use std::error::Error as _;

        let err = LocalSocketError::SendFailed {
            title: "t".to_string(),
            source: NativeError::new("send", libc::EPIPE),
        };
        let source = err.source().unwrap();
        assert_eq!(
            source.downcast_ref::<NativeError>(),
            Some(&NativeError::new("send", libc::EPIPE))
        );
        assert!(err.to_string().contains("send() failed"));
    }

    #[test]
    fn test_into_io_error_kinds() {
        let timeout: std::io::Error = LocalSocketError::ReadTimeout {
            title: "t".to_string(),
            timeout_ms: 10,
        }
        .into();
        assert_eq!(timeout.kind(), std::io::ErrorKind::TimedOut);

        let closed: std::io::Error = LocalSocketError::InvalidFd {
            title: "t".to_string(),
        }
        .into();
        assert_eq!(closed.kind(), std::io::ErrorKind::NotConnected);

        let reset: std::io::Error = LocalSocketError::SendFailed {
            title: "t".to_string(),
            source: NativeError::new("send", libc::EPIPE),
        }
        .into();
        assert_eq!(reset.kind(), std::io::ErrorKind::BrokenPipe);
    }
}
