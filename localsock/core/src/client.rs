//! Client Socket
//!
//! One accepted connection. A [`ClientSocket`] owns exactly one fd until it is
//! closed (explicitly or on drop) and never reuses it afterwards.
//!
//! Reads and writes block, bounded by the `SO_RCVTIMEO`/`SO_SNDTIMEO` values
//! the accept loop applied from the [`RunConfig`]. The byte stream carries no
//! message boundaries; framing is up to the caller.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::credential::PeerCredential;
use crate::error::LocalSocketError;
use crate::native::NativeSocketProvider;
use crate::run_config::{RunConfig, NO_FD};

/// An accepted local socket connection
pub struct ClientSocket {
    fd: AtomicI32,
    peer_credential: PeerCredential,
    run_config: Arc<RunConfig>,
    provider: Arc<dyn NativeSocketProvider>,
}

impl ClientSocket {
    /// Wrap an accepted fd; the socket takes ownership of it
    pub(crate) fn new(
        fd: RawFd,
        peer_credential: PeerCredential,
        run_config: Arc<RunConfig>,
        provider: Arc<dyn NativeSocketProvider>,
    ) -> Self {
        Self {
            fd: AtomicI32::new(if fd >= 0 { fd } else { NO_FD }),
            peer_credential,
            run_config,
            provider,
        }
    }

    /// Current fd, or `-1` once closed
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd.load(Ordering::SeqCst)
    }

    /// Whether the socket has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.fd() < 0
    }

    /// Credentials of the connected peer
    #[must_use]
    pub fn peer_credential(&self) -> &PeerCredential {
        &self.peer_credential
    }

    /// Run config of the server this client was accepted from
    #[must_use]
    pub fn run_config(&self) -> &Arc<RunConfig> {
        &self.run_config
    }

    fn title(&self) -> String {
        self.run_config.title().to_string()
    }

    fn open_fd(&self) -> Result<RawFd, LocalSocketError> {
        let fd = self.fd();
        if fd < 0 {
            return Err(LocalSocketError::InvalidFd { title: self.title() });
        }
        Ok(fd)
    }

    /// Read up to `buf.len()` bytes
    ///
    /// Returns `Ok(0)` at end of stream (the peer closed its write side).
    ///
    /// # Errors
    ///
    /// - [`LocalSocketError::InvalidFd`] if the socket is closed
    /// - [`LocalSocketError::ReadTimeout`] if nothing arrived within the receive timeout
    /// - [`LocalSocketError::ReadFailed`] for any other failure
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, LocalSocketError> {
        let fd = self.open_fd()?;
        self.provider.read(fd, buf).map_err(|source| {
            if source.is_timeout() {
                LocalSocketError::ReadTimeout {
                    title: self.title(),
                    timeout_ms: duration_ms(self.run_config.receive_timeout()),
                }
            } else {
                LocalSocketError::ReadFailed {
                    title: self.title(),
                    source,
                }
            }
        })
    }

    /// Read until `buf` is full, the peer closes, or `deadline` passes
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` only
    /// at end of stream.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read); [`LocalSocketError::ReadTimeout`] is also
    /// returned once `deadline` has passed.
    pub fn read_fully(
        &self,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> Result<usize, LocalSocketError> {
        let started = Instant::now();
        let mut filled = 0;
        while filled < buf.len() {
            if let Some(deadline) = deadline {
                if Instant::now() > deadline {
                    return Err(LocalSocketError::ReadTimeout {
                        title: self.title(),
                        timeout_ms: duration_ms(deadline.saturating_duration_since(started)),
                    });
                }
            }
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Read one byte, or `None` at end of stream
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub fn read_byte(&self) -> Result<Option<u8>, LocalSocketError> {
        let mut byte = [0u8; 1];
        Ok((self.read(&mut byte)? == 1).then_some(byte[0]))
    }

    /// Send the whole buffer
    ///
    /// # Errors
    ///
    /// - [`LocalSocketError::InvalidFd`] if the socket is closed
    /// - [`LocalSocketError::SendTimeout`] if the peer stopped draining data
    /// - [`LocalSocketError::SendFailed`] for any other failure
    pub fn write(&self, buf: &[u8]) -> Result<(), LocalSocketError> {
        let fd = self.open_fd()?;
        self.provider.send(fd, buf).map_err(|source| {
            if source.is_timeout() {
                LocalSocketError::SendTimeout {
                    title: self.title(),
                    timeout_ms: duration_ms(self.run_config.send_timeout()),
                }
            } else {
                LocalSocketError::SendFailed {
                    title: self.title(),
                    source,
                }
            }
        })
    }

    /// Send one byte
    ///
    /// # Errors
    ///
    /// Same as [`write`](Self::write).
    pub fn write_byte(&self, byte: u8) -> Result<(), LocalSocketError> {
        self.write(&[byte])
    }

    /// Number of bytes readable without blocking
    ///
    /// # Errors
    ///
    /// [`LocalSocketError::InvalidFd`] if closed, otherwise
    /// [`LocalSocketError::AvailableFailed`].
    pub fn available(&self) -> Result<usize, LocalSocketError> {
        let fd = self.open_fd()?;
        self.provider
            .available(fd)
            .map_err(|source| LocalSocketError::AvailableFailed {
                title: self.title(),
                source,
            })
    }

    /// Apply the run config's receive timeout (`SO_RCVTIMEO`)
    ///
    /// A closed socket is left alone.
    ///
    /// # Errors
    ///
    /// [`LocalSocketError::SetReadTimeoutFailed`] if the provider refuses.
    pub fn set_read_timeout(&self) -> Result<(), LocalSocketError> {
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }
        let timeout = self.run_config.receive_timeout();
        self.provider
            .set_recv_timeout(fd, timeout)
            .map_err(|source| LocalSocketError::SetReadTimeoutFailed {
                title: self.title(),
                timeout_ms: duration_ms(timeout),
                source,
            })
    }

    /// Apply the run config's send timeout (`SO_SNDTIMEO`)
    ///
    /// A closed socket is left alone.
    ///
    /// # Errors
    ///
    /// [`LocalSocketError::SetSendTimeoutFailed`] if the provider refuses.
    pub fn set_write_timeout(&self) -> Result<(), LocalSocketError> {
        let fd = self.fd();
        if fd < 0 {
            return Ok(());
        }
        let timeout = self.run_config.send_timeout();
        self.provider
            .set_send_timeout(fd, timeout)
            .map_err(|source| LocalSocketError::SetSendTimeoutFailed {
                title: self.title(),
                timeout_ms: duration_ms(timeout),
                source,
            })
    }

    /// Close the socket
    ///
    /// Idempotent. The fd is released even if the provider reports an error,
    /// so a real descriptor is never closed twice.
    ///
    /// # Errors
    ///
    /// [`LocalSocketError::CloseClientSocketFailed`] if `close()` failed.
    pub fn close(&self) -> Result<(), LocalSocketError> {
        let fd = self.fd.swap(NO_FD, Ordering::SeqCst);
        if fd < 0 {
            return Ok(());
        }
        debug!(title = %self.run_config.title(), fd, "Closing client socket");
        self.provider
            .close(fd)
            .map_err(|source| LocalSocketError::CloseClientSocketFailed {
                title: self.title(),
                source,
            })
    }

    /// Close the socket, logging instead of returning a failure
    pub fn close_quietly(&self) {
        if let Err(e) = self.close() {
            warn!(title = %self.run_config.title(), error = %e, "Client socket close failed");
        }
    }

    /// `std::io::Read` view over this socket
    #[must_use]
    pub fn input_stream(&self) -> ClientInputStream<'_> {
        ClientInputStream { socket: self }
    }

    /// `std::io::Write` view over this socket
    #[must_use]
    pub fn output_stream(&self) -> ClientOutputStream<'_> {
        ClientOutputStream { socket: self }
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.close_quietly();
    }
}

impl fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocket")
            .field("title", &self.run_config.title())
            .field("fd", &self.fd())
            .field("peer", &self.peer_credential)
            .finish_non_exhaustive()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Input stream adapter returned by [`ClientSocket::input_stream`]
#[derive(Debug)]
pub struct ClientInputStream<'a> {
    socket: &'a ClientSocket,
}

impl ClientInputStream<'_> {
    /// Bytes readable without blocking
    ///
    /// # Errors
    ///
    /// See [`ClientSocket::available`].
    pub fn available(&self) -> io::Result<usize> {
        Ok(self.socket.available()?)
    }
}

impl io::Read for ClientInputStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.socket.read(buf)?)
    }
}

/// Output stream adapter returned by [`ClientSocket::output_stream`]
#[derive(Debug)]
pub struct ClientOutputStream<'a> {
    socket: &'a ClientSocket,
}

impl io::Write for ClientOutputStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
