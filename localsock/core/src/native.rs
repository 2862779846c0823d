//! Native Socket Provider
//!
//! The syscall boundary of the crate. Everything above this module talks to
//! sockets only through [`NativeSocketProvider`], which keeps the server and
//! client logic independent of how the calls are made and lets tests swap in
//! a provider that misbehaves on purpose.
//!
//! [`LibcProvider`] is the default implementation, calling
//! `socket/bind/listen/accept/recv/send/ioctl/setsockopt/getsockopt` via `libc`.

use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::credential::PeerCredential;
use crate::error::NativeError;

/// Result type returned by provider calls
pub type NativeResult<T> = Result<T, NativeError>;

/// Largest backlog accepted by [`NativeSocketProvider::create_and_listen`]
pub const MAX_BACKLOG: i32 = 500;

/// Size of `sockaddr_un.sun_path` on Linux (`UNIX_PATH_MAX`)
pub const UNIX_PATH_MAX: usize = 108;

/// Syscall surface consumed by the server and client sockets
///
/// All methods take raw fds; ownership of those fds is tracked by the caller.
pub trait NativeSocketProvider: Send + Sync {
    /// Create an `AF_UNIX`/`SOCK_STREAM` socket bound to `path` and listening
    ///
    /// A path starting with a NUL byte binds in the abstract namespace.
    fn create_and_listen(&self, path: &[u8], backlog: i32) -> NativeResult<RawFd>;

    /// Accept one pending connection on a listening fd
    fn accept(&self, fd: RawFd) -> NativeResult<RawFd>;

    /// Kernel-reported credentials of the peer connected on `fd`
    fn peer_credential(&self, fd: RawFd) -> NativeResult<PeerCredential>;

    /// Read up to `buf.len()` bytes; `Ok(0)` means end of stream
    fn read(&self, fd: RawFd, buf: &mut [u8]) -> NativeResult<usize>;

    /// Send the whole buffer
    fn send(&self, fd: RawFd, buf: &[u8]) -> NativeResult<()>;

    /// Number of bytes that can be read without blocking
    fn available(&self, fd: RawFd) -> NativeResult<usize>;

    /// Set `SO_RCVTIMEO`
    fn set_recv_timeout(&self, fd: RawFd, timeout: Duration) -> NativeResult<()>;

    /// Set `SO_SNDTIMEO`
    fn set_send_timeout(&self, fd: RawFd, timeout: Duration) -> NativeResult<()>;

    /// Shut down both directions, waking any thread blocked on `fd`
    fn shutdown(&self, fd: RawFd) -> NativeResult<()>;

    /// Close the fd
    fn close(&self, fd: RawFd) -> NativeResult<()>;
}

/// Real uid of the current process
#[must_use]
pub fn current_uid() -> u32 {
    // SAFETY: getuid() has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const SOCKET_TYPE: libc::c_int = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SOCKET_TYPE: libc::c_int = libc::SOCK_STREAM;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

fn check(op: &'static str, ret: libc::c_int) -> NativeResult<libc::c_int> {
    if ret == -1 {
        Err(NativeError::last_os_error(op))
    } else {
        Ok(ret)
    }
}

fn duration_to_timeval(timeout: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_usec: libc::suseconds_t::try_from(timeout.subsec_micros()).unwrap_or(0),
    }
}

/// [`NativeSocketProvider`] backed by direct `libc` calls
#[derive(Clone, Copy, Debug, Default)]
pub struct LibcProvider;

impl LibcProvider {
    /// Create the provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn set_timeout(
        op: &'static str,
        fd: RawFd,
        option: libc::c_int,
        timeout: Duration,
    ) -> NativeResult<()> {
        if fd < 0 {
            return Err(NativeError::new(op, libc::EBADF));
        }
        let tv = duration_to_timeval(timeout);
        // SAFETY: tv is a valid timeval living across the call and the length matches it.
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                option,
                std::ptr::addr_of!(tv).cast::<libc::c_void>(),
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        check(op, ret).map(|_| ())
    }
}

impl NativeSocketProvider for LibcProvider {
    fn create_and_listen(&self, path: &[u8], backlog: i32) -> NativeResult<RawFd> {
        if !(1..=MAX_BACKLOG).contains(&backlog) {
            return Err(NativeError::new("listen", libc::EINVAL));
        }

        // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
        // Filesystem paths need room for the trailing NUL.
        let abstract_namespace = path.first() == Some(&0);
        let needed = if abstract_namespace {
            path.len()
        } else {
            path.len() + 1
        };
        if path.is_empty() || needed > addr.sun_path.len() {
            return Err(NativeError::new("bind", libc::ENAMETOOLONG));
        }

        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path.iter_mut().zip(path) {
            *dst = *src as libc::c_char;
        }
        let addr_len = mem::offset_of!(libc::sockaddr_un, sun_path) + needed;

        // SAFETY: plain socket(2) call.
        let fd = check("socket", unsafe {
            libc::socket(libc::AF_UNIX, SOCKET_TYPE, 0)
        })?;

        // SAFETY: addr is initialized and addr_len never exceeds its size.
        let bound = check("bind", unsafe {
            libc::bind(
                fd,
                std::ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                addr_len as libc::socklen_t,
            )
        });
        // SAFETY: fd is a socket we own.
        let listening = bound.and_then(|_| check("listen", unsafe { libc::listen(fd, backlog) }));

        if let Err(e) = listening {
            // SAFETY: fd was returned by socket() above and is not shared.
            unsafe { libc::close(fd) };
            return Err(e);
        }

        Ok(fd)
    }

    fn accept(&self, fd: RawFd) -> NativeResult<RawFd> {
        if fd < 0 {
            return Err(NativeError::new("accept", libc::EBADF));
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        // SAFETY: null address pointers are allowed by accept4(2).
        let ret = unsafe {
            libc::accept4(
                fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        // SAFETY: null address pointers are allowed by accept(2).
        let ret = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };

        check("accept", ret)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn peer_credential(&self, fd: RawFd) -> NativeResult<PeerCredential> {
        if fd < 0 {
            return Err(NativeError::new("getsockopt", libc::EBADF));
        }

        // Start from -1 so a getsockopt() that "succeeds" without filling the
        // struct never yields uid 0.
        let mut cred = libc::ucred {
            pid: -1,
            uid: u32::MAX,
            gid: u32::MAX,
        };
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: cred and len are valid for writes of the advertised size.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                std::ptr::addr_of_mut!(cred).cast::<libc::c_void>(),
                &mut len,
            )
        };
        check("getsockopt", ret)?;

        let mut peer = PeerCredential::new(
            cred.pid,
            i32::try_from(cred.uid).unwrap_or(crate::credential::UNFILLED),
            i32::try_from(cred.gid).unwrap_or(crate::credential::UNFILLED),
        );
        peer.fill_process_info();
        Ok(peer)
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn peer_credential(&self, fd: RawFd) -> NativeResult<PeerCredential> {
        if fd < 0 {
            return Err(NativeError::new("getpeereid", libc::EBADF));
        }

        let mut uid: libc::uid_t = libc::uid_t::MAX;
        let mut gid: libc::gid_t = libc::gid_t::MAX;
        // SAFETY: uid and gid are valid for writes.
        let ret = unsafe { libc::getpeereid(fd, &mut uid, &mut gid) };
        check("getpeereid", ret)?;

        // getpeereid() does not report the pid
        Ok(PeerCredential::new(
            crate::credential::UNFILLED,
            i32::try_from(uid).unwrap_or(crate::credential::UNFILLED),
            i32::try_from(gid).unwrap_or(crate::credential::UNFILLED),
        ))
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> NativeResult<usize> {
        if fd < 0 {
            return Err(NativeError::new("recv", libc::EBADF));
        }
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes.
            let ret = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if ret >= 0 {
                return Ok(ret.unsigned_abs());
            }
            let err = NativeError::last_os_error("recv");
            if !err.is_interrupted() {
                return Err(err);
            }
        }
    }

    fn send(&self, fd: RawFd, buf: &[u8]) -> NativeResult<()> {
        if fd < 0 {
            return Err(NativeError::new("send", libc::EBADF));
        }
        let mut remaining = buf;
        while !remaining.is_empty() {
            // SAFETY: remaining is valid for reads of remaining.len() bytes.
            let ret = unsafe {
                libc::send(
                    fd,
                    remaining.as_ptr().cast(),
                    remaining.len(),
                    SEND_FLAGS,
                )
            };
            if ret < 0 {
                let err = NativeError::last_os_error("send");
                if err.is_interrupted() {
                    continue;
                }
                return Err(err);
            }
            remaining = &remaining[ret.unsigned_abs()..];
        }
        Ok(())
    }

    fn available(&self, fd: RawFd) -> NativeResult<usize> {
        if fd < 0 {
            return Err(NativeError::new("ioctl", libc::EBADF));
        }
        let mut pending: libc::c_int = 0;
        // SAFETY: FIONREAD writes a single c_int into pending.
        let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut pending) };
        check("ioctl", ret)?;
        Ok(usize::try_from(pending).unwrap_or(0))
    }

    fn set_recv_timeout(&self, fd: RawFd, timeout: Duration) -> NativeResult<()> {
        Self::set_timeout("setsockopt", fd, libc::SO_RCVTIMEO, timeout)
    }

    fn set_send_timeout(&self, fd: RawFd, timeout: Duration) -> NativeResult<()> {
        Self::set_timeout("setsockopt", fd, libc::SO_SNDTIMEO, timeout)
    }

    fn shutdown(&self, fd: RawFd) -> NativeResult<()> {
        if fd < 0 {
            return Err(NativeError::new("shutdown", libc::EBADF));
        }
        // SAFETY: plain shutdown(2) call on a caller-owned fd.
        check("shutdown", unsafe { libc::shutdown(fd, libc::SHUT_RDWR) }).map(|_| ())
    }

    fn close(&self, fd: RawFd) -> NativeResult<()> {
        if fd < 0 {
            return Err(NativeError::new("close", libc::EBADF));
        }
        // SAFETY: the caller gives up ownership of fd here.
        check("close", unsafe { libc::close(fd) }).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;

    fn listen_in(dir: &TempDir) -> (std::path::PathBuf, RawFd) {
        let path = dir.path().join("native.sock");
        let fd = LibcProvider
            .create_and_listen(path.to_str().unwrap().as_bytes(), 50)
            .unwrap();
        (path, fd)
    }

    #[test]
    fn test_create_accept_and_peer_credential() {
        let dir = TempDir::new().unwrap();
        let (path, fd) = listen_in(&dir);
        assert!(fd >= 0);
        assert!(path.exists());

        let _peer = UnixStream::connect(&path).unwrap();
        let client_fd = LibcProvider.accept(fd).unwrap();

        let cred = LibcProvider.peer_credential(client_fd).unwrap();
        assert_eq!(cred.uid, i32::try_from(current_uid()).unwrap());
        assert!(cred.is_filled());

        LibcProvider.close(client_fd).unwrap();
        LibcProvider.close(fd).unwrap();
    }

    #[test]
    fn test_read_send_available() {
        let dir = TempDir::new().unwrap();
        let (path, fd) = listen_in(&dir);

        let mut peer = UnixStream::connect(&path).unwrap();
        let client_fd = LibcProvider.accept(fd).unwrap();

        peer.write_all(b"hello").unwrap();
        // Give the kernel a moment to queue the bytes
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(LibcProvider.available(client_fd).unwrap(), 5);

        let mut buf = [0u8; 16];
        let n = LibcProvider.read(client_fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");

        LibcProvider.send(client_fd, b"world").unwrap();
        let mut reply = [0u8; 5];
        std::io::Read::read_exact(&mut peer, &mut reply).unwrap();
        assert_eq!(&reply, b"world");

        LibcProvider.close(client_fd).unwrap();
        LibcProvider.close(fd).unwrap();
    }

    #[test]
    fn test_recv_timeout_reports_eagain() {
        let (local, _peer) = UnixStream::pair().unwrap();
        let fd = std::os::unix::io::AsRawFd::as_raw_fd(&local);

        LibcProvider
            .set_recv_timeout(fd, Duration::from_millis(50))
            .unwrap();
        let mut buf = [0u8; 4];
        let err = LibcProvider.read(fd, &mut buf).unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err}");
    }

    #[test]
    fn test_rejects_bad_backlog_and_long_path() {
        let err = LibcProvider.create_and_listen(b"/tmp/x.sock", 0).unwrap_err();
        assert_eq!(err.errno, libc::EINVAL);

        let long = vec![b'a'; UNIX_PATH_MAX];
        let err = LibcProvider.create_and_listen(&long, 50).unwrap_err();
        assert_eq!(err.errno, libc::ENAMETOOLONG);
    }

    #[test]
    fn test_negative_fd_is_ebadf() {
        assert_eq!(LibcProvider.close(-1).unwrap_err().errno, libc::EBADF);
        assert_eq!(LibcProvider.accept(-1).unwrap_err().errno, libc::EBADF);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_shutdown_wakes_blocked_accept() {
        let dir = TempDir::new().unwrap();
        let (_path, fd) = listen_in(&dir);

        let waiter = std::thread::spawn(move || LibcProvider.accept(fd));
        std::thread::sleep(Duration::from_millis(50));
        LibcProvider.shutdown(fd).unwrap();

        assert!(waiter.join().unwrap().is_err());
        LibcProvider.close(fd).unwrap();
    }
}
