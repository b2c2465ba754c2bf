//! Listener and stream abstraction over TCP and UNIX-domain sockets.
//!
//! Listening sockets are created through raw `libc` calls so the configured
//! backlog is honored, then wrapped in mio's non-blocking types. UNIX
//! sockets are unlinked before bind, opened world-accessible (mode 0777),
//! and unlinked again on shutdown.

use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};

/// Address a listener binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    /// TCP on all interfaces at the given port (0 = kernel-assigned).
    Tcp(u16),
    /// UNIX-domain stream socket at the given path.
    Unix(PathBuf),
}

impl ListenAddr {
    /// Builds an address from a (port, socket-path) config pair; a
    /// non-empty path selects a UNIX socket.
    #[must_use]
    pub fn from_config(port: u16, socket_path: &str) -> Self {
        if socket_path.is_empty() {
            Self::Tcp(port)
        } else {
            Self::Unix(PathBuf::from(socket_path))
        }
    }

    /// Removes the socket file of a UNIX address; no-op for TCP.
    pub fn cleanup(&self) {
        if let Self::Unix(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(port) => write!(f, "tcp:{port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

fn listen_fd(fd: &OwnedFd, backlog: i32) -> io::Result<()> {
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

fn bind_tcp(port: u16, backlog: i32) -> io::Result<TcpListener> {
    let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if raw == -1 {
        return Err(last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let yes: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(yes).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::from(libc::INADDR_ANY).to_be();
    addr.sin_port = port.to_be();
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(last_os_error());
    }
    listen_fd(&fd, backlog)?;

    let std_listener = std::net::TcpListener::from(fd);
    std_listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(std_listener))
}

fn bind_unix(path: &PathBuf, backlog: i32) -> io::Result<UnixListener> {
    let _ = std::fs::remove_file(path);

    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw == -1 {
        return Err(last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_encoded_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix socket path too long",
        ));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            std::ptr::addr_of!(addr).cast(),
            mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc == -1 {
        return Err(last_os_error());
    }

    // Webservers commonly run under a different uid; the socket stays
    // world-accessible like the temp-dir convention it follows.
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777)) {
        wasgate_core::log_warn!("chmod {}: {e} (continuing)", path.display());
    }

    listen_fd(&fd, backlog)?;

    let std_listener = std::os::unix::net::UnixListener::from(fd);
    std_listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(std_listener))
}

/// A bound, non-blocking listening socket.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener.
    Tcp(TcpListener),
    /// UNIX-domain listener.
    Unix(UnixListener),
}

impl Listener {
    /// Binds and listens at `addr` with the given backlog.
    ///
    /// # Errors
    ///
    /// Propagates socket/bind/listen failures; these are startup-fatal for
    /// the gateway.
    pub fn bind(addr: &ListenAddr, backlog: i32) -> io::Result<Self> {
        match addr {
            ListenAddr::Tcp(port) => Ok(Self::Tcp(bind_tcp(*port, backlog)?)),
            ListenAddr::Unix(path) => Ok(Self::Unix(bind_unix(path, backlog)?)),
        }
    }

    /// Accepts one pending connection.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when the accept queue is empty; other errors are
    /// logged by the caller.
    pub fn accept(&self) -> io::Result<Stream> {
        match self {
            Self::Tcp(listener) => listener.accept().map(|(stream, _)| Stream::Tcp(stream)),
            Self::Unix(listener) => listener.accept().map(|(stream, _)| Stream::Unix(stream)),
        }
    }

    /// The actual TCP port bound, for `Tcp(0)` addresses.
    #[must_use]
    pub fn local_tcp_port(&self) -> Option<u16> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            Self::Unix(_) => None,
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.register(registry, token, interests),
            Self::Unix(l) => l.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.reregister(registry, token, interests),
            Self::Unix(l) => l.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.deregister(registry),
            Self::Unix(l) => l.deregister(registry),
        }
    }
}

/// An accepted, non-blocking connection.
#[derive(Debug)]
pub enum Stream {
    /// TCP connection.
    Tcp(TcpStream),
    /// UNIX-domain connection.
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Source for Stream {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.register(registry, token, interests),
            Self::Unix(s) => s.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.reregister(registry, token, interests),
            Self::Unix(s) => s.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.deregister(registry),
            Self::Unix(s) => s.deregister(registry),
        }
    }
}
