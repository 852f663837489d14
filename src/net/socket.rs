use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::net::{UnixListener, UnixStream},
    },
    path::Path,
};

use nix::sys::socket::{
    bind, connect, getsockopt, listen, setsockopt, socket, sockopt, AddressFamily, Backlog,
    SockFlag, SockType, SockaddrLike, SockaddrStorage, UnixAddr,
};

use crate::Result;

use super::Address;

fn family(addr: &SocketAddr) -> AddressFamily {
    if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    }
}

pub(super) fn tcp_listener_socket(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let fd = socket(
        family(&addr),
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = SockaddrStorage::from(addr);

    setsockopt(&fd, sockopt::ReuseAddr, &true)?;

    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(backlog)?)?;

    Ok(TcpListener::from(fd))
}

pub(super) fn unix_listener_socket(path: &Path, backlog: i32) -> Result<UnixListener> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;

    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(backlog)?)?;

    Ok(UnixListener::from(fd))
}

// Start a non-blocking connect, true means the handshake is still in flight and completes once
// the socket turns writable.
fn start_connect(fd: &OwnedFd, addr: &dyn SockaddrLike) -> Result<bool> {
    match connect(fd.as_raw_fd(), addr) {
        Ok(()) => Ok(false),
        Err(nix::Error::EINPROGRESS) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

/// Open a non-blocking TCP socket and start connecting it to `remote`. The returned flag is set
/// while the connect is still pending, see [Socket::take_error].
pub(super) fn tcp_client_socket(
    local: Option<SocketAddr>,
    remote: SocketAddr,
) -> Result<(Socket, bool)> {
    let fd = socket(
        family(&remote),
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    if let Some(local) = local {
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        bind(fd.as_raw_fd(), &SockaddrStorage::from(local))?;
    }
    let pending = start_connect(&fd, &SockaddrStorage::from(remote))?;

    let stream = TcpStream::from(fd);
    stream.set_nodelay(true)?;
    Ok((Socket::Tcp(stream), pending))
}

/// Unix stream connects either finish right away or fail, a full backlog surfaces as a temporary
/// `EAGAIN` error.
pub(super) fn unix_client_socket(local: Option<&Path>, remote: &Path) -> Result<(Socket, bool)> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    if let Some(local) = local {
        bind(fd.as_raw_fd(), &UnixAddr::new(local)?)?;
    }
    let pending = start_connect(&fd, &UnixAddr::new(remote)?)?;

    Ok((Socket::Unix(UnixStream::from(fd)), pending))
}

/// A raw, connected stream socket, as produced by accepting or dialing. A [super::Connection]
/// takes ownership of one and mediates all access to it.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(stream) => (&*stream).read(buf),
            Socket::Unix(stream) => (&*stream).read(buf),
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(stream) => (&*stream).write(buf),
            Socket::Unix(stream) => (&*stream).write(buf),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Tcp(stream) => stream.set_nonblocking(nonblocking),
            Socket::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    /// Shut down both halves of the socket. A socket the peer already tore down is not an error.
    pub fn shutdown(&self) -> io::Result<()> {
        let result = match self {
            Socket::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Socket::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        match result {
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// Enable TCP keepalive probing with both the idle time and probe interval set to `seconds`.
    /// Zero leaves the socket untouched, as does calling this on a unix socket.
    pub fn set_keepalive(&self, seconds: u32) -> Result<()> {
        let stream = match self {
            Socket::Tcp(stream) if seconds > 0 => stream,
            _ => return Ok(()),
        };
        setsockopt(stream, sockopt::KeepAlive, &true)?;
        setsockopt(stream, sockopt::TcpKeepIdle, &seconds)?;
        setsockopt(stream, sockopt::TcpKeepInterval, &seconds)?;
        Ok(())
    }

    /// Fetch and clear the pending socket error, which is how the outcome of a non-blocking
    /// connect is reported.
    pub fn take_error(&self) -> Result<()> {
        let err = match self {
            Socket::Tcp(stream) => getsockopt(stream, sockopt::SocketError)?,
            Socket::Unix(stream) => getsockopt(stream, sockopt::SocketError)?,
        };
        match err {
            0 => Ok(()),
            err => Err(io::Error::from_raw_os_error(err).into()),
        }
    }

    pub fn local_addr(&self) -> io::Result<Address> {
        match self {
            Socket::Tcp(stream) => stream.local_addr().map(Address::Tcp),
            Socket::Unix(stream) => stream.local_addr().map(|addr| Address::from_unix(&addr)),
        }
    }

    pub fn peer_addr(&self) -> io::Result<Address> {
        match self {
            Socket::Tcp(stream) => stream.peer_addr().map(Address::Tcp),
            Socket::Unix(stream) => stream.peer_addr().map(|addr| Address::from_unix(&addr)),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(stream) => stream.as_raw_fd(),
            Socket::Unix(stream) => stream.as_raw_fd(),
        }
    }
}

impl From<TcpStream> for Socket {
    fn from(stream: TcpStream) -> Self {
        Socket::Tcp(stream)
    }
}

impl From<UnixStream> for Socket {
    fn from(stream: UnixStream) -> Self {
        Socket::Unix(stream)
    }
}
