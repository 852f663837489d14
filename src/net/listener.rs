use std::{
    fs, io,
    net::TcpListener,
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixListener,
    },
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use nix::sys::socket::{shutdown, Shutdown};
use tracing::debug;

use crate::{Error, Result};

use super::{resolve_tcp_address, resolve_unix_address, socket, Address, Network, Socket};

const DEFAULT_BACKLOG: i32 = 1024;

/// The listening side of the engine. [crate::server::Server] drives any implementation of this
/// trait from its accept loop, which is also how tests inject accept failures.
///
/// [Accept::accept] must never block: the listening descriptor is non-blocking and registered
/// edge-triggered, so an implementation returns a `WouldBlock` IO error once the backlog is empty.
pub trait Accept: AsRawFd + Send + Sync + 'static {
    /// Accept a single pending connection.
    fn accept(&self) -> Result<Socket>;

    /// Close the listener, after which [Accept::accept] fails with a closed error.
    fn close(&self) -> Result<()>;

    /// The address this listener is bound to.
    fn local_addr(&self) -> Result<Address>;
}

/// Listener configuration.
#[derive(Clone, Copy, Debug)]
pub struct ListenConfig {
    backlog: i32,
}

impl ListenConfig {
    pub fn new() -> ListenConfig {
        ListenConfig {
            backlog: DEFAULT_BACKLOG,
        }
    }

    /// Set the size of the pending connection queue, defaults to 1024.
    pub fn backlog(mut self, backlog: i32) -> ListenConfig {
        self.backlog = backlog;
        self
    }

    /// Create a listener for the network and address, see [create_listener].
    pub fn listen(&self, network: Network, address: &str) -> Result<Listener> {
        match network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let addr = match resolve_tcp_address(network, address)? {
                    Address::Tcp(addr) => addr,
                    Address::Unix(..) => return Err(Error::UnknownNetwork(network.to_string())),
                };
                let listener = socket::tcp_listener_socket(addr, self.backlog)?;
                Ok(Listener::new(Kind::Tcp(listener), None))
            }
            Network::Unix => {
                let path = match resolve_unix_address(network, address)? {
                    Address::Unix(path) => path,
                    Address::Tcp(..) => return Err(Error::UnknownNetwork(network.to_string())),
                };
                let listener = socket::unix_listener_socket(&path, self.backlog)?;
                Ok(Listener::new(Kind::Unix(listener), Some(path)))
            }
            Network::Udp | Network::Udp4 | Network::Udp6 => {
                Err(Error::NotImplemented("udp listener"))
            }
            Network::Unixgram | Network::Unixpacket => {
                Err(Error::NotImplemented("unix datagram listener"))
            }
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum Kind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A [Listener] is a non-blocking TCP or unix listening socket. The listener sets SO_REUSEADDR
/// so a restarted server can rebind its address immediately.
///
/// # Examples
///
/// ```no_run
/// # use netpoll::net::{create_listener, Accept, Network};
/// # fn main() -> netpoll::Result<()> {
/// let listener = create_listener(Network::Tcp, "127.0.0.1:0")?;
/// println!("listening on {}", listener.local_addr()?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Listener {
    kind: Kind,
    // Set for unix listeners we bound ourselves, the socket file is removed on close.
    path: Option<PathBuf>,
    closed: AtomicBool,
}

impl Listener {
    fn new(kind: Kind, path: Option<PathBuf>) -> Listener {
        Listener {
            kind,
            path,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Accept for Listener {
    fn accept(&self) -> Result<Socket> {
        if self.is_closed() {
            return Err(Error::ListenerClosed);
        }

        match self.kind {
            Kind::Tcp(ref listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nodelay(true)?;
                Ok(Socket::Tcp(stream))
            }
            Kind::Unix(ref listener) => Ok(Socket::Unix(listener.accept()?.0)),
        }
    }

    /// Closing is idempotent. The socket is shut down rather than closed, which makes the kernel
    /// reject further accepts while the descriptor number stays reserved until the listener is
    /// dropped.
    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match shutdown(self.as_raw_fd(), Shutdown::Both) {
            Ok(()) | Err(nix::Error::ENOTCONN) => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(ref path) = self.path {
            match fs::remove_file(path) {
                Err(ref e) if e.kind() != io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "failed to remove unix socket file: {}", e)
                }
                _ => {}
            }
        }

        debug!(fd = self.as_raw_fd(), "listener closed");
        Ok(())
    }

    fn local_addr(&self) -> Result<Address> {
        let addr = match self.kind {
            Kind::Tcp(ref listener) => Address::Tcp(listener.local_addr()?),
            Kind::Unix(ref listener) => Address::from_unix(&listener.local_addr()?),
        };
        Ok(addr)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self.kind {
            Kind::Tcp(ref listener) => listener.as_raw_fd(),
            Kind::Unix(ref listener) => listener.as_raw_fd(),
        }
    }
}

impl TryFrom<TcpListener> for Listener {
    type Error = Error;

    fn try_from(listener: TcpListener) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Listener::new(Kind::Tcp(listener), None))
    }
}

impl TryFrom<UnixListener> for Listener {
    type Error = Error;

    fn try_from(listener: UnixListener) -> Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Listener::new(Kind::Unix(listener), None))
    }
}

/// Create a listener on the given network and address with the default [ListenConfig]. UDP
/// networks fail with [Error::NotImplemented].
pub fn create_listener(network: Network, address: &str) -> Result<Listener> {
    ListenConfig::new().listen(network, address)
}

/// Adopt an already listening std socket, switching it to non-blocking mode.
pub fn convert_listener<T>(listener: T) -> Result<Listener>
where
    T: TryInto<Listener, Error = Error>,
{
    listener.try_into()
}
