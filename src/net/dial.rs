use std::{
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    path::Path,
    sync::Arc,
    time::Instant,
};

use futures::future::{self, Either};
use tracing::{debug, trace, warn};

use crate::{
    engine::Engine,
    poll::{FdOperator, Interest, OperatorHandle},
    sync::Signal,
    Error, Result,
};

use super::{socket, Address, Connection, Network, Options, Socket};

fn mismatch(network: Network, addr: &Address) -> Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("address {} does not belong to network {}", addr, network),
    )
    .into()
}

// Detaches the connect registration however the wait ends, including the dial being dropped.
struct Connecting<'a> {
    engine: &'a Engine,
    handle: OperatorHandle,
}

impl Drop for Connecting<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.engine.poller().detach(&self.handle) {
            warn!(fd = self.handle.fd(), "failed to detach connecting socket: {}", e);
        }
    }
}

/// Wait for a pending connect to finish. The socket turns writable once the handshake completes
/// or fails, and the socket error tells the two apart.
async fn wait_connected(engine: &Engine, socket: &Socket, deadline: Option<Instant>) -> Result<()> {
    let writable = Arc::new(Signal::new());
    let operator = {
        let on_write = writable.clone();
        let on_hup = writable.clone();
        FdOperator::new()
            .on_write(move || on_write.notify())
            .on_hup(move || on_hup.notify())
    };
    let handle = engine
        .poller()
        .register(socket.as_raw_fd(), Interest::Writable, Arc::new(operator))?;
    let connecting = Connecting { engine, handle };
    trace!(fd = socket.as_raw_fd(), "waiting for connect");

    match deadline {
        Some(deadline) => {
            match future::select(writable.wait(), engine.sleep_until(deadline)).await {
                Either::Left(..) => {}
                Either::Right(..) => return Err(Error::DeadlineExceeded),
            }
        }
        None => writable.wait().await,
    }
    drop(connecting);

    socket.take_error()
}

/// Connect to `remote` over `network`, optionally binding `local` first, and wrap the socket
/// into a [Connection] whose reader is already running.
///
/// The connect never blocks the calling thread, a pending handshake is awaited on the engine's
/// poller. If `deadline` passes first the dial fails with [Error::DeadlineExceeded] and the
/// half open socket is closed. UDP networks fail with [Error::NotImplemented] and a missing
/// remote with [Error::MissingAddress].
pub async fn dial(
    engine: &Engine,
    network: Network,
    local: Option<&Address>,
    remote: Option<&Address>,
    options: &Options,
    deadline: Option<Instant>,
) -> Result<Connection> {
    if network.is_udp() {
        return Err(Error::NotImplemented("udp dial"));
    }
    if !network.is_stream() {
        return Err(Error::NotImplemented("unix datagram dial"));
    }
    let remote = remote.ok_or(Error::MissingAddress)?;

    let (socket, pending) = match network {
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            let remote_addr = tcp_addr(network, remote)?;
            let local_addr = local.map(|local| tcp_addr(network, local)).transpose()?;
            socket::tcp_client_socket(local_addr, remote_addr)?
        }
        Network::Unix => {
            let remote_path = remote.as_unix().ok_or_else(|| mismatch(network, remote))?;
            let local_path = local
                .map(|local| local.as_unix().ok_or_else(|| mismatch(network, local)))
                .transpose()?;
            socket::unix_client_socket(local_path, remote_path)?
        }
        Network::Udp | Network::Udp4 | Network::Udp6 => {
            return Err(Error::NotImplemented("udp dial"))
        }
        Network::Unixgram | Network::Unixpacket => {
            return Err(Error::NotImplemented("unix datagram dial"))
        }
    };
    if pending {
        wait_connected(engine, &socket, deadline).await?;
    }

    let conn = Connection::new(engine, socket, options.clone())?;
    debug!(fd = conn.as_raw_fd(), %network, remote = %remote, "dialed connection");
    conn.start();
    Ok(conn)
}

fn tcp_addr(network: Network, addr: &Address) -> Result<SocketAddr> {
    let socket_addr = addr.as_tcp().ok_or_else(|| mismatch(network, addr))?;
    let matches = match network {
        Network::Tcp4 => socket_addr.is_ipv4(),
        Network::Tcp6 => socket_addr.is_ipv6(),
        _ => true,
    };
    if !matches {
        return Err(mismatch(network, addr));
    }
    Ok(socket_addr)
}

/// Dial a TCP connection, see [dial].
pub async fn dial_tcp(
    engine: &Engine,
    network: Network,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    options: &Options,
    deadline: Option<Instant>,
) -> Result<Connection> {
    if !network.is_tcp() {
        return Err(Error::UnknownNetwork(network.to_string()));
    }
    let local = local.map(Address::Tcp);
    let remote = remote.map(Address::Tcp);
    dial(engine, network, local.as_ref(), remote.as_ref(), options, deadline).await
}

/// Dial a unix domain socket connection, see [dial].
pub async fn dial_unix(
    engine: &Engine,
    network: Network,
    local: Option<&Path>,
    remote: Option<&Path>,
    options: &Options,
    deadline: Option<Instant>,
) -> Result<Connection> {
    if !network.is_unix() {
        return Err(Error::UnknownNetwork(network.to_string()));
    }
    let local = local.map(|path| Address::Unix(path.to_path_buf()));
    let remote = remote.map(|path| Address::Unix(path.to_path_buf()));
    dial(engine, network, local.as_ref(), remote.as_ref(), options, deadline).await
}
