use std::{
    fmt, io,
    net::{SocketAddr, ToSocketAddrs},
    os::unix::net,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

use super::Network;

/// A typed endpoint, either side of a TCP or unix domain socket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp(SocketAddr),
    /// Unnamed unix endpoints, like the client side of most unix connections, carry an empty
    /// path.
    Unix(PathBuf),
}

impl Address {
    pub(crate) fn from_unix(addr: &net::SocketAddr) -> Address {
        Address::Unix(addr.as_pathname().map(Path::to_path_buf).unwrap_or_default())
    }

    /// The TCP socket address, if this is a TCP endpoint.
    pub fn as_tcp(&self) -> Option<SocketAddr> {
        match self {
            Address::Tcp(addr) => Some(*addr),
            Address::Unix(..) => None,
        }
    }

    /// The filesystem path, if this is a unix endpoint.
    pub fn as_unix(&self) -> Option<&Path> {
        match self {
            Address::Tcp(..) => None,
            Address::Unix(path) => Some(path.as_path()),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Tcp(addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(addr) => addr.fmt(f),
            Address::Unix(path) => path.display().fmt(f),
        }
    }
}

/// Resolve a `host:port` string into a TCP [Address] for the given network. An empty host, as in
/// `":8080"`, means the unspecified address of the network's family. `tcp4` and `tcp6` only accept
/// candidates from their own family.
pub fn resolve_tcp_address(network: Network, address: &str) -> Result<Address> {
    if !network.is_tcp() {
        return Err(Error::UnknownNetwork(network.to_string()));
    }

    let address = match address.strip_prefix(':') {
        Some(port) if network == Network::Tcp6 => format!("[::]:{}", port),
        Some(port) => format!("0.0.0.0:{}", port),
        None => address.to_string(),
    };

    address
        .to_socket_addrs()?
        .find(|candidate| match network {
            Network::Tcp4 => candidate.is_ipv4(),
            Network::Tcp6 => candidate.is_ipv6(),
            _ => true,
        })
        .map(Address::Tcp)
        .ok_or_else(|| {
            Error::from(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} address found for {}", network, address),
            ))
        })
}

/// Resolve a path into a unix [Address].
pub fn resolve_unix_address(network: Network, address: &str) -> Result<Address> {
    if !network.is_unix() {
        return Err(Error::UnknownNetwork(network.to_string()));
    }
    Ok(Address::Unix(PathBuf::from(address)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_tcp_literal() {
        let addr = resolve_tcp_address(Network::Tcp, "127.0.0.1:9091").unwrap();
        assert_eq!(addr, Address::Tcp("127.0.0.1:9091".parse().unwrap()));
        assert_eq!(addr.to_string(), "127.0.0.1:9091");
    }

    #[test]
    fn test_resolve_tcp_family_filter() {
        assert!(resolve_tcp_address(Network::Tcp6, "127.0.0.1:80").is_err());
        let addr = resolve_tcp_address(Network::Tcp6, "[::1]:80").unwrap();
        assert!(addr.as_tcp().unwrap().is_ipv6());
    }

    #[test]
    fn test_resolve_tcp_empty_host() {
        let addr = resolve_tcp_address(Network::Tcp, ":0").unwrap();
        assert!(addr.as_tcp().unwrap().ip().is_unspecified());
    }

    #[test]
    fn test_resolve_wrong_network() {
        assert!(matches!(
            resolve_tcp_address(Network::Unix, "127.0.0.1:80"),
            Err(Error::UnknownNetwork(..))
        ));
        assert!(matches!(
            resolve_unix_address(Network::Tcp, "/tmp/sock"),
            Err(Error::UnknownNetwork(..))
        ));
        let addr = resolve_unix_address(Network::Unix, "/tmp/sock").unwrap();
        assert_eq!(addr.as_unix(), Some(Path::new("/tmp/sock")));
    }
}
