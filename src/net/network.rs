use std::{fmt, str::FromStr};

use crate::Error;

/// The transport family of a listener or dial. Names are validated once, at the boundary, via
/// [FromStr], everything downstream matches over this closed set.
///
/// Only the stream families are served. The datagram and packet families parse, and every
/// operation on them fails with [Error::NotImplemented].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    Unixgram,
    Unixpacket,
    Udp,
    Udp4,
    Udp6,
}

impl Network {
    pub fn is_tcp(self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }

    /// Any of the unix domain families, stream or not.
    pub fn is_unix(self) -> bool {
        matches!(self, Network::Unix | Network::Unixgram | Network::Unixpacket)
    }

    pub fn is_udp(self) -> bool {
        matches!(self, Network::Udp | Network::Udp4 | Network::Udp6)
    }

    /// Whether connections over this family can be listened for and dialed.
    pub fn is_stream(self) -> bool {
        self.is_tcp() || self == Network::Unix
    }

    pub fn as_str(self) -> &'static str {
        use Network::*;
        match self {
            Tcp => "tcp",
            Tcp4 => "tcp4",
            Tcp6 => "tcp6",
            Unix => "unix",
            Unixgram => "unixgram",
            Unixpacket => "unixpacket",
            Udp => "udp",
            Udp4 => "udp4",
            Udp6 => "udp6",
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Network::*;
        match s {
            "tcp" => Ok(Tcp),
            "tcp4" => Ok(Tcp4),
            "tcp6" => Ok(Tcp6),
            "unix" => Ok(Unix),
            "unixgram" => Ok(Unixgram),
            "unixpacket" => Ok(Unixpacket),
            "udp" => Ok(Udp),
            "udp4" => Ok(Udp4),
            "udp6" => Ok(Udp6),
            other => Err(Error::UnknownNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_networks() {
        for name in [
            "tcp",
            "tcp4",
            "tcp6",
            "unix",
            "unixgram",
            "unixpacket",
            "udp",
            "udp4",
            "udp6",
        ] {
            let network: Network = name.parse().unwrap();
            assert_eq!(network.as_str(), name);
        }
        assert!("tcp6".parse::<Network>().unwrap().is_tcp());
        assert!("udp".parse::<Network>().unwrap().is_udp());
        assert!(Network::Unixpacket.is_unix());
        assert!(!Network::Unixpacket.is_stream());
        assert!(Network::Unix.is_stream());
    }

    #[test]
    fn test_parse_unknown_network() {
        let err = "ip4:icmp".parse::<Network>().unwrap_err();
        assert!(matches!(err, Error::UnknownNetwork(ref name) if name == "ip4:icmp"));
    }
}
