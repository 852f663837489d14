use core::result;
use std::{io, os::fd::RawFd};

use nix::libc;
use thiserror::Error;

/// A helper type for wrapping a [result::Result] such that we can reduce noise in our signatures.
pub type Result<T> = result::Result<T, Error>;

/// An error representing a failure anywhere in the engine, from registering a descriptor with the
/// poller all the way up to draining a server during shutdown.
#[derive(Debug, Error)]
pub enum Error {
    #[error("encountered unexpected IO error: {0}")]
    IO(
        #[from]
        #[source]
        io::Error,
    ),
    #[error("unknown network: {0}")]
    UnknownNetwork(String),
    #[error("missing address")]
    MissingAddress,
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
    #[error("descriptor {0} is already registered with the poller")]
    AlreadyRegistered(RawFd),
    #[error("operator has already been detached from the poller")]
    Detached,
    #[error("acknowledged {acknowledged} bytes but only {requested} were requested")]
    AckOverflow {
        acknowledged: usize,
        requested: usize,
    },
    #[error("listener closed")]
    ListenerClosed,
    #[error("listener hung up")]
    ListenerHangup,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether or not this error is a transient condition that the accept loop should back off
    /// from and retry, rather than give up on.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::IO(err) => {
                if err.kind() == io::ErrorKind::Interrupted || err.kind() == io::ErrorKind::WouldBlock
                {
                    return true;
                }
                matches!(
                    err.raw_os_error(),
                    Some(libc::EMFILE)
                        | Some(libc::ENFILE)
                        | Some(libc::ENOBUFS)
                        | Some(libc::ENOMEM)
                        | Some(libc::ECONNABORTED)
                )
            }
            _ => false,
        }
    }

    /// Whether or not this error means the listening socket has been closed underneath us, either
    /// explicitly through [crate::net::Listener::close] or by the kernel.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::ListenerClosed => true,
            Error::IO(err) => matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::EINVAL)),
            _ => false,
        }
    }
}

impl Error {
    /// An equivalent error, for when one failure has to be reported in two places. IO errors keep
    /// their OS error code, or their kind and message when they have none.
    pub(crate) fn replicate(&self) -> Error {
        match self {
            Error::IO(err) => Error::IO(match err.raw_os_error() {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::new(err.kind(), err.to_string()),
            }),
            Error::UnknownNetwork(network) => Error::UnknownNetwork(network.clone()),
            Error::MissingAddress => Error::MissingAddress,
            Error::NotImplemented(what) => Error::NotImplemented(what),
            Error::AlreadyRegistered(fd) => Error::AlreadyRegistered(*fd),
            Error::Detached => Error::Detached,
            Error::AckOverflow {
                acknowledged,
                requested,
            } => Error::AckOverflow {
                acknowledged: *acknowledged,
                requested: *requested,
            },
            Error::ListenerClosed => Error::ListenerClosed,
            Error::ListenerHangup => Error::ListenerHangup,
            Error::DeadlineExceeded => Error::DeadlineExceeded,
            Error::ConnectionClosed => Error::ConnectionClosed,
        }
    }
}

impl From<nix::Error> for Error {
    fn from(value: nix::Error) -> Self {
        Self::IO(io::Error::from(value))
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::IO(err) => err,
            Error::UnknownNetwork(..) | Error::MissingAddress => {
                io::Error::new(io::ErrorKind::InvalidInput, value)
            }
            Error::NotImplemented(..) => io::Error::new(io::ErrorKind::Unsupported, value),
            Error::AlreadyRegistered(..) => io::Error::new(io::ErrorKind::AlreadyExists, value),
            Error::DeadlineExceeded => io::Error::new(io::ErrorKind::TimedOut, value),
            Error::ConnectionClosed | Error::ListenerClosed | Error::ListenerHangup => {
                io::Error::new(io::ErrorKind::NotConnected, value)
            }
            Error::Detached | Error::AckOverflow { .. } => io::Error::new(io::ErrorKind::Other, value),
        }
    }
}
