//! The [self] package handles all logic relating to creating and managing network IO objects on
//! top of an [crate::Engine].
//!
//! This module primarily exposes the following objects:
//! - [Network] and [Address], the typed transport family and endpoint of every socket.
//! - [Listener] which represents a non-blocking TCP or unix listening socket, and the [Accept]
//! trait the server's accept loop is written against.
//! - [Connection] which represents a bi-directional byte stream, buffered on the receive side by
//! an [InputBuffer].
//! - [dial], [dial_tcp] and [dial_unix] to open client connections.
//!
//! UDP is recognised as a network but every operation on it fails with
//! [crate::Error::NotImplemented].

mod addr;
mod connection;
mod dial;
mod listener;
mod network;
mod options;
mod socket;

pub use addr::{resolve_tcp_address, resolve_unix_address, Address};
pub use connection::futures::{Recv, Send};
pub use connection::{Connection, InputBuffer, WorkGuard};
pub use dial::{dial, dial_tcp, dial_unix};
pub use listener::{convert_listener, create_listener, Accept, ListenConfig, Listener};
pub use network::Network;
pub use options::{OnConnect, Options};
pub use socket::Socket;
