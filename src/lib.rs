//! # netpoll
//!
//! This is a non-blocking network I/O engine for linux, built around an edge-triggered `epoll`
//! poller. The implementation is inherently multi-threaded by design: a dedicated driver thread
//! waits on the poller and hands readiness off to tasks running on a small thread pool, one
//! reader task per connection and one accept loop per server. The package is split up into a
//! handful of modules each handling a specific subset of the functionality needed:
//!
//! - [poll] holds the [poll::Poller] and the operator registrations it dispatches to.
//! - [engine] ties a poller, its driver thread and a thread pool into an [Engine].
//! - [net] provides listeners, dialing and the buffered [net::Connection].
//! - [server] runs an accept loop over a listener and drains it gracefully on close.
//!
//! At a high level a simple TCP echo server works as you would expect:
//!
//! ```no_run
//! use std::time::{Duration, Instant};
//!
//! use netpoll::{
//!     block_on,
//!     net::{create_listener, Network, Options},
//!     server::Server,
//!     Engine,
//! };
//!
//! fn main() -> netpoll::Result<()> {
//!     let engine = Engine::new()?;
//!     let listener = create_listener(Network::Tcp, "[::]:9091")?;
//!
//!     // Each accepted connection runs this hook as its own task.
//!     let options = Options::new().on_connect(|conn| async move {
//!         let mut buf = vec![0u8; 1024];
//!         loop {
//!             let read = match conn.recv(&mut buf).await {
//!                 Ok(0) | Err(_) => break,
//!                 Ok(read) => read,
//!             };
//!             if conn.send_all(&buf[..read]).await.is_err() {
//!                 break;
//!             }
//!         }
//!     });
//!
//!     let server = Server::new(&engine, listener, options, |err| {
//!         println!("Server stopped: {}", err);
//!     });
//!     server.run()?;
//!
//!     block_on(engine.sleep(Duration::from_secs(60)));
//!     block_on(server.close(Instant::now() + Duration::from_secs(5)))
//! }
//! ```
//!
//! Similarly here is an example client interacting with the above server:
//!
//! ```no_run
//! use std::time::{Duration, Instant};
//!
//! use netpoll::{
//!     block_on,
//!     net::{dial_tcp, Network, Options},
//!     Engine,
//! };
//!
//! fn main() -> netpoll::Result<()> {
//!     let engine = Engine::new()?;
//!     let remote = "[::1]:9091".parse().ok();
//!     let deadline = Instant::now() + Duration::from_secs(5);
//!
//!     block_on(async {
//!         let client =
//!             dial_tcp(&engine, Network::Tcp6, None, remote, &Options::new(), Some(deadline)).await?;
//!         client.send_all(b"Hello from client!").await?;
//!
//!         let mut buf = vec![0u8; 1024];
//!         let read = client.recv(&mut buf).await?;
//!         println!("Server response: {}", String::from_utf8_lossy(&buf[..read]));
//!         client.close()
//!     })
//! }
//! ```

pub mod engine;
pub mod error;
pub mod net;
pub mod poll;
pub mod server;
pub mod sync;

pub use engine::{block_on, Engine, EngineBuilder};
pub use error::{Error, Result};
