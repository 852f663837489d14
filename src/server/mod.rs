//! The [self] module turns a listener into a running service. A [Server] accepts connections on an
//! [Accept] implementation, wraps every accepted socket into a [Connection] with its own reader,
//! and keeps a registry of the live connections so it can drain them when asked to close.

use std::{
    collections::HashMap,
    fmt, io,
    os::fd::{AsRawFd, RawFd},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Instant,
};

use futures::future::{self, Either};
use tracing::{debug, error, trace, warn};

use crate::{
    engine::Engine,
    net::{Accept, Address, Connection, Listener, Options, Socket},
    poll::{Interest, Operator, OperatorHandle},
    sync::Signal,
    Error, Result,
};

type OnQuit = Box<dyn FnOnce(Error) + Send>;

struct Shared<L> {
    engine: Engine,
    listener: L,
    options: Options,
    on_quit: Mutex<Option<OnQuit>>,
    handle: Mutex<Option<OperatorHandle>>,
    acceptable: Signal,
    connections: Mutex<HashMap<RawFd, Connection>>,
}

impl<L: Accept> Shared<L> {
    fn lock_connections(&self) -> MutexGuard<'_, HashMap<RawFd, Connection>> {
        self.connections
            .lock()
            .expect("failed to lock server connections: poisoned")
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<OperatorHandle>> {
        self.handle
            .lock()
            .expect("failed to lock server operator: poisoned")
    }

    /// Deliver `err` to the quit callback, the first call wins.
    fn quit(&self, err: Error) {
        let on_quit = self
            .on_quit
            .lock()
            .expect("failed to lock server quit callback: poisoned")
            .take();
        match on_quit {
            Some(on_quit) => {
                debug!(fd = self.listener.as_raw_fd(), "server quit: {}", err);
                on_quit(err)
            }
            None => trace!("server already quit, dropping: {}", err),
        }
    }

    fn detach(&self) {
        let handle = self.lock_handle().take();
        if let Some(handle) = handle {
            if let Err(e) = self.engine.poller().detach(&handle) {
                warn!(fd = handle.fd(), "failed to detach listener: {}", e);
            }
        }
    }

    fn serve(self: &Arc<Self>, socket: Socket) {
        let conn = match Connection::new(&self.engine, socket, self.options.clone()) {
            Ok(conn) => conn,
            Err(e) => {
                debug!("discarding connection that failed to initialise: {}", e);
                return;
            }
        };

        // Inserted before the callback is attached, so a connection that closes right away still
        // takes itself back out.
        let fd = conn.as_raw_fd();
        self.lock_connections().insert(fd, conn.clone());
        let registry = Arc::downgrade(self);
        conn.add_close_callback(move |conn| {
            if let Some(shared) = registry.upgrade() {
                shared.remove(fd, conn);
            }
        });

        trace!(fd, id = conn.id(), "accepted connection");
        conn.start();
    }

    // Descriptors get reused, only remove the entry if it is still this connection.
    fn remove(&self, fd: RawFd, conn: &Connection) {
        let removed = {
            let mut connections = self.lock_connections();
            match connections.get(&fd) {
                Some(existing) if existing.ptr_eq(conn) => connections.remove(&fd),
                _ => None,
            }
        };
        drop(removed);
    }
}

struct ListenerOperator<L> {
    shared: Weak<Shared<L>>,
}

impl<L: Accept> Operator for ListenerOperator<L> {
    fn on_readable(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.acceptable.notify();
        }
    }

    fn on_hangup(&self) {
        if let Some(shared) = self.shared.upgrade() {
            warn!(fd = shared.listener.as_raw_fd(), "listener hung up");
            shared.quit(Error::ListenerHangup);
        }
    }
}

async fn accept_loop<L: Accept>(shared: Arc<Shared<L>>) {
    let fd = shared.listener.as_raw_fd();
    debug!(fd, "accept loop started");

    loop {
        match shared.listener.accept() {
            Ok(socket) => shared.serve(socket),
            Err(Error::IO(ref e)) if e.kind() == io::ErrorKind::WouldBlock => {
                shared.acceptable.wait().await
            }
            Err(e) if e.is_closed() => {
                shared.detach();
                shared.quit(e);
                break;
            }
            Err(e) if e.is_temporary() => {
                debug!(fd, "temporary accept error, backing off: {}", e);
                shared.engine.sleep(shared.options.accept_backoff).await;
            }
            // The edge that announced any still pending connections is spent, so waiting for
            // the next one could strand them. Retry directly after a pause instead.
            Err(e) => {
                warn!(fd, "accept conn failed: {}", e);
                shared.engine.sleep(shared.options.accept_backoff).await;
            }
        }
    }

    debug!(fd, "accept loop stopped");
}

/// A [Server] accepts connections from a listener and serves each one on the engine it was created
/// with. Every accepted connection gets the server's [Options], including its on-connect hook.
///
/// The quit callback is invoked exactly once, with the error that ended the accept loop. After
/// [Server::close] that is the listener closed error, a listener hangup reports
/// [Error::ListenerHangup].
///
/// # Examples
///
/// ```no_run
/// # use std::time::{Duration, Instant};
/// # use netpoll::{block_on, net::{create_listener, Network, Options}, server::Server, Engine};
/// # fn main() -> netpoll::Result<()> {
/// let engine = Engine::new()?;
/// let listener = create_listener(Network::Tcp, "127.0.0.1:9091")?;
/// let options = Options::new().on_connect(|conn| async move {
///     let mut buf = vec![0u8; 1024];
///     while let Ok(n) = conn.recv(&mut buf).await {
///         if n == 0 || conn.send_all(&buf[..n]).await.is_err() {
///             break;
///         }
///     }
/// });
///
/// let server = Server::new(&engine, listener, options, |err| println!("server quit: {}", err));
/// server.run()?;
///
/// // Later on, give open connections five seconds to finish up.
/// block_on(server.close(Instant::now() + Duration::from_secs(5)))?;
/// # Ok(())
/// # }
/// ```
pub struct Server<L: Accept = Listener> {
    shared: Arc<Shared<L>>,
}

impl<L: Accept> Server<L> {
    pub fn new<F>(engine: &Engine, listener: L, options: Options, on_quit: F) -> Server<L>
    where
        F: FnOnce(Error) + Send + 'static,
    {
        Server {
            shared: Arc::new(Shared {
                engine: engine.clone(),
                listener,
                options,
                on_quit: Mutex::new(Some(Box::new(on_quit))),
                handle: Mutex::new(None),
                acceptable: Signal::new(),
                connections: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register the listener with the poller and start the accept loop. A failed registration is
    /// delivered to the quit callback as well as returned.
    pub fn run(&self) -> Result<()> {
        let shared = &self.shared;
        let fd = shared.listener.as_raw_fd();
        let mut handle = shared.lock_handle();
        if handle.is_some() {
            return Err(Error::AlreadyRegistered(fd));
        }

        let operator = Arc::new(ListenerOperator {
            shared: Arc::downgrade(shared),
        });
        match shared
            .engine
            .poller()
            .register(fd, Interest::Readable, operator)
        {
            Ok(registered) => *handle = Some(registered),
            Err(e) => {
                drop(handle);
                error!(fd, "failed to register listener: {}", e);
                shared.quit(e.replicate());
                return Err(e);
            }
        }
        drop(handle);

        // Connections may have queued up before registration, the first pass must not wait.
        shared.acceptable.notify();
        shared.engine.spawn(accept_loop(shared.clone()));
        debug!(fd, "server running");
        Ok(())
    }

    /// Stop accepting and drain the live connections. The listener is detached and closed right
    /// away, then every sweep interval the idle connections are closed, while busy ones are left
    /// for a later sweep. Resolves once no connections remain, or with [Error::DeadlineExceeded]
    /// if `deadline` passes first, in which case connections may still be open.
    pub async fn close(&self, deadline: Instant) -> Result<()> {
        let shared = &self.shared;
        shared.detach();
        if let Err(e) = shared.listener.close() {
            warn!(fd = shared.listener.as_raw_fd(), "failed to close listener: {}", e);
        }
        shared.acceptable.notify();

        loop {
            let connections: Vec<Connection> = shared.lock_connections().values().cloned().collect();
            for conn in connections.iter().filter(|conn| conn.is_idle()) {
                if let Err(e) = conn.close() {
                    debug!(fd = conn.as_raw_fd(), "error while closing connection: {}", e);
                }
            }

            let remaining = shared.lock_connections().len();
            if remaining == 0 {
                debug!("server drained");
                return Ok(());
            }
            trace!(remaining, "waiting for busy connections");

            let interval = shared.engine.sleep(shared.options.sweep_interval);
            let timeout = shared.engine.sleep_until(deadline);
            if let Either::Right(..) = future::select(interval, timeout).await {
                debug!(remaining, "server drain deadline exceeded");
                return Err(Error::DeadlineExceeded);
            }
        }
    }

    /// The number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.lock_connections().len()
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.shared.listener.local_addr()
    }
}

/// Dropping a server closes its listener, which ends the accept loop and reports the closed
/// listener to the quit callback if nothing else has. Accepted connections stay open.
impl<L: Accept> Drop for Server<L> {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.detach();
        if let Err(e) = shared.listener.close() {
            warn!(fd = shared.listener.as_raw_fd(), "failed to close dropped listener: {}", e);
        }
        shared.acceptable.notify();
    }
}

impl<L: Accept> fmt::Debug for Server<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("fd", &self.shared.listener.as_raw_fd())
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        block_on,
        net::{create_listener, Network},
    };

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_quit_runs_once() {
        let engine = Engine::new().unwrap();
        let listener = create_listener(Network::Tcp, "127.0.0.1:0").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = Server::new(&engine, listener, Options::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        server.shared.quit(Error::ListenerHangup);
        server.shared.quit(Error::ListenerClosed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_listener_hangup_quits_once() {
        let engine = Engine::new().unwrap();
        let listener = create_listener(Network::Tcp4, "127.0.0.1:0").unwrap();
        let (tx, rx) = mpsc::sync_channel(4);
        let server = Server::new(&engine, listener, Options::new(), move |err| {
            let _ = tx.send(err);
        });
        server.run().unwrap();

        let operator = ListenerOperator {
            shared: Arc::downgrade(&server.shared),
        };
        operator.on_hangup();
        operator.on_hangup();
        let err = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(matches!(err, Error::ListenerHangup));

        // A hangup reports but leaves the listener to its owner.
        let err = server.shared.listener.accept().unwrap_err();
        assert!(err.is_temporary());
        assert!(!err.is_closed());

        block_on(server.close(Instant::now() + TIMEOUT)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_drop_ends_accept_loop() {
        let engine = Engine::new().unwrap();
        let listener = create_listener(Network::Tcp4, "127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        let (tx, rx) = mpsc::sync_channel(1);
        let server = Server::new(&engine, listener, Options::new(), move |err| {
            let _ = tx.send(err);
        });
        server.run().unwrap();
        let shared = Arc::downgrade(&server.shared);

        drop(server);
        let err = rx.recv_timeout(TIMEOUT).unwrap();
        assert!(err.is_closed());
        assert!(!engine.poller().is_registered(fd));

        let start = Instant::now();
        while shared.upgrade().is_some() {
            assert!(start.elapsed() < TIMEOUT, "accept loop kept the server alive");
            std::thread::sleep(Duration::from_millis(10));
        }

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_run_twice_fails_without_quitting() {
        let engine = Engine::new().unwrap();
        let listener = create_listener(Network::Tcp, "127.0.0.1:0").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let server = Server::new(&engine, listener, Options::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        server.run().unwrap();
        assert!(matches!(server.run(), Err(Error::AlreadyRegistered(..))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_run_reports_registration_failure() {
        let engine = Engine::new().unwrap();
        let listener = create_listener(Network::Tcp, "127.0.0.1:0").unwrap();
        // Take the listener's registration slot first.
        let _taken = engine
            .poller()
            .register(
                listener.as_raw_fd(),
                Interest::Readable,
                Arc::new(crate::poll::FdOperator::new()),
            )
            .unwrap();

        let quit = Arc::new(Mutex::new(None));
        let slot = quit.clone();
        let server = Server::new(&engine, listener, Options::new(), move |err| {
            *slot.lock().unwrap() = Some(err);
        });

        assert!(matches!(server.run(), Err(Error::AlreadyRegistered(..))));
        assert!(matches!(
            *quit.lock().unwrap(),
            Some(Error::AlreadyRegistered(..))
        ));

        engine.shutdown().unwrap();
    }
}
