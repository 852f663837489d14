use std::{
    fmt, io, mem,
    os::fd::{AsRawFd, RawFd},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use ::futures::{ready, AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use crate::{
    engine::Engine,
    poll::{Interest, Operator, OperatorHandle},
    sync::Signal,
    Error, Result,
};

use super::{Address, Options, Socket};

mod buffer;
pub(crate) mod futures;
mod reader;

pub use buffer::InputBuffer;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

type CloseCallback = Box<dyn FnOnce(&Connection) + Send>;

#[derive(Default)]
struct CloseState {
    closed: bool,
    callbacks: Vec<CloseCallback>,
}

pub(crate) struct Inner {
    id: u64,
    engine: Engine,
    socket: Socket,
    options: Options,
    active: AtomicBool,
    input: Mutex<InputBuffer>,
    // Edge notifications from the poller, consumed by the reader task and by senders.
    readable: Signal,
    writable: Signal,
    // Reader to consumer, new bytes were acknowledged or the connection closed.
    data: Signal,
    // Consumer to reader, buffered bytes were consumed.
    drained: Signal,
    handle: Mutex<Option<OperatorHandle>>,
    close: Mutex<CloseState>,
    work: AtomicUsize,
    read_timeout: Mutex<Option<Duration>>,
    last_activity: Mutex<Instant>,
}

impl Inner {
    fn lock_input(&self) -> MutexGuard<'_, InputBuffer> {
        self.input
            .lock()
            .expect("failed to lock connection input: poisoned")
    }

    fn lock_close(&self) -> MutexGuard<'_, CloseState> {
        self.close
            .lock()
            .expect("failed to lock connection close state: poisoned")
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .expect("failed to lock connection activity: poisoned") = Instant::now();
    }

    fn read_timeout(&self) -> Option<Duration> {
        *self
            .read_timeout
            .lock()
            .expect("failed to lock connection read timeout: poisoned")
    }

    fn detach(&self) -> Result<()> {
        let handle = self
            .handle
            .lock()
            .expect("failed to lock connection operator: poisoned")
            .take();
        match handle {
            Some(handle) => self.engine.poller().detach(&handle),
            None => Ok(()),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The socket closes right after this, so the registration has to go first.
        let handle = self
            .handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = self.engine.poller().detach(&handle) {
                warn!(fd = handle.fd(), "failed to detach dropped connection: {}", e);
            }
        }
    }
}

// Holds the connection weakly, so a registration never keeps a connection alive.
struct ConnectionOperator {
    inner: Weak<Inner>,
}

impl Operator for ConnectionOperator {
    fn on_readable(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.readable.notify();
        }
    }

    fn on_writable(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.writable.notify();
        }
    }

    // Whatever caused the hangup surfaces on the next read or write.
    fn on_hangup(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.readable.notify();
            inner.writable.notify();
        }
    }
}

/// A [Connection] is a bidirectional byte stream over a TCP or unix socket, produced either by a
/// [crate::server::Server] accepting it or by [super::dial].
///
/// Reads never touch the socket directly. A reader task owned by the connection drains the socket
/// into an [InputBuffer] every time the poller reports it readable, and [Connection::recv] hands
/// out bytes from that buffer in the order they arrived. Writes go straight to the socket.
///
/// The handle is cheap to clone, all clones refer to the same connection. A connection stays open
/// until [Connection::close] is called, the peer closes its end, or a read fails. Dropping handles
/// does not close it.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<Inner>,
}

impl Connection {
    /// Wrap a connected socket and register it with the engine's poller. The reader is not
    /// running yet, [Connection::start] kicks it off.
    pub(crate) fn new(engine: &Engine, socket: Socket, options: Options) -> Result<Connection> {
        socket.set_nonblocking(true)?;

        let inner = Arc::new(Inner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            engine: engine.clone(),
            socket,
            active: AtomicBool::new(true),
            input: Mutex::new(InputBuffer::new(options.max_buffered)),
            readable: Signal::new(),
            writable: Signal::new(),
            data: Signal::new(),
            drained: Signal::new(),
            handle: Mutex::new(None),
            close: Mutex::new(CloseState::default()),
            work: AtomicUsize::new(0),
            read_timeout: Mutex::new(options.read_timeout),
            last_activity: Mutex::new(Instant::now()),
            options,
        });

        let operator = Arc::new(ConnectionOperator {
            inner: Arc::downgrade(&inner),
        });
        let handle =
            engine
                .poller()
                .register(inner.socket.as_raw_fd(), Interest::ReadWrite, operator)?;
        *inner
            .handle
            .lock()
            .expect("failed to lock connection operator: poisoned") = Some(handle);

        // Anything that arrived before registration produced no edge.
        inner.readable.notify();
        inner.writable.notify();

        trace!(fd = inner.socket.as_raw_fd(), id = inner.id, "connection registered");
        Ok(Connection { inner })
    }

    /// Start the reader task and run the on-connect hook, both on the engine's pool.
    pub(crate) fn start(&self) {
        self.inner.engine.spawn(reader::read_loop(self.clone()));
        if let Some(ref on_connect) = self.inner.options.on_connect {
            self.inner.engine.spawn(on_connect(self.clone()));
        }
    }

    /// A process wide unique identifier for this connection, unlike its descriptor it is never
    /// reused.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Receive buffered data into `buf`, waiting until at least one byte is available. Resolves
    /// to `Ok(0)` once the connection is closed and everything buffered has been consumed.
    ///
    /// Only one task should be receiving at a time.
    pub fn recv<'a>(&'a self, buf: &'a mut [u8]) -> futures::Recv<'a> {
        futures::Recv::new(self, buf)
    }

    /// Send the data in `buf`, resolving to the number of bytes written.
    pub fn send<'a>(&'a self, buf: &'a [u8]) -> futures::Send<'a> {
        futures::Send::new(self, buf)
    }

    /// Send all of `buf`.
    pub async fn send_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.send(buf).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// The number of received bytes waiting to be consumed.
    pub fn buffered(&self) -> usize {
        self.inner.lock_input().len()
    }

    pub(crate) fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        loop {
            {
                let mut input = self.inner.lock_input();
                if !input.is_empty() {
                    let n = input.read_into(buf);
                    drop(input);
                    self.inner.drained.notify();
                    return Poll::Ready(Ok(n));
                }
                if !self.is_active() {
                    return Poll::Ready(Ok(0));
                }
            }
            ready!(self.inner.data.poll_wait(cx));
        }
    }

    pub(crate) fn poll_send(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize>> {
        loop {
            if !self.is_active() {
                return Poll::Ready(Err(Error::ConnectionClosed));
            }
            match self.inner.socket.write(buf) {
                Ok(n) => {
                    self.inner.touch();
                    return Poll::Ready(Ok(n));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ready!(self.inner.writable.poll_wait(cx))
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }

    /// Enable TCP keepalive with the given idle time and probe interval, in seconds. This is a
    /// no-op on unix sockets, as is passing zero.
    pub fn set_keepalive(&self, seconds: u32) -> Result<()> {
        self.inner.socket.set_keepalive(seconds)
    }

    /// Change the read timeout, see [Options::read_timeout]. Takes effect on the reader's next
    /// wait.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        *self
            .inner
            .read_timeout
            .lock()
            .expect("failed to lock connection read timeout: poisoned") = timeout;
    }

    /// Register a callback to run when the connection closes. Callbacks run exactly once, in the
    /// order they were added, after the reader has stopped touching the socket. A callback added to
    /// an already closed connection runs immediately.
    pub fn add_close_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        let mut close = self.inner.lock_close();
        if close.closed {
            drop(close);
            callback(self);
            return;
        }
        close.callbacks.push(Box::new(callback));
    }

    /// Close the connection. The first call detaches it from the poller, shuts the socket down and
    /// runs the close callbacks, later calls do nothing. Data already buffered can still be
    /// received afterwards.
    pub fn close(&self) -> Result<()> {
        if self
            .inner
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let detached = self.inner.detach();
        let shutdown = self.inner.socket.shutdown();

        self.inner.readable.notify();
        self.inner.writable.notify();
        self.inner.data.notify();
        self.inner.drained.notify();

        // Reads happen under the input lock and check liveness first, so once we have held it no
        // read is in flight or will start.
        drop(self.inner.lock_input());

        let callbacks = {
            let mut close = self.inner.lock_close();
            close.closed = true;
            mem::take(&mut close.callbacks)
        };
        for callback in callbacks {
            callback(self);
        }

        debug!(fd = self.as_raw_fd(), id = self.inner.id, "connection closed");
        detached?;
        shutdown?;
        Ok(())
    }

    /// Whether the connection may still be used. Turns false exactly once, on close.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Whether no [WorkGuard] is outstanding. Idle connections are closed first when a server
    /// drains.
    pub fn is_idle(&self) -> bool {
        self.inner.work.load(Ordering::Acquire) == 0
    }

    /// Mark the start of application level work on this connection, the connection is not idle
    /// until the returned guard drops.
    pub fn begin_work(&self) -> WorkGuard {
        self.inner.work.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            inner: self.inner.clone(),
        }
    }

    /// When data was last received or sent.
    pub fn last_activity(&self) -> Instant {
        *self
            .inner
            .last_activity
            .lock()
            .expect("failed to lock connection activity: poisoned")
    }

    pub fn local_addr(&self) -> Result<Address> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<Address> {
        Ok(self.inner.socket.peer_addr()?)
    }

    pub(crate) fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.socket.as_raw_fd()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("fd", &self.as_raw_fd())
            .field("active", &self.is_active())
            .field("buffered", &self.buffered())
            .finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_recv(cx, buf).map_err(io::Error::from)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.poll_send(cx, buf).map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.close().map_err(io::Error::from))
    }
}

/// Returned by [Connection::begin_work], keeps the connection from being idle while alive.
pub struct WorkGuard {
    inner: Arc<Inner>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.inner.work.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGuard").field("id", &self.inner.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        os::unix::net::UnixStream,
        sync::{atomic::AtomicUsize, Mutex},
    };

    use ::futures::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::block_on;

    fn pair(engine: &Engine, options: Options) -> (Connection, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        let conn = Connection::new(engine, Socket::from(a), options).unwrap();
        conn.start();
        (conn, b)
    }

    #[test]
    fn test_recv_in_order() {
        let engine = Engine::new().unwrap();
        let (conn, mut peer) = pair(&engine, Options::new().min_read_size(3));

        use std::io::Write;
        peer.write_all(b"hello ").unwrap();
        peer.write_all(b"world").unwrap();
        drop(peer);

        let mut received = Vec::new();
        block_on(async {
            let mut conn = conn.clone();
            conn.read_to_end(&mut received).await.unwrap();
        });
        assert_eq!(received, b"hello world");
        assert!(!conn.is_active());

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_send() {
        let engine = Engine::new().unwrap();
        let (conn, mut peer) = pair(&engine, Options::new());

        block_on(async {
            let mut conn = conn.clone();
            conn.write_all(b"ping").await.unwrap();
        });
        let mut buf = [0u8; 4];
        use std::io::Read;
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        conn.close().unwrap();
        let err = block_on(conn.send(b"late")).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_close_callbacks_run_once_in_order() {
        let engine = Engine::new().unwrap();
        let (conn, _peer) = pair(&engine, Options::new());
        let fd = conn.as_raw_fd();
        assert!(engine.poller().is_registered(fd));

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            conn.add_close_callback(move |_| order.lock().unwrap().push(i));
        }

        assert!(conn.is_active());
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_active());
        assert!(!engine.poller().is_registered(fd));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

        let late = Arc::new(AtomicUsize::new(0));
        let counter = late.clone();
        conn.add_close_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_work_guard_tracks_idle() {
        let engine = Engine::new().unwrap();
        let (conn, _peer) = pair(&engine, Options::new());

        assert!(conn.is_idle());
        let first = conn.begin_work();
        let second = conn.begin_work();
        assert!(!conn.is_idle());
        drop(first);
        assert!(!conn.is_idle());
        drop(second);
        assert!(conn.is_idle());

        conn.close().unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_idle_timeout_closes_connection() {
        let engine = Engine::new().unwrap();
        let (conn, _peer) = pair(
            &engine,
            Options::new()
                .read_timeout(Duration::from_millis(20))
                .idle_timeout(Duration::from_millis(10))
                .timeout_backoff(Duration::from_millis(5)),
        );

        let closed = Arc::new(Signal::new());
        let notify = closed.clone();
        conn.add_close_callback(move |_| notify.notify());
        block_on(closed.wait());
        assert!(!conn.is_active());

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_read_timeout_is_retried() {
        let engine = Engine::new().unwrap();
        let (conn, mut peer) = pair(
            &engine,
            Options::new()
                .read_timeout(Duration::from_millis(20))
                .timeout_backoff(Duration::from_millis(5)),
        );

        // Long enough for several timeouts to fire while the peer stays silent.
        std::thread::sleep(Duration::from_millis(150));
        assert!(conn.is_active());

        use std::io::Write;
        peer.write_all(b"late data").unwrap();
        let mut received = [0u8; 9];
        block_on(async {
            let mut conn = conn.clone();
            conn.read_exact(&mut received).await.unwrap();
        });
        assert_eq!(&received, b"late data");
        assert!(conn.is_active());

        conn.close().unwrap();
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_backpressure_resumes_after_consume() {
        let engine = Engine::new().unwrap();
        let (conn, mut peer) = pair(&engine, Options::new().min_read_size(4).max_buffered(8));

        use std::io::Write;
        let payload: Vec<u8> = (0..64u8).collect();
        peer.write_all(&payload).unwrap();

        let mut received = vec![0u8; payload.len()];
        block_on(async {
            let mut conn = conn.clone();
            conn.read_exact(&mut received).await.unwrap();
        });
        assert_eq!(received, payload);

        conn.close().unwrap();
        engine.shutdown().unwrap();
    }
}
