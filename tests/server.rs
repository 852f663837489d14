use std::{
    io,
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use netpoll::{
    block_on,
    net::{create_listener, dial_tcp, Accept, Address, Connection, Listener, Network, Options, Socket},
    server::Server,
    Engine, Error,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn tcp_listener() -> Listener {
    create_listener(Network::Tcp4, "127.0.0.1:0").unwrap()
}

fn dial<L: Accept>(engine: &Engine, server: &Server<L>) -> Connection {
    let remote = server.local_addr().unwrap().as_tcp();
    let deadline = Instant::now() + TIMEOUT;
    let options = Options::new();
    block_on(dial_tcp(engine, Network::Tcp4, None, remote, &options, Some(deadline))).unwrap()
}

// Hands every accepted connection to the test.
fn forward_connections(options: Options) -> (Options, mpsc::Receiver<Connection>) {
    let (tx, rx) = mpsc::sync_channel(16);
    let options = options.on_connect(move |conn| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(conn);
        }
    });
    (options, rx)
}

#[test]
fn test_bytes_arrive_in_order() {
    init_tracing();
    let engine = Engine::new().unwrap();

    let (tx, rx) = mpsc::sync_channel(1);
    let options = Options::new().on_connect(move |conn| {
        let tx = tx.clone();
        async move {
            let mut received = Vec::new();
            let mut buf = vec![0u8; 1500];
            loop {
                match conn.recv(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(e) => panic!("recv failed: {}", e),
                }
            }
            let _ = tx.send(received);
        }
    });

    let server = Server::new(&engine, tcp_listener(), options, |_| {});
    server.run().unwrap();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let client = dial(&engine, &server);
    block_on(client.send_all(&payload)).unwrap();
    client.close().unwrap();

    let received = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "bytes arrived out of order");

    block_on(server.close(Instant::now() + TIMEOUT)).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_close_drains_idle_then_busy_connections() {
    init_tracing();
    let engine = Engine::new().unwrap();
    let (options, accepted) =
        forward_connections(Options::new().sweep_interval(Duration::from_millis(50)));

    let (quit_tx, quit_rx) = mpsc::sync_channel(1);
    let server = Server::new(&engine, tcp_listener(), options, move |err| {
        let _ = quit_tx.send(err);
    });
    server.run().unwrap();

    let _idle_client = dial(&engine, &server);
    let idle = accepted.recv_timeout(TIMEOUT).unwrap();
    let _busy_client = dial(&engine, &server);
    let busy = accepted.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(server.connection_count(), 2);

    let (closed_tx, closed_rx) = mpsc::sync_channel(1);
    idle.add_close_callback(move |_| {
        let _ = closed_tx.send(Instant::now());
    });

    let guard = busy.begin_work();
    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        drop(guard);
    });

    let start = Instant::now();
    block_on(server.close(start + TIMEOUT)).unwrap();
    release.join().unwrap();

    let idle_closed = closed_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(idle_closed.duration_since(start) < Duration::from_millis(250));
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(!idle.is_active());
    assert!(!busy.is_active());
    assert_eq!(server.connection_count(), 0);

    // Closing the listener is how the accept loop ends.
    let err = quit_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(err.is_closed());

    engine.shutdown().unwrap();
}

#[test]
fn test_close_deadline_exceeded() {
    init_tracing();
    let engine = Engine::new().unwrap();
    let (options, accepted) =
        forward_connections(Options::new().sweep_interval(Duration::from_millis(20)));
    let server = Server::new(&engine, tcp_listener(), options, |_| {});
    server.run().unwrap();

    let _client = dial(&engine, &server);
    let busy = accepted.recv_timeout(TIMEOUT).unwrap();
    let guard = busy.begin_work();

    let err = block_on(server.close(Instant::now() + Duration::from_millis(150))).unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded));
    assert!(busy.is_active());
    assert_eq!(server.connection_count(), 1);

    drop(guard);
    busy.close().unwrap();
    assert_eq!(server.connection_count(), 0);

    engine.shutdown().unwrap();
}

struct FlakyListener {
    inner: Listener,
    failures: AtomicUsize,
}

impl Accept for FlakyListener {
    fn accept(&self) -> netpoll::Result<Socket> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::from_raw_os_error(nix::libc::EMFILE).into());
        }
        self.inner.accept()
    }

    fn close(&self) -> netpoll::Result<()> {
        self.inner.close()
    }

    fn local_addr(&self) -> netpoll::Result<Address> {
        self.inner.local_addr()
    }
}

impl AsRawFd for FlakyListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[test]
fn test_temporary_accept_error_is_retried() {
    init_tracing();
    let engine = Engine::new().unwrap();
    let (options, accepted) =
        forward_connections(Options::new().accept_backoff(Duration::from_millis(20)));

    let quits = Arc::new(AtomicUsize::new(0));
    let counter = quits.clone();
    let listener = FlakyListener {
        inner: tcp_listener(),
        failures: AtomicUsize::new(3),
    };
    let server = Server::new(&engine, listener, options, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.run().unwrap();

    let client = dial(&engine, &server);
    let conn = accepted.recv_timeout(TIMEOUT).unwrap();
    assert!(conn.is_active());
    assert_eq!(quits.load(Ordering::SeqCst), 0);

    // The accepted side sees what the client sends.
    block_on(client.send_all(b"still serving")).unwrap();
    let mut buf = [0u8; 13];
    let mut read = 0;
    while read < buf.len() {
        read += block_on(conn.recv(&mut buf[read..])).unwrap();
    }
    assert_eq!(&buf, b"still serving");

    client.close().unwrap();
    block_on(server.close(Instant::now() + TIMEOUT)).unwrap();
    engine.shutdown().unwrap();
}

// Takes the first pending connection off the backlog but reports EPROTO for it, handing the
// socket out on the following accept. No new readable edge announces it.
struct ProtocolErrorListener {
    inner: Listener,
    failed: AtomicBool,
    held: Mutex<Option<Socket>>,
}

impl Accept for ProtocolErrorListener {
    fn accept(&self) -> netpoll::Result<Socket> {
        if let Some(socket) = self.held.lock().unwrap().take() {
            return Ok(socket);
        }
        let socket = self.inner.accept()?;
        if self.failed.swap(true, Ordering::SeqCst) {
            return Ok(socket);
        }
        *self.held.lock().unwrap() = Some(socket);
        Err(io::Error::from_raw_os_error(nix::libc::EPROTO).into())
    }

    fn close(&self) -> netpoll::Result<()> {
        self.inner.close()
    }

    fn local_addr(&self) -> netpoll::Result<Address> {
        self.inner.local_addr()
    }
}

impl AsRawFd for ProtocolErrorListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[test]
fn test_accept_error_does_not_strand_pending_connection() {
    init_tracing();
    let engine = Engine::new().unwrap();
    let (options, accepted) =
        forward_connections(Options::new().accept_backoff(Duration::from_millis(20)));

    let quits = Arc::new(AtomicUsize::new(0));
    let counter = quits.clone();
    let listener = ProtocolErrorListener {
        inner: tcp_listener(),
        failed: AtomicBool::new(false),
        held: Mutex::new(None),
    };
    let server = Server::new(&engine, listener, options, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    server.run().unwrap();

    let client = dial(&engine, &server);
    let conn = accepted.recv_timeout(TIMEOUT).unwrap();
    assert!(conn.is_active());
    assert_eq!(quits.load(Ordering::SeqCst), 0);

    block_on(client.send_all(b"ok")).unwrap();
    let mut buf = [0u8; 2];
    let mut read = 0;
    while read < buf.len() {
        read += block_on(conn.recv(&mut buf[read..])).unwrap();
    }
    assert_eq!(&buf, b"ok");

    client.close().unwrap();
    block_on(server.close(Instant::now() + TIMEOUT)).unwrap();
    engine.shutdown().unwrap();
}

#[test]
fn test_echo_round_trip() {
    init_tracing();
    let engine = Engine::new().unwrap();
    let options = Options::new().on_connect(|conn| async move {
        let mut buf = vec![0u8; 1024];
        loop {
            let n = match conn.recv(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let _work = conn.begin_work();
            if conn.send_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    });
    let server = Server::new(&engine, tcp_listener(), options, |_| {});
    server.run().unwrap();

    let client = dial(&engine, &server);
    assert_eq!(
        client.peer_addr().unwrap(),
        server.local_addr().unwrap()
    );
    block_on(async {
        client.send_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let mut read = 0;
        while read < buf.len() {
            read += client.recv(&mut buf[read..]).await.unwrap();
        }
        assert_eq!(&buf, b"hello");
    });

    client.close().unwrap();
    block_on(server.close(Instant::now() + TIMEOUT)).unwrap();
    engine.shutdown().unwrap();
}
