use std::{fmt, sync::Arc, time::Duration};

use futures::{future::BoxFuture, Future, FutureExt};

use super::Connection;

const DEFAULT_MIN_READ_SIZE: usize = 4 * 1024;
const DEFAULT_MAX_BUFFERED: usize = 4 * 1024 * 1024;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// The hook run, as its own task, for every connection a server accepts or a dial opens.
pub type OnConnect = Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connection and server options. Every field has a default, and the methods consume and
/// return the options so they chain:
///
/// ```
/// # use std::time::Duration;
/// # use netpoll::net::Options;
/// let options = Options::new()
///     .read_timeout(Duration::from_secs(30))
///     .sweep_interval(Duration::from_millis(100));
/// assert_eq!(options.get_read_timeout(), Some(Duration::from_secs(30)));
/// ```
#[derive(Clone)]
pub struct Options {
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) min_read_size: usize,
    pub(crate) max_buffered: usize,
    pub(crate) accept_backoff: Duration,
    pub(crate) timeout_backoff: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) on_connect: Option<OnConnect>,
}

impl Options {
    pub fn new() -> Options {
        Options {
            read_timeout: None,
            idle_timeout: None,
            min_read_size: DEFAULT_MIN_READ_SIZE,
            max_buffered: DEFAULT_MAX_BUFFERED,
            accept_backoff: DEFAULT_BACKOFF,
            timeout_backoff: DEFAULT_BACKOFF,
            sweep_interval: DEFAULT_BACKOFF,
            on_connect: None,
        }
    }

    /// Bound each wait for readable data. A wait that times out is not fatal, the reader backs
    /// off for [Options::timeout_backoff] and tries again. Unset by default.
    pub fn read_timeout(mut self, timeout: Duration) -> Options {
        self.read_timeout = Some(timeout);
        self
    }

    /// Close a connection once a read timeout fires and nothing was read or written for this
    /// long. Only consulted when a read timeout is set. Unset by default, in which case timeouts
    /// are retried indefinitely.
    pub fn idle_timeout(mut self, timeout: Duration) -> Options {
        self.idle_timeout = Some(timeout);
        self
    }

    /// The minimum free space the reader requests from the input buffer before each read,
    /// defaults to 4KiB.
    pub fn min_read_size(mut self, size: usize) -> Options {
        self.min_read_size = size.max(1);
        self
    }

    /// Once this many unread bytes are buffered the reader stops reading until the consumer
    /// drains some, defaults to 4MiB.
    pub fn max_buffered(mut self, size: usize) -> Options {
        self.max_buffered = size.max(1);
        self
    }

    /// How long the accept loop waits after a temporary accept error, defaults to 1s.
    pub fn accept_backoff(mut self, backoff: Duration) -> Options {
        self.accept_backoff = backoff;
        self
    }

    /// How long the reader waits after a read timeout before retrying, defaults to 1s.
    pub fn timeout_backoff(mut self, backoff: Duration) -> Options {
        self.timeout_backoff = backoff;
        self
    }

    /// The interval between sweeps while a server drains its connections, defaults to 1s.
    pub fn sweep_interval(mut self, interval: Duration) -> Options {
        self.sweep_interval = interval;
        self
    }

    /// Set the hook run for every new connection. The hook runs on the engine's pool, never on
    /// the accept loop.
    pub fn on_connect<F, Fut>(mut self, f: F) -> Options
    where
        F: Fn(Connection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |conn| f(conn).boxed()));
        self
    }

    pub fn get_read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn get_sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("read_timeout", &self.read_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("min_read_size", &self.min_read_size)
            .field("max_buffered", &self.max_buffered)
            .field("accept_backoff", &self.accept_backoff)
            .field("timeout_backoff", &self.timeout_backoff)
            .field("sweep_interval", &self.sweep_interval)
            .field("on_connect", &self.on_connect.is_some())
            .finish()
    }
}
