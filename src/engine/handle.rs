use std::{
    fmt, io,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use futures::{executor::ThreadPool, Future};

use crate::{
    poll::{Poller, Sleep},
    Error, Result,
};

use super::EngineBuilder;

struct Shared {
    poller: Arc<Poller>,
    pool: ThreadPool,
    driver: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // The driver may well be the thread dropping us, so never join here.
        self.poller.stop();
    }
}

/// An [Engine] ties together one [Poller], the dedicated driver thread running its
/// wait-and-dispatch loop, and a thread pool on which every task the engine starts runs: accept
/// loops, per-connection readers and on-connect hooks.
///
/// The handle is cheap to clone and every [crate::net::Connection] and [crate::server::Server]
/// keeps one, so the engine lives for as long as anything built on it does. Dropping the last
/// handle stops the driver, while [Engine::shutdown] stops it and reports how it exited.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Creates a new engine with the default configuration.
    ///
    /// See documentation for the methods in [EngineBuilder] for details on the default
    /// configuration.
    pub fn new() -> Result<Engine> {
        EngineBuilder::new().create()
    }

    /// Create a default engine configuration, which can then be customized.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub(super) fn from_parts(
        poller: Arc<Poller>,
        pool: ThreadPool,
        driver: JoinHandle<Result<()>>,
    ) -> Engine {
        Engine {
            shared: Arc::new(Shared {
                poller,
                pool,
                driver: Mutex::new(Some(driver)),
            }),
        }
    }

    /// The poller this engine drives.
    pub fn poller(&self) -> &Arc<Poller> {
        &self.shared.poller
    }

    /// Spawn a task on the engine's thread pool, the future will run on one of the available
    /// threads and execute concurrently with any other active futures.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.pool.spawn_ok(future)
    }

    /// Return a future that completes after `duration` has elapsed.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        self.shared.poller.sleep(duration)
    }

    /// Return a future that completes once `deadline` has passed.
    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        self.shared.poller.sleep_until(deadline)
    }

    /// Stop the driver thread and wait for it to exit. If the poller's wait failed at some point
    /// the driver will already have exited, and that error is returned here. Calling this more
    /// than once is fine, later calls return `Ok(())`.
    pub fn shutdown(&self) -> Result<()> {
        self.shared.poller.stop();
        let driver = self
            .shared
            .driver
            .lock()
            .expect("failed to lock engine driver: poisoned")
            .take();

        match driver {
            Some(driver) => driver.join().unwrap_or_else(|_| {
                Err(Error::from(io::Error::new(
                    io::ErrorKind::Other,
                    "poller driver thread panicked",
                )))
            }),
            None => Ok(()),
        }
    }

    /// Whether or not the driver is still running.
    pub fn is_running(&self) -> bool {
        !self.shared.poller.is_stopped()
            && self
                .shared
                .driver
                .lock()
                .expect("failed to lock engine driver: poisoned")
                .as_ref()
                .map_or(false, |driver| !driver.is_finished())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("registrations", &self.shared.poller.len())
            .finish()
    }
}
