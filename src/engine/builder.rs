use std::{cmp, fmt, sync::Arc, thread, time::Duration};

use futures::executor::ThreadPool;
use tracing::{debug, error};

use crate::{
    poll::{Poller, DEFAULT_EVENT_CAPACITY, DEFAULT_POLL_TIMEOUT},
    Result,
};

use super::Engine;

/// Engine configuration object.
pub struct EngineBuilder {
    pool_size: usize,
    name_prefix: Option<String>,
    poll_timeout: Duration,
    event_capacity: usize,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("pool_size", &self.pool_size)
            .field("name_prefix", &self.name_prefix)
            .field("poll_timeout", &self.poll_timeout)
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

impl EngineBuilder {
    /// Create a default engine configuration.
    ///
    /// See the other methods on this type for details on the defaults.
    pub fn new() -> Self {
        Self {
            pool_size: cmp::max(1, num_cpus::get()),
            name_prefix: None,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Set the number of threads in the engine's task pool. By default, this is equal to the
    /// number of CPU cores.
    ///
    /// # Panics
    ///
    /// Panics if `pool_size == 0`.
    pub fn pool_size(&mut self, size: usize) -> &mut Self {
        assert!(size > 0);
        self.pool_size = size;
        self
    }

    /// Set the thread name prefix. Pool threads get names like `my-engine-1`, and the poller's
    /// driver thread is named `my-engine-poller`.
    ///
    /// By default, threads are assigned Rust's standard thread name.
    pub fn name_prefix<S: Into<String>>(&mut self, name_prefix: S) -> &mut Self {
        self.name_prefix = Some(name_prefix.into());
        self
    }

    /// Set the upper bound of a single wait in the poller's loop. Waits return earlier whenever
    /// events arrive or a timer is due. Defaults to 100ms.
    pub fn poll_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set how many readiness events a single wait can return. Defaults to 1024.
    pub fn event_capacity(&mut self, capacity: usize) -> &mut Self {
        self.event_capacity = cmp::max(1, capacity);
        self
    }

    /// Create an [Engine] with the given configuration, starting its thread pool and poller
    /// driver.
    pub fn create(&mut self) -> Result<Engine> {
        let poller = Arc::new(Poller::with_config(
            self.poll_timeout,
            self.event_capacity,
        )?);

        let mut pool = ThreadPool::builder();
        pool.pool_size(self.pool_size);
        if let Some(ref name_prefix) = self.name_prefix {
            pool.name_prefix(name_prefix.clone());
        }
        let pool = pool.create()?;

        let mut driver = thread::Builder::new();
        if let Some(ref name_prefix) = self.name_prefix {
            driver = driver.name(format!("{}poller", name_prefix));
        }
        let driver_poller = poller.clone();
        let driver = driver.spawn(move || {
            debug!("poller driver started");
            let result = driver_poller.run();
            match result {
                Ok(()) => debug!("poller driver stopped"),
                Err(ref e) => error!("poller wait failed, driver exiting: {}", e),
            }
            result
        })?;

        Ok(Engine::from_parts(poller, pool, driver))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Instant};

    use super::*;
    use crate::block_on;

    #[test]
    fn test_spawn_runs_on_pool() {
        let engine = EngineBuilder::new()
            .pool_size(2)
            .name_prefix("engine-test-")
            .create()
            .unwrap();

        let (tx, rx) = mpsc::sync_channel(1);
        engine.spawn(async move {
            tx.send(thread::current().name().map(String::from)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.unwrap().starts_with("engine-test-"));

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_sleep_is_driven_by_poller() {
        let engine = EngineBuilder::new()
            .pool_size(1)
            .poll_timeout(Duration::from_secs(5))
            .create()
            .unwrap();

        // A short timer must wake the driver even though its wait bound is much longer.
        let start = Instant::now();
        block_on(engine.sleep(Duration::from_millis(50)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(4));

        engine.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let engine = Engine::new().unwrap();
        assert!(engine.is_running());
        engine.shutdown().unwrap();
        assert!(!engine.is_running());
        engine.shutdown().unwrap();
    }
}
