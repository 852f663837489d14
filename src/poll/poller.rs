use std::{
    collections::HashMap,
    io,
    os::fd::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    task::Waker,
    time::{Duration, Instant},
};

use nix::libc;
use slab::Slab;
use tracing::{debug, trace};

use crate::{Error, Result};

use super::{
    sys::{Epoll, EventFd},
    timer::{Sleep, TimerKey, Timers},
    token::{Token, WAKE_TOKEN},
    Interest, Operator, OperatorHandle, Readiness,
};

pub(crate) const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_EVENT_CAPACITY: usize = 1024;

struct Slot {
    fd: RawFd,
    generation: u32,
    interest: Interest,
    operator: Arc<dyn Operator>,
}

struct Registry {
    slots: Slab<Slot>,
    fds: HashMap<RawFd, usize>,
    generation: u32,
}

/// The [Poller] represents the meat of the event loop, and handles two key pieces of the puzzle.
/// First off it owns the registration table binding each descriptor to the [Operator] that wants
/// to hear about it, allowing operators to be registered, modified and detached from any thread.
/// Then it exposes the wait-and-dispatch loop itself, which turns epoll readiness events into
/// operator callbacks and fires any elapsed [Sleep] timers.
///
/// Every registration is edge-triggered. An operator is told once per readiness transition, so
/// whoever consumes the descriptor must keep going until the kernel reports `WouldBlock` before
/// it can rely on hearing from the poller again.
///
/// Generally the flow of a single [Poller::poll] call is this:
/// - Wait for events, bounded by the caller's timeout and the earliest pending timer.
/// - Resolve each event's token against the registration table, discarding stale generations.
/// - Release the table lock and invoke the readable, writable and hangup callbacks in that order.
/// - Wake every timer whose deadline has passed.
pub struct Poller {
    epoll: Epoll,
    waker: EventFd,
    registry: Mutex<Registry>,
    timers: Mutex<Timers>,
    events: Mutex<Vec<libc::epoll_event>>,
    poll_timeout: Duration,
    stopped: AtomicBool,
}

impl Poller {
    /// Create a new [Poller] with the default wait bound and event capacity.
    pub fn new() -> Result<Poller> {
        Poller::with_config(DEFAULT_POLL_TIMEOUT, DEFAULT_EVENT_CAPACITY)
    }

    pub(crate) fn with_config(poll_timeout: Duration, event_capacity: usize) -> Result<Poller> {
        let epoll = Epoll::new()?;
        let waker = EventFd::new()?;
        epoll.add(waker.as_raw_fd(), WAKE_TOKEN, libc::EPOLLIN as u32)?;

        Ok(Poller {
            epoll,
            waker,
            registry: Mutex::new(Registry {
                slots: Slab::with_capacity(1024),
                fds: HashMap::with_capacity(1024),
                generation: 0,
            }),
            timers: Mutex::new(Timers::default()),
            events: Mutex::new(Vec::with_capacity(event_capacity.max(1))),
            poll_timeout,
            stopped: AtomicBool::new(false),
        })
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .expect("failed to lock poller registry: poisoned")
    }

    fn lock_timers(&self) -> MutexGuard<'_, Timers> {
        self.timers
            .lock()
            .expect("failed to lock poller timers: poisoned")
    }

    /// Register the descriptor with the given interest, returning the [OperatorHandle] used to
    /// modify or detach it later. Fails if the descriptor already has a live registration, or if
    /// the kernel refuses it.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        operator: Arc<dyn Operator>,
    ) -> Result<OperatorHandle> {
        let mut guard = self.lock_registry();
        let registry = &mut *guard;
        if registry.fds.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }

        registry.generation = registry.generation.wrapping_add(1);
        let generation = registry.generation;

        let entry = registry.slots.vacant_entry();
        let token = Token::new(entry.key(), generation);
        self.epoll.add(fd, token.to_u64(), interest.as_epoll())?;

        entry.insert(Slot {
            fd,
            generation,
            interest,
            operator,
        });
        registry.fds.insert(fd, token.index());

        debug!(fd, generation, ?interest, "registered operator");
        Ok(OperatorHandle::new(fd, token))
    }

    /// Change the set of conditions watched for an existing registration. Fails with
    /// [Error::Detached] if the handle no longer refers to a live registration.
    pub fn modify(&self, handle: &OperatorHandle, interest: Interest) -> Result<()> {
        let mut registry = self.lock_registry();
        let token = handle.token();
        let slot = match registry.slots.get_mut(token.index()) {
            Some(slot) if slot.generation == token.generation() => slot,
            _ => return Err(Error::Detached),
        };

        self.epoll
            .modify(slot.fd, token.to_u64(), interest.as_epoll())?;
        slot.interest = interest;
        Ok(())
    }

    /// Remove a registration from the poller. Detaching is idempotent, a handle that was already
    /// detached is simply ignored since shutdown paths may race each other here.
    ///
    /// The descriptor must still be open when this is called, callers detach before they close.
    pub fn detach(&self, handle: &OperatorHandle) -> Result<()> {
        let mut guard = self.lock_registry();
        let registry = &mut *guard;
        let token = handle.token();
        match registry.slots.get(token.index()) {
            Some(slot) if slot.generation == token.generation() => {}
            _ => {
                trace!(fd = handle.fd(), "operator already detached");
                return Ok(());
            }
        }

        let slot = registry.slots.remove(token.index());
        registry.fds.remove(&slot.fd);

        match self.epoll.delete(slot.fd) {
            Ok(()) => {}
            Err(ref e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) => {
                debug!(fd = slot.fd, "descriptor was gone before detach: {}", e);
            }
            Err(e) => return Err(e.into()),
        }

        debug!(fd = slot.fd, generation = slot.generation, "detached operator");
        Ok(())
    }

    /// Whether or not the descriptor currently has a live registration.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.lock_registry().fds.contains_key(&fd)
    }

    /// The number of live registrations.
    pub fn len(&self) -> usize {
        self.lock_registry().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for readiness once and dispatch every event that arrived, returning the number of
    /// operators invoked. The wait is bounded by `timeout` (`None` meaning unbounded) and by the
    /// earliest pending timer.
    ///
    /// Errors here are fatal to the poller, callers should not keep polling after one.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<usize> {
        let next_deadline = self.lock_timers().next_deadline();
        let timeout = match next_deadline {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                Some(timeout.map_or(until, |timeout| timeout.min(until)))
            }
            None => timeout,
        };

        let mut ready = Vec::new();
        {
            let mut events = self
                .events
                .lock()
                .expect("failed to lock poller events: poisoned");

            match self.epoll.wait(&mut events, timeout) {
                Ok(_) => {}
                // A signal interrupted our wait, do nothing and just continue on.
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => events.clear(),
                Err(e) => return Err(e.into()),
            }

            let registry = self.lock_registry();
            for event in events.iter() {
                let data = event.u64;
                let flags = event.events;
                if data == WAKE_TOKEN {
                    self.waker.drain();
                    continue;
                }

                let token = Token::from_u64(data);
                match registry.slots.get(token.index()) {
                    Some(slot) if slot.generation == token.generation() => {
                        ready.push((slot.fd, slot.operator.clone(), Readiness::from_epoll(flags)));
                    }
                    _ => {
                        trace!(
                            index = token.index(),
                            generation = token.generation(),
                            "discarding event for stale registration"
                        );
                    }
                }
            }
        }

        let dispatched = ready.len();
        for (fd, operator, readiness) in ready {
            trace!(fd, ?readiness, "dispatching readiness");
            if readiness.readable {
                operator.on_readable();
            }
            if readiness.writable {
                operator.on_writable();
            }
            if readiness.hangup {
                operator.on_hangup();
            }
        }

        let expired = self.lock_timers().expire(Instant::now());
        for waker in expired {
            waker.wake();
        }

        Ok(dispatched)
    }

    /// Run the wait-and-dispatch loop until [Poller::stop] is called, or until waiting fails, in
    /// which case the error is handed back to whoever owns this poller.
    pub fn run(&self) -> Result<()> {
        while !self.stopped.load(Ordering::Acquire) {
            self.poll(Some(self.poll_timeout))?;
        }
        Ok(())
    }

    /// Ask a running [Poller::run] loop to return after its current pass.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Interrupt a blocked wait.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            debug!("failed to wake poller: {}", e);
        }
    }

    /// Return a [Sleep] future that completes after `duration` has elapsed.
    pub fn sleep(self: &Arc<Self>, duration: Duration) -> Sleep {
        self.sleep_until(Instant::now() + duration)
    }

    /// Return a [Sleep] future that completes once `deadline` has passed.
    pub fn sleep_until(self: &Arc<Self>, deadline: Instant) -> Sleep {
        Sleep::new(self.clone(), deadline)
    }

    pub(crate) fn add_timer(&self, deadline: Instant, waker: Waker) -> TimerKey {
        let (key, earliest) = self.lock_timers().insert(deadline, waker);
        if earliest {
            // The driver may be blocked on a later deadline, make it recompute its wait.
            self.wake();
        }
        key
    }

    pub(crate) fn update_timer(&self, key: TimerKey, waker: Waker) {
        self.lock_timers().update(key, waker);
    }

    pub(crate) fn cancel_timer(&self, key: &TimerKey) {
        self.lock_timers().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        os::unix::net::UnixStream,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::poll::FdOperator;

    fn counting_operator(reads: Arc<AtomicUsize>) -> Arc<dyn Operator> {
        Arc::new(FdOperator::new().on_read(move || {
            reads.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_register_twice_fails() {
        let poller = Poller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));

        let handle = poller
            .register(a.as_raw_fd(), Interest::Readable, counting_operator(reads.clone()))
            .unwrap();
        let err = poller
            .register(a.as_raw_fd(), Interest::Readable, counting_operator(reads))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(fd) if fd == a.as_raw_fd()));

        poller.detach(&handle).unwrap();
        assert!(!poller.is_registered(a.as_raw_fd()));
    }

    #[test]
    fn test_detach_is_idempotent() {
        let poller = Poller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));

        let handle = poller
            .register(a.as_raw_fd(), Interest::Readable, counting_operator(reads))
            .unwrap();
        assert!(poller.detach(&handle).is_ok());
        assert!(poller.detach(&handle).is_ok());
        assert!(poller.is_empty());
    }

    #[test]
    fn test_modify_after_detach_fails() {
        let poller = Poller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));

        let handle = poller
            .register(a.as_raw_fd(), Interest::Readable, counting_operator(reads))
            .unwrap();
        poller.modify(&handle, Interest::ReadWrite).unwrap();
        poller.detach(&handle).unwrap();
        assert!(matches!(
            poller.modify(&handle, Interest::Readable),
            Err(Error::Detached)
        ));
    }

    #[test]
    fn test_readable_dispatch() {
        let poller = Poller::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let reads = Arc::new(AtomicUsize::new(0));

        let _handle = poller
            .register(a.as_raw_fd(), Interest::Readable, counting_operator(reads.clone()))
            .unwrap();

        b.write_all(b"ping").unwrap();
        poller.poll(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        // Edge-triggered: no new data means no new event.
        poller.poll(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_handle_cannot_detach_new_registration() {
        let poller = Poller::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));

        let old = poller
            .register(a.as_raw_fd(), Interest::Readable, counting_operator(reads.clone()))
            .unwrap();
        poller.detach(&old).unwrap();

        let new = poller
            .register(a.as_raw_fd(), Interest::Readable, counting_operator(reads))
            .unwrap();
        assert_ne!(old, new);

        poller.detach(&old).unwrap();
        assert!(poller.is_registered(a.as_raw_fd()));
        poller.detach(&new).unwrap();
        assert!(!poller.is_registered(a.as_raw_fd()));
    }

    #[test]
    fn test_hangup_and_readable_both_dispatched() {
        let poller = Poller::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let hups = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (r, h) = (reads.clone(), hups.clone());
        let (o1, o2) = (order.clone(), order.clone());
        let operator = FdOperator::new()
            .on_read(move || {
                r.fetch_add(1, Ordering::SeqCst);
                o1.lock().unwrap().push("read");
            })
            .on_hup(move || {
                h.fetch_add(1, Ordering::SeqCst);
                o2.lock().unwrap().push("hup");
            });
        let _handle = poller
            .register(a.as_raw_fd(), Interest::Readable, Arc::new(operator))
            .unwrap();

        b.write_all(b"bye").unwrap();
        drop(b);
        poller.poll(Some(Duration::from_secs(1))).unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(hups.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec!["read", "hup"]);
    }
}
