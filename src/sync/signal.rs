use std::{
    future::Future,
    pin::Pin,
    sync::{Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

#[derive(Debug, Default)]
struct SignalInner {
    notified: bool,
    waker: Option<Waker>,
}

/// A reusable wake-up flag shared between the poller's callbacks and a single waiting task. A
/// call to [Signal::notify] is remembered until the next [Signal::wait] consumes it, which means
/// an edge that fires between a task observing `WouldBlock` and the task going back to sleep is
/// never lost.
///
/// Only the most recently registered waker is retained, so a [Signal] is meant to have exactly one
/// waiter at a time.
#[derive(Debug, Default)]
pub struct Signal {
    inner: Mutex<SignalInner>,
}

impl Signal {
    pub fn new() -> Signal {
        Signal::default()
    }

    fn lock_inner(&self) -> MutexGuard<'_, SignalInner> {
        self.inner
            .lock()
            .expect("failed to lock signal state: poisoned")
    }

    /// Mark the signal as notified and wake the waiting task, if any.
    pub fn notify(&self) {
        let waker = {
            let mut inner = self.lock_inner();
            inner.notified = true;
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake()
        }
    }

    /// Consume a pending notification, or register the task's waker for the next one.
    pub fn poll_wait(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut inner = self.lock_inner();
        if inner.notified {
            inner.notified = false;
            return Poll::Ready(());
        }
        inner.waker.replace(cx.waker().clone());
        Poll::Pending
    }

    /// Return a future that completes once the signal has been notified.
    pub fn wait(&self) -> Wait<'_> {
        Wait { signal: self }
    }
}

/// Future returned by [Signal::wait].
pub struct Wait<'a> {
    signal: &'a Signal,
}

impl<'a> Future for Wait<'a> {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.signal.poll_wait(cx)
    }
}
