use std::{
    sync::Arc,
    task::{Context, Poll},
    thread::{self, Thread},
};

use futures::{
    pin_mut,
    task::{waker, ArcWake},
    Future,
};

struct ThreadWaker(Thread);

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

/// Run the supplied future to completion blocking the current thread until the future is complete.
/// This is generally used in `main()` fn's or tests such that the caller waits for an async task,
/// like [crate::server::Server::close], to complete before moving on.
///
/// The I/O itself is driven by the [super::Engine]'s poller thread, so this simply parks the
/// calling thread between polls and relies on the poller (or whichever task completes the
/// future's dependency) to unpark it.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// use netpoll::{block_on, Engine};
///
/// let engine = Engine::new().expect("Failed to start engine.");
/// block_on(engine.sleep(Duration::from_millis(10)));
/// ```
pub fn block_on<F: Future>(f: F) -> F::Output {
    pin_mut!(f);
    let waker = waker(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(result) = f.as_mut().poll(&mut cx) {
            return result;
        }
        // Spurious unparks are harmless, we simply poll again.
        thread::park();
    }
}
