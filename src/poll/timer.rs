use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    time::Instant,
};

use super::Poller;

pub(crate) type TimerKey = (Instant, u64);

/// The deadline table owned by a [Poller]. Entries are ordered by deadline so the poller can bound
/// its wait by the earliest one, and fire everything that has elapsed once it wakes.
#[derive(Default)]
pub(crate) struct Timers {
    entries: BTreeMap<TimerKey, Waker>,
    next_id: u64,
}

impl Timers {
    /// Insert a new deadline, returning its key and whether it is now the earliest one.
    pub(crate) fn insert(&mut self, deadline: Instant, waker: Waker) -> (TimerKey, bool) {
        let key = (deadline, self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(key, waker);
        let earliest = self.entries.keys().next() == Some(&key);
        (key, earliest)
    }

    /// Replace the waker for an outstanding deadline, re-inserting it if it already fired.
    pub(crate) fn update(&mut self, key: TimerKey, waker: Waker) {
        self.entries.insert(key, waker);
    }

    pub(crate) fn remove(&mut self, key: &TimerKey) {
        self.entries.remove(key);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove every entry whose deadline has elapsed, handing back their wakers.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Waker> {
        let mut wakers = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            wakers.push(entry.remove());
        }
        wakers
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A future that completes once its deadline has passed. Created by [Poller::sleep] and
/// [crate::engine::Engine::sleep], and driven by the poller's wait loop.
pub struct Sleep {
    poller: Arc<Poller>,
    deadline: Instant,
    key: Option<TimerKey>,
}

impl Sleep {
    pub(crate) fn new(poller: Arc<Poller>, deadline: Instant) -> Sleep {
        Sleep {
            poller,
            deadline,
            key: None,
        }
    }

    /// The instant this sleep completes at.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if Instant::now() >= self.deadline {
            if let Some(key) = self.key.take() {
                self.poller.cancel_timer(&key);
            }
            return Poll::Ready(());
        }

        let key = self.key;
        match key {
            Some(key) => self.poller.update_timer(key, cx.waker().clone()),
            None => {
                let key = self.poller.add_timer(self.deadline, cx.waker().clone());
                self.key = Some(key);
            }
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.poller.cancel_timer(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::task::noop_waker;

    use super::*;

    #[test]
    fn test_expire_only_elapsed() {
        let mut timers = Timers::default();
        let now = Instant::now();

        let (_, earliest) = timers.insert(now + Duration::from_secs(10), noop_waker());
        assert!(earliest);
        let (_, earliest) = timers.insert(now, noop_waker());
        assert!(earliest);
        let (late, earliest) = timers.insert(now + Duration::from_secs(20), noop_waker());
        assert!(!earliest);

        assert_eq!(timers.expire(now).len(), 1);
        assert_eq!(timers.len(), 2);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(10)));

        timers.remove(&late);
        assert_eq!(timers.len(), 1);
    }
}
