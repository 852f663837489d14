use nix::libc;

/// The set of readiness conditions an operator wants to be notified about. Hangup and error
/// conditions are always reported by the kernel, regardless of the requested interest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    None,
    Readable,
    Writable,
    ReadWrite,
}

impl Interest {
    pub fn is_readable(self) -> bool {
        matches!(self, Interest::Readable | Interest::ReadWrite)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Interest::Writable | Interest::ReadWrite)
    }

    /// Every registration is edge-triggered, and asks for `EPOLLRDHUP` alongside read interest
    /// so a peer's half-close surfaces as a readable edge.
    pub(crate) fn as_epoll(self) -> u32 {
        let mut flags = libc::EPOLLET;
        if self.is_readable() {
            flags |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if self.is_writable() {
            flags |= libc::EPOLLOUT;
        }
        flags as u32
    }
}

/// The conditions reported for a single descriptor in one wake of the poller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

impl Readiness {
    pub(crate) fn from_epoll(events: u32) -> Readiness {
        let events = events as libc::c_int;
        Readiness {
            readable: events & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) != 0,
            writable: events & libc::EPOLLOUT != 0,
            hangup: events & (libc::EPOLLHUP | libc::EPOLLERR) != 0,
        }
    }
}
