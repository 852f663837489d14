use std::{fmt, os::fd::RawFd};

use super::token::Token;

/// The callback side of a registration with the [super::Poller]. When the poller wakes up it
/// invokes, in order, [Operator::on_readable], [Operator::on_writable] and [Operator::on_hangup]
/// for each condition reported on the descriptor. A hangup never suppresses a readable condition
/// reported in the same wake, both are delivered.
///
/// Callbacks run on the poller's driver thread, so they should do no more than hand the
/// readiness off to whichever task owns the descriptor.
pub trait Operator: Send + Sync {
    fn on_readable(&self) {}
    fn on_writable(&self) {}
    fn on_hangup(&self) {}
}

type Callback = Box<dyn Fn() + Send + Sync>;

/// A closure backed [Operator], handy when the owner of a descriptor has nothing else to hang
/// the callbacks off of.
#[derive(Default)]
pub struct FdOperator {
    on_read: Option<Callback>,
    on_write: Option<Callback>,
    on_hup: Option<Callback>,
}

impl FdOperator {
    pub fn new() -> FdOperator {
        FdOperator::default()
    }

    pub fn on_read<F>(mut self, f: F) -> FdOperator
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_read = Some(Box::new(f));
        self
    }

    pub fn on_write<F>(mut self, f: F) -> FdOperator
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_write = Some(Box::new(f));
        self
    }

    pub fn on_hup<F>(mut self, f: F) -> FdOperator
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_hup = Some(Box::new(f));
        self
    }
}

impl Operator for FdOperator {
    fn on_readable(&self) {
        if let Some(f) = self.on_read.as_ref() {
            f()
        }
    }

    fn on_writable(&self) {
        if let Some(f) = self.on_write.as_ref() {
            f()
        }
    }

    fn on_hangup(&self) {
        if let Some(f) = self.on_hup.as_ref() {
            f()
        }
    }
}

impl fmt::Debug for FdOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdOperator")
            .field("on_read", &self.on_read.is_some())
            .field("on_write", &self.on_write.is_some())
            .field("on_hup", &self.on_hup.is_some())
            .finish()
    }
}

/// Identifies one live registration with a [super::Poller]. Handles are cheap to copy, and since
/// they carry the registration's generation a stale handle can never modify or detach a newer
/// registration of the same descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperatorHandle {
    fd: RawFd,
    token: Token,
}

impl OperatorHandle {
    pub(crate) fn new(fd: RawFd, token: Token) -> OperatorHandle {
        OperatorHandle { fd, token }
    }

    /// The descriptor this handle was registered for.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }
}
