//! The [crate::poll] module is the readiness-multiplexing core of the engine, a thin and safe layer
//! over linux `epoll`. This module distills the implementation down to three components:
//! - The [Operator] trait which owners of a descriptor implement to receive readable, writable and
//! hangup callbacks, with [FdOperator] as a closure backed convenience implementation.
//! - The [OperatorHandle] which identifies a single registration, and which is what gets modified
//! and detached.
//! - The [Poller] which owns the registration table and drives the wait-and-dispatch loop, along
//! with the [Sleep] timers that bound each wait.
//!
//! A [Poller] is normally owned and driven by a [crate::engine::Engine], though it is perfectly
//! usable on its own by calling [Poller::poll] in a loop.

mod interest;
mod operator;
mod poller;
mod sys;
mod timer;
mod token;

pub use interest::{Interest, Readiness};
pub use operator::{FdOperator, Operator, OperatorHandle};
pub use poller::Poller;
pub use timer::Sleep;

pub(crate) use poller::{DEFAULT_EVENT_CAPACITY, DEFAULT_POLL_TIMEOUT};
