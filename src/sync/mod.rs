//! Small synchronization primitives used to hand readiness from the poller's driver thread to the
//! tasks running on the engine's thread pool.

mod signal;

pub use signal::{Signal, Wait};
