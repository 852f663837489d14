//! The engine module replaces implicit, process-wide poller state with an explicit object owned by
//! whoever starts a server or dials a connection. An [Engine] bundles the three moving parts every
//! connection needs:
//! - a [crate::poll::Poller] holding the descriptor registrations,
//! - a dedicated driver thread running the poller's wait-and-dispatch loop,
//! - a [futures::executor::ThreadPool] that runs the many lightweight tasks (accept loops,
//! connection readers, on-connect hooks) over a small number of OS threads.
//!
//! Independent engines share nothing, which keeps tests isolated and gives each one a clean
//! teardown through [Engine::shutdown].

mod block_on;
mod builder;
mod handle;

pub use block_on::block_on;
pub use builder::EngineBuilder;
pub use handle::Engine;
