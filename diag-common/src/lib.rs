//! Plumbing shared by the diag crates: message [`Buffer`]s, backpressure [`Flow`]s,
//! FIFO [`Queue`]s and the single-threaded readiness [`Reactor`].

mod buffer;
pub use buffer::Buffer;

mod flow;
pub use flow::{Flow, FlowCredit, FlowOptions};

mod queue;
pub use queue::Queue;

pub mod reactor;
pub use reactor::{Direction, Handler, Next, Reactor, ReactorError, WatchId};

/// Size units.
#[allow(non_upper_case_globals)]
pub mod constants {
    /// 1024 bytes.
    pub const KiB: usize = 1024;
}
