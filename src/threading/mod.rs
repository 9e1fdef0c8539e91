//! Thread suspension.
//!
//! Every managed thread owns a [`ThreadStateWord`] that both the thread and a
//! suspend initiator update with lock-free transitions. Threads make progress
//! toward a stop on their own: they poll at safepoints, and while inside a
//! blocking region they already count as stopped. The
//! [`SuspendOrchestrator`] drives the initiator side and waits on a barrier
//! until every target has confirmed.
//!
//! ```no_run
//! use suspend_rs::{config::SuspendConfig, threading::SuspendOrchestrator};
//!
//! let orchestrator = SuspendOrchestrator::new(SuspendConfig::from_env());
//! let world = orchestrator.stop_the_world()?;
//! for thread in world.suspended() {
//!     println!("{} is stopped", thread.name());
//! }
//! world.finish()?;
//! # Ok::<(), suspend_rs::error::SuspendError>(())
//! ```
use crate::utils::ManagedThreadId;
use std::cell::Cell;

pub mod barrier;
pub mod interrupt;
pub mod orchestrator;
pub mod registry;
pub mod state;
pub mod thread;
pub mod transitions;

pub use barrier::{BarrierCounts, SuspendBarrier};
pub use interrupt::{AsyncInterrupt, DeferredInterrupt, InterruptMechanism, Unsupported};
pub use orchestrator::{
    InitiatorLock, ResumeOutcome, StopTheWorldGuard, SuspendCycle, SuspendDiagnostics,
    SuspendOrchestrator, SuspendOutcome,
};
pub use registry::ThreadRegistry;
pub use state::{StateSnapshot, ThreadState, ThreadStateWord, Transition, MAX_SUSPEND_COUNT};
pub use thread::{ManagedThread, NoSafepointsGuard, ThreadDiagnostics};
pub use transitions::Operation;

thread_local! {
    /// Managed id of the record the current OS thread registered, if any
    pub(crate) static CURRENT_THREAD: Cell<Option<ManagedThreadId>> = const { Cell::new(None) };
}

/// Managed id of the calling thread, if it registered with an orchestrator.
pub fn current_thread_id() -> Option<ManagedThreadId> {
    CURRENT_THREAD.get()
}
