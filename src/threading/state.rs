//! The packed per-thread state word.
//!
//! One `u32` holds the logical state, the no-safepoints flag and the number of
//! outstanding suspend requests:
//!
//! ```text
//!  31            16 15          8 7     6            0
//! +----------------+-------------+-----+--------------+
//! |    (unused)    | suspend cnt | NSP |    state     |
//! +----------------+-------------+-----+--------------+
//! ```
//!
//! The word is only ever modified through the compare-and-swap loop in
//! [`ThreadStateWord::update`]; see [`super::transitions`] for the operations.
use crate::{
    error::{ProtocolDefect, RawWord},
    threading::transitions::Operation,
    utils::sync::{AtomicU32, Ordering},
};
use serde::Serialize;
use std::fmt;

const STATE_MASK: u32 = 0x7F;
const NO_SAFEPOINTS_BIT: u32 = 0x80;
const SUSPEND_COUNT_SHIFT: u32 = 8;
const SUSPEND_COUNT_MASK: u32 = 0xFF << SUSPEND_COUNT_SHIFT;

/// Upper bound on overlapping suspend requests against one thread.
pub const MAX_SUSPEND_COUNT: u8 = u8::MAX;

/// Logical state of a managed thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ThreadState {
    /// Registered but not yet attached.
    Starting = 0,
    /// Executing managed code; suspendable.
    Running = 1,
    /// Gone. No further transitions are valid.
    Detached = 2,
    /// An asynchronous interrupt landed and parked the thread.
    AsyncSuspended = 3,
    /// The thread parked itself at a safepoint.
    SelfSuspended = 4,
    /// A suspend request is pending against a running thread.
    AsyncSuspendRequested = 5,
    /// Outside managed execution (syscall, wait).
    Blocking = 6,
    /// An asynchronous interrupt landed while the thread was blocking.
    BlockingAsyncSuspended = 7,
    /// The thread tried to leave a blocking region and parked.
    BlockingSelfSuspended = 8,
    /// A suspend request arrived while the thread was blocking.
    BlockingSuspendRequested = 9,
}

impl ThreadState {
    pub const ALL: [ThreadState; 10] = [
        ThreadState::Starting,
        ThreadState::Running,
        ThreadState::Detached,
        ThreadState::AsyncSuspended,
        ThreadState::SelfSuspended,
        ThreadState::AsyncSuspendRequested,
        ThreadState::Blocking,
        ThreadState::BlockingAsyncSuspended,
        ThreadState::BlockingSelfSuspended,
        ThreadState::BlockingSuspendRequested,
    ];

    pub fn from_bits(bits: u8) -> Option<Self> {
        Self::ALL.get(bits as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ThreadState::Starting => "STARTING",
            ThreadState::Running => "RUNNING",
            ThreadState::Detached => "DETACHED",
            ThreadState::AsyncSuspended => "ASYNC_SUSPENDED",
            ThreadState::SelfSuspended => "SELF_SUSPENDED",
            ThreadState::AsyncSuspendRequested => "ASYNC_SUSPEND_REQUESTED",
            ThreadState::Blocking => "BLOCKING",
            ThreadState::BlockingAsyncSuspended => "BLOCKING_ASYNC_SUSPENDED",
            ThreadState::BlockingSelfSuspended => "BLOCKING_SELF_SUSPENDED",
            ThreadState::BlockingSuspendRequested => "BLOCKING_SUSPEND_REQUESTED",
        }
    }

    /// States that require `suspend_count > 0`.
    pub fn holds_suspend_requests(self) -> bool {
        !matches!(
            self,
            ThreadState::Starting
                | ThreadState::Running
                | ThreadState::Detached
                | ThreadState::Blocking
        )
    }

    /// The thread is parked, or is blocking with a suspend request recorded, and
    /// so can be treated as stopped by an initiator.
    pub fn is_suspended(self) -> bool {
        matches!(
            self,
            ThreadState::AsyncSuspended
                | ThreadState::SelfSuspended
                | ThreadState::BlockingAsyncSuspended
                | ThreadState::BlockingSelfSuspended
                | ThreadState::BlockingSuspendRequested
        )
    }

    /// Attached and not yet detached.
    pub fn is_live(self) -> bool {
        !matches!(self, ThreadState::Starting | ThreadState::Detached)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded copy of a [`ThreadStateWord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub state: ThreadState,
    pub suspend_count: u8,
    pub no_safepoints: bool,
}

impl StateSnapshot {
    pub const fn new(state: ThreadState, suspend_count: u8, no_safepoints: bool) -> Self {
        Self {
            state,
            suspend_count,
            no_safepoints,
        }
    }

    pub fn encode(self) -> u32 {
        let mut raw = self.state as u32 | ((self.suspend_count as u32) << SUSPEND_COUNT_SHIFT);
        if self.no_safepoints {
            raw |= NO_SAFEPOINTS_BIT;
        }
        raw
    }

    pub fn decode(raw: u32) -> Option<Self> {
        let state = ThreadState::from_bits((raw & STATE_MASK) as u8)?;
        Some(Self {
            state,
            suspend_count: ((raw & SUSPEND_COUNT_MASK) >> SUSPEND_COUNT_SHIFT) as u8,
            no_safepoints: raw & NO_SAFEPOINTS_BIT != 0,
        })
    }

    pub fn with_state(self, state: ThreadState) -> Self {
        Self { state, ..self }
    }

    pub fn with_count(self, suspend_count: u8) -> Self {
        Self {
            suspend_count,
            ..self
        }
    }

    pub fn with_no_safepoints(self, no_safepoints: bool) -> Self {
        Self {
            no_safepoints,
            ..self
        }
    }

    /// Checks the word-level invariants that hold in every reachable state.
    pub fn check_invariants(self) -> Result<(), &'static str> {
        if self.state.holds_suspend_requests() {
            if self.suspend_count == 0 {
                return Err("suspended or suspend-requested state with suspend_count == 0");
            }
        } else if self.suspend_count != 0 {
            return Err("suspend_count must be 0 outside suspended states");
        }

        if self.no_safepoints
            && !matches!(
                self.state,
                ThreadState::Running | ThreadState::AsyncSuspendRequested
            )
        {
            return Err("no_safepoints set outside RUNNING / ASYNC_SUSPEND_REQUESTED");
        }

        Ok(())
    }
}

impl fmt::Display for StateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(count={}", self.state, self.suspend_count)?;
        if self.no_safepoints {
            f.write_str(", no_safepoints")?;
        }
        f.write_str(")")
    }
}

/// The result of one successful state word update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition<V> {
    pub operation: Operation,
    pub before: StateSnapshot,
    pub after: StateSnapshot,
    pub verdict: V,
}

/// Atomic per-thread state word.
#[derive(Debug)]
pub struct ThreadStateWord {
    raw: AtomicU32,
}

impl ThreadStateWord {
    /// A fresh word for a thread that has just registered.
    pub fn new() -> Self {
        Self::with_snapshot(StateSnapshot::new(ThreadState::Starting, 0, false))
    }

    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            raw: AtomicU32::new(snapshot.encode()),
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw.load(Ordering::SeqCst)
    }

    pub fn load(&self) -> Result<StateSnapshot, RawWord> {
        let raw = self.raw();
        StateSnapshot::decode(raw).ok_or(RawWord(raw))
    }

    /// Runs `step` against the current value and installs its result with a CAS,
    /// retrying on contention. `step` is a pure function of the decoded word: it
    /// either produces the next word plus a verdict, or names the violated
    /// precondition. A rejected step leaves the word untouched.
    pub fn update<V>(
        &self,
        operation: Operation,
        mut step: impl FnMut(StateSnapshot) -> Result<(StateSnapshot, V), &'static str>,
    ) -> Result<Transition<V>, ProtocolDefect> {
        let mut outcome = None;

        let _ = self
            .raw
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                let Some(before) = StateSnapshot::decode(raw) else {
                    outcome = Some(Err(ProtocolDefect::new(
                        operation,
                        RawWord(raw),
                        "state word holds an unknown state",
                    )));
                    return None;
                };

                match step(before) {
                    Ok((after, verdict)) => {
                        outcome = Some(Ok(Transition {
                            operation,
                            before,
                            after,
                            verdict,
                        }));
                        Some(after.encode())
                    }
                    Err(reason) => {
                        outcome = Some(Err(ProtocolDefect::new(operation, RawWord(raw), reason)));
                        None
                    }
                }
            });

        // fetch_update always runs the closure at least once
        outcome.unwrap_or_else(|| {
            Err(ProtocolDefect::new(
                operation,
                RawWord(self.raw()),
                "state update produced no outcome",
            ))
        })
    }
}

impl Default for ThreadStateWord {
    fn default() -> Self {
        Self::new()
    }
}
