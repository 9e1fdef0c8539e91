//! Random operation programs for the state machine.
//!
//! A [`FuzzProgram`] starts a state word in some valid state and applies a
//! sequence of arbitrary transitions to it, ignoring who would be allowed to
//! call them. After every step the word must still satisfy its invariants, and
//! a rejected step must have left it untouched.
use crate::threading::{
    state::{StateSnapshot, ThreadState, ThreadStateWord, Transition},
    transitions::{self, PollVerdict},
};
use arbitrary::Arbitrary;
use std::fmt;

#[derive(Debug, Arbitrary, Clone, Copy, PartialEq, Eq)]
pub enum FuzzOp {
    Attach,
    Detach,
    RequestSuspension,
    PeekBlockingSuspendRequested,
    PollSafepoint,
    RequestResume,
    RequestPulse,
    AbortAsyncSuspend,
    FinishAsyncSuspend,
    EnterBlocking,
    LeaveBlocking,
    AbortBlocking,
    BeginNoSafepoints,
    EndNoSafepoints,
}

#[derive(Debug, Arbitrary, Clone)]
pub struct FuzzProgram {
    pub start_state: u8,
    pub start_count: u8,
    pub start_no_safepoints: bool,
    pub ops: Vec<FuzzOp>,
}

impl FuzzProgram {
    /// The program's starting point, normalized into a valid word.
    pub fn start(&self) -> StateSnapshot {
        let state = ThreadState::ALL[self.start_state as usize % ThreadState::ALL.len()];
        let count = if state.holds_suspend_requests() {
            self.start_count.max(1)
        } else {
            0
        };
        let no_safepoints = self.start_no_safepoints
            && matches!(state, ThreadState::Running | ThreadState::AsyncSuspendRequested);
        StateSnapshot::new(state, count, no_safepoints)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzStats {
    pub applied: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub step: usize,
    pub op: FuzzOp,
    pub message: String,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({:?}): {}", self.step, self.op, self.message)
    }
}

fn check<V>(
    word: &ThreadStateWord,
    previous: StateSnapshot,
    result: Result<Transition<V>, crate::error::ProtocolDefect>,
) -> Result<bool, String> {
    let now = word
        .load()
        .map_err(|raw| format!("word no longer decodes: {}", raw))?;
    match result {
        Ok(t) => {
            if t.before != previous {
                return Err(format!("transition saw {} but word held {}", t.before, previous));
            }
            if t.after != now {
                return Err(format!("transition reported {} but word holds {}", t.after, now));
            }
            now.check_invariants()
                .map_err(|e| format!("{} -> {}: {}", previous, now, e))?;
            Ok(true)
        }
        Err(defect) => {
            if now != previous {
                return Err(format!("rejected {} changed the word to {}", defect, now));
            }
            Ok(false)
        }
    }
}

fn step(word: &ThreadStateWord, previous: StateSnapshot, op: FuzzOp) -> Result<bool, String> {
    match op {
        FuzzOp::Attach => check(word, previous, transitions::attach(word)),
        FuzzOp::Detach => check(word, previous, transitions::detach(word)),
        FuzzOp::RequestSuspension => check(word, previous, transitions::request_suspension(word)),
        FuzzOp::PeekBlockingSuspendRequested => {
            let result = transitions::peek_blocking_suspend_requested(word);
            if word.load().ok() != Some(previous) {
                return Err("peek changed the word".to_string());
            }
            Ok(result.is_ok())
        }
        FuzzOp::PollSafepoint => {
            let result = transitions::poll_safepoint(word);
            if let Ok(t) = &result {
                if t.verdict == PollVerdict::ContinueRunning && t.after != previous {
                    return Err("poll without a request changed the word".to_string());
                }
            }
            check(word, previous, result)
        }
        FuzzOp::RequestResume => check(word, previous, transitions::request_resume(word)),
        FuzzOp::RequestPulse => check(word, previous, transitions::request_pulse(word)),
        FuzzOp::AbortAsyncSuspend => check(word, previous, transitions::abort_async_suspend(word)),
        FuzzOp::FinishAsyncSuspend => {
            check(word, previous, transitions::finish_async_suspend(word))
        }
        FuzzOp::EnterBlocking => check(word, previous, transitions::enter_blocking(word)),
        FuzzOp::LeaveBlocking => check(word, previous, transitions::leave_blocking(word)),
        FuzzOp::AbortBlocking => check(word, previous, transitions::abort_blocking(word)),
        FuzzOp::BeginNoSafepoints => check(word, previous, transitions::begin_no_safepoints(word)),
        FuzzOp::EndNoSafepoints => check(word, previous, transitions::end_no_safepoints(word)),
    }
}

pub fn execute_program(program: &FuzzProgram) -> Result<FuzzStats, InvariantViolation> {
    let word = ThreadStateWord::with_snapshot(program.start());
    let mut stats = FuzzStats::default();

    for (i, &op) in program.ops.iter().enumerate() {
        let violation = |message: String| InvariantViolation {
            step: i,
            op,
            message,
        };
        let previous = word
            .load()
            .map_err(|raw| violation(format!("word no longer decodes: {}", raw)))?;

        if step(&word, previous, op).map_err(violation)? {
            stats.applied += 1;
        } else {
            stats.rejected += 1;
        }
    }

    Ok(stats)
}
