//! State machine transitions.
//!
//! Every function here takes a thread's [`ThreadStateWord`] and performs one
//! lock-free transition through [`ThreadStateWord::update`]. None of them block.
//! A combination of state, count and flag outside an operation's precondition
//! table is reported as a [`ProtocolDefect`] and leaves the word untouched; the
//! caller decides whether that is fatal.
//!
//! Operations split by who may call them:
//!
//! - the thread on itself: [`attach`], [`detach`], [`poll_safepoint`],
//!   [`enter_blocking`], [`leave_blocking`], [`abort_blocking`],
//!   [`begin_no_safepoints`], [`end_no_safepoints`];
//! - the suspend initiator on another thread: [`request_suspension`],
//!   [`request_resume`], [`request_pulse`], [`peek_blocking_suspend_requested`];
//! - the interrupt path (in the target's interrupt context, or the initiator when
//!   delivery failed): [`finish_async_suspend`], [`abort_async_suspend`].
use crate::{
    error::ProtocolDefect,
    threading::state::{StateSnapshot, ThreadState, ThreadStateWord, Transition, MAX_SUSPEND_COUNT},
};
use serde::Serialize;
use std::fmt;

use ThreadState::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
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

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Attach => "attach",
            Operation::Detach => "detach",
            Operation::RequestSuspension => "request_suspension",
            Operation::PeekBlockingSuspendRequested => "peek_blocking_suspend_requested",
            Operation::PollSafepoint => "poll_safepoint",
            Operation::RequestResume => "request_resume",
            Operation::RequestPulse => "request_pulse",
            Operation::AbortAsyncSuspend => "abort_async_suspend",
            Operation::FinishAsyncSuspend => "finish_async_suspend",
            Operation::EnterBlocking => "enter_blocking",
            Operation::LeaveBlocking => "leave_blocking",
            Operation::AbortBlocking => "abort_blocking",
            Operation::BeginNoSafepoints => "begin_no_safepoints",
            Operation::EndNoSafepoints => "end_no_safepoints",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the initiator must do after [`request_suspension`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SuspendVerdict {
    /// The thread was running: interrupt it (or wait for its next poll).
    InitiateAsyncSuspend,
    /// The thread is blocking and can be treated as suspended.
    InitiateBlockingSuspend,
    /// Already parked; nothing to wait for.
    AlreadySuspended,
    /// Already blocking with a suspend request on record.
    AlreadySuspendedBlocking,
}

/// Outcome of [`poll_safepoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PollVerdict {
    ContinueRunning,
    /// Notify the initiator, then wait on the resume semaphore.
    ParkAndNotify,
}

/// What the initiator must do after [`request_resume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResumeVerdict {
    /// The thread was not suspended.
    Error,
    /// Other suspend requests remain; the count was only decremented.
    Done,
    /// A suspend request that never landed was taken back. Nothing to wake.
    Withdrawn,
    /// Post the thread's resume semaphore.
    MustSignalSelfResume,
    /// Resume through the interrupt mechanism.
    MustSignalAsyncResume,
    /// The thread never left its blocking region. Nothing to wake.
    MustSignalBlockingResume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PulseVerdict {
    MustAsyncPulse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnterBlockingVerdict {
    Continue,
    /// A suspend request is pending: poll, then try again.
    PollAndRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LeaveBlockingVerdict {
    Done,
    /// A suspend request arrived while blocking: park.
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbortBlockingVerdict {
    /// The thread was not blocking.
    Ignore,
    /// Not blocking, and a suspend request is pending: poll.
    IgnoreAndPoll,
    Ok,
    Wait,
}

fn unchanged<V>(old: StateSnapshot, verdict: V) -> Result<(StateSnapshot, V), &'static str> {
    Ok((old, verdict))
}

fn increment(count: u8) -> Result<u8, &'static str> {
    if count == 0 {
        return Err("suspend_count is 0 in a suspended state");
    }
    if count >= MAX_SUSPEND_COUNT {
        return Err("suspend_count overflow");
    }
    Ok(count + 1)
}

pub fn attach(word: &ThreadStateWord) -> Result<Transition<()>, ProtocolDefect> {
    word.update(Operation::Attach, |old| match old.state {
        Starting if old.suspend_count != 0 => Err("suspend_count must be 0 while starting"),
        Starting => Ok((StateSnapshot::new(Running, 0, false), ())),
        _ => Err("only a STARTING thread can attach"),
    })
}

/// Returns `false` while a suspend request is pending; the thread must let it
/// land and be resumed before exiting.
pub fn detach(word: &ThreadStateWord) -> Result<Transition<bool>, ProtocolDefect> {
    word.update(Operation::Detach, |old| {
        if old.no_safepoints {
            return Err("detaching inside a no-safepoints region");
        }
        match old.state {
            Running | Blocking if old.suspend_count != 0 => {
                Err("suspend_count must be 0 while running or blocking")
            }
            Running | Blocking => Ok((StateSnapshot::new(Detached, 0, false), true)),
            AsyncSuspendRequested | BlockingSuspendRequested => unchanged(old, false),
            _ => Err("only a running or blocking thread can detach"),
        }
    })
}

pub fn request_suspension(
    word: &ThreadStateWord,
) -> Result<Transition<SuspendVerdict>, ProtocolDefect> {
    word.update(Operation::RequestSuspension, |old| match old.state {
        Running => {
            if old.suspend_count != 0 {
                return Err("suspend_count must be 0 while running");
            }
            Ok((
                old.with_state(AsyncSuspendRequested).with_count(1),
                SuspendVerdict::InitiateAsyncSuspend,
            ))
        }
        AsyncSuspended | SelfSuspended | BlockingAsyncSuspended | BlockingSelfSuspended => {
            if old.no_safepoints {
                return Err("no_safepoints set on a suspended thread");
            }
            Ok((
                old.with_count(increment(old.suspend_count)?),
                SuspendVerdict::AlreadySuspended,
            ))
        }
        Blocking => {
            if old.suspend_count != 0 {
                return Err("suspend_count must be 0 while blocking");
            }
            if old.no_safepoints {
                return Err("no_safepoints set on a blocking thread");
            }
            Ok((
                old.with_state(BlockingSuspendRequested).with_count(1),
                SuspendVerdict::InitiateBlockingSuspend,
            ))
        }
        BlockingSuspendRequested => Ok((
            old.with_count(increment(old.suspend_count)?),
            SuspendVerdict::AlreadySuspendedBlocking,
        )),
        AsyncSuspendRequested => {
            Err("a suspend request is already in flight; only one initiator may run at a time")
        }
        Starting | Detached => Err("thread is not attached"),
    })
}

/// Read-only: whether a blocking thread still has an unserviced suspend request.
pub fn peek_blocking_suspend_requested(word: &ThreadStateWord) -> Result<bool, ProtocolDefect> {
    word.update(Operation::PeekBlockingSuspendRequested, |old| match old.state {
        BlockingSuspendRequested => unchanged(old, true),
        Blocking | BlockingAsyncSuspended | BlockingSelfSuspended => unchanged(old, false),
        _ => Err("thread is not in a blocking state"),
    })
    .map(|t| t.verdict)
}

pub fn poll_safepoint(word: &ThreadStateWord) -> Result<Transition<PollVerdict>, ProtocolDefect> {
    word.update(Operation::PollSafepoint, |old| {
        if old.no_safepoints {
            return Err("polling inside a no-safepoints region");
        }
        match old.state {
            Running if old.suspend_count != 0 => Err("suspend_count must be 0 while running"),
            Running => unchanged(old, PollVerdict::ContinueRunning),
            AsyncSuspendRequested if old.suspend_count == 0 => {
                Err("suspend requested with suspend_count == 0")
            }
            AsyncSuspendRequested => Ok((old.with_state(SelfSuspended), PollVerdict::ParkAndNotify)),
            _ => Err("only a running thread can poll"),
        }
    })
}

pub fn request_resume(word: &ThreadStateWord) -> Result<Transition<ResumeVerdict>, ProtocolDefect> {
    word.update(Operation::RequestResume, |old| {
        let count = old.suspend_count;
        match old.state {
            Running | Blocking => {
                if count != 0 {
                    return Err("suspend_count must be 0 while running or blocking");
                }
                unchanged(old, ResumeVerdict::Error)
            }
            AsyncSuspendRequested | AsyncSuspended | SelfSuspended | BlockingAsyncSuspended
            | BlockingSelfSuspended | BlockingSuspendRequested => {
                if count == 0 {
                    return Err("suspend_count is 0 in a suspended state");
                }
                if old.no_safepoints && old.state != AsyncSuspendRequested {
                    return Err("no_safepoints set on a suspended thread");
                }
                if count > 1 {
                    return Ok((old.with_count(count - 1), ResumeVerdict::Done));
                }
                let (next, verdict) = match old.state {
                    AsyncSuspendRequested => (Running, ResumeVerdict::Withdrawn),
                    AsyncSuspended => (Running, ResumeVerdict::MustSignalAsyncResume),
                    SelfSuspended => (Running, ResumeVerdict::MustSignalSelfResume),
                    BlockingAsyncSuspended => (Blocking, ResumeVerdict::MustSignalAsyncResume),
                    BlockingSelfSuspended => (Running, ResumeVerdict::MustSignalSelfResume),
                    _ => (Blocking, ResumeVerdict::MustSignalBlockingResume),
                };
                Ok((old.with_state(next).with_count(0), verdict))
            }
            Starting | Detached => Err("thread is not attached"),
        }
    })
}

/// Resume a blocking, asynchronously suspended thread and immediately request
/// its suspension again, as one step. Only valid with exactly one outstanding
/// suspend request.
pub fn request_pulse(word: &ThreadStateWord) -> Result<Transition<PulseVerdict>, ProtocolDefect> {
    word.update(Operation::RequestPulse, |old| match old.state {
        BlockingAsyncSuspended if old.suspend_count != 1 => {
            Err("pulse requires exactly one outstanding suspend request")
        }
        BlockingAsyncSuspended if old.no_safepoints => Err("no_safepoints set on a suspended thread"),
        BlockingAsyncSuspended => Ok((
            old.with_state(BlockingSuspendRequested),
            PulseVerdict::MustAsyncPulse,
        )),
        _ => Err("only a BLOCKING_ASYNC_SUSPENDED thread can be pulsed"),
    })
}

/// The interrupt meant to land a suspend could not. Returns `false` if the
/// thread meanwhile suspended itself, in which case there is nothing to abort.
pub fn abort_async_suspend(word: &ThreadStateWord) -> Result<Transition<bool>, ProtocolDefect> {
    word.update(Operation::AbortAsyncSuspend, |old| {
        let count = old.suspend_count;
        match old.state {
            SelfSuspended | BlockingSelfSuspended => unchanged(old, false),
            AsyncSuspendRequested | BlockingSuspendRequested => {
                if count == 0 {
                    return Err("suspend requested with suspend_count == 0");
                }
                if count > 1 {
                    return Ok((old.with_count(count - 1), true));
                }
                let next = if old.state == AsyncSuspendRequested {
                    Running
                } else {
                    Blocking
                };
                Ok((old.with_state(next).with_count(0), true))
            }
            _ => Err("no asynchronous suspend is in flight"),
        }
    })
}

/// The interrupt landed. Returns `false` if the thread had already suspended
/// itself, in which case the interrupt context must not wait.
pub fn finish_async_suspend(word: &ThreadStateWord) -> Result<Transition<bool>, ProtocolDefect> {
    word.update(Operation::FinishAsyncSuspend, |old| match old.state {
        SelfSuspended | BlockingSelfSuspended => unchanged(old, false),
        AsyncSuspendRequested | BlockingSuspendRequested if old.suspend_count == 0 => {
            Err("suspend requested with suspend_count == 0")
        }
        AsyncSuspendRequested | BlockingSuspendRequested if old.no_safepoints => {
            Err("asynchronous suspend landed inside a no-safepoints region")
        }
        AsyncSuspendRequested => Ok((old.with_state(AsyncSuspended), true)),
        BlockingSuspendRequested => Ok((old.with_state(BlockingAsyncSuspended), true)),
        _ => Err("no asynchronous suspend is in flight"),
    })
}

pub fn enter_blocking(
    word: &ThreadStateWord,
) -> Result<Transition<EnterBlockingVerdict>, ProtocolDefect> {
    word.update(Operation::EnterBlocking, |old| {
        if old.no_safepoints {
            return Err("entering a blocking region inside a no-safepoints region");
        }
        match old.state {
            Running if old.suspend_count != 0 => Err("suspend_count must be 0 while running"),
            Running => Ok((old.with_state(Blocking), EnterBlockingVerdict::Continue)),
            AsyncSuspendRequested if old.suspend_count == 0 => {
                Err("suspend requested with suspend_count == 0")
            }
            AsyncSuspendRequested => unchanged(old, EnterBlockingVerdict::PollAndRetry),
            _ => Err("only a running thread can enter a blocking region"),
        }
    })
}

pub fn leave_blocking(
    word: &ThreadStateWord,
) -> Result<Transition<LeaveBlockingVerdict>, ProtocolDefect> {
    word.update(Operation::LeaveBlocking, |old| match old.state {
        Blocking if old.suspend_count != 0 => Err("suspend_count must be 0 while blocking"),
        Blocking => Ok((old.with_state(Running), LeaveBlockingVerdict::Done)),
        BlockingSuspendRequested if old.suspend_count == 0 => {
            Err("suspend requested with suspend_count == 0")
        }
        BlockingSuspendRequested => Ok((
            old.with_state(BlockingSelfSuspended),
            LeaveBlockingVerdict::Wait,
        )),
        _ => Err("thread is not in a blocking region"),
    })
}

pub fn abort_blocking(
    word: &ThreadStateWord,
) -> Result<Transition<AbortBlockingVerdict>, ProtocolDefect> {
    word.update(Operation::AbortBlocking, |old| match old.state {
        Running if old.suspend_count != 0 => Err("suspend_count must be 0 while running"),
        Running => unchanged(old, AbortBlockingVerdict::Ignore),
        AsyncSuspendRequested if old.suspend_count == 0 => {
            Err("suspend requested with suspend_count == 0")
        }
        AsyncSuspendRequested => unchanged(old, AbortBlockingVerdict::IgnoreAndPoll),
        Blocking if old.suspend_count != 0 => Err("suspend_count must be 0 while blocking"),
        Blocking => Ok((old.with_state(Running), AbortBlockingVerdict::Ok)),
        BlockingSuspendRequested if old.suspend_count == 0 => {
            Err("suspend requested with suspend_count == 0")
        }
        BlockingSuspendRequested => Ok((
            old.with_state(BlockingSelfSuspended),
            AbortBlockingVerdict::Wait,
        )),
        _ => Err("thread cannot abort a blocking region from this state"),
    })
}

pub fn begin_no_safepoints(word: &ThreadStateWord) -> Result<Transition<()>, ProtocolDefect> {
    word.update(Operation::BeginNoSafepoints, |old| match old.state {
        Running | AsyncSuspendRequested if old.no_safepoints => {
            Err("no-safepoints regions do not nest")
        }
        Running | AsyncSuspendRequested => Ok((old.with_no_safepoints(true), ())),
        _ => Err("only a running thread can begin a no-safepoints region"),
    })
}

pub fn end_no_safepoints(word: &ThreadStateWord) -> Result<Transition<()>, ProtocolDefect> {
    word.update(Operation::EndNoSafepoints, |old| match old.state {
        Running | AsyncSuspendRequested if !old.no_safepoints => {
            Err("no no-safepoints region is open")
        }
        Running | AsyncSuspendRequested => Ok((old.with_no_safepoints(false), ())),
        _ => Err("only a running thread can end a no-safepoints region"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(state: ThreadState, count: u8, no_safepoints: bool) -> ThreadStateWord {
        ThreadStateWord::with_snapshot(StateSnapshot::new(state, count, no_safepoints))
    }

    fn current(word: &ThreadStateWord) -> StateSnapshot {
        word.load().unwrap()
    }

    #[test]
    fn test_attach_only_from_starting() {
        let w = ThreadStateWord::new();
        attach(&w).unwrap();
        assert_eq!(current(&w), StateSnapshot::new(Running, 0, false));

        let defect = attach(&w).unwrap_err();
        assert_eq!(defect.operation, Operation::Attach);
        assert_eq!(current(&w).state, Running);
    }

    #[test]
    fn test_detach() {
        let w = word(Blocking, 0, false);
        assert!(detach(&w).unwrap().verdict);
        assert_eq!(current(&w).state, Detached);

        let w = word(AsyncSuspendRequested, 1, false);
        assert!(!detach(&w).unwrap().verdict);
        assert_eq!(current(&w).state, AsyncSuspendRequested);

        let w = word(BlockingSuspendRequested, 2, false);
        assert!(!detach(&w).unwrap().verdict);

        assert!(detach(&word(Running, 0, true)).is_err());
        assert!(detach(&word(SelfSuspended, 1, false)).is_err());
        assert!(detach(&word(Detached, 0, false)).is_err());
    }

    #[test]
    fn test_request_suspension_table() {
        let w = word(Running, 0, true);
        let t = request_suspension(&w).unwrap();
        assert_eq!(t.verdict, SuspendVerdict::InitiateAsyncSuspend);
        assert_eq!(t.after, StateSnapshot::new(AsyncSuspendRequested, 1, true));

        for state in [AsyncSuspended, SelfSuspended, BlockingAsyncSuspended, BlockingSelfSuspended] {
            let w = word(state, 2, false);
            let t = request_suspension(&w).unwrap();
            assert_eq!(t.verdict, SuspendVerdict::AlreadySuspended);
            assert_eq!(t.after, StateSnapshot::new(state, 3, false));
        }

        let w = word(Blocking, 0, false);
        let t = request_suspension(&w).unwrap();
        assert_eq!(t.verdict, SuspendVerdict::InitiateBlockingSuspend);
        assert_eq!(t.after, StateSnapshot::new(BlockingSuspendRequested, 1, false));

        let t = request_suspension(&w).unwrap();
        assert_eq!(t.verdict, SuspendVerdict::AlreadySuspendedBlocking);
        assert_eq!(t.after.suspend_count, 2);

        assert!(request_suspension(&word(AsyncSuspendRequested, 1, false)).is_err());
        assert!(request_suspension(&word(Starting, 0, false)).is_err());
        assert!(request_suspension(&word(Detached, 0, false)).is_err());
    }

    #[test]
    fn test_suspend_count_overflow_is_a_defect() {
        let w = word(SelfSuspended, MAX_SUSPEND_COUNT, false);
        let defect = request_suspension(&w).unwrap_err();
        assert_eq!(defect.reason, "suspend_count overflow");
        assert_eq!(current(&w).suspend_count, MAX_SUSPEND_COUNT);
    }

    #[test]
    fn test_peek_blocking() {
        assert!(peek_blocking_suspend_requested(&word(BlockingSuspendRequested, 1, false)).unwrap());
        assert!(!peek_blocking_suspend_requested(&word(Blocking, 0, false)).unwrap());
        assert!(!peek_blocking_suspend_requested(&word(BlockingSelfSuspended, 1, false)).unwrap());
        assert!(peek_blocking_suspend_requested(&word(Running, 0, false)).is_err());
    }

    #[test]
    fn test_poll_safepoint_is_idempotent_without_request() {
        let w = word(Running, 0, false);
        for _ in 0..100 {
            assert_eq!(poll_safepoint(&w).unwrap().verdict, PollVerdict::ContinueRunning);
        }
        assert_eq!(current(&w), StateSnapshot::new(Running, 0, false));
    }

    #[test]
    fn test_poll_parks_on_request() {
        let w = word(AsyncSuspendRequested, 1, false);
        assert_eq!(poll_safepoint(&w).unwrap().verdict, PollVerdict::ParkAndNotify);
        assert_eq!(current(&w), StateSnapshot::new(SelfSuspended, 1, false));

        assert!(poll_safepoint(&word(AsyncSuspendRequested, 1, true)).is_err());
        assert!(poll_safepoint(&word(Blocking, 0, false)).is_err());
    }

    #[test]
    fn test_request_resume_table() {
        let cases = [
            (AsyncSuspended, Running, ResumeVerdict::MustSignalAsyncResume),
            (SelfSuspended, Running, ResumeVerdict::MustSignalSelfResume),
            (BlockingAsyncSuspended, Blocking, ResumeVerdict::MustSignalAsyncResume),
            (BlockingSelfSuspended, Running, ResumeVerdict::MustSignalSelfResume),
            (BlockingSuspendRequested, Blocking, ResumeVerdict::MustSignalBlockingResume),
            (AsyncSuspendRequested, Running, ResumeVerdict::Withdrawn),
        ];
        for (from, to, verdict) in cases {
            let w = word(from, 1, false);
            let t = request_resume(&w).unwrap();
            assert_eq!(t.verdict, verdict, "resuming {}", from);
            assert_eq!(t.after, StateSnapshot::new(to, 0, false));
        }

        let w = word(SelfSuspended, 3, false);
        assert_eq!(request_resume(&w).unwrap().verdict, ResumeVerdict::Done);
        assert_eq!(current(&w), StateSnapshot::new(SelfSuspended, 2, false));

        assert_eq!(
            request_resume(&word(Running, 0, false)).unwrap().verdict,
            ResumeVerdict::Error
        );
        assert_eq!(
            request_resume(&word(Blocking, 0, false)).unwrap().verdict,
            ResumeVerdict::Error
        );
        assert!(request_resume(&word(Detached, 0, false)).is_err());
    }

    #[test]
    fn test_pulse_precondition_is_narrow() {
        let w = word(BlockingAsyncSuspended, 1, false);
        assert_eq!(request_pulse(&w).unwrap().verdict, PulseVerdict::MustAsyncPulse);
        assert_eq!(current(&w), StateSnapshot::new(BlockingSuspendRequested, 1, false));

        let w = word(BlockingAsyncSuspended, 2, false);
        assert!(request_pulse(&w).is_err());
        assert_eq!(current(&w).suspend_count, 2);

        assert!(request_pulse(&word(AsyncSuspended, 1, false)).is_err());
    }

    #[test]
    fn test_abort_async_suspend() {
        let w = word(AsyncSuspendRequested, 1, true);
        assert!(abort_async_suspend(&w).unwrap().verdict);
        assert_eq!(current(&w), StateSnapshot::new(Running, 0, true));

        let w = word(BlockingSuspendRequested, 2, false);
        assert!(abort_async_suspend(&w).unwrap().verdict);
        assert_eq!(current(&w), StateSnapshot::new(BlockingSuspendRequested, 1, false));
        assert!(abort_async_suspend(&w).unwrap().verdict);
        assert_eq!(current(&w), StateSnapshot::new(Blocking, 0, false));

        let w = word(SelfSuspended, 1, false);
        assert!(!abort_async_suspend(&w).unwrap().verdict);
        assert_eq!(current(&w).state, SelfSuspended);

        assert!(abort_async_suspend(&word(Running, 0, false)).is_err());
    }

    #[test]
    fn test_finish_async_suspend() {
        let w = word(AsyncSuspendRequested, 1, false);
        assert!(finish_async_suspend(&w).unwrap().verdict);
        assert_eq!(current(&w).state, AsyncSuspended);

        let w = word(BlockingSuspendRequested, 1, false);
        assert!(finish_async_suspend(&w).unwrap().verdict);
        assert_eq!(current(&w).state, BlockingAsyncSuspended);

        let w = word(BlockingSelfSuspended, 1, false);
        assert!(!finish_async_suspend(&w).unwrap().verdict);

        assert!(finish_async_suspend(&word(AsyncSuspendRequested, 1, true)).is_err());
        assert!(finish_async_suspend(&word(Running, 0, false)).is_err());
    }

    #[test]
    fn test_blocking_regions() {
        let w = word(Running, 0, false);
        assert_eq!(enter_blocking(&w).unwrap().verdict, EnterBlockingVerdict::Continue);
        assert_eq!(leave_blocking(&w).unwrap().verdict, LeaveBlockingVerdict::Done);
        assert_eq!(current(&w).state, Running);

        let w = word(AsyncSuspendRequested, 1, false);
        assert_eq!(
            enter_blocking(&w).unwrap().verdict,
            EnterBlockingVerdict::PollAndRetry
        );
        assert_eq!(current(&w).state, AsyncSuspendRequested);

        let w = word(BlockingSuspendRequested, 1, false);
        assert_eq!(leave_blocking(&w).unwrap().verdict, LeaveBlockingVerdict::Wait);
        assert_eq!(current(&w).state, BlockingSelfSuspended);

        assert!(enter_blocking(&word(Running, 0, true)).is_err());
        assert!(leave_blocking(&word(Running, 0, false)).is_err());
    }

    #[test]
    fn test_abort_blocking_table() {
        let cases = [
            (Running, 0, AbortBlockingVerdict::Ignore, Running),
            (AsyncSuspendRequested, 1, AbortBlockingVerdict::IgnoreAndPoll, AsyncSuspendRequested),
            (Blocking, 0, AbortBlockingVerdict::Ok, Running),
            (BlockingSuspendRequested, 1, AbortBlockingVerdict::Wait, BlockingSelfSuspended),
        ];
        for (from, count, verdict, to) in cases {
            let w = word(from, count, false);
            assert_eq!(abort_blocking(&w).unwrap().verdict, verdict);
            assert_eq!(current(&w).state, to);
        }
        assert!(abort_blocking(&word(SelfSuspended, 1, false)).is_err());
    }

    #[test]
    fn test_no_safepoints_regions_do_not_nest() {
        let w = word(Running, 0, false);
        begin_no_safepoints(&w).unwrap();
        assert!(current(&w).no_safepoints);
        assert!(begin_no_safepoints(&w).is_err());

        request_suspension(&w).unwrap();
        end_no_safepoints(&w).unwrap();
        assert_eq!(current(&w), StateSnapshot::new(AsyncSuspendRequested, 1, false));
        assert!(end_no_safepoints(&w).is_err());

        assert!(begin_no_safepoints(&word(Blocking, 0, false)).is_err());
    }

    #[test]
    fn test_suspend_resume_round_trip() {
        let starts = [
            StateSnapshot::new(Running, 0, false),
            StateSnapshot::new(Running, 0, true),
            StateSnapshot::new(Blocking, 0, false),
            StateSnapshot::new(SelfSuspended, 1, false),
            StateSnapshot::new(AsyncSuspended, 4, false),
            StateSnapshot::new(BlockingSuspendRequested, 2, false),
            StateSnapshot::new(BlockingAsyncSuspended, 1, false),
            StateSnapshot::new(BlockingSelfSuspended, 7, false),
        ];
        for start in starts {
            let w = ThreadStateWord::with_snapshot(start);
            request_suspension(&w).unwrap();
            request_resume(&w).unwrap();
            assert_eq!(current(&w), start, "round trip from {}", start);
        }
    }

    #[test]
    fn test_overlapping_requests_balance() {
        const N: u8 = 5;

        // First request lands through a safepoint poll; the rest overlap it.
        let w = word(Running, 0, false);
        request_suspension(&w).unwrap();
        poll_safepoint(&w).unwrap();
        for _ in 1..N {
            assert_eq!(
                request_suspension(&w).unwrap().verdict,
                SuspendVerdict::AlreadySuspended
            );
        }
        for _ in 1..N {
            assert_eq!(request_resume(&w).unwrap().verdict, ResumeVerdict::Done);
            assert_eq!(current(&w).state, SelfSuspended);
        }
        assert_eq!(
            request_resume(&w).unwrap().verdict,
            ResumeVerdict::MustSignalSelfResume
        );
        assert_eq!(current(&w), StateSnapshot::new(Running, 0, false));

        let w = word(Blocking, 0, false);
        for _ in 0..N {
            request_suspension(&w).unwrap();
        }
        for _ in 1..N {
            assert_eq!(request_resume(&w).unwrap().verdict, ResumeVerdict::Done);
            assert_eq!(current(&w).state, BlockingSuspendRequested);
        }
        assert_eq!(
            request_resume(&w).unwrap().verdict,
            ResumeVerdict::MustSignalBlockingResume
        );
        assert_eq!(current(&w), StateSnapshot::new(Blocking, 0, false));
    }
}
