//! The per-thread control record and the protocol drivers a managed thread runs
//! on itself.
//!
//! The raw transitions in [`super::transitions`] only move the state word. The
//! drivers here add the other half of the protocol: confirming on the suspend
//! barrier, parking on the resume semaphore, and running the interrupt handler
//! when an asynchronous interrupt is pending.
use crate::{
    config::DefectPolicy,
    error::{ProtocolDefect, SuspendError},
    threading::{
        barrier::SuspendBarrier,
        state::{StateSnapshot, ThreadState, ThreadStateWord, Transition},
        transitions::{
            self, AbortBlockingVerdict, EnterBlockingVerdict, LeaveBlockingVerdict, Operation,
            PollVerdict, PulseVerdict, ResumeVerdict, SuspendVerdict,
        },
    },
    utils::{
        sync::{Arc, AtomicBool, Ordering, Semaphore},
        ManagedThreadId,
    },
};
use serde::Serialize;
use std::{
    fmt,
    sync::OnceLock,
    thread::ThreadId,
};
use tracing::{debug, error, trace, warn};

#[cfg(any(debug_assertions, feature = "suspend-validation"))]
use crate::utils::{ring_buffer::TransitionRingBuffer, sync::Mutex};

/// Control record of one managed thread.
///
/// Shared between the thread itself and any suspend initiator. Only the owning
/// thread may call the self-transition drivers ([`poll_safepoint`],
/// [`enter_blocking`], ...); the initiator-side wrappers are for the orchestrator.
///
/// [`poll_safepoint`]: ManagedThread::poll_safepoint
/// [`enter_blocking`]: ManagedThread::enter_blocking
#[derive(Debug)]
pub struct ManagedThread {
    id: ManagedThreadId,
    name: String,
    state: ThreadStateWord,
    resume: Semaphore,
    barrier: Arc<SuspendBarrier>,
    interrupt_pending: AtomicBool,
    defect_policy: DefectPolicy,
    native_id: OnceLock<ThreadId>,
    #[cfg(any(debug_assertions, feature = "suspend-validation"))]
    history: Mutex<TransitionRingBuffer>,
}

impl ManagedThread {
    pub fn new(
        id: ManagedThreadId,
        name: String,
        barrier: Arc<SuspendBarrier>,
        defect_policy: DefectPolicy,
    ) -> Self {
        Self {
            id,
            name,
            state: ThreadStateWord::new(),
            resume: Semaphore::new(0),
            barrier,
            interrupt_pending: AtomicBool::new(false),
            defect_policy,
            native_id: OnceLock::new(),
            #[cfg(any(debug_assertions, feature = "suspend-validation"))]
            history: Mutex::new(TransitionRingBuffer::new()),
        }
    }

    pub fn id(&self) -> ManagedThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread that attached this record, once attached.
    pub fn native_id(&self) -> Option<ThreadId> {
        self.native_id.get().copied()
    }

    pub fn state_word(&self) -> &ThreadStateWord {
        &self.state
    }

    pub fn snapshot(&self) -> Option<StateSnapshot> {
        self.state.load().ok()
    }

    pub fn is_live(&self) -> bool {
        self.snapshot().is_some_and(|s| s.state.is_live())
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt_pending.load(Ordering::SeqCst)
    }

    pub(crate) fn raise_interrupt(&self) {
        self.interrupt_pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn signal_resume(&self) {
        self.resume.post();
    }

    /// Most recent transitions, oldest first. Empty when validation is compiled out.
    pub fn history(&self) -> Vec<String> {
        #[cfg(any(debug_assertions, feature = "suspend-validation"))]
        {
            self.history.lock().entries()
        }
        #[cfg(not(any(debug_assertions, feature = "suspend-validation")))]
        {
            Vec::new()
        }
    }

    fn record<V: fmt::Debug>(&self, t: &Transition<V>) {
        trace!(
            thread = %self.id,
            operation = %t.operation,
            before = %t.before,
            after = %t.after,
            verdict = ?t.verdict,
            "state transition"
        );
        #[cfg(any(debug_assertions, feature = "suspend-validation"))]
        self.history
            .lock()
            .push(format!("{} {} -> {}", t.operation, t.before, t.after));
    }

    /// Logs a defect with the thread's history and applies the defect policy.
    pub(crate) fn escalate(&self, defect: ProtocolDefect) -> SuspendError {
        error!(
            thread = %self.id,
            name = %self.name,
            %defect,
            "suspend protocol defect, recent transitions:\n{}",
            self.history().join("\n")
        );
        if self.defect_policy == DefectPolicy::Panic {
            panic!("protocol defect on thread {}: {}", self.id, defect);
        }
        SuspendError::Defect {
            thread: self.id,
            defect,
        }
    }

    fn apply<V: fmt::Debug>(
        &self,
        step: impl FnOnce(&ThreadStateWord) -> Result<Transition<V>, ProtocolDefect>,
    ) -> Result<Transition<V>, SuspendError> {
        match step(&self.state) {
            Ok(t) => {
                self.record(&t);
                Ok(t)
            }
            Err(defect) => Err(self.escalate(defect)),
        }
    }

    fn load(&self, operation: Operation) -> Result<StateSnapshot, SuspendError> {
        self.state.load().map_err(|raw| {
            self.escalate(ProtocolDefect::new(
                operation,
                raw,
                "state word holds an unknown state",
            ))
        })
    }

    // Initiator side.

    pub fn request_suspension(&self) -> Result<Transition<SuspendVerdict>, SuspendError> {
        self.apply(transitions::request_suspension)
    }

    pub fn request_resume(&self) -> Result<Transition<ResumeVerdict>, SuspendError> {
        self.apply(transitions::request_resume)
    }

    pub fn request_pulse(&self) -> Result<Transition<PulseVerdict>, SuspendError> {
        self.apply(transitions::request_pulse)
    }

    pub fn abort_async_suspend(&self) -> Result<Transition<bool>, SuspendError> {
        self.apply(transitions::abort_async_suspend)
    }

    pub fn peek_blocking_suspend_requested(&self) -> Result<bool, SuspendError> {
        transitions::peek_blocking_suspend_requested(&self.state).map_err(|d| self.escalate(d))
    }

    // Thread side.

    pub fn attach(&self) -> Result<(), SuspendError> {
        let _ = self.native_id.set(std::thread::current().id());
        self.apply(transitions::attach)?;
        debug!(thread = %self.id, name = %self.name, "attached");
        Ok(())
    }

    /// Moves to DETACHED, first letting any pending suspend request land and be
    /// resumed.
    pub fn detach(&self) -> Result<(), SuspendError> {
        loop {
            self.service_pending_interrupt()?;
            if self.apply(transitions::detach)?.verdict {
                debug!(thread = %self.id, name = %self.name, "detached");
                return Ok(());
            }

            match self.load(Operation::Detach)?.state {
                ThreadState::BlockingSuspendRequested => self.abort_blocking()?,
                _ => self.poll_safepoint()?,
            }
        }
    }

    /// Cooperative safepoint. Parks if a suspend request is pending, and returns
    /// once the thread has been resumed.
    ///
    /// Inside a no-safepoints region this never parks. A pending interrupt is
    /// still handled, which takes its suspend request back.
    pub fn poll_safepoint(&self) -> Result<(), SuspendError> {
        if self.load(Operation::PollSafepoint)?.no_safepoints {
            self.service_pending_interrupt()?;
            return Ok(());
        }

        if self.service_pending_interrupt()? {
            return Ok(());
        }

        match self.apply(transitions::poll_safepoint)?.verdict {
            PollVerdict::ContinueRunning => {}
            PollVerdict::ParkAndNotify => {
                self.barrier.notify_suspended();
                self.park();
            }
        }
        Ok(())
    }

    fn park(&self) {
        debug!(thread = %self.id, "parked");
        self.resume.wait();
        self.barrier.notify_resumed();
        debug!(thread = %self.id, "resumed");
    }

    /// Runs the interrupt handler if an interrupt is pending. Returns `true` if
    /// the thread parked (and has been resumed since).
    fn service_pending_interrupt(&self) -> Result<bool, SuspendError> {
        if !self.interrupt_pending.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let snapshot = self.load(Operation::FinishAsyncSuspend)?;
        match snapshot.state {
            ThreadState::AsyncSuspendRequested if snapshot.no_safepoints => {
                let Some(t) = self.interrupt_step(transitions::abort_async_suspend)? else {
                    return Ok(false);
                };
                if t.verdict {
                    debug!(thread = %self.id, "interrupt landed in a no-safepoints region, aborted");
                    self.barrier.notify_aborted();
                }
                Ok(false)
            }
            ThreadState::AsyncSuspendRequested | ThreadState::BlockingSuspendRequested => {
                let Some(t) = self.interrupt_step(transitions::finish_async_suspend)? else {
                    return Ok(false);
                };
                if !t.verdict {
                    return Ok(false);
                }
                // a blocking suspend was already confirmed by the initiator
                if t.before.state == ThreadState::AsyncSuspendRequested {
                    self.barrier.notify_suspended();
                }
                self.park();
                Ok(true)
            }
            _ => {
                trace!(thread = %self.id, state = %snapshot, "dropping stale interrupt");
                Ok(false)
            }
        }
    }

    /// An interrupt step may race with the initiator taking its request back.
    /// That race yields `None`; any other rejection is a defect.
    fn interrupt_step<V: fmt::Debug>(
        &self,
        step: impl FnOnce(&ThreadStateWord) -> Result<Transition<V>, ProtocolDefect>,
    ) -> Result<Option<Transition<V>>, SuspendError> {
        match step(&self.state) {
            Ok(t) => {
                self.record(&t);
                Ok(Some(t))
            }
            Err(defect) => match self.state.load() {
                Ok(now) if matches!(now.state, ThreadState::Running | ThreadState::Blocking) => {
                    trace!(thread = %self.id, state = %now, "interrupt outlived its request");
                    Ok(None)
                }
                _ => Err(self.escalate(defect)),
            },
        }
    }

    pub fn enter_blocking(&self) -> Result<(), SuspendError> {
        loop {
            match self.apply(transitions::enter_blocking)?.verdict {
                EnterBlockingVerdict::Continue => return Ok(()),
                EnterBlockingVerdict::PollAndRetry => self.poll_safepoint()?,
            }
        }
    }

    pub fn leave_blocking(&self) -> Result<(), SuspendError> {
        loop {
            if self.service_pending_interrupt()? {
                continue;
            }
            match self.apply(transitions::leave_blocking)?.verdict {
                LeaveBlockingVerdict::Done => return Ok(()),
                LeaveBlockingVerdict::Wait => {
                    self.park();
                    return Ok(());
                }
            }
        }
    }

    pub fn abort_blocking(&self) -> Result<(), SuspendError> {
        loop {
            if self.service_pending_interrupt()? {
                continue;
            }
            match self.apply(transitions::abort_blocking)?.verdict {
                AbortBlockingVerdict::Ignore | AbortBlockingVerdict::Ok => return Ok(()),
                AbortBlockingVerdict::IgnoreAndPoll => return self.poll_safepoint(),
                AbortBlockingVerdict::Wait => {
                    self.park();
                    return Ok(());
                }
            }
        }
    }

    /// Runs `f` inside a blocking region, so the thread counts as suspended for
    /// as long as `f` runs.
    pub fn with_blocking<R>(&self, f: impl FnOnce() -> R) -> Result<R, SuspendError> {
        self.enter_blocking()?;
        let result = f();
        self.leave_blocking()?;
        Ok(result)
    }

    /// Opens a no-safepoints region, closed when the guard is dropped.
    pub fn no_safepoints(&self) -> Result<NoSafepointsGuard<'_>, SuspendError> {
        self.apply(transitions::begin_no_safepoints)?;
        Ok(NoSafepointsGuard {
            thread: self,
            ended: false,
        })
    }

    fn end_no_safepoints(&self) -> Result<(), SuspendError> {
        self.apply(transitions::end_no_safepoints)?;
        // a request may have arrived while the region was open
        self.poll_safepoint()
    }

    pub fn diagnostics(&self) -> ThreadDiagnostics {
        let raw = self.state.raw();
        let snapshot = StateSnapshot::decode(raw);
        ThreadDiagnostics {
            id: self.id,
            name: self.name.clone(),
            native_id: self.native_id().map(|id| format!("{:?}", id)),
            raw_word: raw,
            state: snapshot.map(|s| s.state),
            suspend_count: snapshot.map_or(0, |s| s.suspend_count),
            no_safepoints: snapshot.is_some_and(|s| s.no_safepoints),
            interrupt_pending: self.interrupt_pending(),
            history: self.history(),
        }
    }
}

/// Keeps a no-safepoints region open. Dropping it closes the region and polls.
pub struct NoSafepointsGuard<'a> {
    thread: &'a ManagedThread,
    ended: bool,
}

impl NoSafepointsGuard<'_> {
    /// Closes the region, returning any error instead of logging it.
    pub fn end(mut self) -> Result<(), SuspendError> {
        self.ended = true;
        self.thread.end_no_safepoints()
    }
}

impl Drop for NoSafepointsGuard<'_> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if let Err(e) = self.thread.end_no_safepoints() {
            warn!(thread = %self.thread.id, "failed to close no-safepoints region: {}", e);
        }
    }
}

/// Point-in-time view of one thread for diagnostic dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadDiagnostics {
    pub id: ManagedThreadId,
    pub name: String,
    pub native_id: Option<String>,
    pub raw_word: u32,
    pub state: Option<ThreadState>,
    pub suspend_count: u8,
    pub no_safepoints: bool,
    pub interrupt_pending: bool,
    pub history: Vec<String>,
}

impl fmt::Display for ThreadDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread {} ({}): ", self.id, self.name)?;
        match self.state {
            Some(state) => write!(
                f,
                "{}",
                StateSnapshot::new(state, self.suspend_count, self.no_safepoints)
            )?,
            None => write!(f, "<invalid state word {:#x}>", self.raw_word)?,
        }
        if self.interrupt_pending {
            f.write_str(" [interrupt pending]")?;
        }
        for entry in &self.history {
            write!(f, "\n    {}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    fn thread_with(policy: DefectPolicy) -> Arc<ManagedThread> {
        thread_with_barrier(policy, Arc::new(SuspendBarrier::new()))
    }

    fn thread_with_barrier(policy: DefectPolicy, barrier: Arc<SuspendBarrier>) -> Arc<ManagedThread> {
        Arc::new(ManagedThread::new(
            ManagedThreadId::new(7),
            "worker".to_string(),
            barrier,
            policy,
        ))
    }

    fn wait_for_state(t: &ManagedThread, state: ThreadState) {
        for _ in 0..10_000 {
            if t.snapshot().map(|s| s.state) == Some(state) {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("thread never reached {}", state);
    }

    #[test]
    fn test_blocking_region_without_requests() {
        let t = thread_with(DefectPolicy::Propagate);
        t.attach().unwrap();
        assert_eq!(t.with_blocking(|| 42).unwrap(), 42);
        t.poll_safepoint().unwrap();
        assert_eq!(t.snapshot(), Some(StateSnapshot::new(ThreadState::Running, 0, false)));
        t.detach().unwrap();
        assert!(!t.is_live());
    }

    #[test]
    fn test_defect_propagates() {
        let t = thread_with(DefectPolicy::Propagate);
        t.attach().unwrap();
        let err = t.attach().unwrap_err();
        let defect = err.defect().unwrap();
        assert_eq!(defect.operation, Operation::Attach);
        assert_eq!(err.to_string(), format!("protocol defect on thread 7: {}", defect));
    }

    #[test]
    #[should_panic(expected = "protocol defect on thread 7")]
    fn test_defect_panics_by_default() {
        let t = thread_with(DefectPolicy::Panic);
        t.leave_blocking().unwrap_err();
    }

    #[test]
    fn test_no_safepoints_guard() {
        let t = thread_with(DefectPolicy::Propagate);
        t.attach().unwrap();
        {
            let _guard = t.no_safepoints().unwrap();
            assert!(t.snapshot().unwrap().no_safepoints);
            // polling is a no-op inside the region
            t.poll_safepoint().unwrap();
            assert!(t.enter_blocking().is_err());
        }
        assert_eq!(t.snapshot(), Some(StateSnapshot::new(ThreadState::Running, 0, false)));

        let guard = t.no_safepoints().unwrap();
        guard.end().unwrap();
        assert!(!t.snapshot().unwrap().no_safepoints);
    }

    #[test]
    fn test_interrupt_inside_no_safepoints_is_aborted() {
        let barrier = Arc::new(SuspendBarrier::new());
        let t = thread_with_barrier(DefectPolicy::Propagate, barrier.clone());
        t.attach().unwrap();
        let guard = t.no_safepoints().unwrap();

        assert_eq!(
            t.request_suspension().unwrap().verdict,
            SuspendVerdict::InitiateAsyncSuspend
        );
        t.raise_interrupt();
        t.poll_safepoint().unwrap();

        assert!(!t.interrupt_pending());
        assert_eq!(t.snapshot(), Some(StateSnapshot::new(ThreadState::Running, 0, true)));
        #[cfg(debug_assertions)]
        assert_eq!(barrier.counts().abort_posts, 1);

        guard.end().unwrap();
    }

    #[test]
    fn test_stale_interrupt_is_dropped() {
        let t = thread_with(DefectPolicy::Propagate);
        t.attach().unwrap();
        t.raise_interrupt();
        t.poll_safepoint().unwrap();
        assert!(!t.interrupt_pending());
        assert_eq!(t.snapshot().unwrap().state, ThreadState::Running);
    }

    #[test]
    fn test_detach_waits_out_blocking_suspend() {
        let t = thread_with(DefectPolicy::Propagate);
        t.attach().unwrap();
        t.enter_blocking().unwrap();
        assert_eq!(
            t.request_suspension().unwrap().verdict,
            SuspendVerdict::InitiateBlockingSuspend
        );
        assert!(t.peek_blocking_suspend_requested().unwrap());

        let initiator = {
            let t = t.clone();
            thread::spawn(move || {
                wait_for_state(&t, ThreadState::BlockingSelfSuspended);
                assert_eq!(
                    t.request_resume().unwrap().verdict,
                    ResumeVerdict::MustSignalSelfResume
                );
                t.signal_resume();
            })
        };

        t.detach().unwrap();
        initiator.join().unwrap();
        assert_eq!(t.snapshot().unwrap().state, ThreadState::Detached);
    }

    #[test]
    fn test_diagnostics_render() {
        let t = thread_with(DefectPolicy::Propagate);
        t.attach().unwrap();
        let diag = t.diagnostics();
        assert_eq!(diag.state, Some(ThreadState::Running));
        assert!(diag.to_string().starts_with("thread 7 (worker): RUNNING(count=0)"));
        #[cfg(debug_assertions)]
        assert_eq!(diag.history, vec!["#0 attach STARTING(count=0) -> RUNNING(count=0)"]);
    }
}
