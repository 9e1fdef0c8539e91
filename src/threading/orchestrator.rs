//! The suspend initiator's side of the protocol.
//!
//! A cycle runs under the initiator lock:
//!
//! ```text
//! lock_initiator -> begin_global_suspend -> suspend_one * N -> wait_pending_operations
//!     -> (inspect) -> resume_one * N -> wait_pending_operations -> end_global_suspend
//! ```
//!
//! [`SuspendOrchestrator::stop_the_world`] runs the whole sequence against every
//! registered thread and resumes them when its guard is dropped.
use crate::{
    config::{DefectPolicy, SuspendConfig, SuspendPolicy},
    error::SuspendError,
    metrics::SuspendMetrics,
    threading::{
        barrier::{BarrierCounts, SuspendBarrier},
        interrupt::{AsyncInterrupt, InterruptMechanism},
        registry::ThreadRegistry,
        state::ThreadState,
        thread::{ManagedThread, ThreadDiagnostics},
        transitions::{ResumeVerdict, SuspendVerdict},
        CURRENT_THREAD,
    },
    utils::{
        sync::{Arc, AtomicBool, AtomicUsize, Mutex, MutexGuard, Ordering},
        ManagedThreadId,
    },
};
use serde::Serialize;
use std::{
    fmt, thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

/// How `suspend_one` got (or failed to get) the thread to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SuspendOutcome {
    /// Pending until the thread's next safepoint poll.
    AwaitingSafepoint,
    /// Interrupt delivered; pending until its handler runs.
    Interrupted,
    /// The interrupt could not be delivered and the request was taken back. The
    /// thread keeps running.
    Aborted,
    /// The interrupt could not be delivered, but the thread had already parked
    /// itself; pending on its own confirmation.
    SelfSuspended,
    /// The thread is in a blocking region and counts as suspended.
    Blocking,
    /// Another request already holds the thread. Nothing to wait for.
    AlreadySuspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResumeOutcome {
    /// The thread held no suspend request.
    NotSuspended,
    /// Other requests still hold the thread.
    StillSuspended,
    /// The request had not landed yet and was taken back.
    Withdrawn,
    /// The thread never left its blocking region. Nothing to wait for.
    Released,
    /// The thread was woken; pending until it confirms.
    Signaled,
}

/// Everything an initiator knows about the threads it is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspendDiagnostics {
    pub cycle_active: bool,
    pub pending_operations: usize,
    pub barrier: BarrierCounts,
    pub threads: Vec<ThreadDiagnostics>,
}

impl SuspendDiagnostics {
    pub fn thread(&self, id: ManagedThreadId) -> Option<&ThreadDiagnostics> {
        self.threads.iter().find(|t| t.id == id)
    }
}

impl fmt::Display for SuspendDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "suspend state: cycle {}, {} pending, {} posts / {} waits",
            if self.cycle_active { "active" } else { "idle" },
            self.pending_operations,
            self.barrier.posts(),
            self.barrier.waits
        )?;
        for t in &self.threads {
            writeln!(f, "  {}", t)?;
        }
        Ok(())
    }
}

pub struct SuspendOrchestrator {
    config: SuspendConfig,
    interrupt: InterruptMechanism,
    barrier: Arc<SuspendBarrier>,
    registry: ThreadRegistry,
    initiator_lock: Mutex<()>,
    cycle_active: AtomicBool,
    pending: AtomicUsize,
    metrics: SuspendMetrics,
}

impl SuspendOrchestrator {
    pub fn new(config: SuspendConfig) -> Self {
        Self::with_interrupt(config, InterruptMechanism::default())
    }

    pub fn with_interrupt(config: SuspendConfig, interrupt: InterruptMechanism) -> Self {
        let barrier = Arc::new(SuspendBarrier::new());
        Self {
            registry: ThreadRegistry::new(barrier.clone(), config.defect_policy),
            config,
            interrupt,
            barrier,
            initiator_lock: Mutex::new(()),
            cycle_active: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            metrics: SuspendMetrics::new(),
        }
    }

    pub fn config(&self) -> &SuspendConfig {
        &self.config
    }

    pub fn interrupt(&self) -> &InterruptMechanism {
        &self.interrupt
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &SuspendMetrics {
        &self.metrics
    }

    pub fn is_cycle_active(&self) -> bool {
        self.cycle_active.load(Ordering::SeqCst)
    }

    pub fn pending_operations(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn barrier_counts(&self) -> BarrierCounts {
        self.barrier.counts()
    }

    /// Registers and attaches the calling OS thread. Waits for any running
    /// cycle to finish first, so a new thread never escapes a stop-the-world.
    pub fn register_thread(&self, name: impl Into<String>) -> Result<Arc<ManagedThread>, SuspendError> {
        let _lock = self.initiator_lock.lock();
        let thread = self.registry.register(name);
        if let Err(e) = thread.attach() {
            self.registry.unregister(thread.id());
            return Err(e);
        }
        CURRENT_THREAD.set(Some(thread.id()));
        Ok(thread)
    }

    /// Detaches and removes the calling thread's record. Must be called by the
    /// thread that registered it.
    pub fn unregister_thread(&self, thread: &ManagedThread) -> Result<(), SuspendError> {
        // stay suspendable while an initiator holds the lock
        let _lock = thread.with_blocking(|| self.initiator_lock.lock())?;
        thread.detach()?;
        self.registry.unregister(thread.id());
        if CURRENT_THREAD.get() == Some(thread.id()) {
            CURRENT_THREAD.set(None);
        }
        Ok(())
    }

    /// The calling thread's record, if it is registered here.
    pub fn current_thread(&self) -> Option<Arc<ManagedThread>> {
        CURRENT_THREAD.get().and_then(|id| self.registry.get(id))
    }

    /// Takes the process-wide initiator lock. A managed caller waits inside a
    /// blocking region, so the current lock holder can still suspend it.
    pub fn lock_initiator(&self) -> Result<InitiatorLock<'_>, SuspendError> {
        let current = self.current_thread();
        let guard = match &current {
            Some(thread) => thread.with_blocking(|| self.initiator_lock.lock())?,
            None => self.initiator_lock.lock(),
        };
        Ok(InitiatorLock {
            orchestrator: self,
            _guard: guard,
            initiator: current.map(|t| t.id()),
        })
    }

    /// Suspends every other registered thread. They are resumed when the guard
    /// is dropped or [`StopTheWorldGuard::finish`] is called.
    pub fn stop_the_world(&self) -> Result<StopTheWorldGuard<'_>, SuspendError> {
        let mut cycle = self.lock_initiator()?.begin_global_suspend()?;
        let mut suspended = Vec::new();
        if let Err(e) = cycle.suspend_all_into(&mut suspended) {
            // `suspended` holds every thread with a request from this cycle
            match cycle.resume_all(&suspended) {
                Ok(()) => {
                    if let Err(end_err) = cycle.end_global_suspend() {
                        warn!("failed to close aborted stop-the-world: {}", end_err);
                    }
                }
                Err(resume_err) => {
                    warn!("failed to resume threads after aborted stop-the-world: {}", resume_err);
                }
            }
            return Err(e);
        }
        debug!(threads = suspended.len(), "world stopped");
        Ok(StopTheWorldGuard {
            cycle: Some(cycle),
            suspended,
        })
    }

    pub fn dump_threads(&self) -> SuspendDiagnostics {
        SuspendDiagnostics {
            cycle_active: self.is_cycle_active(),
            pending_operations: self.pending_operations(),
            barrier: self.barrier.counts(),
            threads: self
                .registry
                .snapshot()
                .iter()
                .map(|t| t.diagnostics())
                .collect(),
        }
    }

    /// Logs an orchestrator-level defect and applies the defect policy.
    fn fail(&self, err: SuspendError) -> SuspendError {
        error!("suspend protocol defect: {}\n{}", err, self.dump_threads());
        if self.config.defect_policy == DefectPolicy::Panic {
            panic!("{}", err);
        }
        err
    }

    fn add_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }
}

/// Holds the initiator lock. At most one exists at a time.
pub struct InitiatorLock<'a> {
    orchestrator: &'a SuspendOrchestrator,
    _guard: MutexGuard<'a, ()>,
    initiator: Option<ManagedThreadId>,
}

impl<'a> InitiatorLock<'a> {
    pub fn initiator(&self) -> Option<ManagedThreadId> {
        self.initiator
    }

    pub fn begin_global_suspend(self) -> Result<SuspendCycle<'a>, SuspendError> {
        let o = self.orchestrator;
        let pending = o.pending_operations();
        if pending != 0 {
            return Err(o.fail(SuspendError::UnwaitedOperations(pending)));
        }
        let was_active = o.cycle_active.swap(true, Ordering::SeqCst);
        debug_assert!(!was_active, "suspend cycle active without the initiator lock");

        // confirmations that arrived after an abandoned cycle gave up on them
        let stray = o.barrier.drain();
        if stray != 0 {
            warn!(stray, "discarding stale suspend barrier posts");
        }
        o.barrier.reset_counts();
        debug!(initiator = ?self.initiator, "suspend cycle started");

        Ok(SuspendCycle {
            orchestrator: o,
            initiator: self.initiator,
            _lock: self,
            started: Instant::now(),
            finished: false,
        })
    }
}

/// An active suspend cycle. Holds the initiator lock until dropped.
///
/// Dropping it without [`end_global_suspend`] leaves the targets as they are
/// and only resets the cycle bookkeeping.
///
/// [`end_global_suspend`]: SuspendCycle::end_global_suspend
pub struct SuspendCycle<'a> {
    orchestrator: &'a SuspendOrchestrator,
    initiator: Option<ManagedThreadId>,
    _lock: InitiatorLock<'a>,
    started: Instant,
    finished: bool,
}

impl<'a> SuspendCycle<'a> {
    pub fn orchestrator(&self) -> &'a SuspendOrchestrator {
        self.orchestrator
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn check_target(&self, thread: &ManagedThread) -> Result<(), SuspendError> {
        if self.initiator == Some(thread.id()) {
            return Err(self.orchestrator.fail(SuspendError::SelfTarget(thread.id())));
        }
        Ok(())
    }

    pub fn suspend_one(&mut self, thread: &ManagedThread) -> Result<SuspendOutcome, SuspendError> {
        self.suspend_with_policy(thread, self.orchestrator.config.policy)
    }

    fn suspend_with_policy(
        &mut self,
        thread: &ManagedThread,
        policy: SuspendPolicy,
    ) -> Result<SuspendOutcome, SuspendError> {
        self.check_target(thread)?;
        let o = self.orchestrator;
        SuspendMetrics::bump(&o.metrics.suspend_requests);

        let outcome = match thread.request_suspension()?.verdict {
            SuspendVerdict::InitiateAsyncSuspend => {
                SuspendMetrics::bump(&o.metrics.async_suspends);
                match policy {
                    SuspendPolicy::Cooperative => {
                        o.add_pending();
                        SuspendOutcome::AwaitingSafepoint
                    }
                    SuspendPolicy::Preemptive if o.interrupt.request_async_interrupt(thread) => {
                        o.add_pending();
                        SuspendOutcome::Interrupted
                    }
                    SuspendPolicy::Preemptive => {
                        SuspendMetrics::bump(&o.metrics.interrupt_failures);
                        if thread.abort_async_suspend()?.verdict {
                            SuspendMetrics::bump(&o.metrics.aborted_suspends);
                            SuspendOutcome::Aborted
                        } else {
                            SuspendMetrics::bump(&o.metrics.self_suspend_races);
                            o.add_pending();
                            SuspendOutcome::SelfSuspended
                        }
                    }
                }
            }
            SuspendVerdict::InitiateBlockingSuspend => {
                SuspendMetrics::bump(&o.metrics.blocking_suspends);
                // the thread is in a safe region; confirm on its behalf
                o.add_pending();
                o.barrier.notify_suspended();
                // lands as BLOCKING_ASYNC_SUSPENDED if it leaves the region
                if policy == SuspendPolicy::Preemptive && !o.interrupt.request_async_interrupt(thread) {
                    // it parks on its own when it leaves instead
                    SuspendMetrics::bump(&o.metrics.interrupt_failures);
                }
                SuspendOutcome::Blocking
            }
            SuspendVerdict::AlreadySuspended | SuspendVerdict::AlreadySuspendedBlocking => {
                SuspendMetrics::bump(&o.metrics.already_suspended);
                SuspendOutcome::AlreadySuspended
            }
        };

        debug!(thread = %thread.id(), ?outcome, "suspend requested");
        Ok(outcome)
    }

    pub fn resume_one(&mut self, thread: &ManagedThread) -> Result<ResumeOutcome, SuspendError> {
        self.check_target(thread)?;
        let o = self.orchestrator;

        let outcome = match thread.request_resume()?.verdict {
            ResumeVerdict::Error => ResumeOutcome::NotSuspended,
            ResumeVerdict::Done => ResumeOutcome::StillSuspended,
            ResumeVerdict::Withdrawn => {
                // the request never landed, so its confirmation never comes
                let _ = o
                    .pending
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1));
                ResumeOutcome::Withdrawn
            }
            ResumeVerdict::MustSignalBlockingResume => ResumeOutcome::Released,
            ResumeVerdict::MustSignalSelfResume => {
                thread.signal_resume();
                o.add_pending();
                SuspendMetrics::bump(&o.metrics.resumes_signaled);
                ResumeOutcome::Signaled
            }
            ResumeVerdict::MustSignalAsyncResume => {
                if !o.interrupt.request_async_resume(thread) {
                    return Err(o.fail(SuspendError::ResumeFailed(thread.id())));
                }
                o.add_pending();
                SuspendMetrics::bump(&o.metrics.resumes_signaled);
                ResumeOutcome::Signaled
            }
        };

        debug!(thread = %thread.id(), ?outcome, "resume requested");
        Ok(outcome)
    }

    /// Lets a thread parked by an interrupt inside a blocking region run until
    /// it parks again, keeping it counted as suspended.
    pub fn pulse_one(&mut self, thread: &ManagedThread) -> Result<(), SuspendError> {
        self.check_target(thread)?;
        let o = self.orchestrator;
        thread.request_pulse()?;
        if !o.interrupt.request_async_resume(thread) {
            return Err(o.fail(SuspendError::ResumeFailed(thread.id())));
        }
        o.add_pending();
        SuspendMetrics::bump(&o.metrics.pulses);
        debug!(thread = %thread.id(), "pulsed");
        Ok(())
    }

    /// Waits for one confirmation per pending operation.
    ///
    /// Threads that have not confirmed after `warn_after` are logged. A wait
    /// still unsatisfied after `wait_timeout` is a hang: the full thread dump is
    /// logged and the error escalated according to the defect policy. The
    /// unconfirmed operations stay pending, so resuming the targets and waiting
    /// again settles the barrier.
    pub fn wait_pending_operations(&mut self) -> Result<(), SuspendError> {
        let o = self.orchestrator;
        let pending = o.pending.swap(0, Ordering::SeqCst);
        if pending == 0 {
            return Ok(());
        }

        let started = Instant::now();
        let warn_at = started + o.config.warn_after.min(o.config.wait_timeout);
        let deadline = started + o.config.wait_timeout;
        let mut warned = false;

        for done in 0..pending {
            if !warned {
                if o.barrier.wait_timeout(warn_at.saturating_duration_since(Instant::now())) {
                    continue;
                }
                warned = true;
                self.warn_slow(started.elapsed(), pending - done);
            }

            if !o.barrier.wait_timeout(deadline.saturating_duration_since(Instant::now())) {
                o.pending.fetch_add(pending - done, Ordering::SeqCst);
                return Err(self.timed_out(started.elapsed(), pending - done));
            }
        }

        if warned {
            warn!(
                "suspend barrier completed after {} ms",
                started.elapsed().as_millis()
            );
        }
        Ok(())
    }

    fn warn_slow(&self, waited: Duration, remaining: usize) {
        let o = self.orchestrator;
        warn!(
            "suspend barrier taking longer than expected: {} of {} ms, {} confirmations outstanding",
            waited.as_millis(),
            o.config.wait_timeout.as_millis(),
            remaining
        );
        for t in o.registry.snapshot() {
            if Some(t.id()) == self.initiator {
                continue;
            }
            let Some(snapshot) = t.snapshot() else {
                continue;
            };
            let settled = snapshot.state.is_suspended()
                || matches!(snapshot.state, ThreadState::Starting | ThreadState::Detached);
            if !settled {
                warn!("  - {}", t.diagnostics());
            }
        }
    }

    fn timed_out(&self, waited: Duration, pending: usize) -> SuspendError {
        let o = self.orchestrator;
        SuspendMetrics::bump(&o.metrics.barrier_timeouts);
        let dump = o.dump_threads();
        error!(
            "suspend barrier timed out after {} ms with {} pending operations\n{}",
            waited.as_millis(),
            pending,
            dump
        );
        let err = SuspendError::Timeout {
            waited,
            pending,
            dump: Box::new(dump),
        };
        if o.config.defect_policy == DefectPolicy::Panic {
            panic!("{}", err);
        }
        err
    }

    /// Suspends every live registered thread other than the initiator and waits
    /// for all of them. Returns the threads this cycle now holds.
    pub fn suspend_all(&mut self) -> Result<Vec<Arc<ManagedThread>>, SuspendError> {
        let mut held = Vec::new();
        self.suspend_all_into(&mut held)?;
        Ok(held)
    }

    /// Collects into `held` every thread that carries a request from this
    /// cycle. On error `held` still names exactly those threads, so resuming
    /// them undoes the attempt.
    fn suspend_all_into(&mut self, held: &mut Vec<Arc<ManagedThread>>) -> Result<(), SuspendError> {
        let o = self.orchestrator;
        let mut candidates: Vec<_> = o
            .registry
            .snapshot()
            .into_iter()
            .filter(|t| Some(t.id()) != self.initiator && t.is_live())
            .collect();

        let mut attempt = 0;
        while !candidates.is_empty() {
            attempt += 1;
            for t in candidates.drain(..) {
                if self.suspend_one(&t)? == SuspendOutcome::Aborted {
                    // no interrupt available, wait for a safepoint instead
                    SuspendMetrics::bump(&o.metrics.suspend_retries);
                    self.suspend_with_policy(&t, SuspendPolicy::Cooperative)?;
                }
                held.push(t);
            }

            self.wait_pending_operations()?;

            // an interrupt that landed inside a no-safepoints region gives the
            // request back; ask again
            held.retain(|t| {
                let released = t
                    .snapshot()
                    .is_some_and(|s| matches!(s.state, ThreadState::Running | ThreadState::Blocking));
                if released {
                    candidates.push(t.clone());
                }
                !released
            });

            if let Some(t) = candidates.first() {
                if attempt >= o.config.max_suspend_attempts {
                    return Err(o.fail(SuspendError::SuspendRetriesExhausted {
                        thread: t.id(),
                        attempts: attempt,
                    }));
                }
                SuspendMetrics::bump(&o.metrics.suspend_retries);
                thread::sleep(Duration::from_micros(50 << attempt.min(10)));
            }
        }
        Ok(())
    }

    /// Resumes `threads` and waits for every woken thread to confirm.
    pub fn resume_all(&mut self, threads: &[Arc<ManagedThread>]) -> Result<(), SuspendError> {
        for t in threads {
            self.resume_one(t)?;
        }
        self.wait_pending_operations()
    }

    /// Closes the cycle and releases the initiator lock.
    pub fn end_global_suspend(mut self) -> Result<(), SuspendError> {
        let o = self.orchestrator;
        let pending = o.pending_operations();
        if pending != 0 {
            return Err(o.fail(SuspendError::UnwaitedOperations(pending)));
        }
        o.barrier.check_balance().map_err(|e| o.fail(e))?;

        let pause = self.started.elapsed();
        o.metrics.record_pause(pause);
        o.cycle_active.store(false, Ordering::SeqCst);
        self.finished = true;
        debug!(pause_us = pause.as_micros() as u64, "suspend cycle ended");
        Ok(())
    }
}

impl Drop for SuspendCycle<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let o = self.orchestrator;
        warn!(
            pending = o.pending_operations(),
            "suspend cycle dropped without end_global_suspend"
        );
        o.pending.store(0, Ordering::SeqCst);
        o.cycle_active.store(false, Ordering::SeqCst);
    }
}

/// A stopped world. Resumes every thread it suspended when dropped.
pub struct StopTheWorldGuard<'a> {
    cycle: Option<SuspendCycle<'a>>,
    suspended: Vec<Arc<ManagedThread>>,
}

impl<'a> StopTheWorldGuard<'a> {
    pub fn suspended(&self) -> &[Arc<ManagedThread>] {
        &self.suspended
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.cycle
            .as_ref()
            .map_or(0, |c| c.elapsed().as_micros() as u64)
    }

    /// Resumes everything and ends the cycle, returning any error.
    pub fn finish(mut self) -> Result<(), SuspendError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), SuspendError> {
        let Some(mut cycle) = self.cycle.take() else {
            return Ok(());
        };
        cycle.resume_all(&self.suspended)?;
        cycle.end_global_suspend()
    }
}

impl Drop for StopTheWorldGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to restart the world: {}", e);
        }
    }
}
