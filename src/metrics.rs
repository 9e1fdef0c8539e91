use crate::utils::sync::{AtomicU64, Ordering};
use serde::Serialize;
use std::{fmt, time::Duration};

/// Suspend protocol counters.
///
/// All counters use `Ordering::Relaxed`: they are independent and never used to
/// synchronize anything, only read back for reports.
#[derive(Debug, Default)]
pub struct SuspendMetrics {
    /// Completed suspend cycles
    pub cycles: AtomicU64,
    /// Total time between begin and end of a cycle (in microseconds)
    pub pause_total_us: AtomicU64,
    /// Longest single cycle (in microseconds)
    pub pause_max_us: AtomicU64,
    pub suspend_requests: AtomicU64,
    pub async_suspends: AtomicU64,
    pub blocking_suspends: AtomicU64,
    pub already_suspended: AtomicU64,
    /// Interrupts the platform mechanism refused
    pub interrupt_failures: AtomicU64,
    /// Aborted interrupts that found the thread already self-suspended
    pub self_suspend_races: AtomicU64,
    /// Suspensions taken back because the interrupt could not land
    pub aborted_suspends: AtomicU64,
    /// Threads `suspend_all` had to ask again
    pub suspend_retries: AtomicU64,
    pub resumes_signaled: AtomicU64,
    pub pulses: AtomicU64,
    pub barrier_timeouts: AtomicU64,
}

impl SuspendMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pause(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.pause_total_us.fetch_add(us, Ordering::Relaxed);
        self.pause_max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let cycles = load(&self.cycles);
        let pause_total_us = load(&self.pause_total_us);
        MetricsSnapshot {
            cycles,
            pause_total_us,
            pause_max_us: load(&self.pause_max_us),
            pause_mean_us: if cycles == 0 { 0 } else { pause_total_us / cycles },
            suspend_requests: load(&self.suspend_requests),
            async_suspends: load(&self.async_suspends),
            blocking_suspends: load(&self.blocking_suspends),
            already_suspended: load(&self.already_suspended),
            interrupt_failures: load(&self.interrupt_failures),
            self_suspend_races: load(&self.self_suspend_races),
            aborted_suspends: load(&self.aborted_suspends),
            suspend_retries: load(&self.suspend_retries),
            resumes_signaled: load(&self.resumes_signaled),
            pulses: load(&self.pulses),
            barrier_timeouts: load(&self.barrier_timeouts),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub pause_total_us: u64,
    pub pause_max_us: u64,
    pub pause_mean_us: u64,
    pub suspend_requests: u64,
    pub async_suspends: u64,
    pub blocking_suspends: u64,
    pub already_suspended: u64,
    pub interrupt_failures: u64,
    pub self_suspend_races: u64,
    pub aborted_suspends: u64,
    pub suspend_retries: u64,
    pub resumes_signaled: u64,
    pub pulses: u64,
    pub barrier_timeouts: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Suspend Statistics:")?;
        writeln!(f, "  Cycles:              {:>10}", self.cycles)?;
        writeln!(
            f,
            "  Pause (us):          total {:>10}, mean {:>8}, max {:>8}",
            self.pause_total_us, self.pause_mean_us, self.pause_max_us
        )?;
        writeln!(f, "  Suspend requests:    {:>10}", self.suspend_requests)?;
        writeln!(f, "    async:             {:>10}", self.async_suspends)?;
        writeln!(f, "    blocking:          {:>10}", self.blocking_suspends)?;
        writeln!(f, "    already suspended: {:>10}", self.already_suspended)?;
        writeln!(f, "  Interrupt failures:  {:>10}", self.interrupt_failures)?;
        writeln!(f, "  Self-suspend races:  {:>10}", self.self_suspend_races)?;
        writeln!(f, "  Aborted suspends:    {:>10}", self.aborted_suspends)?;
        writeln!(f, "  Suspend retries:     {:>10}", self.suspend_retries)?;
        writeln!(f, "  Resumes signaled:    {:>10}", self.resumes_signaled)?;
        writeln!(f, "  Pulses:              {:>10}", self.pulses)?;
        writeln!(f, "  Barrier timeouts:    {:>10}", self.barrier_timeouts)?;
        Ok(())
    }
}
