//! Multi-threaded stress scenario.
//!
//! Mutator threads alternate between polling work, blocking regions and short
//! no-safepoints regions, each following its own deterministic schedule, while
//! the calling thread stops and restarts the world repeatedly. After every stop
//! each held thread must be observed in a suspended state.
use crate::{
    config::SuspendConfig,
    error::SuspendError,
    metrics::MetricsSnapshot,
    threading::{ManagedThread, SuspendOrchestrator},
    utils::sync::{Arc, AtomicBool, Ordering},
};
use serde::Serialize;
use std::{
    fmt, hint,
    sync::Barrier,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StressOptions {
    pub threads: usize,
    pub cycles: usize,
    /// Share of mutator steps spent in a blocking region, in `0.0..=1.0`.
    pub blocking_ratio: f64,
    /// Share of mutator steps spent in a no-safepoints region, in `0.0..=1.0`.
    pub no_safepoints_ratio: f64,
    pub seed: u64,
    pub config: SuspendConfig,
}

impl Default for StressOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            cycles: 100,
            blocking_ratio: 0.3,
            no_safepoints_ratio: 0.1,
            seed: 0x5EED,
            config: SuspendConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub threads: usize,
    pub cycles: usize,
    pub mutator_steps: u64,
    /// Held threads found outside a suspended state while the world was stopped
    pub violations: usize,
    pub elapsed_ms: u64,
    pub metrics: MetricsSnapshot,
}

impl fmt::Display for StressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} cycles against {} threads in {} ms ({} mutator steps, {} violations)",
            self.cycles, self.threads, self.elapsed_ms, self.mutator_steps, self.violations
        )?;
        write!(f, "{}", self.metrics)
    }
}

struct Schedule(u64);

impl Schedule {
    fn new(seed: u64) -> Self {
        Schedule(seed | 1)
    }

    /// Uniform in `0.0..1.0`.
    fn next(&mut self) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn spin(iterations: u32) {
    for i in 0..iterations {
        hint::black_box(i);
    }
}

fn mutate(
    thread: &ManagedThread,
    options: &StressOptions,
    seed: u64,
    stop: &AtomicBool,
) -> Result<u64, SuspendError> {
    let mut schedule = Schedule::new(seed);
    let mut steps = 0;

    while !stop.load(Ordering::Relaxed) {
        let roll = schedule.next();
        if roll < options.blocking_ratio {
            thread.with_blocking(|| thread::sleep(Duration::from_micros(50)))?;
        } else if roll < options.blocking_ratio + options.no_safepoints_ratio {
            let region = thread.no_safepoints()?;
            spin(200);
            // a no-op inside the region
            thread.poll_safepoint()?;
            region.end()?;
        } else {
            spin(500);
            thread.poll_safepoint()?;
        }
        steps += 1;
    }

    Ok(steps)
}

pub fn run_stress(options: &StressOptions) -> Result<StressReport, SuspendError> {
    let orchestrator = Arc::new(SuspendOrchestrator::new(options.config.clone()));
    let stop = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(Barrier::new(options.threads + 1));
    let started = Instant::now();

    let handles: Vec<_> = (0..options.threads)
        .map(|i| {
            let orchestrator = orchestrator.clone();
            let stop = stop.clone();
            let ready = ready.clone();
            let options = options.clone();
            thread::spawn(move || -> Result<u64, SuspendError> {
                let registered = orchestrator.register_thread(format!("mutator-{}", i));
                ready.wait();
                let thread = registered?;
                let seed = options.seed.wrapping_add(i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
                let steps = mutate(&thread, &options, seed, &stop);
                orchestrator.unregister_thread(&thread)?;
                steps
            })
        })
        .collect();

    ready.wait();
    let stopped = stop_repeatedly(&orchestrator, options.cycles);
    stop.store(true, Ordering::Relaxed);

    let mut mutator_steps = 0;
    let mut mutator_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(steps)) => mutator_steps += steps,
            Ok(Err(e)) => mutator_error = Some(e),
            Err(_) => warn!("mutator thread panicked"),
        }
    }

    let violations = stopped?;
    if let Some(e) = mutator_error {
        return Err(e);
    }

    Ok(StressReport {
        threads: options.threads,
        cycles: options.cycles,
        mutator_steps,
        violations,
        elapsed_ms: started.elapsed().as_millis() as u64,
        metrics: orchestrator.metrics().snapshot(),
    })
}

fn stop_repeatedly(orchestrator: &SuspendOrchestrator, cycles: usize) -> Result<usize, SuspendError> {
    let mut violations = 0;
    for cycle in 0..cycles {
        let world = orchestrator.stop_the_world()?;
        for t in world.suspended() {
            let suspended = t.snapshot().is_some_and(|s| s.state.is_suspended());
            if !suspended {
                warn!(cycle, "held thread is not suspended: {}", t.diagnostics());
                violations += 1;
            }
        }
        debug!(
            cycle,
            held = world.suspended().len(),
            pause_us = world.elapsed_micros(),
            "world stopped"
        );
        world.finish()?;
    }
    Ok(violations)
}
