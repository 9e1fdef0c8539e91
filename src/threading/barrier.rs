use crate::{
    error::SuspendError,
    utils::sync::Semaphore,
};
use std::time::Duration;

#[cfg(any(debug_assertions, feature = "suspend-validation"))]
use crate::utils::sync::{AtomicUsize, Ordering};

/// Per-cycle confirmation barrier between the initiator and its targets.
///
/// Target threads post once when they confirm a suspension, a resumption or an
/// aborted interrupt; the initiator waits once per pending operation. With
/// validation enabled, every post and wait is counted so the two sides can be
/// checked against each other at the end of a cycle.
#[derive(Debug, Default)]
pub struct SuspendBarrier {
    semaphore: Semaphore,
    #[cfg(any(debug_assertions, feature = "suspend-validation"))]
    counters: BarrierCounters,
}

#[cfg(any(debug_assertions, feature = "suspend-validation"))]
#[derive(Debug, Default)]
struct BarrierCounters {
    suspend_posts: AtomicUsize,
    resume_posts: AtomicUsize,
    abort_posts: AtomicUsize,
    waits: AtomicUsize,
}

/// Post/wait totals since the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BarrierCounts {
    pub suspend_posts: usize,
    pub resume_posts: usize,
    pub abort_posts: usize,
    pub waits: usize,
}

impl BarrierCounts {
    pub fn posts(&self) -> usize {
        self.suspend_posts + self.resume_posts + self.abort_posts
    }
}

impl SuspendBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_suspended(&self) {
        #[cfg(any(debug_assertions, feature = "suspend-validation"))]
        self.counters.suspend_posts.fetch_add(1, Ordering::SeqCst);
        self.semaphore.post();
    }

    pub fn notify_resumed(&self) {
        #[cfg(any(debug_assertions, feature = "suspend-validation"))]
        self.counters.resume_posts.fetch_add(1, Ordering::SeqCst);
        self.semaphore.post();
    }

    /// An interrupt reached a thread that could not be suspended, and the
    /// request was taken back.
    pub fn notify_aborted(&self) {
        #[cfg(any(debug_assertions, feature = "suspend-validation"))]
        self.counters.abort_posts.fetch_add(1, Ordering::SeqCst);
        self.semaphore.post();
    }

    /// Consumes one post. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if !self.semaphore.wait_timeout(timeout) {
            return false;
        }
        #[cfg(any(debug_assertions, feature = "suspend-validation"))]
        self.counters.waits.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Consumes every post nobody waited for. Returns how many there were.
    pub fn drain(&self) -> usize {
        let mut stray = 0;
        while self.semaphore.try_wait() {
            stray += 1;
        }
        stray
    }

    #[cfg(any(debug_assertions, feature = "suspend-validation"))]
    pub fn counts(&self) -> BarrierCounts {
        BarrierCounts {
            suspend_posts: self.counters.suspend_posts.load(Ordering::SeqCst),
            resume_posts: self.counters.resume_posts.load(Ordering::SeqCst),
            abort_posts: self.counters.abort_posts.load(Ordering::SeqCst),
            waits: self.counters.waits.load(Ordering::SeqCst),
        }
    }

    #[cfg(not(any(debug_assertions, feature = "suspend-validation")))]
    pub fn counts(&self) -> BarrierCounts {
        BarrierCounts::default()
    }

    /// Zeroes the counters at the start of a cycle.
    pub fn reset_counts(&self) {
        #[cfg(any(debug_assertions, feature = "suspend-validation"))]
        {
            self.counters.suspend_posts.store(0, Ordering::SeqCst);
            self.counters.resume_posts.store(0, Ordering::SeqCst);
            self.counters.abort_posts.store(0, Ordering::SeqCst);
            self.counters.waits.store(0, Ordering::SeqCst);
        }
    }

    /// `suspend_posts + resume_posts + abort_posts == waits`. Always `Ok` when
    /// validation is compiled out.
    pub fn check_balance(&self) -> Result<(), SuspendError> {
        let counts = self.counts();
        if counts.posts() != counts.waits {
            return Err(SuspendError::BarrierImbalance {
                posts: counts.posts(),
                waits: counts.waits,
            });
        }
        Ok(())
    }
}
