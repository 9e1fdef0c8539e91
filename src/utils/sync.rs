//! Basic synchronization primitives.
//!
//! This module provides a single place for the synchronization types used by the
//! suspend machinery, so that low-level modules can depend on it without pulling
//! in the orchestrator.
use std::time::{Duration, Instant};

pub use parking_lot::{Condvar, Mutex, MutexGuard};
pub use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

/// Counting semaphore with blocking, timed and non-blocking waits.
///
/// Used both for the initiator's barrier and for every thread's resume signal.
/// Visibility between a `post` and the wait it releases comes from the inner
/// mutex.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Returns `false` if no post arrived before `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();

        while *count == 0 {
            if self.available.wait_until(&mut count, deadline).timed_out() && *count == 0 {
                return false;
            }
        }

        *count -= 1;
        true
    }

    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.post();
        sem.wait();
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cross_thread_release() {
        let sem = Arc::new(Semaphore::new(0));
        let poster = {
            let sem = sem.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    thread::sleep(Duration::from_millis(1));
                    sem.post();
                }
            })
        };

        for _ in 0..5 {
            assert!(sem.wait_timeout(Duration::from_secs(5)));
        }
        poster.join().unwrap();
        assert!(!sem.try_wait());
    }
}
