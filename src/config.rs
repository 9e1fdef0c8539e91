//! Suspend configuration.
//!
//! Defaults can be overridden from the environment:
//!
//! - `SUSPEND_RS_POLICY`: `cooperative` (default) or `preemptive`
//! - `SUSPEND_RS_WAIT_TIMEOUT_MS`: how long a barrier wait may take before it is
//!   treated as a hang (default: 10000)
//! - `SUSPEND_RS_WARN_AFTER_MS`: when to log the threads that have not yet
//!   confirmed (default: 1000)
//! - `SUSPEND_RS_DEFECT_POLICY`: `panic` (default) or `propagate`
//! - `SUSPEND_RS_MAX_ATTEMPTS`: how many times `suspend_all` retries a thread
//!   whose suspension was aborted (default: 64)
use clap::ValueEnum;
use serde::Serialize;
use std::{env, time::Duration};

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(10_000);
const DEFAULT_WARN_AFTER: Duration = Duration::from_millis(1_000);
const DEFAULT_MAX_ATTEMPTS: usize = 64;

/// How a running thread is brought to a stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SuspendPolicy {
    /// Wait for the thread's next safepoint poll.
    #[default]
    Cooperative,
    /// Interrupt the thread through the platform interrupt mechanism.
    Preemptive,
}

impl SuspendPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "cooperative" | "coop" => Some(SuspendPolicy::Cooperative),
            "preemptive" | "preempt" => Some(SuspendPolicy::Preemptive),
            _ => None,
        }
    }
}

/// What happens when the suspend protocol is violated or a barrier wait hangs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DefectPolicy {
    /// Log the thread dump and panic.
    #[default]
    Panic,
    /// Log the thread dump and return the error to the caller.
    Propagate,
}

impl DefectPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "panic" | "abort" => Some(DefectPolicy::Panic),
            "propagate" | "error" => Some(DefectPolicy::Propagate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspendConfig {
    pub policy: SuspendPolicy,
    pub wait_timeout: Duration,
    pub warn_after: Duration,
    pub defect_policy: DefectPolicy,
    pub max_suspend_attempts: usize,
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            policy: SuspendPolicy::default(),
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            warn_after: DEFAULT_WARN_AFTER,
            defect_policy: DefectPolicy::default(),
            max_suspend_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl SuspendConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. Unparseable values
    /// fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        let defaults = Self::default();
        Self {
            policy: lookup("SUSPEND_RS_POLICY")
                .and_then(|v| SuspendPolicy::parse(&v))
                .unwrap_or(defaults.policy),
            wait_timeout: millis("SUSPEND_RS_WAIT_TIMEOUT_MS").unwrap_or(defaults.wait_timeout),
            warn_after: millis("SUSPEND_RS_WARN_AFTER_MS").unwrap_or(defaults.warn_after),
            defect_policy: lookup("SUSPEND_RS_DEFECT_POLICY")
                .and_then(|v| DefectPolicy::parse(&v))
                .unwrap_or(defaults.defect_policy),
            max_suspend_attempts: lookup("SUSPEND_RS_MAX_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.max_suspend_attempts),
        }
    }

    pub fn with_policy(mut self, policy: SuspendPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_warn_after(mut self, warn_after: Duration) -> Self {
        self.warn_after = warn_after;
        self
    }

    pub fn with_defect_policy(mut self, defect_policy: DefectPolicy) -> Self {
        self.defect_policy = defect_policy;
        self
    }

    pub fn with_max_suspend_attempts(mut self, attempts: usize) -> Self {
        self.max_suspend_attempts = attempts.max(1);
        self
    }
}
