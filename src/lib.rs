//! # suspend-rs
//!
//! Cooperative and preemptive thread suspension for a managed runtime: the
//! protocol by which one thread (a garbage collector, a debugger) brings other
//! running threads to a stop and later releases them.
//!
//! See [`threading`] for the state machine and the orchestrator.
//!
//! ## Feature Flags
//!
//! - `suspend-validation`: keeps the barrier post/wait counters and the
//!   per-thread transition history in release builds. Both are always on with
//!   debug assertions.
//! - `fuzzing`: exposes the [`fuzzing`] module used by the fuzz target.
use clap::Parser;
use std::process::ExitCode;

pub mod config;
pub mod error;
#[cfg(any(test, feature = "fuzzing"))]
pub mod fuzzing;
pub mod metrics;
pub mod stress;
pub mod threading;
pub mod utils;

use config::{DefectPolicy, SuspendConfig, SuspendPolicy};
use stress::{run_stress, StressOptions};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Stress the thread suspension protocol with concurrent mutators"
)]
pub struct Args {
    /// Number of mutator threads
    #[arg(short, long, default_value_t = 4)]
    pub threads: usize,
    /// Number of stop-the-world cycles
    #[arg(short, long, default_value_t = 100)]
    pub cycles: usize,
    /// How running threads are stopped (defaults to SUSPEND_RS_POLICY)
    #[arg(short, long, value_enum)]
    pub policy: Option<SuspendPolicy>,
    /// Share of mutator steps spent in blocking regions
    #[arg(long, default_value_t = 0.3)]
    pub blocking_ratio: f64,
    /// Share of mutator steps spent in no-safepoints regions
    #[arg(long, default_value_t = 0.1)]
    pub no_safepoints_ratio: f64,
    #[arg(long, default_value_t = 0x5EED)]
    pub seed: u64,
    /// Barrier timeout in milliseconds (defaults to SUSPEND_RS_WAIT_TIMEOUT_MS)
    #[arg(long, value_name = "MS")]
    pub wait_timeout: Option<u64>,
    #[arg(long, value_enum, default_value_t = DefectPolicy::Propagate)]
    pub defect_policy: DefectPolicy,
    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl Args {
    pub fn stress_options(&self) -> Result<StressOptions, String> {
        for (name, ratio) in [
            ("--blocking-ratio", self.blocking_ratio),
            ("--no-safepoints-ratio", self.no_safepoints_ratio),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(format!("{} must be between 0 and 1, got {}", name, ratio));
            }
        }
        if self.blocking_ratio + self.no_safepoints_ratio > 1.0 {
            return Err("--blocking-ratio and --no-safepoints-ratio add up to more than 1".into());
        }

        let mut config = SuspendConfig::from_env().with_defect_policy(self.defect_policy);
        if let Some(policy) = self.policy {
            config = config.with_policy(policy);
        }
        if let Some(ms) = self.wait_timeout {
            config = config.with_wait_timeout(std::time::Duration::from_millis(ms));
        }

        Ok(StressOptions {
            threads: self.threads,
            cycles: self.cycles,
            blocking_ratio: self.blocking_ratio,
            no_safepoints_ratio: self.no_safepoints_ratio,
            seed: self.seed,
            config,
        })
    }
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    let options = match args.stress_options() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Invalid arguments: {}", e);
            return ExitCode::from(2);
        }
    };

    let report = match run_stress(&options) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Suspend protocol failure: {}", e);
            if let error::SuspendError::Timeout { dump, .. } = &e {
                eprintln!("{}", dump);
            }
            return ExitCode::from(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Failed to serialize report: {}", e);
                return ExitCode::from(1);
            }
        }
    } else {
        print!("{}", report);
    }

    if report.violations == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
