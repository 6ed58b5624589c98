use clap::Parser;

use crate::error::StressError;
use crate::wait_stress::ObserverMode;

/// Number of worker groups spawned when `--groups` is not given
pub const DEFAULT_GROUPS: usize = 52;

/// Upper bound on `--groups`; every group costs three processes
pub const MAX_GROUPS: usize = 4096;

/// Stress the kernel's wait/notification paths with stop/continue storms
#[derive(Parser, Debug, Clone)]
#[command(name = "wait-stressor", version, about)]
pub struct StressConfig {
    /// Number of worker groups (runner + killer + observer) to spawn
    #[arg(short, long, default_value_t = DEFAULT_GROUPS)]
    pub groups: usize,

    /// Seconds to run before shutting down; 0 runs until interrupted
    #[arg(short, long, default_value_t = 0)]
    pub duration: u32,

    /// Also reap any child (non-blocking) after every targeted wait
    #[arg(long)]
    pub reap_any: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl StressConfig {
    pub fn validate(&self) -> Result<(), StressError> {
        if self.groups > MAX_GROUPS {
            return Err(StressError::Config(format!(
                "groups must be at most {MAX_GROUPS}, got {}",
                self.groups
            )));
        }
        Ok(())
    }

    pub fn observer_mode(&self) -> ObserverMode {
        if self.reap_any {
            ObserverMode::TargetedAndAny
        } else {
            ObserverMode::Targeted
        }
    }

    /// Processes alive at steady state, not counting the driver
    pub fn process_demand(&self) -> u64 {
        self.groups as u64 * 3
    }
}
