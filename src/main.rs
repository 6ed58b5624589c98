use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use nix::unistd::getpid;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod census;
mod config;
mod driver;
mod error;
mod process_control;
mod shutdown;
mod wait_stress;

use config::StressConfig;
use process_control::UnixProcessControl;

fn main() -> ExitCode {
    let config = StressConfig::parse();
    initialize_logging(config.debug);

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &StressConfig) -> Result<()> {
    config.validate()?;
    census::check_system(config.process_demand());

    shutdown::install_handlers()?;
    shutdown::block_signals()?;
    let ctrl = UnixProcessControl::new();
    if let Err(e) = ctrl.adopt_orphans() {
        warn!("Orphaned descendants will not be reaped here: {}", e);
    }

    if config.duration == 0 {
        info!(
            "Starting wait stress test with {} groups. To stop, use: kill {}",
            config.groups,
            getpid()
        );
    } else {
        info!(
            "Starting wait stress test with {} groups for {} seconds...",
            config.groups, config.duration
        );
    }
    shutdown::arm_timer(config.duration);

    let result = driver::run(&ctrl, config, &shutdown::SHUTDOWN);
    shutdown::disarm_timer();
    let orphans = census::drain_orphans(&ctrl, getpid());
    let summary = result?;

    info!(
        "Reaped {} of {} groups ({} failed, {} orphans)",
        summary.reaped, summary.spawned, summary.failed, orphans
    );
    info!("All child processes have exited");
    Ok(())
}

/// Info and below go to stdout, warnings and errors to stderr
fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let writer = std::io::stderr
        .with_max_level(Level::WARN)
        .or_else(std::io::stdout);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(writer)
        .with_target(false)
        .init();
}
