use std::sync::atomic::AtomicBool;

use nix::errno::Errno;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::StressConfig;
use crate::error::StressError;
use crate::process_control::{
    wait_or_shutdown, ProcessControl, ProcessEvent, Role, SignalKind, WaitOptions,
};
use crate::shutdown::is_requested;
use crate::wait_stress;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub spawned: usize,
    pub reaped: usize,
    /// Groups that exited non-zero or were killed by a signal
    pub failed: usize,
}

/// Spawn `config.groups` group processes and reap every one of them.
///
/// Once shutdown is requested, live groups are sent SIGTERM and reaping
/// continues until none are left. A failed spawn terminates and reaps the
/// groups already running before the error is returned.
pub fn run<C: ProcessControl>(
    ctrl: &C,
    config: &StressConfig,
    stop: &AtomicBool,
) -> Result<RunSummary, StressError> {
    let mode = config.observer_mode();
    let mut live: Vec<(usize, Pid)> = Vec::with_capacity(config.groups);

    for index in 0..config.groups {
        if is_requested(stop) {
            warn!("Shutdown requested after spawning {} of {} groups", index, config.groups);
            break;
        }
        match ctrl.spawn(Role::Group(index), || {
            wait_stress::run_group(ctrl, index, mode, stop)
        }) {
            Ok(pid) => {
                info!("Spawned group {} with PID: {}", index, pid);
                live.push((index, pid));
            }
            Err(e) => {
                error!("fork: {}", e);
                let spawned = live.len();
                let summary = reap_groups(ctrl, live, stop, true);
                debug!("Cleaned up {} of {} groups after spawn failure", summary.reaped, spawned);
                return Err(e);
            }
        }
    }

    Ok(reap_groups(ctrl, live, stop, false))
}

fn terminate_groups<C: ProcessControl>(ctrl: &C, live: &[(usize, Pid)]) {
    for (index, pid) in live {
        match ctrl.send_signal(*pid, SignalKind::Terminate) {
            Ok(()) => debug!("Sent SIGTERM to group {} ({})", index, pid),
            Err(e) => debug!("Group {} already gone: {}", index, e),
        }
    }
}

fn reap_groups<C: ProcessControl>(
    ctrl: &C,
    mut live: Vec<(usize, Pid)>,
    stop: &AtomicBool,
    terminate_now: bool,
) -> RunSummary {
    let mut summary = RunSummary {
        spawned: live.len(),
        ..RunSummary::default()
    };
    let mut terminated = false;
    if terminate_now {
        terminate_groups(ctrl, &live);
        terminated = true;
    }

    while !live.is_empty() {
        if !terminated && is_requested(stop) {
            info!("Stopping {} running groups", live.len());
            terminate_groups(ctrl, &live);
            terminated = true;
        }

        debug!("Main process is waiting for all children to exit");
        // After SIGTERM went out nothing else can happen but exits, so a
        // plain blocking wait will do
        let waited = if terminated {
            ctrl.wait_for_any_child(WaitOptions::EXITED)
        } else {
            wait_or_shutdown(ctrl, None, WaitOptions::EXITED, stop)
        };
        let event = match waited {
            Ok(event) => event,
            Err(e) if e.errno() == Some(Errno::EINTR) => continue,
            Err(e) => {
                error!("{} ({} groups unaccounted for)", e, live.len());
                break;
            }
        };

        let Some(pid) = event.reaped_pid() else {
            continue;
        };
        let Some(position) = live.iter().position(|(_, p)| *p == pid) else {
            debug!("Reaped orphaned descendant {}", pid);
            continue;
        };
        let (index, _) = live.swap_remove(position);
        summary.reaped += 1;

        match event {
            ProcessEvent::Exited { code: 0, .. } => debug!("Group {} exited", index),
            ProcessEvent::Exited { code, .. } => {
                summary.failed += 1;
                warn!("Group {} exited with status {}", index, code);
            }
            ProcessEvent::Signaled { signal, .. } => {
                summary.failed += 1;
                warn!("Group {} was killed by {}", index, signal);
            }
            _ => {}
        }
    }

    summary
}
