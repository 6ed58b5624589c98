//! The per-group workload: a runner that idles, a killer that stops and
//! resumes it, and the group process observing both through waitpid().

use std::sync::atomic::AtomicBool;
use std::thread;

use nix::errno::Errno;
use nix::unistd::{getpid, Pid};
use tracing::{debug, error, info, warn};

use crate::error::StressError;
use crate::process_control::{
    wait_or_shutdown, ProcessControl, ProcessEvent, Role, SignalKind, WaitOptions,
};
use crate::shutdown::{self, is_requested};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverMode {
    /// Only waitpid() on the runner
    Targeted,
    /// Additionally reap any child without blocking after every targeted wait
    TargetedAndAny,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverStats {
    pub stopped: u64,
    pub continued: u64,
    /// Continue notifications whose stop was never observed
    pub coalesced: u64,
}

#[derive(Debug, Default)]
pub struct Observation {
    pub stats: ObserverStats,
    /// Children reaped while observing
    pub reaped: Vec<Pid>,
}

/// Runner body: sleep until a caught signal asks us to stop.
/// SIGSTOP/SIGCONT are handled by the kernel and never wake us.
pub fn idle(stop: &AtomicBool) -> i32 {
    while !is_requested(stop) {
        shutdown::suspend();
    }
    libc::EXIT_SUCCESS
}

/// Killer body: stop and resume `target` until told to stop.
///
/// Each cycle ends with a resume so the runner is never left stopped. Returns
/// the number of completed cycles once the target is gone or shutdown is
/// requested.
pub fn toggle<C: ProcessControl>(
    ctrl: &C,
    target: Pid,
    stop: &AtomicBool,
) -> Result<u64, StressError> {
    let mut cycles: u64 = 0;
    while !is_requested(stop) {
        let result = ctrl
            .send_signal(target, SignalKind::Stop)
            .and_then(|()| {
                thread::yield_now();
                ctrl.send_signal(target, SignalKind::Continue)
            });
        match result {
            Ok(()) => cycles += 1,
            Err(e) if e.errno() == Some(Errno::ESRCH) => {
                debug!("Runner {} is gone, killer exiting", target);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(cycles)
}

/// Watch `runner` for stop/continue/exit notifications until shutdown, the
/// runner's termination, or a non-transient wait failure.
pub fn observe<C: ProcessControl>(
    ctrl: &C,
    runner: Pid,
    mode: ObserverMode,
    stop: &AtomicBool,
) -> Observation {
    let mut observation = Observation::default();
    let mut awaiting_continue = false;

    while !is_requested(stop) {
        match wait_or_shutdown(ctrl, Some(runner), WaitOptions::STATE_CHANGES, stop) {
            Ok(ProcessEvent::Stopped { .. }) => {
                observation.stats.stopped += 1;
                awaiting_continue = true;
            }
            Ok(ProcessEvent::Continued { .. }) => {
                observation.stats.continued += 1;
                if !awaiting_continue {
                    observation.stats.coalesced += 1;
                }
                awaiting_continue = false;
            }
            Ok(ProcessEvent::StillAlive) => {}
            Ok(event) => {
                if let Some(pid) = event.reaped_pid() {
                    info!("Runner {} terminated: {:?}", runner, event);
                    observation.reaped.push(pid);
                }
                break;
            }
            Err(e) if e.is_transient() => continue,
            Err(e) => {
                warn!("Observer for runner {} stopping: {}", runner, e);
                break;
            }
        }

        if mode == ObserverMode::TargetedAndAny {
            match ctrl.wait_for_any_child(WaitOptions::EXITED.no_hang()) {
                Ok(event) => {
                    if let Some(pid) = event.reaped_pid() {
                        debug!("Reaped child {} while observing runner {}", pid, runner);
                        observation.reaped.push(pid);
                        if pid == runner {
                            break;
                        }
                    }
                }
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    warn!("Observer for runner {} stopping: {}", runner, e);
                    break;
                }
            }
        }
    }

    observation
}

/// Spawn the runner/killer pair and observe it until shutdown.
///
/// A failed runner spawn returns immediately. A failed killer spawn is
/// logged, observation still runs, and the error is returned afterwards.
pub fn stress_wait<C: ProcessControl>(
    ctrl: &C,
    mode: ObserverMode,
    stop: &AtomicBool,
) -> Result<ObserverStats, StressError> {
    let runner = ctrl.spawn(Role::Runner, || idle(stop))?;

    let (killer, killer_error) = match ctrl.spawn(Role::Killer, || run_killer(ctrl, runner, stop)) {
        Ok(pid) => (Some(pid), None),
        Err(e) => {
            error!("{}", e);
            (None, Some(e))
        }
    };

    let observation = observe(ctrl, runner, mode, stop);
    teardown(ctrl, runner, killer, &observation.reaped);

    match killer_error {
        Some(e) => Err(e),
        None => Ok(observation.stats),
    }
}

/// Entry point of a group process; returns its exit code.
pub fn run_group<C: ProcessControl>(
    ctrl: &C,
    index: usize,
    mode: ObserverMode,
    stop: &AtomicBool,
) -> i32 {
    info!("Main process has spawned a child with PID: {}", getpid());
    match stress_wait(ctrl, mode, stop) {
        Ok(stats) => {
            info!(
                "Group {} finished: {} stopped, {} continued, {} coalesced",
                index, stats.stopped, stats.continued, stats.coalesced
            );
            libc::EXIT_SUCCESS
        }
        Err(e) => {
            error!("Group {} failed: {}", index, e);
            libc::EXIT_FAILURE
        }
    }
}

fn run_killer<C: ProcessControl>(ctrl: &C, runner: Pid, stop: &AtomicBool) -> i32 {
    // The killer never sleeps, so it takes shutdown signals as they come
    if let Err(e) = shutdown::unblock_signals() {
        warn!("{}", e);
    }
    match toggle(ctrl, runner, stop) {
        Ok(cycles) => {
            debug!("Killer for runner {} done after {} cycles", runner, cycles);
            libc::EXIT_SUCCESS
        }
        Err(e) => {
            error!("Killer for runner {} failed: {}", runner, e);
            libc::EXIT_FAILURE
        }
    }
}

/// Stop the killer first so nothing stops the runner again, then terminate
/// the runner. SIGTERM on a stopped process stays pending until SIGCONT.
fn teardown<C: ProcessControl>(ctrl: &C, runner: Pid, killer: Option<Pid>, reaped: &[Pid]) {
    if let Some(killer) = killer.filter(|pid| !reaped.contains(pid)) {
        signal_quietly(ctrl, killer, SignalKind::Terminate);
        reap(ctrl, killer);
    }
    if !reaped.contains(&runner) {
        signal_quietly(ctrl, runner, SignalKind::Terminate);
        signal_quietly(ctrl, runner, SignalKind::Continue);
        reap(ctrl, runner);
    }
}

fn signal_quietly<C: ProcessControl>(ctrl: &C, pid: Pid, kind: SignalKind) {
    match ctrl.send_signal(pid, kind) {
        Ok(()) => {}
        Err(e) if e.errno() == Some(Errno::ESRCH) => debug!("{}", e),
        Err(e) => warn!("{}", e),
    }
}

fn reap<C: ProcessControl>(ctrl: &C, pid: Pid) {
    loop {
        match ctrl.wait_for_state_change(pid, WaitOptions::EXITED) {
            Ok(event) if event.reaped_pid().is_some() => {
                debug!("Reaped {}: {:?}", pid, event);
                return;
            }
            Ok(_) => {}
            Err(e) if e.errno() == Some(Errno::EINTR) => {}
            Err(e) => {
                debug!("Giving up on reaping {}: {}", pid, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use nix::sys::signal::Signal;

    use super::*;
    use crate::process_control::fake::{FakeControl, Step};

    fn setup() -> (Arc<AtomicBool>, FakeControl) {
        let stop = Arc::new(AtomicBool::new(false));
        let ctrl = FakeControl::new(Arc::clone(&stop));
        (stop, ctrl)
    }

    fn stopped(pid: Pid) -> Step {
        Step::Event(ProcessEvent::Stopped {
            pid,
            signal: Signal::SIGSTOP,
        })
    }

    fn continued(pid: Pid) -> Step {
        Step::Event(ProcessEvent::Continued { pid })
    }

    #[test]
    fn test_group_spawns_runner_then_killer() {
        let (stop, ctrl) = setup();
        ctrl.script_targeted([Step::Shutdown]);

        let stats = stress_wait(&ctrl, ObserverMode::Targeted, &stop).unwrap();

        let spawned = ctrl.spawned();
        assert_eq!(spawned.len(), 2);
        assert_eq!(spawned[0].0, Role::Runner);
        assert_eq!(spawned[1].0, Role::Killer);
        assert_eq!(stats, ObserverStats::default());
    }

    #[test]
    fn test_runner_spawn_failure_skips_killer() {
        let (stop, ctrl) = setup();
        ctrl.fail_spawn(Role::Runner);

        let err = stress_wait(&ctrl, ObserverMode::Targeted, &stop).unwrap_err();

        assert!(matches!(err, StressError::Spawn { role: Role::Runner, .. }));
        assert!(ctrl.spawned().is_empty());
        assert_eq!(run_group(&ctrl, 0, ObserverMode::Targeted, &stop), libc::EXIT_FAILURE);
    }

    #[test]
    fn test_killer_spawn_failure_still_observes() {
        let (stop, ctrl) = setup();
        ctrl.fail_spawn(Role::Killer);
        let runner = ctrl.next_pid();
        ctrl.script_targeted([stopped(runner), continued(runner), Step::Shutdown]);

        let err = stress_wait(&ctrl, ObserverMode::Targeted, &stop).unwrap_err();

        assert!(matches!(err, StressError::Spawn { role: Role::Killer, .. }));
        // the runner was still torn down and reaped
        assert!(ctrl.reaped().contains(&runner));
    }

    #[test]
    fn test_observer_counts_stop_continue_pairs() {
        let (stop, ctrl) = setup();
        let runner = ctrl.next_pid();
        ctrl.script_targeted([
            stopped(runner),
            continued(runner),
            stopped(runner),
            continued(runner),
            continued(runner),
            Step::Shutdown,
        ]);

        let stats = stress_wait(&ctrl, ObserverMode::Targeted, &stop).unwrap();

        assert_eq!(stats.stopped, 2);
        assert_eq!(stats.continued, 3);
        assert_eq!(stats.coalesced, 1);
    }

    #[test]
    fn test_observer_retries_transient_failures() {
        let (stop, ctrl) = setup();
        let runner = ctrl.next_pid();
        ctrl.script_targeted([
            Step::Fail(Errno::EINTR),
            Step::Fail(Errno::ECHILD),
            stopped(runner),
            Step::Shutdown,
        ]);

        let stats = stress_wait(&ctrl, ObserverMode::Targeted, &stop).unwrap();

        assert_eq!(stats.stopped, 1);
        assert!(stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_observer_stops_on_fatal_failure() {
        let (stop, ctrl) = setup();
        let runner = ctrl.next_pid();
        ctrl.script_targeted([stopped(runner), Step::Fail(Errno::EINVAL), stopped(runner)]);

        let observation = observe(&ctrl, runner, ObserverMode::Targeted, &stop);

        assert_eq!(observation.stats.stopped, 1);
        assert!(!stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_observer_ends_when_runner_terminates() {
        let (stop, ctrl) = setup();
        let runner = ctrl.next_pid();
        ctrl.script_targeted([
            stopped(runner),
            Step::Event(ProcessEvent::Signaled {
                pid: runner,
                signal: Signal::SIGKILL,
            }),
        ]);

        stress_wait(&ctrl, ObserverMode::Targeted, &stop).unwrap();

        // the runner was reaped by the observer, so teardown only signals the killer
        let signals = ctrl.signals();
        assert!(signals.iter().all(|(pid, _)| *pid != runner));
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].1, SignalKind::Terminate);
    }

    #[test]
    fn test_teardown_terminates_killer_before_runner() {
        let (stop, ctrl) = setup();
        let runner = ctrl.next_pid();
        let killer = Pid::from_raw(runner.as_raw() + 1);
        ctrl.script_targeted([Step::Shutdown]);

        stress_wait(&ctrl, ObserverMode::Targeted, &stop).unwrap();

        assert_eq!(
            ctrl.signals(),
            vec![
                (killer, SignalKind::Terminate),
                (runner, SignalKind::Terminate),
                (runner, SignalKind::Continue),
            ]
        );
        assert_eq!(ctrl.reaped(), vec![killer, runner]);
    }

    #[test]
    fn test_targeted_mode_never_queries_any_child() {
        let (stop, ctrl) = setup();
        let runner = ctrl.next_pid();
        ctrl.script_targeted([stopped(runner), continued(runner), Step::Shutdown]);

        stress_wait(&ctrl, ObserverMode::Targeted, &stop).unwrap();

        assert_eq!(ctrl.any_waits(), 0);
    }

    #[test]
    fn test_any_child_mode_reaps_without_blocking() {
        let (stop, ctrl) = setup();
        let runner = ctrl.next_pid();
        let killer = Pid::from_raw(runner.as_raw() + 1);
        ctrl.script_targeted([stopped(runner), continued(runner), stopped(runner), Step::Shutdown]);
        ctrl.script_any([Step::Event(ProcessEvent::Exited {
            pid: killer,
            code: 1,
        })]);

        stress_wait(&ctrl, ObserverMode::TargetedAndAny, &stop).unwrap();

        assert_eq!(ctrl.any_waits(), 3);
        // the killer was reaped by the generic query and not signalled again
        assert!(ctrl.signals().iter().all(|(pid, _)| *pid != killer));
        assert_eq!(ctrl.reaped().iter().filter(|pid| **pid == killer).count(), 1);
    }

    #[test]
    fn test_toggle_until_runner_disappears() {
        let (stop, ctrl) = setup();
        let runner = ctrl.spawn(Role::Runner, || 0).unwrap();
        ctrl.script_targeted([Step::Event(ProcessEvent::Exited {
            pid: runner,
            code: 0,
        })]);
        ctrl.wait_for_state_change(runner, WaitOptions::EXITED).unwrap();

        let cycles = toggle(&ctrl, runner, &stop).unwrap();

        assert_eq!(cycles, 0);
    }

    fn signal_kinds(ctrl: &FakeControl) -> Vec<SignalKind> {
        ctrl.signals().iter().map(|(_, kind)| *kind).collect()
    }

    #[test]
    fn test_toggle_alternates_stop_and_continue() {
        let (stop, ctrl) = setup();
        let runner = ctrl.spawn(Role::Runner, || 0).unwrap();
        ctrl.limit_signals(6);

        let cycles = toggle(&ctrl, runner, &stop).unwrap();

        assert_eq!(cycles, 3);
        assert_eq!(
            signal_kinds(&ctrl),
            [SignalKind::Stop, SignalKind::Continue].repeat(3)
        );
        assert!(ctrl.signals().iter().all(|(pid, _)| *pid == runner));
    }

    #[test]
    fn test_toggle_completes_cycle_when_shutdown_lands_mid_cycle() {
        let (stop, ctrl) = setup();
        let runner = ctrl.spawn(Role::Runner, || 0).unwrap();
        // raised right after the third SIGSTOP
        ctrl.stop_after_signals(5);

        let cycles = toggle(&ctrl, runner, &stop).unwrap();

        assert_eq!(cycles, 3);
        let kinds = signal_kinds(&ctrl);
        assert_eq!(kinds.len(), 6);
        assert_eq!(kinds.last(), Some(&SignalKind::Continue));
        assert_eq!(kinds, [SignalKind::Stop, SignalKind::Continue].repeat(3));
    }

    #[test]
    fn test_toggle_stops_on_shutdown() {
        let (stop, ctrl) = setup();
        let runner = ctrl.spawn(Role::Runner, || 0).unwrap();
        stop.store(true, Ordering::SeqCst);

        assert_eq!(toggle(&ctrl, runner, &stop).unwrap(), 0);
        assert!(ctrl.signals().is_empty());
    }

    #[test]
    fn test_group_exit_codes() {
        let (stop, ctrl) = setup();
        ctrl.script_targeted([Step::Shutdown]);
        assert_eq!(run_group(&ctrl, 0, ObserverMode::Targeted, &stop), libc::EXIT_SUCCESS);

        let (stop, ctrl) = setup();
        ctrl.fail_spawn(Role::Killer);
        ctrl.script_targeted([Step::Shutdown]);
        assert_eq!(run_group(&ctrl, 1, ObserverMode::Targeted, &stop), libc::EXIT_FAILURE);
    }
}
