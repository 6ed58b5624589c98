use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::resource::{getrlimit, Resource};
use nix::unistd::Pid;
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, info, warn};

use crate::process_control::{ProcessControl, ProcessEvent, WaitOptions};
use crate::shutdown;

/// Seconds to wait for orphaned descendants after every group is reaped
pub const ORPHAN_GRACE_SECS: u32 = 2;

/// Log CPU and process counts, and warn when `demand` more processes would
/// not fit under RLIMIT_NPROC.
pub fn check_system(demand: u64) {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    info!("CPUs available: {}", num_cpus::get());
    let running = sys
        .processes()
        .values()
        .filter(|process| process.thread_kind().is_none())
        .count();
    info!("Processes running: {}", running);

    match getrlimit(Resource::RLIMIT_NPROC) {
        Ok((soft, _)) if exceeds_limit(demand, soft) => warn!(
            "Stress test needs {} processes but RLIMIT_NPROC is {}; expect spawn failures",
            demand, soft
        ),
        Ok(_) => {}
        Err(e) => debug!("getrlimit(RLIMIT_NPROC) failed: {}", e),
    }
}

fn exceeds_limit(demand: u64, soft: libc::rlim_t) -> bool {
    soft != libc::RLIM_INFINITY && demand > soft as u64
}

/// Pids of every live process descending from `root`
pub fn surviving_descendants(root: Pid) -> Vec<Pid> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let tree = sys
        .processes()
        .iter()
        // Linux threads show up as tasks parented to their process
        .filter(|(_, process)| process.thread_kind().is_none())
        .map(|(pid, process)| (pid.as_u32(), process.parent().map(|p| p.as_u32())));
    descendants_of(root.as_raw() as u32, tree)
        .into_iter()
        .map(|pid| Pid::from_raw(pid as i32))
        .collect()
}

/// Walk a (pid, parent) table and collect everything below `root`
pub fn descendants_of(root: u32, tree: impl IntoIterator<Item = (u32, Option<u32>)>) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, parent) in tree {
        if let Some(parent) = parent {
            children.entry(parent).or_default().push(pid);
        }
    }

    let mut seen = HashSet::new();
    let mut pending = vec![root];
    let mut found = Vec::new();
    while let Some(pid) = pending.pop() {
        for &child in children.get(&pid).into_iter().flatten() {
            if child != root && seen.insert(child) {
                found.push(child);
                pending.push(child);
            }
        }
    }
    found.sort_unstable();
    found
}

/// Reap descendants reparented to us after their group died. Returns how
/// many were reaped; anything still alive after the grace period is logged.
pub fn drain_orphans<C: ProcessControl>(ctrl: &C, root: Pid) -> usize {
    let deadline = Instant::now() + Duration::from_secs(ORPHAN_GRACE_SECS.into());
    let mut reaped = 0;
    loop {
        match ctrl.wait_for_any_child(WaitOptions::EXITED.no_hang()) {
            Ok(ProcessEvent::StillAlive) => {
                if Instant::now() >= deadline {
                    break;
                }
                // wakes on SIGCHLD, or on the tick at the latest
                shutdown::arm_timer(1);
                ctrl.suspend();
            }
            Ok(event) => {
                if let Some(pid) = event.reaped_pid() {
                    debug!("Reaped orphaned descendant {}", pid);
                    reaped += 1;
                }
            }
            Err(e) if e.errno() == Some(Errno::ECHILD) => break,
            Err(e) if e.errno() == Some(Errno::EINTR) => {}
            Err(e) => {
                debug!("Stopped draining orphans: {}", e);
                break;
            }
        }
    }
    shutdown::disarm_timer();

    let survivors = surviving_descendants(root);
    if !survivors.is_empty() {
        warn!("{} descendant processes still running: {:?}", survivors.len(), survivors);
    }
    reaped
}
