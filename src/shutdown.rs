use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::alarm;
use tracing::warn;

use crate::error::StressError;

/// Process-wide stop flag. Forked children inherit both the flag and the
/// handlers that raise it.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGALRM];

extern "C" fn request_shutdown(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

// Only there so that SIGCHLD interrupts sigsuspend
extern "C" fn child_changed(_signal: libc::c_int) {}

/// Route SIGTERM, SIGINT and SIGALRM to the stop flag and let SIGCHLD wake
/// sleepers. SA_NOCLDSTOP is left off: stops and resumes wake them too.
pub fn install_handlers() -> Result<(), StressError> {
    let shutdown = SigAction::new(
        SigHandler::Handler(request_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let child = SigAction::new(
        SigHandler::Handler(child_changed),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let actions = SHUTDOWN_SIGNALS
        .iter()
        .map(|signal| (*signal, &shutdown))
        .chain([(Signal::SIGCHLD, &child)]);
    for (signal, action) in actions {
        // Safety: the handlers only store to an atomic.
        unsafe { sigaction(signal, action) }
            .map_err(|e| StressError::Setup(format!("sigaction({signal})"), e))?;
    }
    Ok(())
}

/// Signals that may only be taken inside [`suspend`]
fn wakeup_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in SHUTDOWN_SIGNALS {
        set.add(signal);
    }
    set.add(Signal::SIGCHLD);
    set
}

/// Hold the shutdown signals and SIGCHLD pending until the next [`suspend`].
///
/// Checking the stop flag and then going to sleep is only race free while
/// they are blocked. The mask survives fork, so every spawned process starts
/// out blocked too.
pub fn block_signals() -> Result<(), StressError> {
    wakeup_signals()
        .thread_block()
        .map_err(|e| StressError::Setup("sigprocmask(SIG_BLOCK)".to_string(), e))
}

/// For processes that never sleep and just poll the flag
pub fn unblock_signals() -> Result<(), StressError> {
    wakeup_signals()
        .thread_unblock()
        .map_err(|e| StressError::Setup("sigprocmask(SIG_UNBLOCK)".to_string(), e))
}

/// Sleep until a shutdown signal or SIGCHLD has been handled. Returns at once
/// when one is already pending.
pub fn suspend() {
    let mut mask = match SigSet::thread_get_mask() {
        Ok(mask) => mask,
        Err(e) => {
            warn!("Failed to read signal mask: {}", e);
            return;
        }
    };
    for signal in wakeup_signals().iter() {
        mask.remove(signal);
    }
    // Always fails with EINTR once a handler has run
    unsafe { libc::sigsuspend(mask.as_ref()) };
}

/// Deliver SIGALRM after `seconds`; zero leaves the run unbounded.
pub fn arm_timer(seconds: u32) {
    if seconds > 0 {
        alarm::set(seconds);
    }
}

pub fn disarm_timer() {
    alarm::cancel();
}

pub fn is_requested(flag: &AtomicBool) -> bool {
    flag.load(Ordering::SeqCst)
}
