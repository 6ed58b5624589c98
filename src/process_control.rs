//! Process control capability.
//!
//! The stress workload only needs a handful of OS primitives: fork a process
//! running some entry function, deliver a signal, the two flavours of wait,
//! and sleeping until a signal arrives. They sit behind [`ProcessControl`] so
//! that the group and driver logic can be driven by a scripted fake in tests.

use std::fmt;
use std::sync::atomic::AtomicBool;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, getppid, ForkResult, Pid};
use tracing::{debug, warn};

use crate::error::StressError;
use crate::shutdown::{self, is_requested};

/// What a spawned process does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Group coordinator, identified by its index in the driver's spawn loop
    Group(usize),
    /// Idle target that only receives signals
    Runner,
    /// Signal toggler that stops and resumes the runner
    Killer,
}

impl Role {
    /// Signal delivered to the process when its parent dies.
    ///
    /// Groups get SIGTERM so they can tear down their pair; the leaves are
    /// simply killed.
    pub fn parent_death_signal(self) -> Signal {
        match self {
            Role::Group(_) => Signal::SIGTERM,
            Role::Runner | Role::Killer => Signal::SIGKILL,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Group(_) => f.write_str("group"),
            Role::Runner => f.write_str("runner"),
            Role::Killer => f.write_str("killer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Stop,
    Continue,
    Terminate,
}

impl SignalKind {
    pub fn as_signal(self) -> Signal {
        match self {
            SignalKind::Stop => Signal::SIGSTOP,
            SignalKind::Continue => Signal::SIGCONT,
            SignalKind::Terminate => Signal::SIGTERM,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_signal().as_str())
    }
}

/// Which state changes a wait call reports. Termination is always reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitOptions {
    pub untraced: bool,
    pub continued: bool,
    pub no_hang: bool,
}

impl WaitOptions {
    /// Termination only, blocking
    pub const EXITED: WaitOptions = WaitOptions {
        untraced: false,
        continued: false,
        no_hang: false,
    };

    /// Stop, resume and termination, blocking
    pub const STATE_CHANGES: WaitOptions = WaitOptions {
        untraced: true,
        continued: true,
        no_hang: false,
    };

    pub fn no_hang(mut self) -> Self {
        self.no_hang = true;
        self
    }

    fn to_flags(self) -> WaitPidFlag {
        let mut flags = WaitPidFlag::empty();
        if self.untraced {
            flags |= WaitPidFlag::WUNTRACED;
        }
        if self.continued {
            flags |= WaitPidFlag::WCONTINUED;
        }
        if self.no_hang {
            flags |= WaitPidFlag::WNOHANG;
        }
        flags
    }
}

/// A status change reported by a wait call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Exited { pid: Pid, code: i32 },
    Signaled { pid: Pid, signal: Signal },
    Stopped { pid: Pid, signal: Signal },
    Continued { pid: Pid },
    /// Non-blocking wait with nothing to report
    StillAlive,
}

impl ProcessEvent {
    /// Pid of a process this event reaped, if any
    pub fn reaped_pid(&self) -> Option<Pid> {
        match *self {
            ProcessEvent::Exited { pid, .. } | ProcessEvent::Signaled { pid, .. } => Some(pid),
            _ => None,
        }
    }
}

impl From<WaitStatus> for ProcessEvent {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(pid, code) => ProcessEvent::Exited { pid, code },
            WaitStatus::Signaled(pid, signal, _) => ProcessEvent::Signaled { pid, signal },
            WaitStatus::Stopped(pid, signal) => ProcessEvent::Stopped { pid, signal },
            WaitStatus::Continued(pid) => ProcessEvent::Continued { pid },
            WaitStatus::StillAlive => ProcessEvent::StillAlive,
            // ptrace stops; nothing here traces, but report them as stops
            other => match other.pid() {
                Some(pid) => ProcessEvent::Stopped {
                    pid,
                    signal: Signal::SIGTRAP,
                },
                None => ProcessEvent::StillAlive,
            },
        }
    }
}

pub trait ProcessControl {
    /// Start a new process running `entry`; its return value is the exit code.
    ///
    /// Returns the child's pid in the caller. The entry never returns to the
    /// caller's code path in the child.
    fn spawn<F>(&self, role: Role, entry: F) -> Result<Pid, StressError>
    where
        F: FnOnce() -> i32;

    fn send_signal(&self, pid: Pid, kind: SignalKind) -> Result<(), StressError>;

    fn wait_for_state_change(
        &self,
        pid: Pid,
        options: WaitOptions,
    ) -> Result<ProcessEvent, StressError>;

    fn wait_for_any_child(&self, options: WaitOptions) -> Result<ProcessEvent, StressError>;

    /// Sleep until a signal handler runs. The shutdown signals and SIGCHLD
    /// stay blocked outside this call, so none of them can be lost.
    fn suspend(&self);
}

/// Blocking wait that still notices shutdown.
///
/// Polls with WNOHANG and sleeps in [`ProcessControl::suspend`] while nothing
/// is pending. SIGCHLD wakes it for child state changes, the shutdown signals
/// for everything else. Returns EINTR once `stop` is raised.
pub fn wait_or_shutdown<C: ProcessControl>(
    ctrl: &C,
    target: Option<Pid>,
    options: WaitOptions,
    stop: &AtomicBool,
) -> Result<ProcessEvent, StressError> {
    loop {
        if is_requested(stop) {
            return Err(StressError::Wait {
                pid: target,
                source: Errno::EINTR,
            });
        }
        let event = match target {
            Some(pid) => ctrl.wait_for_state_change(pid, options.no_hang())?,
            None => ctrl.wait_for_any_child(options.no_hang())?,
        };
        if event != ProcessEvent::StillAlive {
            return Ok(event);
        }
        ctrl.suspend();
    }
}

/// [`ProcessControl`] on top of fork, kill and waitpid
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcessControl;

impl UnixProcessControl {
    pub fn new() -> Self {
        Self
    }

    /// Make orphaned descendants reparent to this process instead of init.
    #[cfg(target_os = "linux")]
    pub fn adopt_orphans(&self) -> Result<(), StressError> {
        let ret = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
        Errno::result(ret)
            .map(drop)
            .map_err(|e| StressError::Setup("PR_SET_CHILD_SUBREAPER".to_string(), e))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn adopt_orphans(&self) -> Result<(), StressError> {
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn tie_to_parent(role: Role, parent: Pid) {
    let signal = role.parent_death_signal() as libc::c_ulong;
    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, signal, 0, 0, 0) };
    if let Err(e) = Errno::result(ret) {
        warn!("Failed to set parent death signal for {} process: {}", role, e);
    }
    // The parent may have died before the prctl above took effect
    if getppid() != parent {
        unsafe { libc::_exit(libc::EXIT_FAILURE) }
    }
}

#[cfg(not(target_os = "linux"))]
fn tie_to_parent(_role: Role, _parent: Pid) {}

impl ProcessControl for UnixProcessControl {
    fn spawn<F>(&self, role: Role, entry: F) -> Result<Pid, StressError>
    where
        F: FnOnce() -> i32,
    {
        let parent = getpid();
        // Safety: the stressor never starts threads, so the child inherits a
        // consistent single-threaded address space.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                debug!("Spawned {} process with PID: {}", role, child);
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                tie_to_parent(role, parent);
                let code = entry();
                unsafe { libc::_exit(code) }
            }
            Err(source) => Err(StressError::Spawn { role, source }),
        }
    }

    fn send_signal(&self, pid: Pid, kind: SignalKind) -> Result<(), StressError> {
        signal::kill(pid, kind.as_signal())
            .map_err(|source| StressError::Signal { pid, kind, source })
    }

    fn wait_for_state_change(
        &self,
        pid: Pid,
        options: WaitOptions,
    ) -> Result<ProcessEvent, StressError> {
        waitpid(pid, Some(options.to_flags()))
            .map(ProcessEvent::from)
            .map_err(|source| StressError::Wait {
                pid: Some(pid),
                source,
            })
    }

    fn wait_for_any_child(&self, options: WaitOptions) -> Result<ProcessEvent, StressError> {
        waitpid(None::<Pid>, Some(options.to_flags()))
            .map(ProcessEvent::from)
            .map_err(|source| StressError::Wait { pid: None, source })
    }

    fn suspend(&self) {
        shutdown::suspend();
    }
}
