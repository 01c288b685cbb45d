use std::{convert::TryFrom, io, os::unix::process::CommandExt, process::Command, time::Duration};

use log::{debug, info, warn};
use nix::{
    errno::Errno,
    sys::{
        prctl,
        signal::{kill, pthread_sigmask, sigprocmask, SigSet, SigmaskHow, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, getpid, getppid, ForkResult, Pid},
};

use crate::{OrchestratorError, Result};

/// Signals that divert a running lifecycle into cleanup.
pub const TERMINATION_SIGNALS: [Signal; 4] =
    [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP, Signal::SIGQUIT];

/// Parent-death signal the watchdog asks the kernel for.
const WATCHDOG_SIGNAL: Signal = Signal::SIGUSR1;

/// How long the container wait sleeps in `sigtimedwait` between polls.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code used when the container exited but its status could not be read.
const UNKNOWN_EXIT: i32 = 255;

fn termination_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in TERMINATION_SIGNALS.iter() {
        set.add(*signal);
    }
    set
}

/// Re-parent orphaned descendants to this process, so the container init
/// that the runtime double-forks can be waited on.
pub fn set_child_subreaper() -> Result<()> {
    prctl::set_child_subreaper(true)?;
    Ok(())
}

/// Reap every exited child without blocking; returns how many were reaped.
/// Only safe once no other code in the process waits on specific children.
pub fn reap_orphans() -> usize {
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, status)) => {
                debug!("Reaped orphan {} with status {}", pid, status);
                reaped += 1;
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                debug!("Reaped orphan {} killed by {:?}", pid, signal);
                reaped += 1;
            }
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("waitpid failed while reaping orphans: {}", err);
                break;
            }
        }
    }
    reaped
}

/// Children must not inherit the blocked termination signals.
pub fn unblock_termination_signals(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&termination_set()), None)
                .map_err(io::Error::from)
        });
    }
}

/// Termination signals blocked on the calling thread so they can be taken
/// synchronously. The previous mask comes back on drop.
pub struct TerminationSignals {
    previous: SigSet
}

impl TerminationSignals {
    pub fn block() -> Result<Self> {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&termination_set()), Some(&mut previous))?;
        Ok(TerminationSignals { previous })
    }

    /// Take a termination signal if one is already pending.
    pub fn pending(&self) -> Option<Signal> {
        self.wait(Duration::from_secs(0))
    }

    /// Take a termination signal, waiting up to `timeout` for one.
    pub fn wait(&self, timeout: Duration) -> Option<Signal> {
        let set = termination_set();
        let timeout = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let signo = unsafe { libc::sigtimedwait(set.as_ref(), std::ptr::null_mut(), &timeout) };
        if signo < 0 {
            return None;
        }
        Signal::try_from(signo).ok()
    }
}

impl Drop for TerminationSignals {
    fn drop(&mut self) {
        if let Err(err) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!("Failed to restore signal mask: {}", err);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerExit {
    /// Exit code, or 128 + signal number.
    Exited(i32),
    Interrupted(Signal)
}

/// Block until the container init exits or a termination signal arrives.
/// Only `pid` is ever reaped here.
pub fn wait_container(pid: Pid, signals: &TerminationSignals) -> Result<ContainerExit> {
    info!("Waiting on container process {}", pid);
    let mut adopted = true;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                info!("Container process {} exited with {}", pid, code);
                return Ok(ContainerExit::Exited(code));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                info!("Container process {} was killed by {:?}", pid, signal);
                return Ok(ContainerExit::Exited(128 + signal as i32));
            }
            Ok(_) => {}
            Err(Errno::ECHILD) => {
                if adopted {
                    warn!("Container process {} is not our child, polling for its exit", pid);
                    adopted = false;
                }
                if let Err(Errno::ESRCH) = kill(pid, None) {
                    info!("Container process {} is gone, exit status unknown", pid);
                    return Ok(ContainerExit::Exited(UNKNOWN_EXIT));
                }
            }
            Err(err) => return Err(err.into()),
        }
        if let Some(signal) = signals.wait(POLL_INTERVAL) {
            info!("Received {:?} while waiting on container process {}", signal, pid);
            return Ok(ContainerExit::Interrupted(signal));
        }
    }
}

/// Kill-on-orchestrator-death for a process that is not our direct child.
///
/// `PR_SET_PDEATHSIG` only applies to the caller's own children and is
/// cleared across fork, so a forked watchdog asks for it instead and SIGKILLs
/// the target once it fires. The watchdog is bound to the process that armed
/// it: after a fork, call [`DeathSignal::rearm`] from the new process.
#[derive(Debug)]
pub struct DeathSignal {
    target: Pid,
    owner: Pid,
    watchdog: Option<Pid>
}

impl DeathSignal {
    pub fn arm(target: Pid) -> Result<Self> {
        let mut supervisor = DeathSignal {
            target,
            owner: getpid(),
            watchdog: None,
        };
        supervisor.spawn_watchdog()?;
        Ok(supervisor)
    }

    pub fn target(&self) -> Pid {
        self.target
    }

    /// Whether a watchdog is watching the current process.
    pub fn is_armed(&self) -> bool {
        self.watchdog.is_some() && self.owner == getpid()
    }

    pub fn rearm(&mut self) -> Result<()> {
        if self.owner == getpid() {
            self.stop_watchdog()?;
        } else {
            // The old watchdog belongs to the process we were forked from.
            self.watchdog = None;
            self.owner = getpid();
        }
        self.spawn_watchdog()
    }

    pub fn disarm(mut self) -> Result<()> {
        self.stop_watchdog()
    }

    /// Leave the watchdog running past this handle, so the target is killed
    /// whenever this process exits.
    pub fn persist(mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            info!("Leaving watchdog {} armed for process {}", watchdog, self.target);
        }
    }

    fn spawn_watchdog(&mut self) -> Result<()> {
        let (owner, target) = (self.owner, self.target);
        match unsafe { fork() }.map_err(OrchestratorError::DeathSignal)? {
            ForkResult::Parent { child } => {
                debug!("Armed death signal for {} via watchdog {}", target, child);
                self.watchdog = Some(child);
                Ok(())
            }
            ForkResult::Child => watchdog(owner, target),
        }
    }

    fn stop_watchdog(&mut self) -> Result<()> {
        let watchdog = match self.watchdog.take() {
            Some(watchdog) => watchdog,
            None => return Ok(()),
        };
        match kill(watchdog, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(OrchestratorError::DeathSignal(err)),
        }
        match waitpid(watchdog, None) {
            Ok(_) | Err(Errno::ECHILD) => {}
            Err(err) => return Err(OrchestratorError::DeathSignal(err)),
        }
        debug!("Disarmed death signal for {}", self.target);
        Ok(())
    }
}

impl Drop for DeathSignal {
    fn drop(&mut self) {
        if self.owner != getpid() {
            return;
        }
        if let Err(err) = self.stop_watchdog() {
            warn!("Failed to disarm death signal for {}: {}", self.target, err);
        }
    }
}

/// Body of the forked watchdog. Only async-signal-safe calls from here on.
fn watchdog(owner: Pid, target: Pid) -> ! {
    let _ = SigSet::all().thread_block();
    let code = match prctl::set_pdeathsig(WATCHDOG_SIGNAL) {
        Ok(()) => {
            // The owner may already be gone before the death signal was set.
            if getppid() == owner {
                let mut wake = SigSet::empty();
                wake.add(WATCHDOG_SIGNAL);
                loop {
                    match wake.wait() {
                        Err(Errno::EINTR) => continue,
                        _ => break,
                    }
                }
            }
            let _ = kill(target, Signal::SIGKILL);
            0
        }
        Err(_) => 1,
    };
    unsafe { libc::_exit(code) }
}
