//! The create → start → wait → delete sequence.
//!
//! Once `create` succeeds the runtime-level container is owned by a
//! [`CreatedContainer`], whose release runs `delete` exactly once: either
//! explicitly at the end of the run or from `Drop` on any other exit path.

use std::{fmt, path::{Path, PathBuf}};

use log::{error, info, warn};
use nix::{sys::signal::{kill, Signal}, unistd::Pid};

use crate::{
    config::{HookEvent, Hooks},
    container::{ContainerState, Status},
    hooks::{self, HookPolicy},
    linux::{self, ContainerExit, DeathSignal, TerminationSignals},
    runtime::{ContainerRuntime, RuntimePhase},
    OrchestratorError, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Creating,
    Created,
    Running,
    Stopping,
    Failed,
    Deleted
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A container that exists in the runtime and must be deleted.
pub struct CreatedContainer<'r, R: ContainerRuntime + ?Sized> {
    runtime: &'r R,
    state: ContainerState,
    released: bool
}

impl<'r, R: ContainerRuntime + ?Sized> CreatedContainer<'r, R> {
    pub fn create(runtime: &'r R, bundle: &Path, id: &str) -> Result<Self> {
        let state = runtime.create(bundle, id)?;
        Ok(CreatedContainer { runtime, state, released: false })
    }

    pub fn state(&self) -> &ContainerState {
        &self.state
    }

    /// Learn the init pid and annotations from the runtime.
    pub fn refresh(&mut self) -> Result<Pid> {
        let reported = self.runtime.state(&self.state.id)?;
        self.state.merge(reported);
        match self.state.pid {
            Some(pid) if pid > 0 => Ok(Pid::from_raw(pid)),
            _ => Err(OrchestratorError::Runtime {
                phase: RuntimePhase::State,
                exit_code: Some(0),
                stderr: format!("runtime reported no pid for {}", self.state.id),
            }),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.runtime.start(&self.state.id)?;
        self.state.advance(Status::Running)
    }

    pub fn stopped(&mut self) -> Result<()> {
        self.state.advance(Status::Stopped)
    }

    /// Delete the container. Consumes the guard, so this runs at most once.
    pub fn release(mut self, force: bool) -> Result<()> {
        self.delete(force)
    }

    fn delete(&mut self, force: bool) -> Result<()> {
        self.released = true;
        self.runtime.delete(&self.state.id, force)?;
        self.state.advance(Status::Deleted)
    }
}

impl<'r, R: ContainerRuntime + ?Sized> Drop for CreatedContainer<'r, R> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("Container {} was not released, forcing delete", self.state.id);
        if let Err(err) = self.delete(true) {
            error!("Forced delete of {} failed: {}", self.state.id, err);
        }
    }
}

/// How a lifecycle ended.
#[derive(Debug, Default)]
pub struct Outcome {
    pub phases: Vec<Phase>,
    /// Exit status of the container init, when it was observed.
    pub container_status: Option<i32>,
    /// Termination signal that cut the run short.
    pub signal: Option<Signal>,
    /// First failure of the run.
    pub error: Option<OrchestratorError>,
    /// Delete failure, kept apart so it never hides `error`.
    pub cleanup_error: Option<OrchestratorError>
}

impl Outcome {
    fn enter(&mut self, phase: Phase) {
        info!("Entering {}", phase);
        self.phases.push(phase);
    }

    fn fail(&mut self, err: OrchestratorError) {
        if self.error.is_some() {
            warn!("Additional failure: {}", err);
        } else {
            self.error = Some(err);
        }
    }

    fn interrupt(&mut self, signal: Signal) {
        if self.signal.is_none() {
            self.signal = Some(signal);
        }
    }

    fn must_force(&self) -> bool {
        self.error.is_some() || self.signal.is_some()
    }

    /// The orchestrator's exit code. The first failure wins, then an
    /// interrupting signal, then a delete failure, then the container's own
    /// status (capped at 127).
    pub fn exit_code(&self) -> i32 {
        if let Some(err) = &self.error {
            return err.exit_code();
        }
        if let Some(signal) = self.signal {
            return 128 + signal as i32;
        }
        if let Some(err) = &self.cleanup_error {
            return err.exit_code();
        }
        self.container_status.map_or(0, |status| status.min(127))
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == 0
    }
}

pub struct Lifecycle<'a, R: ContainerRuntime + ?Sized> {
    runtime: &'a R,
    hooks: &'a Hooks,
    bundle: PathBuf,
    id: String
}

impl<'a, R: ContainerRuntime + ?Sized> Lifecycle<'a, R> {
    pub fn new<B, S>(runtime: &'a R, hooks: &'a Hooks, bundle: B, id: S) -> Self
    where
        B: Into<PathBuf>,
        S: Into<String>,
    {
        Lifecycle {
            runtime,
            hooks,
            bundle: bundle.into(),
            id: id.into(),
        }
    }

    pub fn run(&self) -> Outcome {
        let mut outcome = Outcome::default();
        let signals = match TerminationSignals::block() {
            Ok(signals) => signals,
            Err(err) => {
                outcome.fail(err);
                return outcome;
            }
        };
        self.drive(&signals, &mut outcome);
        // Anything still pending would be delivered once the mask is restored.
        while let Some(signal) = signals.pending() {
            info!("Received {:?} during cleanup", signal);
            outcome.interrupt(signal);
        }
        outcome
    }

    fn drive(&self, signals: &TerminationSignals, outcome: &mut Outcome) {
        outcome.enter(Phase::Creating);
        let mut container = match CreatedContainer::create(self.runtime, &self.bundle, &self.id) {
            Ok(container) => container,
            Err(err) => {
                error!("Failed to create container {}: {}", self.id, err);
                outcome.fail(err);
                outcome.enter(Phase::Deleted);
                return;
            }
        };
        outcome.enter(Phase::Created);

        let (pid, supervisor) = match self.supervise(&mut container) {
            Ok(supervised) => supervised,
            Err(err) => {
                outcome.fail(err);
                outcome.enter(Phase::Failed);
                self.delete(container, None, outcome);
                return;
            }
        };
        let mut supervisor = Some(supervisor);

        if self.launch(&mut container, signals, outcome) {
            outcome.enter(Phase::Running);
            let poststart =
                self.run_hooks(HookEvent::Poststart, &container, HookPolicy::BestEffort);
            if let Err(err) = poststart {
                outcome.fail(err);
            }
            if let Some(signal) = signals.pending() {
                outcome.interrupt(signal);
            } else {
                match linux::wait_container(pid, signals) {
                    Ok(ContainerExit::Exited(status)) => {
                        outcome.container_status = Some(status);
                        // The pid is free for reuse from here on.
                        disarm(supervisor.take());
                    }
                    Ok(ContainerExit::Interrupted(signal)) => outcome.interrupt(signal),
                    Err(err) => outcome.fail(err),
                }
            }
        }

        outcome.enter(Phase::Stopping);
        if let Err(err) = container.stopped() {
            outcome.fail(err);
        }
        if let Err(err) = self.run_hooks(HookEvent::Poststop, &container, HookPolicy::BestEffort) {
            outcome.fail(err);
        }
        self.delete(container, supervisor, outcome);
    }

    fn supervise(&self, container: &mut CreatedContainer<'a, R>) -> Result<(Pid, DeathSignal)> {
        let pid = container.refresh()?;
        info!("Container {} has init process {}", self.id, pid);
        let supervisor = DeathSignal::arm(pid)?;
        Ok((pid, supervisor))
    }

    /// Prestart hooks then `start`. False when the run must go straight to
    /// stopping.
    fn launch(
        &self,
        container: &mut CreatedContainer<'a, R>,
        signals: &TerminationSignals,
        outcome: &mut Outcome,
    ) -> bool {
        if let Some(signal) = signals.pending() {
            outcome.interrupt(signal);
            return false;
        }
        if let Err(err) = self.run_hooks(HookEvent::Prestart, container, HookPolicy::Strict) {
            outcome.fail(err);
            return false;
        }
        if let Some(signal) = signals.pending() {
            outcome.interrupt(signal);
            return false;
        }
        if let Err(err) = container.start() {
            error!("Failed to start container {}: {}", self.id, err);
            outcome.fail(err);
            return false;
        }
        true
    }

    fn run_hooks(
        &self,
        event: HookEvent,
        container: &CreatedContainer<'a, R>,
        policy: HookPolicy,
    ) -> Result<()> {
        hooks::run_phase(event, self.hooks.get(event), container.state(), policy)
    }

    fn delete(
        &self,
        container: CreatedContainer<'a, R>,
        supervisor: Option<DeathSignal>,
        outcome: &mut Outcome,
    ) {
        if let Err(err) = container.release(outcome.must_force()) {
            let err = OrchestratorError::Cleanup(Box::new(err));
            if outcome.error.is_some() {
                warn!("{}", err);
            } else {
                error!("{}", err);
            }
            outcome.cleanup_error = Some(err);
        }
        outcome.enter(Phase::Deleted);

        // A supervisor is only still held while the init is unreaped, so a
        // container that outlived a failed delete must still die with us.
        match supervisor {
            Some(supervisor)
                if outcome.cleanup_error.is_some() && kill(supervisor.target(), None).is_ok() =>
            {
                supervisor.persist()
            }
            other => disarm(other),
        }
    }
}

fn disarm(supervisor: Option<DeathSignal>) {
    if let Some(supervisor) = supervisor {
        if let Err(err) = supervisor.disarm() {
            warn!("{}", err);
        }
    }
}
