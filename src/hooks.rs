//! OCI hook execution: the container state is written to
//! the hook's stdin as JSON and the hook's exit status decides success.
//!
//! `Hook::timeout` is not enforced. A hook that never exits blocks its phase,
//! and with it the whole lifecycle, indefinitely.

use std::{
    io::{ErrorKind, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Command, Stdio},
};

use log::{debug, error, warn};

use crate::{
    config::{Hook, HookEvent},
    container::ContainerState,
    linux, OrchestratorError, Result,
};

/// What a phase does with a failing hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPolicy {
    /// Stop at the first failure and return it.
    Strict,
    /// Run every hook, then return the first failure.
    BestEffort
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookResult {
    pub name: String,
    /// Exit code, or 128 + signal number.
    pub status: i32,
    pub stderr: String
}

impl HookResult {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn into_error(self) -> OrchestratorError {
        OrchestratorError::Hook {
            name: self.name,
            status: self.status,
            stderr: self.stderr,
        }
    }
}

/// Spawn one hook, feed it `state` and wait for it.
pub fn run(hook: &Hook, name: &str, state: &ContainerState) -> Result<HookResult> {
    let input = state.to_json()?;

    let mut cmd = Command::new(&hook.path);
    if let Some((arg0, rest)) = hook.args.as_deref().and_then(<[String]>::split_first) {
        cmd.arg0(arg0).args(rest);
    }
    cmd.envs(hook.env_pairs())
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped());
    linux::unblock_termination_signals(&mut cmd);

    let mut child = cmd.spawn().map_err(|err| OrchestratorError::HookSpawn {
        name: name.to_string(),
        err,
    })?;
    debug!("spawned {} process with PID {}", name, child.id());

    // Dropping stdin after the write closes it.
    let written = match child.stdin.take() {
        Some(mut stdin) => stdin.write_all(&input),
        None => Ok(()),
    };
    let output = child.wait_with_output()?;
    match written {
        Err(err) if err.kind() == ErrorKind::BrokenPipe => {
            debug!("{} exited without reading its state", name);
        }
        Err(err) => return Err(err.into()),
        Ok(()) => {}
    }

    let status = output
        .status
        .code()
        .unwrap_or_else(|| 128 + output.status.signal().unwrap_or(0));
    debug!("{} process exited with {}", name, status);
    Ok(HookResult {
        name: name.to_string(),
        status,
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
    })
}

/// Run the hooks of one phase in declared order, one at a time.
pub fn run_phase(
    event: HookEvent,
    hooks: &[Hook],
    state: &ContainerState,
    policy: HookPolicy,
) -> Result<()> {
    let mut first_failure = None;
    for (i, hook) in hooks.iter().enumerate() {
        let name = format!("hook {}[{}]", event, i);
        let failure = match run(hook, &name, state) {
            Ok(result) if result.success() => continue,
            Ok(result) => result.into_error(),
            Err(err) => err,
        };
        match policy {
            HookPolicy::Strict => {
                error!("{}", failure);
                return Err(failure);
            }
            HookPolicy::BestEffort => {
                warn!("{}", failure);
                if first_failure.is_none() {
                    first_failure = Some(failure);
                }
            }
        }
    }
    match first_failure {
        Some(failure) => Err(failure),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::{Path, PathBuf},
        time::{Duration, Instant},
    };

    use crate::container::Status;

    use super::*;

    fn sh(script: &str) -> Hook {
        Hook {
            path: PathBuf::from("/bin/sh"),
            args: Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]),
            env: None,
            timeout: None,
        }
    }

    fn state() -> ContainerState {
        let mut state = ContainerState::new("web-1", Path::new("/bundles/web"));
        state.advance(Status::Created).unwrap();
        state.pid = Some(1234);
        state
    }

    #[test]
    fn hook_receives_state_on_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("state.json");
        let hook = sh(&format!("cat > '{}'", out.display()));
        let result = run(&hook, "hook prestart[0]", &state()).unwrap();
        assert!(result.success());

        let received: ContainerState = serde_json::from_slice(&fs::read(&out).unwrap()).unwrap();
        assert_eq!(received, state());
    }

    #[test]
    fn env_is_merged_and_args_are_passed() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env");
        let mut hook = sh(&format!(
            "echo \"$0 $GREETING ${{PATH:+has-path}}\" > '{}'",
            out.display()
        ));
        hook.args.as_mut().unwrap().push("renamed".to_string());
        hook.env = Some(vec!["GREETING=hello".to_string()]);
        run(&hook, "hook poststart[0]", &state()).unwrap();
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "renamed hello has-path");
    }

    #[test]
    fn failure_reports_status_and_stderr() {
        let hook = sh("echo 'no network' >&2; exit 4");
        let result = run(&hook, "hook prestart[1]", &state()).unwrap();
        assert!(!result.success());
        assert_eq!(result.status, 4);
        assert_eq!(result.stderr, "no network");
        match result.into_error() {
            OrchestratorError::Hook { name, status, .. } => {
                assert_eq!(name, "hook prestart[1]");
                assert_eq!(status, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn hook_may_ignore_its_stdin() {
        let result = run(&sh("exit 0"), "hook poststop[0]", &state()).unwrap();
        assert!(result.success());
    }

    #[test]
    fn signal_death_maps_above_128() {
        let result = run(&sh("kill -9 $$"), "hook poststop[0]", &state()).unwrap();
        assert_eq!(result.status, 128 + 9);
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let hook = Hook {
            path: PathBuf::from("/nonexistent/hook"),
            args: None,
            env: None,
            timeout: None,
        };
        match run(&hook, "hook prestart[0]", &state()) {
            Err(OrchestratorError::HookSpawn { name, .. }) => assert_eq!(name, "hook prestart[0]"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn hooks_run_in_declared_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("order");
        let hooks: Vec<Hook> = ["a", "b", "c"]
            .iter()
            .map(|tag| sh(&format!("echo {} >> '{}'", tag, log.display())))
            .collect();
        run_phase(HookEvent::Prestart, &hooks, &state(), HookPolicy::Strict).unwrap();
        assert_eq!(fs::read_to_string(&log).unwrap(), "a\nb\nc\n");
    }

    #[test]
    fn strict_phase_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("order");
        let hooks = vec![
            sh(&format!("echo a >> '{}'", log.display())),
            sh("exit 2"),
            sh(&format!("echo c >> '{}'", log.display())),
        ];
        match run_phase(HookEvent::Prestart, &hooks, &state(), HookPolicy::Strict) {
            Err(OrchestratorError::Hook { name, status, .. }) => {
                assert_eq!(name, "hook prestart[1]");
                assert_eq!(status, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read_to_string(&log).unwrap(), "a\n");
    }

    #[test]
    fn best_effort_phase_runs_all_and_returns_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("order");
        let hooks = vec![
            sh("exit 5"),
            sh("exit 6"),
            sh(&format!("echo c >> '{}'", log.display())),
        ];
        match run_phase(HookEvent::Poststop, &hooks, &state(), HookPolicy::BestEffort) {
            Err(OrchestratorError::Hook { name, status, .. }) => {
                assert_eq!(name, "hook poststop[0]");
                assert_eq!(status, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs::read_to_string(&log).unwrap(), "c\n");
    }

    #[test]
    fn timeout_is_not_enforced() {
        let mut hook = sh("sleep 2; exit 0");
        hook.timeout = Some(1);
        let started = Instant::now();
        let result = run(&hook, "hook prestart[0]", &state()).unwrap();
        assert!(result.success());
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
