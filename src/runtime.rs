use std::{
    collections::HashMap,
    ffi::OsStr,
    fmt,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use log::{debug, error, info};
use serde::Deserialize;

use crate::{
    container::{ContainerState, Status},
    linux, OrchestratorError, Result,
};

pub const DEFAULT_RUNTIME: &str = "runc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    Create,
    State,
    Start,
    Delete
}

impl fmt::Display for RuntimePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimePhase::Create => "create",
            RuntimePhase::State => "state",
            RuntimePhase::Start => "start",
            RuntimePhase::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// What `<runtime> state <id>` prints.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    #[serde(default)]
    pub oci_version: Option<String>,
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub pid: Option<i32>,
    #[serde(default)]
    pub bundle: Option<PathBuf>,
    #[serde(default)]
    pub annotations: HashMap<String, String>
}

/// The subcommands of an OCI runtime. Each call blocks until the runtime
/// exits; none of them undo each other.
pub trait ContainerRuntime {
    fn create(&self, bundle: &Path, id: &str) -> Result<ContainerState>;
    fn state(&self, id: &str) -> Result<RuntimeState>;
    fn start(&self, id: &str) -> Result<()>;
    fn delete(&self, id: &str, force: bool) -> Result<()>;
}

/// An external runtime binary, optionally behind a wrapper such as `sudo`.
#[derive(Debug, Clone, PartialEq)]
pub struct Runtime {
    command: Vec<String>
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime { command: vec![DEFAULT_RUNTIME.to_string()] }
    }
}

impl Runtime {
    /// `command` is the base command line, e.g. `["sudo", "runc"]`.
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command: Vec<String> = command.into_iter().map(Into::into).collect();
        if command.is_empty() {
            return Runtime::default();
        }
        Runtime { command }
    }

    pub fn command_line(&self) -> &[String] {
        &self.command
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        linux::unblock_termination_signals(&mut cmd);
        cmd
    }

    /// Run one subcommand. With `capture`, stdout is returned and stderr is
    /// kept for the error. `create` must not capture: the container inherits
    /// the runtime's stdio and would hold the pipes open.
    fn invoke(&self, phase: RuntimePhase, args: &[&OsStr], capture: bool) -> Result<Vec<u8>> {
        let mut cmd = self.base_command();
        cmd.args(args);
        debug!("Executing {:?}", cmd);
        let spawn_failed = |err: std::io::Error| OrchestratorError::Runtime {
            phase,
            exit_code: None,
            stderr: format!("failed to execute {}: {}", self.command[0], err),
        };
        let output = if capture {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .map_err(spawn_failed)?
        } else {
            let status = cmd.status().map_err(spawn_failed)?;
            Output { status, stdout: Vec::new(), stderr: Vec::new() }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
            error!("runtime {} exited with {}: {}", phase, output.status, stderr);
            return Err(OrchestratorError::Runtime {
                phase,
                exit_code: output.status.code(),
                stderr,
            });
        }
        debug!("runtime {} successful", phase);
        Ok(output.stdout)
    }
}

impl ContainerRuntime for Runtime {
    fn create(&self, bundle: &Path, id: &str) -> Result<ContainerState> {
        info!("Creating container {} from {}", id, bundle.display());
        self.invoke(
            RuntimePhase::Create,
            &[OsStr::new("create"), bundle.as_os_str(), OsStr::new(id)],
            false,
        )?;
        let mut state = ContainerState::new(id, bundle);
        state.advance(Status::Created)?;
        Ok(state)
    }

    fn state(&self, id: &str) -> Result<RuntimeState> {
        let stdout = self.invoke(
            RuntimePhase::State,
            &[OsStr::new("state"), OsStr::new(id)],
            true,
        )?;
        serde_json::from_slice(&stdout).map_err(|err| OrchestratorError::Runtime {
            phase: RuntimePhase::State,
            exit_code: Some(0),
            stderr: format!("unparsable state output: {}", err),
        })
    }

    fn start(&self, id: &str) -> Result<()> {
        info!("Starting container {}", id);
        self.invoke(RuntimePhase::Start, &[OsStr::new("start"), OsStr::new(id)], true)?;
        Ok(())
    }

    fn delete(&self, id: &str, force: bool) -> Result<()> {
        info!("Deleting container {}{}", id, if force { " (forced)" } else { "" });
        let mut args = vec![OsStr::new("delete")];
        if force {
            args.push(OsStr::new("--force"));
        }
        args.push(OsStr::new(id));
        self.invoke(RuntimePhase::Delete, &args, true)?;
        Ok(())
    }
}
