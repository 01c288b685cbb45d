use std::{collections::HashMap, fmt, path::{Path, PathBuf}};

use serde::{Serialize, Deserialize};

use crate::{runtime::RuntimeState, OrchestratorError, Result};

/// Version reported to hooks when the runtime does not name one.
pub const OCI_VERSION: &str = "1.0.2";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Created,
    Running,
    Stopped,
    Deleted
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// State handed to hooks on stdin.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub bundle_path: PathBuf,
    #[serde(default)]
    pub annotations: HashMap<String, String>
}

impl ContainerState {
    pub fn new(id: &str, bundle: &Path) -> Self {
        ContainerState {
            oci_version: OCI_VERSION.to_string(),
            id: id.to_string(),
            status: Status::Creating,
            pid: None,
            bundle_path: bundle.to_path_buf(),
            annotations: HashMap::new(),
        }
    }

    /// Move to `next`. Status only moves forward, except that `Deleted` is
    /// reachable from every other status.
    pub fn advance(&mut self, next: Status) -> Result<()> {
        let allowed = next > self.status
            || (next == Status::Deleted && self.status != Status::Deleted);
        if !allowed {
            return Err(OrchestratorError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Fold what the runtime reported via `state` into our view.
    pub fn merge(&mut self, reported: RuntimeState) {
        if let Some(version) = reported.oci_version {
            self.oci_version = version;
        }
        if reported.pid.is_some() {
            self.pid = reported.pid;
        }
        self.annotations.extend(reported.annotations);
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
