use std::{fmt, fs, io::ErrorKind, path::{Path, PathBuf}};

use log::{debug, warn};
use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::Result;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Hook {
    pub path: PathBuf,
    pub args: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    /// Seconds. Accepted but not enforced.
    pub timeout: Option<i32>
}

impl Hook {
    /// `KEY=VALUE` entries split into pairs. Entries without `=` are skipped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env
            .iter()
            .flatten()
            .filter_map(|entry| {
                let pair = entry.split_once('=');
                if pair.is_none() {
                    warn!("Ignoring malformed hook env entry `{}`", entry);
                }
                pair
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    Prestart,
    Poststart,
    Poststop
}

impl HookEvent {
    pub const ALL: [HookEvent; 3] =
        [HookEvent::Prestart, HookEvent::Poststart, HookEvent::Poststop];
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookEvent::Prestart => "prestart",
            HookEvent::Poststart => "poststart",
            HookEvent::Poststop => "poststop",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Hooks {
    #[serde(default)]
    pub prestart: Vec<Hook>,
    #[serde(default)]
    pub poststart: Vec<Hook>,
    #[serde(default)]
    pub poststop: Vec<Hook>
}

impl Hooks {
    /// Load hooks from a JSON file. `keys` walks into nested objects first,
    /// so `["hooks"]` reads the hook table of a bundle's `config.json`.
    /// A missing file or key means no hooks.
    pub fn read_file<P: AsRef<Path>>(path: P, keys: &[String]) -> Result<Hooks> {
        let path = path.as_ref();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("No hook file at {}", path.display());
                return Ok(Hooks::default());
            }
            Err(err) => return Err(err.into()),
        };
        let value: Value = serde_json::from_slice(&bytes)?;
        Hooks::from_value(value, keys)
    }

    pub fn from_value(mut value: Value, keys: &[String]) -> Result<Hooks> {
        for key in keys {
            value = match value.get_mut(key.as_str()) {
                Some(nested) => nested.take(),
                None => Value::Null,
            };
        }
        if value.is_null() {
            return Ok(Hooks::default());
        }
        let hooks: Hooks = serde_json::from_value(value)?;
        hooks.warn_unenforced_timeouts();
        Ok(hooks)
    }

    pub fn get(&self, event: HookEvent) -> &[Hook] {
        match event {
            HookEvent::Prestart => &self.prestart,
            HookEvent::Poststart => &self.poststart,
            HookEvent::Poststop => &self.poststop,
        }
    }

    fn warn_unenforced_timeouts(&self) {
        for event in HookEvent::ALL.iter() {
            for (i, hook) in self.get(*event).iter().enumerate() {
                if let Some(timeout) = hook.timeout {
                    warn!(
                        "hook {}[{}] declares timeout {}s; timeouts are not enforced \
                         and the hook may block forever",
                        event, i, timeout
                    );
                }
            }
        }
    }
}
