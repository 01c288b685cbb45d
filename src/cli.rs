//! Command line front end. `main.rs` only parses and sets up logging.

use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};
use uuid::Uuid;

use crate::{config::Hooks, lifecycle::Lifecycle, linux, runtime::Runtime, EXIT_SUPERVISOR};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run an OCI bundle through an external runtime, with hooks and guaranteed
/// cleanup.
#[derive(Parser, Debug)]
#[command(name = "ocirun")]
#[command(version = VERSION)]
pub struct Options {
    /// The base runtime command (e.g. -r sudo -r runc)
    #[arg(short = 'r', long = "runtime", value_name = "ARG", allow_hyphen_values = true)]
    pub runtime: Vec<String>,

    /// Path to the OCI bundle
    #[arg(short, long, default_value = ".")]
    pub bundle: PathBuf,

    /// Container ID (random when omitted)
    #[arg(long)]
    pub id: Option<String>,

    /// Hook table (default: <bundle>/hooks.json)
    #[arg(long)]
    pub hooks: Option<PathBuf>,

    /// Object key to descend into before reading hooks (repeatable)
    #[arg(long = "hooks-key", value_name = "KEY")]
    pub hooks_key: Vec<String>,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

/// Drive one container through its lifecycle and return the process exit code.
pub fn run(options: Options) -> i32 {
    let id = options
        .id
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let bundle = options.bundle;
    let hooks_path = options
        .hooks
        .unwrap_or_else(|| bundle.join("hooks.json"));
    let hooks = match Hooks::read_file(&hooks_path, &options.hooks_key) {
        Ok(hooks) => hooks,
        Err(err) => {
            error!("Failed to load hooks from {}: {}", hooks_path.display(), err);
            return 1;
        }
    };

    if let Err(err) = linux::set_child_subreaper() {
        error!("Failed to become child subreaper: {}", err);
        return EXIT_SUPERVISOR;
    }

    let runtime = Runtime::new(options.runtime);
    info!(
        "ocirun v{} running {} with {}",
        VERSION,
        id,
        runtime.command_line().join(" ")
    );
    let outcome = Lifecycle::new(&runtime, &hooks, bundle, id).run();

    // Descendants re-parented to us while the container ran.
    let reaped = linux::reap_orphans();
    if reaped > 0 {
        info!("Reaped {} orphaned processes", reaped);
    }

    if let Some(err) = &outcome.cleanup_error {
        warn!("{}", err);
    }
    let code = outcome.exit_code();
    if outcome.succeeded() {
        info!("Container finished cleanly");
    } else {
        info!("Exiting with {}", code);
    }
    code
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use rusty_fork::rusty_fork_test;

    use super::*;

    /// Fake runtime whose init is a short `sleep`; every call is logged.
    fn fake_runtime(dir: &Path) -> String {
        let dir = dir.display();
        format!(
            "case \"$1\" in\n\
             create) sleep 1 & echo $! > '{dir}/pid' ;;\n\
             state) printf '{{\"id\":\"%s\",\"status\":\"created\",\"pid\":%s}}' \
             \"$2\" \"$(cat '{dir}/pid')\" ;;\n\
             esac\n\
             echo \"$*\" >> '{dir}/calls'\n",
            dir = dir
        )
    }

    fn options(dir: &Path, extra: &[&str]) -> Options {
        let script = fake_runtime(dir);
        let bundle = dir.display().to_string();
        let mut args = vec![
            "ocirun", "-r", "/bin/sh", "-r", "-c", "-r", script.as_str(), "-r", "fake-runc",
            "--bundle", bundle.as_str(),
        ];
        args.extend_from_slice(extra);
        Options::try_parse_from(args).unwrap()
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("calls"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Processes, zombies included, whose parent is this process.
    fn children() -> usize {
        let ppid = format!("PPid:\t{}", std::process::id());
        fs::read_dir("/proc")
            .unwrap()
            .filter_map(|entry| fs::read_to_string(entry.ok()?.path().join("status")).ok())
            .filter(|status| status.lines().any(|line| line == ppid))
            .count()
    }

    #[test]
    fn runtime_is_repeatable_and_accepts_dashes() {
        let options =
            Options::try_parse_from(&["ocirun", "-r", "sudo", "-r", "-n", "-r", "runc"]).unwrap();
        assert_eq!(options.runtime, vec!["sudo", "-n", "runc"]);
        assert_eq!(options.bundle, PathBuf::from("."));
        assert!(options.id.is_none());
        assert!(!options.verbose);
    }

    #[test]
    fn hooks_key_is_repeatable() {
        let options = Options::try_parse_from(&[
            "ocirun", "--hooks", "/etc/ocirun.json", "--hooks-key", "web", "--hooks-key", "hooks",
        ])
        .unwrap();
        assert_eq!(options.hooks, Some(PathBuf::from("/etc/ocirun.json")));
        assert_eq!(options.hooks_key, vec!["web", "hooks"]);
    }

    rusty_fork_test! {
        #[test]
        fn clean_run_uses_bundle_hooks_and_random_id() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("poststop-ran");
            let table = serde_json::json!({
                "poststop": [{
                    "path": "/bin/sh",
                    "args": ["sh", "-c", format!("touch '{}'", marker.display())],
                }]
            });
            fs::write(dir.path().join("hooks.json"), table.to_string()).unwrap();

            assert_eq!(run(options(dir.path(), &[])), 0);
            assert!(marker.exists());

            let calls = calls(dir.path());
            let verbs: Vec<&str> = calls
                .iter()
                .map(|line| line.split(' ').next().unwrap())
                .collect();
            assert_eq!(verbs, vec!["create", "state", "start", "delete"]);
            let id = calls[0].split(' ').last().unwrap();
            assert_eq!(id.len(), 32);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
            assert!(calls.iter().all(|line| line.ends_with(id)));
        }

        #[test]
        fn explicit_id_is_passed_to_the_runtime() {
            let dir = tempfile::tempdir().unwrap();
            assert_eq!(run(options(dir.path(), &["--id", "web-1"])), 0);
            assert!(calls(dir.path()).iter().all(|line| line.ends_with(" web-1")));
        }

        #[test]
        fn unreadable_hook_table_fails_before_create() {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("hooks.json"), "{ not json").unwrap();
            assert_eq!(run(options(dir.path(), &[])), 1);
            assert!(!dir.path().join("calls").exists());
        }

        #[test]
        fn orphans_left_by_the_container_are_reaped() {
            let dir = tempfile::tempdir().unwrap();
            let table = serde_json::json!({
                "poststart": [{
                    "path": "/bin/sh",
                    "args": ["sh", "-c", "(sh -c 'exit 0' &)"],
                }]
            });
            fs::write(dir.path().join("hooks.json"), table.to_string()).unwrap();

            assert_eq!(run(options(dir.path(), &[])), 0);
            assert_eq!(children(), 0);
        }
    }
}
