//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;

use codeagent::config::{AppConfig, ProviderConfig};
use codeagent::container::{ContainerRuntime, RuntimeType};
use codeagent::{BackendFactory, CodeBackend, SessionResult, WorkTarget, Workspace};

/// Stand-in for the docker CLI.
///
/// By default every container exists and is running. After
/// [`Sandbox::use_container_table`] only containers with a file under
/// `containers/` exist; the file holds `<status> <labels json>` as printed
/// by `inspect`, and `run`, `start` and `rm` update it.
///
/// A one-shot `exec` echoes its arguments, fails like a logged-out CLI when
/// the prompt mentions "logout" and sleeps when it mentions "slow". An
/// interactive `exec -i` answers each stdin line with two lines followed by
/// an idle prompt; the line "exit" ends the CLI and "hang" gets no answer.
/// Invocations are appended to `calls.log` next to the script, and `run`
/// also logs the `FAKE_KEY` value it inherited.
const FAKE_DOCKER: &str = r#"#!/bin/sh
dir="$(dirname "$0")"
echo "$*" >> "$dir/calls.log"
cmd="$1"
shift
last=""
for arg in "$@"; do last="$arg"; done
case "$cmd" in
  inspect)
    if [ ! -d "$dir/containers" ]; then
      echo "running null"
    elif [ -f "$dir/containers/$last" ]; then
      cat "$dir/containers/$last"
    else
      echo "Error: No such object: $last" >&2
      exit 1
    fi
    ;;
  start)
    if [ -f "$dir/containers/$last" ]; then
      labels="$(cut -d' ' -f2- "$dir/containers/$last")"
      echo "running $labels" > "$dir/containers/$last"
    fi
    ;;
  rm) rm -f "$dir/containers/$last" ;;
  version) echo "fake 1.0" ;;
  run)
    echo "run-env FAKE_KEY=${FAKE_KEY:-}" >> "$dir/calls.log"
    name=""
    session=""
    while [ $# -gt 0 ]; do
      case "$1" in
        -d) shift ;;
        --name) name="$2"; shift 2 ;;
        --label)
          case "$2" in codeagent.session=*) session="${2#codeagent.session=}" ;; esac
          shift 2
          ;;
        -*) shift 2 ;;
        *) break ;;
      esac
    done
    if [ -d "$dir/containers" ]; then
      echo "running {\"codeagent.session\":\"$session\"}" > "$dir/containers/$name"
      if [ -f "$dir/run_conflict" ]; then
        rm -f "$dir/run_conflict"
        echo "Error: the container name \"/$name\" is already in use" >&2
        exit 1
      fi
    fi
    echo fake-container-id
    ;;
  exec)
    interactive=0
    while [ $# -gt 0 ]; do
      case "$1" in
        -i) interactive=1; shift ;;
        -w|-e) shift 2 ;;
        *) break ;;
      esac
    done
    shift
    if [ "$interactive" = 1 ]; then
      if [ -f "$dir/silent" ]; then
        while IFS= read -r line; do :; done
        exit 0
      fi
      while IFS= read -r line; do
        case "$line" in
          exit) exit 0 ;;
          hang) ;;
          *) printf 'reply to %s\nsecond line\n> ' "$line" ;;
        esac
      done
    else
      shift
      case "$*" in
        *logout*) echo "Error: not logged in"; exit 1 ;;
        *slow*) exec sleep 5 ;;
      esac
      echo "exec: $*"
    fi
    ;;
  *) echo "unsupported: $cmd" >&2; exit 1 ;;
esac
"#;

/// Temporary layout for one test: workspace dir, session dir, fake runtime.
pub struct Sandbox {
    pub root: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("workspace")).unwrap();
        fs::create_dir_all(root.path().join("sessions")).unwrap();
        Self { root }
    }

    pub fn workspace_dir(&self) -> PathBuf {
        self.root.path().join("workspace")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.path().join("sessions")
    }

    pub fn workspace(&self, provider: &str, pr: u64) -> Workspace {
        Workspace::new(
            provider,
            "o",
            "r",
            self.workspace_dir(),
            self.sessions_dir(),
            WorkTarget::PullRequest(pr),
        )
    }

    /// Install the fake docker script and return its path.
    pub fn fake_docker(&self) -> PathBuf {
        let path = self.root.path().join("docker");
        fs::write(&path, FAKE_DOCKER).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn fake_runtime(&self) -> ContainerRuntime {
        ContainerRuntime::with_binary(RuntimeType::Docker, self.fake_docker().display().to_string())
    }

    /// Switch the fake runtime from "everything exists" to an explicit
    /// container table, initially empty.
    pub fn use_container_table(&self) {
        fs::create_dir_all(self.root.path().join("containers")).unwrap();
    }

    /// Register a container as `inspect` prints it, e.g. `running null` or
    /// `exited {"codeagent.session":"x/o/r#pr-7"}`.
    pub fn add_container(&self, name: &str, inspect_line: &str) {
        self.use_container_table();
        fs::write(
            self.root.path().join("containers").join(name),
            format!("{inspect_line}\n"),
        )
        .unwrap();
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.root.path().join("containers").join(name).exists()
    }

    /// Make the next `run` lose a creation race: the container appears but
    /// the call fails with a name conflict.
    pub fn fail_next_run(&self) {
        fs::write(self.root.path().join("run_conflict"), "").unwrap();
    }

    /// Make interactive CLIs read stdin without ever answering.
    pub fn silence_cli(&self) {
        fs::write(self.root.path().join("silent"), "").unwrap();
    }

    /// Lines the fake runtime was invoked with.
    pub fn calls(&self) -> Vec<String> {
        read_lines(&self.root.path().join("calls.log"))
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Provider profile for the fake CLI used inside fake containers.
pub fn fake_cli_profile() -> ProviderConfig {
    ProviderConfig {
        command: "fake-cli".to_string(),
        args: vec!["--print".to_string(), "{prompt}".to_string()],
        api_key: Some("k".to_string()),
        api_key_env: Some("FAKE_KEY".to_string()),
        auth_failure_patterns: vec!["not logged in".to_string()],
        probe_message: "probe".to_string(),
        ..Default::default()
    }
}

/// Provider profile running `sh` on the host.
pub fn shell_profile(script: &str) -> ProviderConfig {
    ProviderConfig {
        command: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            "{prompt}".to_string(),
        ],
        ..Default::default()
    }
}

pub fn config_with_provider(name: &str, profile: ProviderConfig) -> AppConfig {
    let mut config = AppConfig::default();
    config.providers.insert(name.to_string(), profile);
    config
}

/// Counts constructions performed by the wrapped factory.
pub struct CountingFactory<F> {
    pub inner: F,
    pub created: AtomicUsize,
}

impl<F> CountingFactory<F> {
    pub fn new(inner: F) -> Arc<Self> {
        Arc::new(Self {
            inner,
            created: AtomicUsize::new(0),
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F: BackendFactory> BackendFactory for CountingFactory<F> {
    async fn create(&self, workspace: &Workspace) -> SessionResult<Arc<dyn CodeBackend>> {
        let backend = self.inner.create(workspace).await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(backend)
    }
}
