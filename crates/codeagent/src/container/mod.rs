//! Container runtime management module.
//!
//! Every container operation is an argument list handed to a single
//! container CLI (`docker` or `podman`). Only the exit code and the
//! stdout/stderr of that CLI are interpreted; no client library is used.

mod config;
mod error;

pub use config::{ContainerConfig, VolumeMount, validate_container_name, validate_image_name};
pub use error::{ContainerError, ContainerResult};

use std::collections::BTreeMap;
use std::process::{Output, Stdio};

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether this runtime requires SELinux volume labels (:Z suffix).
    pub fn needs_selinux_labels(&self) -> bool {
        match self {
            RuntimeType::Docker => false,
            RuntimeType::Podman => true,
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.default_binary())
    }
}

/// Coarse container state as reported by `inspect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    /// Exists but is not running (created, exited, paused, ...).
    Stopped(String),
}

impl ContainerStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "running" => ContainerStatus::Running,
            other => ContainerStatus::Stopped(other.to_string()),
        }
    }
}

/// State and labels of an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub status: ContainerStatus,
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    /// Parse `inspect --format '{{.State.Status}} {{json .Config.Labels}}'`.
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (status, labels) = raw.split_once(' ').unwrap_or((raw, "null"));
        let status = status.trim_matches('"');
        if status.is_empty() {
            return None;
        }
        let labels: Option<BTreeMap<String, String>> = match serde_json::from_str(labels.trim()) {
            Ok(labels) => labels,
            Err(e) => {
                debug!("ignoring unparsable container labels '{}': {}", labels, e);
                None
            }
        };
        Some(Self {
            status: ContainerStatus::parse(status),
            labels: labels.unwrap_or_default(),
        })
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Options for `exec` into a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Keep stdin attached (`-i`).
    pub interactive: bool,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Extra environment for the exec'd process.
    pub env: Vec<(String, String)>,
}

/// Container runtime client.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::with_type(RuntimeType::default())
    }
}

impl ContainerRuntime {
    /// Create a runtime using the default binary for `runtime_type`.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Run the CLI to completion and return its raw output.
    async fn run(&self, command: &str, args: &[String]) -> ContainerResult<Output> {
        self.run_with_env(command, args, &BTreeMap::new()).await
    }

    /// Like [`run`](Self::run), with extra environment for the CLI process.
    async fn run_with_env(
        &self,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> ContainerResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(command, e))
    }

    /// Run the CLI and fail on a non-zero exit status.
    async fn run_checked(&self, command: &str, args: &[String]) -> ContainerResult<String> {
        let output = self.run(command, args).await?;
        if !output.status.success() {
            return Err(ContainerError::CommandFailed {
                command: command.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn spawn_error(&self, command: &str, err: std::io::Error) -> ContainerError {
        if err.kind() == std::io::ErrorKind::NotFound {
            ContainerError::RuntimeUnavailable {
                binary: self.binary.clone(),
                message: err.to_string(),
            }
        } else {
            ContainerError::CommandFailed {
                command: command.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let args = vec!["version".to_string()];
        self.run_checked("version", &args).await
    }

    /// Build the argument list for `run -d`.
    pub fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];

        if let Some(ref name) = config.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        if let Some(ref network_mode) = config.network_mode {
            args.push("--network".to_string());
            args.push(network_mode.clone());
        }

        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        for mount in &config.volumes {
            args.push("-v".to_string());
            args.push(mount.to_arg(self.runtime_type.needs_selinux_labels()));
        }

        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for key in config.secret_env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }

        if let Some(ref workdir) = config.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }

        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }

    /// Create and start a new container, returning its ID.
    ///
    /// The configuration is validated first; a name collision is reported
    /// as [`ContainerError::NameConflict`] so callers can re-probe.
    pub async fn run_detached(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;

        let args = self.run_args(config);
        let output = self.run_with_env("run", &args, &config.secret_env).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if ContainerError::is_name_conflict_message(&stderr) {
                return Err(ContainerError::NameConflict(
                    config.name.clone().unwrap_or_default(),
                ));
            }
            return Err(ContainerError::CommandFailed {
                command: "run".to_string(),
                message: stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Start a stopped container.
    pub async fn start_container(&self, name: &str) -> ContainerResult<()> {
        validate_container_name(name)?;
        let args = vec!["start".to_string(), name.to_string()];
        self.run_checked("start", &args).await.map(|_| ())
    }

    /// Remove a container. Removing a missing container is not an error.
    pub async fn remove_container(&self, name: &str, force: bool) -> ContainerResult<()> {
        validate_container_name(name)?;
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());

        let output = self.run("rm", &args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.to_ascii_lowercase().contains("no such container") {
            debug!("container {} already gone", name);
            return Ok(());
        }
        Err(ContainerError::CommandFailed {
            command: "rm".to_string(),
            message: stderr,
        })
    }

    /// Get the container state and labels via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn inspect_container(&self, name: &str) -> ContainerResult<Option<ContainerInfo>> {
        validate_container_name(name)?;

        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}} {{json .Config.Labels}}".to_string(),
            name.to_string(),
        ];
        let output = self.run("inspect", &args).await?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        Ok(ContainerInfo::parse(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Build (but do not spawn) an `exec` command.
    ///
    /// Stdio is left to the caller: one-shot prompts pipe stdout/stderr,
    /// interactive sessions additionally pipe stdin.
    pub fn exec_command(
        &self,
        name: &str,
        command: &[String],
        options: &ExecOptions,
    ) -> ContainerResult<Command> {
        validate_container_name(name)?;

        let mut args = vec!["exec".to_string()];
        if options.interactive {
            args.push("-i".to_string());
        }
        if let Some(ref workdir) = options.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &options.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        args.extend(command.iter().cloned());

        debug!("{} {}", self.binary, args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args).kill_on_drop(true);
        Ok(cmd)
    }

    /// Map a spawn failure of an `exec_command` child.
    pub fn exec_spawn_error(&self, err: std::io::Error) -> ContainerError {
        self.spawn_error("exec", err)
    }
}
