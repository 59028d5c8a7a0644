//! Local process backend: a fresh CLI process per prompt.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::{ProviderConfig, RuntimeConfig};
use crate::error::{SessionError, SessionResult};
use crate::workspace::Workspace;

use super::process::{AuthMatcher, binary_exists, substitute_prompt, terminate};
use super::{BackendKind, BackendStatus, CodeBackend, Response, SessionState};

/// Runs the provider CLI on the host with the workspace as working
/// directory. Output is captured in full before it is returned.
pub struct LocalProcessBackend {
    profile: ProviderConfig,
    workdir: PathBuf,
    prompt_timeout: Duration,
    kill_grace: Duration,
    auth: AuthMatcher,
    prompt_lock: Arc<Mutex<()>>,
}

impl LocalProcessBackend {
    pub fn new(
        workspace: &Workspace,
        profile: ProviderConfig,
        runtime: &RuntimeConfig,
    ) -> SessionResult<Self> {
        if profile.command.is_empty() {
            return Err(SessionError::Configuration(format!(
                "provider '{}' has no command configured",
                workspace.provider()
            )));
        }
        if !binary_exists(&profile.command) {
            return Err(SessionError::Configuration(format!(
                "CLI '{}' not found",
                profile.command
            )));
        }

        let auth = AuthMatcher::new(&profile.auth_failure_patterns)?;
        Ok(Self {
            profile,
            workdir: workspace.path().to_path_buf(),
            prompt_timeout: runtime.prompt_timeout(),
            kill_grace: runtime.kill_grace(),
            auth,
            prompt_lock: Arc::new(Mutex::new(())),
        })
    }

    fn command(&self, message: &str) -> Command {
        let mut cmd = Command::new(&self.profile.command);
        cmd.args(substitute_prompt(&self.profile.args, message))
            .current_dir(&self.workdir)
            .envs(&self.profile.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let (Some(var), Some(key)) = (&self.profile.api_key_env, &self.profile.api_key) {
            cmd.env(var, key);
        }
        cmd
    }

    /// Run the CLI to completion and return its stdout.
    async fn run(&self, message: &str) -> SessionResult<Vec<u8>> {
        let mut child = self.command(message).spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SessionError::Configuration(format!("CLI '{}' not found", self.profile.command))
            } else {
                SessionError::launch(&self.profile.command, e.to_string())
            }
        })?;
        debug!(
            "spawned {} (pid {:?}) in {}",
            self.profile.command,
            child.id(),
            self.workdir.display()
        );

        // Drain both pipes while waiting so a chatty CLI cannot block on a
        // full pipe.
        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let status = match tokio::time::timeout(self.prompt_timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "{} exceeded {}s, terminating",
                    self.profile.command,
                    self.prompt_timeout.as_secs()
                );
                terminate(&mut child, self.kill_grace).await;
                return Err(SessionError::timeout("local prompt", self.prompt_timeout));
            }
        };

        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        if !status.success() {
            let mut output = String::from_utf8_lossy(&stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&stderr));
            return Err(self.auth.classify(&status.to_string(), output));
        }

        Ok(stdout)
    }
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut out = Vec::new();
    if let Some(mut pipe) = pipe
        && let Err(e) = pipe.read_to_end(&mut out).await
    {
        debug!("pipe read failed: {}", e);
    }
    out
}

#[async_trait]
impl CodeBackend for LocalProcessBackend {
    async fn prompt(&self, message: &str) -> SessionResult<Response> {
        let permit = self.prompt_lock.clone().lock_owned().await;
        let output = self.run(message).await?;
        Ok(Response::from_bytes(output).with_permit(permit))
    }

    async fn close(&self) -> SessionResult<()> {
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::LocalProcess
    }

    async fn status(&self) -> BackendStatus {
        let state = if self.prompt_lock.try_lock().is_ok() {
            SessionState::Ready
        } else {
            SessionState::Busy
        };
        BackendStatus {
            kind: BackendKind::LocalProcess,
            state,
            container: None,
            session: None,
        }
    }
}
