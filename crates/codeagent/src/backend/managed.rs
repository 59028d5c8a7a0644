//! Managed container backend: one long-lived container, one `exec` per
//! prompt, stdout streamed back as it arrives.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{ProviderConfig, RuntimeConfig};
use crate::container::{ContainerRuntime, ExecOptions};
use crate::error::{SessionError, SessionResult};
use crate::naming::ContainerVariant;
use crate::workspace::Workspace;

use super::process::{AuthMatcher, substitute_prompt, terminate};
use super::provision::{launch_error, provision_session_container};
use super::{BackendKind, BackendStatus, CodeBackend, Response, ResponseSender, SessionState};

/// Stdout kept for failure classification.
const MAX_DIAGNOSTIC_OUTPUT: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

pub struct ManagedContainerBackend {
    runtime: ContainerRuntime,
    container: String,
    profile: ProviderConfig,
    workdir: String,
    prompt_timeout: Duration,
    kill_grace: Duration,
    auth: AuthMatcher,
    prompt_lock: Arc<Mutex<()>>,
    closed: AtomicBool,
}

impl ManagedContainerBackend {
    /// Reuse or create the workspace's container.
    pub async fn start(
        runtime: ContainerRuntime,
        workspace: &Workspace,
        profile: ProviderConfig,
        runtime_config: &RuntimeConfig,
    ) -> SessionResult<Self> {
        if profile.command.is_empty() {
            return Err(SessionError::Configuration(format!(
                "provider '{}' has no command configured",
                workspace.provider()
            )));
        }
        let auth = AuthMatcher::new(&profile.auth_failure_patterns)?;

        let origin = provision_session_container(
            &runtime,
            workspace,
            &profile,
            runtime_config,
            ContainerVariant::Managed,
        )
        .await?;
        info!(
            "managed session {} uses container {:?}",
            workspace.session_key(),
            origin
        );

        Ok(Self {
            runtime,
            container: origin.name().to_string(),
            profile,
            workdir: runtime_config.container_workdir.clone(),
            prompt_timeout: runtime_config.prompt_timeout(),
            kill_grace: runtime_config.kill_grace(),
            auth,
            prompt_lock: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
        })
    }

    pub fn container(&self) -> &str {
        &self.container
    }
}

#[async_trait]
impl CodeBackend for ManagedContainerBackend {
    async fn prompt(&self, message: &str) -> SessionResult<Response> {
        let permit = self.prompt_lock.clone().lock_owned().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }

        let mut command = vec![self.profile.command.clone()];
        command.extend(substitute_prompt(&self.profile.args, message));
        let options = ExecOptions {
            interactive: false,
            workdir: Some(self.workdir.clone()),
            env: Vec::new(),
        };

        let mut cmd = self.runtime.exec_command(&self.container, &command, &options)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| launch_error(self.runtime.exec_spawn_error(e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::launch("exec", "no stdout pipe"))?;

        let (tx, response) = Response::channel();
        tokio::spawn(pump_exec(
            child,
            stdout,
            tx,
            self.prompt_timeout,
            self.kill_grace,
            self.auth.clone(),
        ));

        Ok(response.with_permit(permit))
    }

    async fn close(&self) -> SessionResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("removing container {}", self.container);
        self.runtime
            .remove_container(&self.container, true)
            .await
            .map_err(launch_error)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::ManagedContainer
    }

    async fn status(&self) -> BackendStatus {
        let state = if self.closed.load(Ordering::SeqCst) {
            SessionState::Closed
        } else if self.prompt_lock.try_lock().is_ok() {
            SessionState::Ready
        } else {
            SessionState::Busy
        };
        BackendStatus {
            kind: BackendKind::ManagedContainer,
            state,
            container: Some(self.container.clone()),
            session: None,
        }
    }
}

/// Forward exec stdout into `tx` until exit, then report a failed exit as
/// a classified stream error.
async fn pump_exec(
    mut child: Child,
    mut stdout: ChildStdout,
    tx: ResponseSender,
    timeout: Duration,
    grace: Duration,
    auth: AuthMatcher,
) {
    let deadline = Instant::now() + timeout;
    let stderr = tokio::spawn(read_capped(child.stderr.take()));
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut caller_gone = false;

    loop {
        match tokio::time::timeout_at(deadline, stdout.read(&mut buf)).await {
            Err(_) => {
                warn!("container exec exceeded {}s, terminating", timeout.as_secs());
                terminate(&mut child, grace).await;
                let _ = tx
                    .send(Err(SessionError::timeout("container prompt", timeout).into_io()))
                    .await;
                return;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                keep_tail(&mut tail, &buf[..n]);
                if !caller_gone && tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    debug!("response dropped, discarding remaining exec output");
                    caller_gone = true;
                }
            }
            Ok(Err(e)) => {
                terminate(&mut child, grace).await;
                let _ = tx.send(Err(SessionError::from_io(e).into_io())).await;
                return;
            }
        }
    }

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            let _ = tx.send(Err(SessionError::Io(e).into_io())).await;
            return;
        }
        Err(_) => {
            terminate(&mut child, grace).await;
            let _ = tx
                .send(Err(SessionError::timeout("container prompt", timeout).into_io()))
                .await;
            return;
        }
    };

    if !status.success() {
        let stderr = stderr.await.unwrap_or_default();
        let mut output = String::from_utf8_lossy(&tail).into_owned();
        output.push_str(&String::from_utf8_lossy(&stderr));
        let err = auth.classify(&status.to_string(), output);
        debug!("container exec failed: {}", err);
        let _ = tx.send(Err(err.into_io())).await;
    }
}

fn keep_tail(tail: &mut Vec<u8>, chunk: &[u8]) {
    tail.extend_from_slice(chunk);
    if tail.len() > MAX_DIAGNOSTIC_OUTPUT {
        let excess = tail.len() - MAX_DIAGNOSTIC_OUTPUT;
        tail.drain(..excess);
    }
}

async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut out = Vec::new();
    let Some(mut pipe) = pipe else {
        return out;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => keep_tail(&mut out, &buf[..n]),
        }
    }
    out
}
