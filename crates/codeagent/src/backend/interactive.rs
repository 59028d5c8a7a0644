//! Interactive container backend.
//!
//! The CLI is started once per session with `exec -i` and kept alive; each
//! prompt is written as one line to its stdin. The CLI has no framing, so
//! the end of a reply is decided by [`BoundaryDetector`] over the bytes
//! read since the prompt was written.
//!
//! Two locks serialise turns:
//! - the prompt permit, held by the returned [`Response`] until it is
//!   drained or dropped;
//! - the output lock, held by the per-turn reader task until the boundary
//!   is seen, so an abandoned response still consumes its own turn before
//!   the next prompt is written.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::boundary::{BoundaryConfig, BoundaryDetector};
use crate::config::{ProviderConfig, RuntimeConfig};
use crate::container::{ContainerRuntime, ExecOptions};
use crate::error::{SessionError, SessionResult};
use crate::naming::ContainerVariant;
use crate::workspace::Workspace;

use super::process::terminate;
use super::provision::{launch_error, provision_session_container};
use super::{BackendKind, BackendStatus, CodeBackend, Response, ResponseSender, SessionState};

/// Raw stdout chunks buffered between the pump and the turn reader.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

const READ_CHUNK: usize = 8 * 1024;

/// Diagnostic metadata of one interactive session.
#[derive(Debug, Clone, Serialize)]
pub struct InteractiveSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
}

impl InteractiveSession {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: now,
            message_count: 0,
        }
    }

    fn record_message(&mut self) {
        self.message_count += 1;
        self.last_activity = Utc::now();
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// No activity for longer than `threshold`.
    pub fn is_idle(&self, threshold: Duration) -> bool {
        match TimeDelta::from_std(threshold) {
            Ok(threshold) => Utc::now() - self.last_activity > threshold,
            Err(_) => false,
        }
    }
}

struct Shared {
    state: SessionState,
    session: InteractiveSession,
}

/// One exec'd CLI process and its pipes.
struct Attachment {
    child: Child,
    stdin: ChildStdin,
    output: Arc<Mutex<mpsc::Receiver<Bytes>>>,
    /// Set when the turn protocol lost sync with the process (timeout,
    /// broken pipe, closed output); the next prompt reattaches.
    poisoned: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Attachment {
    fn is_dead(&mut self) -> bool {
        self.poisoned.load(Ordering::SeqCst) || !matches!(self.child.try_wait(), Ok(None))
    }

    async fn write_line(&mut self, line: &str) -> SessionResult<()> {
        let mut data = line.replace(['\r', '\n'], " ");
        data.push('\n');
        let result = async {
            self.stdin.write_all(data.as_bytes()).await?;
            self.stdin.flush().await
        }
        .await;

        result.map_err(|e| {
            self.poisoned.store(true, Ordering::SeqCst);
            SessionError::from_io(e)
        })
    }

    async fn shutdown(mut self, grace: Duration) {
        drop(self.stdin);
        terminate(&mut self.child, grace).await;
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct InteractiveContainerBackend {
    runtime: ContainerRuntime,
    container: String,
    cli: Vec<String>,
    exec_options: ExecOptions,
    probe_message: String,
    detector: BoundaryDetector,
    prompt_timeout: Duration,
    startup_timeout: Duration,
    kill_grace: Duration,
    remove_on_close: bool,
    prompt_lock: Arc<Mutex<()>>,
    transport: Mutex<Option<Attachment>>,
    shared: Arc<RwLock<Shared>>,
}

impl InteractiveContainerBackend {
    /// Reuse or create the session container, attach the CLI and run the
    /// readiness handshake.
    pub async fn start(
        runtime: ContainerRuntime,
        workspace: &Workspace,
        profile: ProviderConfig,
        runtime_config: &RuntimeConfig,
        boundary: BoundaryConfig,
    ) -> SessionResult<Self> {
        if profile.command.is_empty() {
            return Err(SessionError::Configuration(format!(
                "provider '{}' has no command configured",
                workspace.provider()
            )));
        }

        let origin = provision_session_container(
            &runtime,
            workspace,
            &profile,
            runtime_config,
            ContainerVariant::Interactive,
        )
        .await?;

        let mut cli = vec![profile.command.clone()];
        cli.extend(profile.interactive_args.iter().cloned());

        let backend = Self {
            runtime,
            container: origin.name().to_string(),
            cli,
            exec_options: ExecOptions {
                interactive: true,
                workdir: Some(runtime_config.container_workdir.clone()),
                env: Vec::new(),
            },
            probe_message: profile.probe_message.clone(),
            detector: BoundaryDetector::new(boundary),
            prompt_timeout: runtime_config.prompt_timeout(),
            startup_timeout: runtime_config.startup_timeout(),
            kill_grace: runtime_config.kill_grace(),
            remove_on_close: runtime_config.remove_on_close,
            prompt_lock: Arc::new(Mutex::new(())),
            transport: Mutex::new(None),
            shared: Arc::new(RwLock::new(Shared {
                state: SessionState::Starting,
                session: InteractiveSession::new(),
            })),
        };

        match backend.attach().await {
            Ok(attachment) => {
                *backend.transport.lock().await = Some(attachment);
                let mut shared = backend.shared.write().await;
                shared.state.transition(SessionState::Ready);
                info!(
                    "interactive session {} ready in container {}",
                    shared.session.id, backend.container
                );
            }
            Err(e) => {
                backend.shared.write().await.state = SessionState::Closed;
                error!(
                    "interactive session in {} failed to start: {}",
                    backend.container, e
                );
                return Err(e);
            }
        }

        Ok(backend)
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub async fn state(&self) -> SessionState {
        self.shared.read().await.state
    }

    pub async fn session(&self) -> InteractiveSession {
        self.shared.read().await.session.clone()
    }

    async fn ensure_open(&self) -> SessionResult<()> {
        if self.shared.read().await.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    /// Output channel of a live attachment, reattaching first when the CLI
    /// is gone or out of sync.
    async fn live_output(&self) -> SessionResult<Arc<Mutex<mpsc::Receiver<Bytes>>>> {
        let mut transport = self.transport.lock().await;
        self.ensure_open().await?;
        if transport.as_mut().is_none_or(|a| a.is_dead()) {
            if let Some(old) = transport.take() {
                warn!("interactive CLI in {} is gone, reattaching", self.container);
                old.shutdown(self.kill_grace).await;
            }
            *transport = Some(self.attach().await?);
        }
        transport
            .as_ref()
            .map(|a| a.output.clone())
            .ok_or(SessionError::Closed)
    }

    /// Exec a fresh CLI process in the container and wait until it answers
    /// the probe.
    async fn attach(&self) -> SessionResult<Attachment> {
        let mut cmd = self
            .runtime
            .exec_command(&self.container, &self.cli, &self.exec_options)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| launch_error(self.runtime.exec_spawn_error(e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::launch("interactive exec", "no stdin pipe"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::launch("interactive exec", "no stdout pipe"))?;

        let (raw_tx, raw_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let mut tasks = vec![tokio::spawn(stdout_pump(stdout, raw_tx))];
        if let Some(stderr) = child.stderr.take() {
            let container = self.container.clone();
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{} stderr] {}", container, line);
                }
            }));
        }

        let mut attachment = Attachment {
            child,
            stdin,
            output: Arc::new(Mutex::new(raw_rx)),
            poisoned: Arc::new(AtomicBool::new(false)),
            tasks,
        };

        match self.handshake(&mut attachment).await {
            Ok(()) => Ok(attachment),
            Err(e) => {
                attachment.shutdown(self.kill_grace).await;
                Err(e)
            }
        }
    }

    /// Write the probe and wait for a substantive reply, then for its
    /// boundary or a quiet period.
    async fn handshake(&self, attachment: &mut Attachment) -> SessionResult<()> {
        let deadline = Instant::now() + self.startup_timeout;
        attachment.write_line(&self.probe_message).await?;

        let mut output = attachment.output.lock().await;
        let mut buffer = Vec::new();

        while !self.detector.is_substantive(&buffer) {
            match tokio::time::timeout_at(deadline, output.recv()).await {
                Err(_) => {
                    return Err(SessionError::timeout(
                        "readiness handshake",
                        self.startup_timeout,
                    ));
                }
                Ok(None) => {
                    return Err(SessionError::ProcessExited(
                        "interactive CLI exited during startup".to_string(),
                    ));
                }
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
            }
        }

        let settle = Duration::from_millis(self.detector.config().handshake_settle_ms);
        while self.detector.detect(&buffer).is_none() {
            let until = (Instant::now() + settle).min(deadline);
            match tokio::time::timeout_at(until, output.recv()).await {
                Err(_) => break,
                Ok(None) => {
                    return Err(SessionError::ProcessExited(
                        "interactive CLI exited during startup".to_string(),
                    ));
                }
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
            }
        }

        debug!(
            "handshake with {} complete ({} bytes)",
            self.container,
            buffer.len()
        );
        Ok(())
    }
}

#[async_trait]
impl CodeBackend for InteractiveContainerBackend {
    async fn prompt(&self, message: &str) -> SessionResult<Response> {
        let permit = self.prompt_lock.clone().lock_owned().await;

        // The output lock may still be held by an abandoned turn; wait for it
        // without holding the transport so `close` is never blocked behind it.
        let mut attempts = 0;
        let (output, poisoned) = loop {
            attempts += 1;
            let pending = self.live_output().await?;
            let mut output = pending.clone().lock_owned().await;

            let mut transport = self.transport.lock().await;
            self.ensure_open().await?;
            let current = transport
                .as_mut()
                .is_some_and(|a| Arc::ptr_eq(&a.output, &pending) && !a.is_dead());
            if !current {
                if attempts < 2 {
                    debug!("attachment to {} changed while waiting, retrying", self.container);
                    continue;
                }
                return Err(SessionError::ProcessExited(
                    "interactive CLI was lost while waiting for the previous turn".to_string(),
                ));
            }
            let attachment = transport.as_mut().ok_or(SessionError::Closed)?;

            let mut stale = 0;
            while let Ok(chunk) = output.try_recv() {
                stale += chunk.len();
            }
            if stale > 0 {
                debug!("discarded {} stale bytes from {}", stale, self.container);
            }

            attachment.write_line(message).await?;
            break (output, attachment.poisoned.clone());
        };

        {
            let mut shared = self.shared.write().await;
            shared.state.transition(SessionState::Busy);
            shared.session.record_message();
        }

        let (tx, response) = Response::channel();
        tokio::spawn(read_turn(
            output,
            tx,
            self.detector.clone(),
            self.prompt_timeout,
            poisoned,
            self.shared.clone(),
        ));

        Ok(response.with_permit(permit))
    }

    async fn close(&self) -> SessionResult<()> {
        {
            let mut shared = self.shared.write().await;
            if shared.state == SessionState::Closed {
                return Ok(());
            }
            shared.state = SessionState::Closed;
        }

        if let Some(attachment) = self.transport.lock().await.take() {
            attachment.shutdown(self.kill_grace).await;
        }

        if self.remove_on_close {
            info!("removing container {}", self.container);
            self.runtime
                .remove_container(&self.container, true)
                .await
                .map_err(launch_error)?;
        } else {
            info!(
                "closed interactive session; container {} left running for inspection",
                self.container
            );
        }
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::InteractiveContainer
    }

    async fn status(&self) -> BackendStatus {
        let shared = self.shared.read().await;
        BackendStatus {
            kind: BackendKind::InteractiveContainer,
            state: shared.state,
            container: Some(self.container.clone()),
            session: Some(shared.session.clone()),
        }
    }
}

async fn stdout_pump(mut stdout: ChildStdout, tx: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("interactive stdout read failed: {}", e);
                break;
            }
        }
    }
}

/// Read one turn: forward complete lines as they arrive and stop at the
/// boundary, keeping the marker itself out of the response.
async fn read_turn(
    mut output: OwnedMutexGuard<mpsc::Receiver<Bytes>>,
    tx: ResponseSender,
    detector: BoundaryDetector,
    timeout: Duration,
    poisoned: Arc<AtomicBool>,
    shared: Arc<RwLock<Shared>>,
) {
    let deadline = Instant::now() + timeout;
    let mut buffer: Vec<u8> = Vec::new();
    let mut forwarded = 0;

    let outcome = loop {
        let chunk = match tokio::time::timeout_at(deadline, output.recv()).await {
            Err(_) => break Err(SessionError::timeout("interactive prompt", timeout)),
            Ok(None) => {
                break Err(SessionError::ProcessExited(
                    "interactive CLI closed its output".to_string(),
                ));
            }
            Ok(Some(chunk)) => chunk,
        };
        buffer.extend_from_slice(&chunk);

        if let Some(boundary) = detector.detect(&buffer) {
            if boundary.content_end > forwarded {
                forward(&tx, &buffer[forwarded..boundary.content_end]).await;
            }
            break Ok(());
        }

        if let Some(pos) = buffer[forwarded..].iter().rposition(|b| *b == b'\n') {
            let end = forwarded + pos + 1;
            forward(&tx, &buffer[forwarded..end]).await;
            forwarded = end;
        }
    };

    if let Err(e) = outcome {
        warn!("interactive turn failed: {}", e);
        poisoned.store(true, Ordering::SeqCst);
        let _ = tx.send(Err(e.into_io())).await;
    }

    let mut shared = shared.write().await;
    shared.state.transition(SessionState::Ready);
    shared.session.touch();
}

async fn forward(tx: &ResponseSender, bytes: &[u8]) {
    // A dropped response still has to consume its turn.
    let _ = tx.send(Ok(Bytes::copy_from_slice(bytes))).await;
}
