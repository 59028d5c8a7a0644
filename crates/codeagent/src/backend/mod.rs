//! Code-generation backends.
//!
//! A backend owns one external execution environment for one workspace and
//! exposes a uniform prompt/close contract:
//! - `LocalProcessBackend`: fresh CLI process per prompt on the host
//! - `ManagedContainerBackend`: long-lived container, one `exec` per prompt
//! - `InteractiveContainerBackend`: long-lived container and CLI process,
//!   prompts written to its stdin
//!
//! [`DefaultBackendFactory`] picks the variant from configuration.

mod credentials;
mod interactive;
mod local;
mod managed;
mod process;
mod provision;
mod response;

pub use credentials::{CredentialSetup, prepare_credentials};
pub use interactive::{InteractiveContainerBackend, InteractiveSession};
pub use local::LocalProcessBackend;
pub use managed::ManagedContainerBackend;
pub use process::{AuthMatcher, binary_exists, substitute_prompt, terminate};
pub use provision::{
    ContainerOrigin, SESSION_LABEL, ensure_running, find_existing, session_container_config,
};
pub use response::{RESPONSE_CHANNEL_CAPACITY, Response, ResponseSender};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;

use crate::config::AppConfig;
use crate::container::ContainerRuntime;
use crate::error::{SessionError, SessionResult};
use crate::workspace::Workspace;

/// Trait implemented by every backend variant.
///
/// `prompt` calls on one backend are served one at a time in arrival
/// order; a second caller waits until the previous [`Response`] has been
/// drained or dropped.
#[async_trait]
pub trait CodeBackend: Send + Sync {
    /// Send one message and return the reply stream.
    async fn prompt(&self, message: &str) -> SessionResult<Response>;

    /// Release the execution environment.
    async fn close(&self) -> SessionResult<()>;

    fn kind(&self) -> BackendKind;

    /// Snapshot for diagnostics.
    async fn status(&self) -> BackendStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    LocalProcess,
    ManagedContainer,
    InteractiveContainer,
}

impl BackendKind {
    /// Variant for the (docker enabled, interactive enabled) toggles.
    ///
    /// Interactive sessions need a container; without one the local
    /// variant is used.
    pub fn select(docker_enabled: bool, interactive_enabled: bool) -> Self {
        match (docker_enabled, interactive_enabled) {
            (false, _) => BackendKind::LocalProcess,
            (true, false) => BackendKind::ManagedContainer,
            (true, true) => BackendKind::InteractiveContainer,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::LocalProcess => "local",
            BackendKind::ManagedContainer => "container",
            BackendKind::InteractiveContainer => "interactive",
        })
    }
}

/// Lifecycle state of a backend.
///
/// Only the interactive variant passes through `Starting`; `Closed` is
/// terminal for every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Ready,
    Busy,
    Closed,
}

impl SessionState {
    /// Apply a transition unless the state is already terminal.
    pub fn transition(&mut self, to: SessionState) {
        if *self != SessionState::Closed {
            *self = to;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub state: SessionState,
    /// Container backing the session, for container variants.
    pub container: Option<String>,
    /// Interactive session metadata.
    pub session: Option<InteractiveSession>,
}

/// Creates backends for workspaces.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn create(&self, workspace: &Workspace) -> SessionResult<Arc<dyn CodeBackend>>;
}

/// Factory choosing the backend variant from [`AppConfig`].
pub struct DefaultBackendFactory {
    config: Arc<AppConfig>,
    runtime: ContainerRuntime,
}

impl DefaultBackendFactory {
    pub fn new(config: Arc<AppConfig>) -> Self {
        let runtime = match config.runtime.container_binary {
            Some(ref binary) => {
                ContainerRuntime::with_binary(config.runtime.container_runtime, binary.clone())
            }
            None => ContainerRuntime::with_type(config.runtime.container_runtime),
        };
        Self { config, runtime }
    }

    pub fn kind(&self) -> BackendKind {
        BackendKind::select(
            self.config.runtime.docker_enabled,
            self.config.runtime.interactive_enabled,
        )
    }

    pub fn runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }
}

#[async_trait]
impl BackendFactory for DefaultBackendFactory {
    async fn create(&self, workspace: &Workspace) -> SessionResult<Arc<dyn CodeBackend>> {
        let provider = workspace.provider().to_lowercase();
        let profile = self.config.provider(&provider).ok_or_else(|| {
            SessionError::Configuration(format!("unknown provider '{}'", provider))
        })?;

        if self.config.runtime.interactive_enabled && !self.config.runtime.docker_enabled {
            warn!("interactive sessions require docker_enabled; using local processes");
        }

        let kind = self.kind();
        info!(
            "creating {} backend for {}",
            kind,
            workspace.session_key()
        );

        let backend: Arc<dyn CodeBackend> = match kind {
            BackendKind::LocalProcess => Arc::new(LocalProcessBackend::new(
                workspace,
                profile,
                &self.config.runtime,
            )?),
            BackendKind::ManagedContainer => Arc::new(
                ManagedContainerBackend::start(
                    self.runtime.clone(),
                    workspace,
                    profile,
                    &self.config.runtime,
                )
                .await?,
            ),
            BackendKind::InteractiveContainer => Arc::new(
                InteractiveContainerBackend::start(
                    self.runtime.clone(),
                    workspace,
                    profile,
                    &self.config.runtime,
                    self.config.boundary.clone(),
                )
                .await?,
            ),
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::WorkTarget;

    #[test]
    fn test_select_variant() {
        assert_eq!(BackendKind::select(false, false), BackendKind::LocalProcess);
        assert_eq!(BackendKind::select(false, true), BackendKind::LocalProcess);
        assert_eq!(BackendKind::select(true, false), BackendKind::ManagedContainer);
        assert_eq!(
            BackendKind::select(true, true),
            BackendKind::InteractiveContainer
        );
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut state = SessionState::Starting;
        state.transition(SessionState::Ready);
        assert_eq!(state, SessionState::Ready);
        state.transition(SessionState::Closed);
        state.transition(SessionState::Ready);
        assert_eq!(state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_factory_rejects_unknown_provider() {
        let factory = DefaultBackendFactory::new(Arc::new(AppConfig::default()));
        let ws = Workspace::new("nope", "o", "r", "/tmp", "/tmp", WorkTarget::Issue(1));
        let err = factory.create(&ws).await.err().unwrap();
        assert!(matches!(err, SessionError::Configuration(_)));
    }
}
