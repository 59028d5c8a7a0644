//! Finding, starting and creating session containers.

use std::path::Path;

use log::{debug, info, warn};

use crate::config::{ProviderConfig, RuntimeConfig};
use crate::container::{
    ContainerConfig, ContainerError, ContainerRuntime, ContainerStatus, VolumeMount,
};
use crate::error::{SessionError, SessionResult};
use crate::naming::{ContainerVariant, candidate_names};
use crate::path_guard::{WorktreeInfo, resolve_worktree};
use crate::workspace::Workspace;

use super::credentials::{CredentialSetup, prepare_credentials};

/// How a session container came to be running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerOrigin {
    /// Already running under this name.
    Reused(String),
    /// Existed but was stopped; started again.
    Restarted(String),
    /// Newly created.
    Created(String),
}

impl ContainerOrigin {
    pub fn name(&self) -> &str {
        match self {
            ContainerOrigin::Reused(name)
            | ContainerOrigin::Restarted(name)
            | ContainerOrigin::Created(name) => name,
        }
    }
}

/// Map runtime failures onto the session taxonomy.
pub(crate) fn launch_error(err: ContainerError) -> SessionError {
    match err {
        ContainerError::RuntimeUnavailable { .. } => SessionError::Configuration(err.to_string()),
        ContainerError::InvalidInput(_) => SessionError::Container(err),
        other => SessionError::launch("container", other.to_string()),
    }
}

/// Label carrying the session key of the container.
pub const SESSION_LABEL: &str = "codeagent.session";

/// Probe `candidates` in order and return the first existing container.
///
/// With `expected_session` set, a container whose session label names a
/// different session is skipped. Containers without the label predate it
/// and are accepted.
pub async fn find_existing(
    runtime: &ContainerRuntime,
    candidates: &[String],
    expected_session: Option<&str>,
) -> SessionResult<Option<(String, ContainerStatus)>> {
    for name in candidates {
        let Some(info) = runtime
            .inspect_container(name)
            .await
            .map_err(launch_error)?
        else {
            continue;
        };

        let foreign = match (expected_session, info.label(SESSION_LABEL)) {
            (Some(expected), Some(found)) if !found.eq_ignore_ascii_case(expected) => Some(found),
            _ => None,
        };
        if let Some(found) = foreign {
            warn!(
                "container {} belongs to session {}, not {}; skipping",
                name,
                found,
                expected_session.unwrap_or_default()
            );
            continue;
        }

        debug!("found container {} ({:?})", name, info.status);
        return Ok(Some((name.clone(), info.status)));
    }
    Ok(None)
}

/// Make sure a container for this session is running.
///
/// Existing containers under the current or a legacy name are reused
/// (started first if stopped). Otherwise `config` is created; a name
/// conflict from a concurrent creator is retried once after re-probing.
pub async fn ensure_running(
    runtime: &ContainerRuntime,
    candidates: &[String],
    config: &ContainerConfig,
) -> SessionResult<ContainerOrigin> {
    let expected_session = config.labels.get(SESSION_LABEL).map(String::as_str);
    for attempt in 0..2 {
        if let Some((name, status)) = find_existing(runtime, candidates, expected_session).await? {
            return match status {
                ContainerStatus::Running => {
                    info!("reusing running container {}", name);
                    Ok(ContainerOrigin::Reused(name))
                }
                ContainerStatus::Stopped(state) => {
                    info!("starting existing container {} (was {})", name, state);
                    runtime.start_container(&name).await.map_err(launch_error)?;
                    Ok(ContainerOrigin::Restarted(name))
                }
            };
        }

        match runtime.run_detached(config).await {
            Ok(id) => {
                let name = config.name.clone().unwrap_or(id);
                info!("created container {}", name);
                return Ok(ContainerOrigin::Created(name));
            }
            Err(ContainerError::NameConflict(name)) if attempt == 0 => {
                warn!("container name {} was taken concurrently, re-probing", name);
            }
            Err(e) => return Err(launch_error(e)),
        }
    }

    Err(SessionError::launch(
        "container",
        "name conflict persisted after re-probing",
    ))
}

/// Bring up the container for `workspace`: resolve the worktree parent,
/// prepare the credential directory and reuse or create the container.
pub async fn provision_session_container(
    runtime: &ContainerRuntime,
    workspace: &Workspace,
    profile: &ProviderConfig,
    runtime_config: &RuntimeConfig,
    variant: ContainerVariant,
) -> SessionResult<ContainerOrigin> {
    let provider = workspace.provider().to_lowercase();
    let candidates = candidate_names(&provider, workspace, variant);
    let name = candidates[0].clone();

    let worktree = resolve_worktree(workspace.path())?;
    let credentials = prepare_credentials(&provider, profile, workspace.session_path(), &name)?;
    let config = session_container_config(
        &name,
        variant,
        workspace,
        runtime_config,
        &credentials,
        &worktree,
        profile.env.clone(),
    )?;

    ensure_running(runtime, &candidates, &config).await
}

/// Build the `run` configuration of a session container.
pub fn session_container_config(
    name: &str,
    variant: ContainerVariant,
    workspace: &Workspace,
    runtime: &RuntimeConfig,
    credentials: &CredentialSetup,
    worktree: &WorktreeInfo,
    provider_env: impl IntoIterator<Item = (String, String)>,
) -> SessionResult<ContainerConfig> {
    let mut config = ContainerConfig::new(runtime.image.clone())
        .name(name)
        .command(runtime.keepalive_command.clone())
        .workdir(runtime.container_workdir.clone())
        .label(SESSION_LABEL, workspace.session_key().to_string())
        .label(
            "codeagent.variant",
            match variant {
                ContainerVariant::Managed => "managed",
                ContainerVariant::Interactive => "interactive",
            },
        )
        .volume(VolumeMount::new(
            path_str(workspace.path())?,
            runtime.container_workdir.clone(),
        ))
        .volume(VolumeMount::new(
            path_str(&credentials.host_dir)?,
            runtime.container_home.clone(),
        ))
        .env("HOME", runtime.container_home.clone())
        .envs(provider_env)
        .secret_envs(credentials.env.iter().cloned());

    if let Some(ref parent) = worktree.parent_repo {
        let parent = path_str(parent)?;
        config = config.volume(VolumeMount::read_only(parent.clone(), parent));
    }

    if let Some(ref network) = runtime.network {
        config = config.network_mode(network.clone());
    }

    config.validate()?;
    Ok(config)
}

fn path_str(path: &Path) -> SessionResult<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| SessionError::unsafe_path(path, "path is not valid UTF-8"))
}
