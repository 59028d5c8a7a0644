//! Isolated per-workspace credential directories for container backends.
//!
//! Each session container gets its own home directory on the host,
//! `<session_path>/<container name>/`, mounted as the CLI user's home. It
//! is seeded either with an API key (passed as environment) or with copies
//! of the provider's login files taken from fixed locations in the host
//! user's home. Nothing derived from workspace data ever selects a source
//! path.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::container::validate_container_name;
use crate::error::{SessionError, SessionResult};

/// Provider login files, relative to the host user's home directory.
fn host_credential_files(provider: &str) -> &'static [&'static str] {
    match provider {
        "claude" => &[".claude/.credentials.json", ".claude.json"],
        "codex" => &[".codex/auth.json"],
        _ => &[],
    }
}

/// What was prepared for a container.
#[derive(Debug, Clone, Default)]
pub struct CredentialSetup {
    /// Host directory to mount as the container home.
    pub host_dir: PathBuf,
    /// Environment carrying an API key, if one is configured.
    pub env: Vec<(String, String)>,
    /// Files copied into `host_dir`, relative to it.
    pub copied: Vec<PathBuf>,
}

/// Prepare the credential directory using the current user's home.
pub fn prepare_credentials(
    provider: &str,
    profile: &ProviderConfig,
    session_path: &Path,
    container_name: &str,
) -> SessionResult<CredentialSetup> {
    let home = dirs::home_dir();
    prepare_credentials_from(
        home.as_deref(),
        provider,
        profile,
        session_path,
        container_name,
    )
}

pub(crate) fn prepare_credentials_from(
    home: Option<&Path>,
    provider: &str,
    profile: &ProviderConfig,
    session_path: &Path,
    container_name: &str,
) -> SessionResult<CredentialSetup> {
    validate_container_name(container_name)?;

    let host_dir = session_path.join(container_name);
    fs::create_dir_all(&host_dir)?;
    fs::set_permissions(&host_dir, fs::Permissions::from_mode(0o700))?;

    let mut setup = CredentialSetup {
        host_dir,
        ..Default::default()
    };

    if let Some(key) = profile.api_key.as_deref().filter(|k| !k.is_empty()) {
        let var = profile.api_key_env.clone().ok_or_else(|| {
            SessionError::Configuration(format!(
                "provider '{}' has an api_key but no api_key_env",
                provider
            ))
        })?;
        debug!("injecting {} for {}", var, container_name);
        setup.env.push((var, key.to_string()));
        return Ok(setup);
    }

    let Some(home) = home else {
        return Err(SessionError::Configuration(format!(
            "no api_key configured for '{}' and no home directory to copy credentials from",
            provider
        )));
    };

    for rel in host_credential_files(provider) {
        if copy_credential(home, &setup.host_dir, Path::new(rel))? {
            setup.copied.push(PathBuf::from(rel));
        }
    }

    if setup.copied.is_empty() {
        return Err(SessionError::Configuration(format!(
            "no credentials for provider '{}': set providers.{}.api_key or log in on the host",
            provider, provider
        )));
    }

    info!(
        "copied {} credential file(s) for {} into {}",
        setup.copied.len(),
        provider,
        setup.host_dir.display()
    );
    Ok(setup)
}

/// Copy one credential file. Returns `false` if the source is absent or
/// not a regular file.
fn copy_credential(home: &Path, dest_root: &Path, rel: &Path) -> SessionResult<bool> {
    let src = home.join(rel);
    let metadata = match fs::symlink_metadata(&src) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    if !metadata.file_type().is_file() {
        warn!(
            "skipping credential {}: not a regular file",
            src.display()
        );
        return Ok(false);
    }

    let dest = dest_root.join(rel);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    // Never write through whatever might already sit at the destination.
    match fs::symlink_metadata(&dest) {
        Ok(_) => fs::remove_file(&dest)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    fs::copy(&src, &dest)?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(0o600))?;
    Ok(true)
}
