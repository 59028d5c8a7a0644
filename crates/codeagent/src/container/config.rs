//! Container creation parameters and input validation.

use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Path on the host.
    pub host_path: String,
    /// Path inside the container.
    pub container_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    pub fn read_only(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(host_path, container_path)
        }
    }

    /// Render as a `-v` argument value.
    pub fn to_arg(&self, selinux_label: bool) -> String {
        let mut options = Vec::new();
        if self.read_only {
            options.push("ro");
        }
        if selinux_label {
            options.push("Z");
        }
        if options.is_empty() {
            format!("{}:{}", self.host_path, self.container_path)
        } else {
            format!(
                "{}:{}:{}",
                self.host_path,
                self.container_path,
                options.join(",")
            )
        }
    }
}

/// Configuration for creating a new container.
///
/// Maps are ordered so the generated argument list is deterministic.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: Option<String>,
    /// Image to use.
    pub image: String,
    /// Command to run as the container's main process.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Environment variables whose values stay off the argument list: only
    /// `-e NAME` is passed and the value is inherited from the CLI process.
    pub secret_env: BTreeMap<String, String>,
    /// Bind mounts.
    pub volumes: Vec<VolumeMount>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Labels for the container.
    pub labels: BTreeMap<String, String>,
    /// Network mode (e.g., "host", "bridge", "none").
    pub network_mode: Option<String>,
}

impl ContainerConfig {
    /// Create a new container config with the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all container configuration fields.
    ///
    /// Must be called before creating a container; every value ends up on
    /// the container CLI's argument list.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys().chain(self.secret_env.keys()) {
            validate_env_var_key(key)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        for mount in &self.volumes {
            validate_volume_path(&mount.host_path, "host")?;
            validate_volume_path(&mount.container_path, "container")?;
            validate_container_path(&mount.container_path)?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn secret_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.secret_env
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate an OCI image reference.
///
/// Allowed characters: alphanumeric, `.`, `-`, `_`, `/`, `:`, `@`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Validate a container name or ID.
///
/// Names start with an alphanumeric character or underscore and contain
/// only alphanumerics, `-` and `_`.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable name cannot be empty".to_string(),
        ));
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' is invalid",
            key
        )));
    }
    Ok(())
}

fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    // ':' would be read as the host/container separator.
    let dangerous_chars = [
        '\0', ':', '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '[', ']', '*',
        '?', '\\', '"', '\'', '\n', '\r',
    ];
    if let Some(c) = dangerous_chars.iter().find(|c| path.contains(**c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path contains forbidden character {:?}",
            side, c
        )));
    }

    Ok(())
}

fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes".to_string(),
        ));
    }

    Ok(())
}
