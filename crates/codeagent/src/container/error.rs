//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command ran and failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The container CLI binary could not be executed at all.
    #[error("container runtime '{binary}' is not available: {message}")]
    RuntimeUnavailable { binary: String, message: String },

    /// A container with the requested name already exists.
    #[error("container name already in use: {0}")]
    NameConflict(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Whether stderr from `run` indicates the name is taken.
    ///
    /// Docker says "is already in use by container", podman says
    /// "name is already in use" or "already exists".
    pub fn is_name_conflict_message(stderr: &str) -> bool {
        let lower = stderr.to_ascii_lowercase();
        lower.contains("already in use") || lower.contains("already exists")
    }
}
