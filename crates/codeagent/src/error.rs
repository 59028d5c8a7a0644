//! Session engine error types.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::container::ContainerError;

/// Result type for session engine operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by backends, the registry and the retry wrapper.
///
/// Backends classify failures into these variants and attach the raw
/// output or exit status so callers can decide whether to retry, recreate
/// the session or give up.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Missing credential, unknown provider or CLI not installed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The process or container could not be started.
    #[error("failed to launch {what}: {message}")]
    ProcessLaunch { what: String, message: String },

    /// A bounded wait ran out. The session stays usable.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// The wrapped CLI reported an authentication failure.
    #[error("authentication failed: {output}")]
    Auth { output: String },

    /// Writing to the backend transport failed with a broken pipe.
    #[error("broken pipe: {0}")]
    BrokenPipe(String),

    /// The backing process exited while a session still needed it.
    #[error("process has already exited: {0}")]
    ProcessExited(String),

    /// A path failed validation before being mounted or read.
    #[error("unsafe path {}: {reason}", .path.display())]
    UnsafePath { path: PathBuf, reason: String },

    /// The CLI ran but failed.
    #[error("execution failed ({status}): {output}")]
    Execution { status: String, output: String },

    /// The backend has been closed.
    #[error("session is closed")]
    Closed,

    /// Every retry attempt failed.
    #[error("prompt failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<SessionError>,
    },

    /// Container runtime failure.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    pub fn launch(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessLaunch {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn unsafe_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnsafePath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the taxonomy marks this error as transient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BrokenPipe(_) | Self::ProcessExited(_))
    }

    /// Classify a transport IO error.
    ///
    /// Errors that already carry a `SessionError` (as produced by response
    /// streams) are unwrapped instead of re-classified.
    pub fn from_io(err: io::Error) -> Self {
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<SessionError>())
        {
            if let Some(inner) = err.into_inner()
                && let Ok(session_err) = inner.downcast::<SessionError>()
            {
                return *session_err;
            }
            return Self::Io(io::Error::other("unrecoverable response stream error"));
        }

        match err.kind() {
            io::ErrorKind::BrokenPipe => Self::BrokenPipe(err.to_string()),
            io::ErrorKind::UnexpectedEof => Self::ProcessExited(err.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Wrap into an `io::Error` so it can travel through an `AsyncRead`.
    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            Self::BrokenPipe(_) => io::ErrorKind::BrokenPipe,
            Self::Timeout { .. } => io::ErrorKind::TimedOut,
            Self::ProcessExited(_) => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}
