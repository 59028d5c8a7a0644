//! Session engine for driving code-generation CLIs.
//!
//! A [`SessionRegistry`] hands out one [`CodeBackend`] per workspace. Each
//! backend runs the provider CLI either as a local process, through one
//! `exec` per prompt in a long-lived container, or as a single interactive
//! process inside a container. Replies come back as streaming
//! [`Response`]s; [`RetryingInvoker`] retries transient transport failures.

pub mod backend;
pub mod boundary;
pub mod config;
pub mod container;
pub mod error;
pub mod naming;
pub mod path_guard;
pub mod registry;
pub mod retry;
pub mod workspace;

pub use backend::{
    BackendFactory, BackendKind, BackendStatus, CodeBackend, DefaultBackendFactory,
    InteractiveContainerBackend, InteractiveSession, LocalProcessBackend,
    ManagedContainerBackend, Response, SessionState,
};
pub use boundary::{BoundaryConfig, BoundaryDetector};
pub use config::AppConfig;
pub use error::{SessionError, SessionResult};
pub use naming::{ContainerVariant, container_name, legacy_names};
pub use path_guard::{WorktreeInfo, resolve_worktree};
pub use registry::SessionRegistry;
pub use retry::{RetryPolicy, RetryingInvoker, prompt_with_retry};
pub use workspace::{SessionKey, WorkTarget, Workspace};
