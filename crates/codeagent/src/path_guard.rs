//! Git worktree resolution for container mounts.
//!
//! A worktree's `.git` is a file pointing at `<repo>/.git/worktrees/<name>`.
//! Container backends mount `<repo>` read-only so git works inside the
//! container, which makes the content of that file security relevant: it
//! must never be able to expose an arbitrary host path. Everything that is
//! not a well-formed worktree pointer is rejected.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use log::debug;

use crate::error::{SessionError, SessionResult};

/// Maximum number of `..` segments accepted in a relative `gitdir`.
///
/// Relative worktree pointers written by git need at most a couple of
/// levels to climb out of the worktree into the parent repository.
pub const MAX_PARENT_SEGMENTS: usize = 3;

/// Largest `.git` file we are willing to read.
const MAX_GIT_FILE_LEN: u64 = 4096;

/// Path fragments that are never acceptable in a worktree pointer.
const DENIED_FRAGMENTS: &[&str] = &[
    "/etc/", "/root/", "/proc/", "/sys/", "/dev/", "/boot/", "/.ssh", "/.gnupg", "/.aws",
];

/// Result of inspecting a workspace's `.git` marker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorktreeInfo {
    pub is_worktree: bool,
    /// The parent repository root, for worktrees only.
    pub parent_repo: Option<PathBuf>,
}

/// Inspect `workspace_path/.git` and resolve the parent repository of a
/// worktree.
///
/// A missing `.git` or a `.git` directory means "not a worktree". A `.git`
/// file must hold a `gitdir:` line pointing at
/// `<repo>/.git/worktrees/<name>` inside an existing repository; anything
/// else fails with [`SessionError::UnsafePath`].
pub fn resolve_worktree(workspace_path: &Path) -> SessionResult<WorktreeInfo> {
    let marker = workspace_path.join(".git");

    let metadata = match fs::symlink_metadata(&marker) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} has no .git marker", workspace_path.display());
            return Ok(WorktreeInfo::default());
        }
        Err(e) => return Err(e.into()),
    };

    if metadata.file_type().is_symlink() {
        return Err(SessionError::unsafe_path(
            &marker,
            ".git must not be a symlink",
        ));
    }

    if metadata.is_dir() {
        return Ok(WorktreeInfo::default());
    }

    if metadata.len() > MAX_GIT_FILE_LEN {
        return Err(SessionError::unsafe_path(&marker, ".git file is too large"));
    }

    let mut content = String::new();
    fs::File::open(&marker)?
        .take(MAX_GIT_FILE_LEN)
        .read_to_string(&mut content)
        .map_err(|e| SessionError::unsafe_path(&marker, format!("unreadable .git file: {e}")))?;

    let raw = parse_gitdir(&content)
        .ok_or_else(|| SessionError::unsafe_path(&marker, "missing 'gitdir:' line"))?;

    let parent_repo = resolve_parent_repo(workspace_path, raw)?;
    debug!(
        "{} is a worktree of {}",
        workspace_path.display(),
        parent_repo.display()
    );

    Ok(WorktreeInfo {
        is_worktree: true,
        parent_repo: Some(parent_repo),
    })
}

fn parse_gitdir(content: &str) -> Option<&str> {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("gitdir:"))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn resolve_parent_repo(workspace_path: &Path, raw: &str) -> SessionResult<PathBuf> {
    check_denied(raw)?;

    let joined = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        workspace_path.join(raw)
    };
    let normalized = normalize_lexically(&joined).ok_or_else(|| {
        SessionError::unsafe_path(raw, "gitdir escapes the filesystem root")
    })?;
    check_denied(&normalized.to_string_lossy())?;

    let resolved = normalized.canonicalize().map_err(|e| {
        SessionError::unsafe_path(&normalized, format!("gitdir does not resolve: {e}"))
    })?;
    check_denied(&resolved.to_string_lossy())?;

    let parent_repo = worktree_parent(&resolved).ok_or_else(|| {
        SessionError::unsafe_path(&resolved, "gitdir is not of the form <repo>/.git/worktrees/<name>")
    })?;

    if !parent_repo.join(".git").is_dir() {
        return Err(SessionError::unsafe_path(
            &parent_repo,
            "parent repository has no .git directory",
        ));
    }

    Ok(parent_repo)
}

/// Reject values containing denied fragments or too many `..` segments.
fn check_denied(value: &str) -> SessionResult<()> {
    if value.contains('\0') {
        return Err(SessionError::unsafe_path(value, "contains a NUL byte"));
    }

    if value.starts_with('~') {
        return Err(SessionError::unsafe_path(
            value,
            "home-relative paths are not allowed",
        ));
    }

    // Treat the value as a directory so "/etc" and "/etc/" match alike.
    let probe = format!("{}/", value.trim_end_matches('/'));
    if let Some(fragment) = DENIED_FRAGMENTS.iter().find(|f| probe.contains(*f)) {
        return Err(SessionError::unsafe_path(
            value,
            format!("references sensitive location '{}'", fragment),
        ));
    }

    let parent_segments = Path::new(value)
        .components()
        .filter(|c| matches!(c, Component::ParentDir))
        .count();
    if parent_segments > MAX_PARENT_SEGMENTS {
        return Err(SessionError::unsafe_path(
            value,
            format!(
                "{} '..' segments exceed the limit of {}",
                parent_segments, MAX_PARENT_SEGMENTS
            ),
        ));
    }

    Ok(())
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// Returns `None` if `..` would climb above the root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// `<repo>/.git/worktrees/<name>` -> `<repo>`.
fn worktree_parent(gitdir: &Path) -> Option<PathBuf> {
    let name = gitdir.file_name()?;
    if name.is_empty() {
        return None;
    }
    let worktrees = gitdir.parent()?;
    if worktrees.file_name()? != "worktrees" {
        return None;
    }
    let dot_git = worktrees.parent()?;
    if dot_git.file_name()? != ".git" {
        return None;
    }
    let repo = dot_git.parent()?;
    if repo.as_os_str().is_empty() {
        return None;
    }
    Some(repo.to_path_buf())
}
