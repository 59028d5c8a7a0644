//! Workspace identity and session keys.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The pull request or issue a workspace is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "number", rename_all = "snake_case")]
pub enum WorkTarget {
    PullRequest(u64),
    Issue(u64),
}

impl WorkTarget {
    /// Short kind tag used in keys and container names.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkTarget::PullRequest(_) => "pr",
            WorkTarget::Issue(_) => "issue",
        }
    }

    pub fn number(&self) -> u64 {
        match self {
            WorkTarget::PullRequest(n) | WorkTarget::Issue(n) => *n,
        }
    }
}

impl fmt::Display for WorkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind(), self.number())
    }
}

/// One unit of work: a checked-out repository for one PR or issue.
///
/// Provisioned by the caller; the session engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    provider: String,
    org: String,
    repo: String,
    path: PathBuf,
    session_path: PathBuf,
    target: WorkTarget,
}

impl Workspace {
    pub fn new(
        provider: impl Into<String>,
        org: impl Into<String>,
        repo: impl Into<String>,
        path: impl Into<PathBuf>,
        session_path: impl Into<PathBuf>,
        target: WorkTarget,
    ) -> Self {
        Self {
            provider: provider.into(),
            org: org.into(),
            repo: repo.into(),
            path: path.into(),
            session_path: session_path.into(),
            target,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Host directory containing the checked-out code.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Host scratch directory for backend-local state.
    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    pub fn target(&self) -> WorkTarget {
        self.target
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::from(self)
    }
}

/// Registry key derived from a workspace.
///
/// Provider, org and repo are lower-cased: GitHub owners and repositories
/// are case-insensitive, so `Acme/Web` and `acme/web` are one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub provider: String,
    pub org: String,
    pub repo: String,
    pub target: WorkTarget,
}

impl SessionKey {
    pub fn new(provider: &str, org: &str, repo: &str, target: WorkTarget) -> Self {
        Self {
            provider: provider.trim().to_lowercase(),
            org: org.trim().to_lowercase(),
            repo: repo.trim().to_lowercase(),
            target,
        }
    }
}

impl From<&Workspace> for SessionKey {
    fn from(workspace: &Workspace) -> Self {
        SessionKey::new(
            &workspace.provider,
            &workspace.org,
            &workspace.repo,
            workspace.target,
        )
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}#{}",
            self.provider, self.org, self.repo, self.target
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(provider: &str, org: &str, repo: &str, path: &str, target: WorkTarget) -> Workspace {
        Workspace::new(provider, org, repo, path, "/tmp/sessions", target)
    }

    #[test]
    fn test_equal_identity_yields_equal_key() {
        let a = ws("claude", "acme", "web", "/a", WorkTarget::PullRequest(7));
        let b = ws("claude", "acme", "web", "/b", WorkTarget::PullRequest(7));
        assert_eq!(a.session_key(), b.session_key());
    }

    #[test]
    fn test_key_is_case_insensitive() {
        let a = ws("Claude", "Acme", "Web", "/a", WorkTarget::Issue(3));
        let b = ws("claude", "acme", "web", "/a", WorkTarget::Issue(3));
        assert_eq!(a.session_key(), b.session_key());
    }

    #[test]
    fn test_pr_and_issue_with_same_number_differ() {
        let pr = ws("claude", "acme", "web", "/a", WorkTarget::PullRequest(7));
        let issue = ws("claude", "acme", "web", "/a", WorkTarget::Issue(7));
        assert_ne!(pr.session_key(), issue.session_key());
    }

    #[test]
    fn test_key_display() {
        let key = ws("x", "o", "r", "/a", WorkTarget::PullRequest(7)).session_key();
        assert_eq!(key.to_string(), "x/o/r#pr-7");
    }
}
