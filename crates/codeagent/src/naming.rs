//! Deterministic container names derived from workspace identity.
//!
//! The same name doubles as the per-workspace credential directory name,
//! so every name is restricted to `[a-z0-9_-]`, starts with a letter and
//! stays within the 128 character limit of the container runtimes.

use sha2::{Digest, Sha256};

use crate::workspace::{SessionKey, Workspace};

/// Prefix shared by every container this engine creates.
pub const NAME_PREFIX: &str = "codeagent";

/// Upper bound for the human-readable part of a name.
const MAX_SLUG_LEN: usize = 90;

/// Upper bound for provider, org and repo in a legacy name; kind, number
/// and variant follow untruncated.
const MAX_LEGACY_IDENTITY_LEN: usize = 72;

/// Number of hex digits of the key digest appended to names.
const DIGEST_LEN: usize = 10;

/// Which container-backed variant a name is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerVariant {
    /// One-shot `exec` per prompt.
    Managed,
    /// Long-lived interactive process.
    Interactive,
}

impl ContainerVariant {
    fn suffix(&self) -> &'static str {
        match self {
            ContainerVariant::Managed => "",
            ContainerVariant::Interactive => "-interactive",
        }
    }
}

/// Current container name for a workspace.
///
/// The readable slug is followed by a digest of the unsanitised key so
/// that workspaces whose slugs collide after sanitising (`a.b` vs `a-b`)
/// still get distinct names.
pub fn container_name(provider: &str, workspace: &Workspace, variant: ContainerVariant) -> String {
    let key = SessionKey::new(provider, workspace.org(), workspace.repo(), workspace.target());
    let slug = truncate_slug(
        &sanitize(&format!(
            "{}-{}-{}-{}",
            key.provider, key.org, key.repo, key.target
        )),
        MAX_SLUG_LEN,
    );
    format!(
        "{}-{}{}-{}",
        NAME_PREFIX,
        slug,
        variant.suffix(),
        key_digest(&key, variant)
    )
}

/// Names earlier releases used for the same workspace, most recent first.
///
/// Containers started under these names are still running on hosts that
/// were upgraded in place; lookups must probe them before creating a new
/// container. Fields are joined with `_`, which sanitised fields never
/// contain, and kind, number and variant are never truncated, so two keys
/// only share a legacy name when they differ in punctuation alone. Reuse
/// additionally checks the session label (see `provision::find_existing`).
pub fn legacy_names(provider: &str, workspace: &Workspace, variant: ContainerVariant) -> Vec<String> {
    let key = SessionKey::new(provider, workspace.org(), workspace.repo(), workspace.target());

    // Underscore-separated names used before the digest format.
    let identity = truncate_slug(
        &[
            sanitize(&key.provider),
            sanitize(&key.org),
            sanitize(&key.repo),
        ]
        .join("_"),
        MAX_LEGACY_IDENTITY_LEN,
    );
    let underscored = format!(
        "{}_{}_{}_{}{}",
        NAME_PREFIX,
        identity,
        key.target.kind(),
        key.target.number(),
        variant.suffix().replace('-', "_")
    );

    vec![underscored]
}

/// Current name followed by all legacy names, in probe order.
pub fn candidate_names(
    provider: &str,
    workspace: &Workspace,
    variant: ContainerVariant,
) -> Vec<String> {
    let mut names = vec![container_name(provider, workspace, variant)];
    names.extend(legacy_names(provider, workspace, variant));
    names
}

fn key_digest(key: &SessionKey, variant: ContainerVariant) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_string().as_bytes());
    hasher.update(variant.suffix().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..DIGEST_LEN].to_string()
}

/// Lower-case, map everything outside `[a-z0-9]` to `-`, collapse runs.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

fn truncate_slug(slug: &str, max_len: usize) -> String {
    if slug.len() <= max_len {
        return slug.to_string();
    }
    slug[..max_len]
        .trim_end_matches(['-', '_'])
        .to_string()
}
