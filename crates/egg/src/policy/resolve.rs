// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Policy loading and `base` chain resolution.
//!
//! A config file inherits from its `base`: a named base under
//! `~/.wingthing/bases/`, a path relative to the config file, an absolute
//! path, or the literal `none` (empty slate). An absent `base` inherits the
//! built-in default policy. A structured `base` record may additionally
//! replace individual sections of the resolved parent before the merge.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};

use super::merge::merge;
use super::{expand_tilde, home_dir, Base, MountMode, MountRule, Policy, WILDCARD};

/// Maximum number of `base` hops on one chain.
pub const MAX_BASE_DEPTH: usize = 10;

/// Well-known directory for named bases, relative to `$HOME`.
pub const BASES_DIR: &str = ".wingthing/bases";

/// Sensitive dotfiles denied by the built-in default policy.
pub const SENSITIVE_PATHS: &[&str] = &[
    "~/.ssh",
    "~/.gnupg",
    "~/.aws",
    "~/.docker",
    "~/.kube",
    "~/.netrc",
    "~/.bash_history",
    "~/.zsh_history",
];

/// Load a config file and resolve its full `base` chain into an effective
/// policy.
pub fn resolve_file(path: &Path) -> anyhow::Result<Policy> {
    let mut visited = Vec::new();
    resolve_at(path, &mut visited, 0)
}

/// Resolve an already-parsed policy whose relative references are anchored
/// at `dir`. Used for inline policies passed straight to the supervisor.
pub fn resolve_policy(child: Policy, dir: &Path) -> anyhow::Result<Policy> {
    let mut visited = Vec::new();
    resolve_parsed(child, dir, &mut visited, 0)
}

fn resolve_at(path: &Path, visited: &mut Vec<PathBuf>, depth: usize) -> anyhow::Result<Policy> {
    if depth > MAX_BASE_DEPTH {
        bail!("base chain exceeds depth {MAX_BASE_DEPTH} at {}", path.display());
    }

    let abs = std::fs::canonicalize(path)
        .with_context(|| format!("config file not found: {}", path.display()))?;
    if visited.contains(&abs) {
        bail!("base chain cycle through {}", abs.display());
    }
    visited.push(abs.clone());

    let text = std::fs::read_to_string(&abs)
        .with_context(|| format!("reading config file {}", abs.display()))?;
    let child = Policy::parse(&text)
        .with_context(|| format!("parsing config file {}", abs.display()))?;

    let dir = abs.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"));
    resolve_parsed(child, &dir, visited, depth)
}

fn resolve_parsed(
    mut child: Policy,
    dir: &Path,
    visited: &mut Vec<PathBuf>,
    depth: usize,
) -> anyhow::Result<Policy> {
    let parent = match child.base.take() {
        None => default_policy(),
        Some(Base::Ref(r)) if r == "none" => {
            child.normalize();
            return Ok(child);
        }
        Some(Base::Ref(r)) => resolve_at(&locate(&r, dir), visited, depth + 1)?,
        Some(Base::Masked(masks)) => {
            let named_none = masks.name.as_deref() == Some("none");
            if named_none && masks.has_mask() {
                bail!("base: none leaves nothing to mask");
            }
            if named_none {
                child.normalize();
                return Ok(child);
            }

            let mut parent = match masks.name.as_deref() {
                None => default_policy(),
                Some(name) => resolve_at(&locate(name, dir), visited, depth + 1)?,
            };

            if let Some(ref fs_ref) = masks.fs {
                match fs_ref.as_str() {
                    "none" => parent.fs.clear(),
                    other => {
                        parent.fs = resolve_at(&locate(other, dir), visited, depth + 1)?.fs;
                    }
                }
            }
            if let Some(ref net_ref) = masks.network {
                match net_ref.as_str() {
                    "none" => parent.network.clear(),
                    other => {
                        parent.network =
                            resolve_at(&locate(other, dir), visited, depth + 1)?.network;
                    }
                }
            }
            if let Some(ref env_ref) = masks.env {
                match env_ref.as_str() {
                    "none" => parent.env.clear(),
                    other => {
                        parent.env = resolve_at(&locate(other, dir), visited, depth + 1)?.env;
                    }
                }
            }
            parent
        }
    };

    Ok(merge(parent, child))
}

/// Turn a base reference into a filesystem path.
///
/// Relative (`./`, `../`) anchors at the referencing config's directory,
/// absolute and `~` paths are taken as given, anything else is a name under
/// [`BASES_DIR`].
fn locate(reference: &str, dir: &Path) -> PathBuf {
    if reference.starts_with("./") || reference.starts_with("../") {
        return dir.join(reference);
    }
    if reference.starts_with('/') {
        return PathBuf::from(reference);
    }
    if reference.starts_with('~') {
        return expand_tilde(reference, &home_dir());
    }
    home_dir().join(BASES_DIR).join(format!("{reference}.yaml"))
}

/// The built-in default policy used when a config carries no `base`.
///
/// Everything readable, the working directory and standard build caches
/// writable, sensitive dotfiles denied, and the sandbox's own config
/// protected from the agent.
pub fn default_policy() -> Policy {
    let mut fs = vec![
        MountRule::new(MountMode::Ro, "/"),
        MountRule::new(MountMode::Rw, "./"),
        MountRule::new(MountMode::Rw, "~/.cache"),
        MountRule::new(MountMode::Rw, "~/.npm"),
        MountRule::new(MountMode::Rw, "~/.cargo/registry"),
    ];
    #[cfg(target_os = "macos")]
    fs.push(MountRule::new(MountMode::Rw, "~/Library/Caches"));
    for path in SENSITIVE_PATHS {
        fs.push(MountRule::new(MountMode::Deny, *path));
    }
    fs.push(MountRule::new(MountMode::DenyWrite, "./egg.yaml"));

    Policy {
        fs,
        env: ["HOME", "PATH", "TERM", "LANG", "USER"].map(str::to_owned).to_vec(),
        ..Policy::default()
    }
}

/// Whether `domains` requires the filtering proxy: non-empty and not the
/// universal wildcard.
pub fn needs_domain_proxy(domains: &[String]) -> bool {
    !domains.is_empty() && !domains.iter().any(|d| d == WILDCARD)
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
