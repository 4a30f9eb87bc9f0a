// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Platform sandbox backends.
//!
//! The supervisor never runs an agent unenforced: if the platform cannot
//! honor the policy, [`Sandbox::prepare`] fails with an enumeration of the
//! missing capabilities instead of silently degrading.
//!
//! Linux translates the policy into namespaces, bind mounts, tmpfs deny
//! mounts, and a seccomp filter — re-executing this binary as an in-process
//! wrapper when mount surgery is required. macOS generates a seatbelt
//! profile and launches through `sandbox-exec`.

#[cfg(target_os = "linux")]
pub mod cgroup;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "linux")]
pub mod seccomp;
#[cfg(target_os = "linux")]
pub mod wrapper;

use std::path::{Path, PathBuf};

use crate::policy::{MountMode, Policy};

/// Reserved argv[1] that routes the re-exec'd binary into the wrapper.
pub const WRAPPER_ARG: &str = "_deny_init";

/// Inputs for building a sandboxed launch.
pub struct SandboxOptions<'a> {
    pub policy: &'a Policy,
    /// Agent argv (program first).
    pub command: &'a [String],
    pub session_dir: &'a Path,
    /// Filename prefixes persisted out of the overlay upper dir on exit.
    pub overlay_prefixes: &'a [String],
    /// Home override for multi-tenant relay cases.
    pub home: PathBuf,
    pub cwd: PathBuf,
    /// Local domain-proxy port when a domain allowlist is active; lets the
    /// macOS profile restrict egress to that port.
    pub proxy_port: Option<u16>,
}

/// Namespaces the PTY child enters before exec (no-op off Linux).
#[derive(Debug, Clone, Copy, Default)]
pub struct NamespaceEntry {
    pub user: bool,
    pub mount: bool,
    pub pid: bool,
    pub net: bool,
    /// Map the caller's uid/gid to 0 inside the new user namespace (grants
    /// the wrapper CAP_SYS_ADMIN there); identity mapping otherwise.
    pub map_root: bool,
}

impl NamespaceEntry {
    pub fn any(&self) -> bool {
        self.user || self.mount || self.pid || self.net
    }
}

/// A prepared, enforceable launch: what to exec under the PTY plus the
/// resources to reclaim when the session ends.
pub struct Sandbox {
    pub program: String,
    pub args: Vec<String>,
    pub entry: NamespaceEntry,
    cleanup_dirs: Vec<PathBuf>,
}

impl Sandbox {
    /// Translate the effective policy into a platform launch.
    pub fn prepare(opts: &SandboxOptions<'_>) -> anyhow::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            linux::prepare(opts)
        }
        #[cfg(target_os = "macos")]
        {
            macos::prepare(opts)
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            let _ = opts;
            anyhow::bail!("no sandbox backend for this platform");
        }
    }

    pub(crate) fn new(program: String, args: Vec<String>, entry: NamespaceEntry) -> Self {
        Self { program, args, entry, cleanup_dirs: Vec::new() }
    }

    pub(crate) fn with_cleanup(mut self, dir: PathBuf) -> Self {
        self.cleanup_dirs.push(dir);
        self
    }

    /// Full argv for the PTY child.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.program.clone()];
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Reclaim temp directories. Called unconditionally on session exit.
    pub fn destroy(&self) {
        for dir in &self.cleanup_dirs {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("sandbox cleanup of {} failed: {e}", dir.display());
                }
            }
        }
    }
}

/// The policy's filesystem rules, resolved into enforcement lists.
#[derive(Debug, Default, Clone)]
pub struct MountPlan {
    pub writable: Vec<PathBuf>,
    pub deny: Vec<PathBuf>,
    pub deny_write: Vec<PathBuf>,
}

impl MountPlan {
    /// Resolve last-entry-wins rule semantics against `home` and `cwd`
    /// (`./`-prefixed rule paths anchor at the working directory).
    pub fn from_policy(policy: &Policy, home: &Path, cwd: &Path) -> Self {
        let mut plan = Self::default();
        for (path, mode) in policy.effective_fs(home) {
            let path = anchor_cwd(&path, cwd);
            match mode {
                MountMode::Rw => {
                    // `rw:/` and `rw:` of the home root are the baseline
                    // mount layout, not write-isolation punching.
                    if path != home && path != Path::new("/") {
                        plan.writable.push(path);
                    }
                }
                MountMode::Ro => {}
                MountMode::Deny => plan.deny.push(path),
                MountMode::DenyWrite => plan.deny_write.push(path),
            }
        }
        plan
    }

    /// Whether enforcement needs the re-exec'd mount wrapper.
    pub fn needs_wrapper(&self) -> bool {
        !(self.writable.is_empty() && self.deny.is_empty() && self.deny_write.is_empty())
    }
}

/// Anchor `./`-relative rule paths at the working directory.
fn anchor_cwd(path: &Path, cwd: &Path) -> PathBuf {
    if path == Path::new(".") || path == Path::new("./") {
        return cwd.to_path_buf();
    }
    match path.strip_prefix("./") {
        Ok(rest) => cwd.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
