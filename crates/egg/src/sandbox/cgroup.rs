// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session cgroup v2 scope for memory/pid limits.
//!
//! Everything here is best-effort: systemd and user-session cgroup layouts
//! vary too much to assume delegation, so any failure logs the degradation
//! and the session continues with prlimit-only enforcement. The intent —
//! limits or none — is preserved; the supervisor never crashes over a
//! cgroup.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::{debug, warn};

use crate::policy::Resources;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Leaf the supervisor moves itself into when the no-internal-processes
/// rule blocks enabling controllers on its own cgroup.
const DAEMON_LEAF: &str = "wt-daemon";

/// A created (or degraded) per-session cgroup.
pub struct CgroupScope {
    dir: Option<PathBuf>,
}

impl CgroupScope {
    /// Create `wt-egg-<session>` under the supervisor's own cgroup and apply
    /// the configured limits. Returns a degraded scope on any failure.
    pub fn create(session_id: &str, resources: &Resources) -> Self {
        if resources.memory == 0 && resources.max_pids == 0 {
            return Self { dir: None };
        }
        match try_create(session_id, resources) {
            Ok(dir) => {
                debug!("cgroup scope at {}", dir.display());
                Self { dir: Some(dir) }
            }
            Err(e) => {
                warn!("cgroup unavailable, limits degrade to prlimit: {e:#}");
                Self { dir: None }
            }
        }
    }

    /// Whether a real cgroup backs this scope.
    pub fn active(&self) -> bool {
        self.dir.is_some()
    }

    /// Move the child into the scope.
    pub fn add_process(&self, pid: u32) {
        let Some(ref dir) = self.dir else {
            return;
        };
        if let Err(e) = std::fs::write(dir.join("cgroup.procs"), pid.to_string()) {
            warn!("adding pid {pid} to cgroup failed: {e}");
        }
    }

    /// Remove the scope. Call after the child has been reaped; the kernel
    /// rejects rmdir while any process remains, so retry briefly.
    pub fn destroy(&self) {
        let Some(ref dir) = self.dir else {
            return;
        };
        for _ in 0..10 {
            match std::fs::remove_dir(dir) {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
        warn!("cgroup {} not removed (processes still present?)", dir.display());
    }
}

fn try_create(session_id: &str, resources: &Resources) -> anyhow::Result<PathBuf> {
    let own = own_cgroup_dir()?;
    let dir = own.join(format!("wt-egg-{session_id}"));
    if let Err(e) = std::fs::create_dir(&dir) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(e).with_context(|| format!("creating {}", dir.display()));
        }
    }

    if let Err(e) = enable_controllers(&own) {
        // EBUSY signals the no-internal-processes rule: move ourselves into
        // a leaf first, then retry.
        if e.raw_os_error() == Some(nix::libc::EBUSY) {
            move_self_to_leaf(&own).context("moving supervisor into leaf cgroup")?;
            enable_controllers(&own).context("enabling controllers after leaf move")?;
        } else {
            let _ = std::fs::remove_dir(&dir);
            return Err(e).context("enabling +memory +pids");
        }
    }

    if resources.memory != 0 {
        write_limit(&dir, "memory.max", &resources.memory.to_string())?;
    }
    if resources.max_pids != 0 {
        write_limit(&dir, "pids.max", &resources.max_pids.to_string())?;
    }
    Ok(dir)
}

fn write_limit(dir: &Path, file: &str, value: &str) -> anyhow::Result<()> {
    if let Err(e) = std::fs::write(dir.join(file), value) {
        let _ = std::fs::remove_dir(dir);
        return Err(e).with_context(|| format!("writing {file}={value}"));
    }
    Ok(())
}

fn enable_controllers(dir: &Path) -> std::io::Result<()> {
    let mut f = std::fs::OpenOptions::new().write(true).open(dir.join("cgroup.subtree_control"))?;
    f.write_all(b"+memory +pids")
}

fn move_self_to_leaf(own: &Path) -> anyhow::Result<()> {
    let leaf = own.join(DAEMON_LEAF);
    if let Err(e) = std::fs::create_dir(&leaf) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            return Err(e).with_context(|| format!("creating {}", leaf.display()));
        }
    }
    std::fs::write(leaf.join("cgroup.procs"), std::process::id().to_string())
        .context("writing own pid to leaf cgroup.procs")?;
    Ok(())
}

/// The supervisor's own cgroup directory on the unified hierarchy.
fn own_cgroup_dir() -> anyhow::Result<PathBuf> {
    let text = std::fs::read_to_string("/proc/self/cgroup").context("reading /proc/self/cgroup")?;
    let Some(rel) = parse_unified_cgroup(&text) else {
        bail!("no cgroup v2 entry in /proc/self/cgroup");
    };
    let dir = Path::new(CGROUP_ROOT).join(rel.trim_start_matches('/'));
    if !dir.is_dir() {
        bail!("cgroup v2 directory {} not present", dir.display());
    }
    Ok(dir)
}

/// Extract the unified-hierarchy path from `/proc/self/cgroup` contents
/// (the `0::<path>` line).
pub fn parse_unified_cgroup(text: &str) -> Option<&str> {
    text.lines().find_map(|line| line.strip_prefix("0::")).map(str::trim)
}

#[cfg(test)]
#[path = "cgroup_tests.rs"]
mod tests;
