// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! macOS sandbox backend: seatbelt profile generation + `sandbox-exec`.
//!
//! The same policy that drives the Linux mount plan renders to a seatbelt
//! profile: home is write-denied with carve-outs for each writable path,
//! deny paths lose read access, deny-write literals lose writes, and the
//! network section either opens fully, closes fully, or narrows to the
//! local domain proxy's port. Environment filtering is the caller's job.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::bail;

use super::{MountPlan, NamespaceEntry, Sandbox, SandboxOptions};
use crate::policy::Policy;

/// Only trust the system binary; a PATH-injected `sandbox-exec` would mean
/// the host is already lost, but there is no reason to make it easy.
pub const SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

pub fn prepare(opts: &SandboxOptions<'_>) -> anyhow::Result<Sandbox> {
    if opts.command.is_empty() {
        bail!("no agent command to sandbox");
    }
    let plan = MountPlan::from_policy(opts.policy, &opts.home, &opts.cwd);
    let profile = build_profile(opts.policy, &plan, &opts.home, &opts.cwd, opts.proxy_port);

    let mut args = vec!["-p".to_owned(), profile, "--".to_owned()];
    args.extend(opts.command.iter().cloned());
    Ok(Sandbox::new(SEATBELT_EXECUTABLE.to_owned(), args, NamespaceEntry::default()))
}

/// Render the seatbelt profile for `policy`.
pub fn build_profile(
    policy: &Policy,
    plan: &MountPlan,
    home: &Path,
    cwd: &Path,
    proxy_port: Option<u16>,
) -> String {
    let mut p = String::from("(version 1)\n(allow default)\n");

    // Write isolation: everything under home read-only, then the writable
    // carve-outs (canonicalized so /var vs /private/var agree).
    let _ = writeln!(p, "(deny file-write* (subpath {}))", quoted(home));
    let _ = writeln!(p, "(allow file-write* (subpath {}))", quoted(cwd));
    for path in &plan.writable {
        let _ = writeln!(p, "(allow file-write* (subpath {}))", quoted(path));
    }

    for path in &plan.deny {
        let _ = writeln!(p, "(deny file-read* (subpath {}))", quoted(path));
    }
    for path in &plan.deny_write {
        let _ = writeln!(p, "(deny file-write* (literal {}))", quoted(path));
    }

    if policy.network.is_empty() {
        p.push_str("(deny network*)\n");
    } else if !policy.network_unrestricted() {
        // Domain filtering happens in the proxy; the profile only needs to
        // force all egress through it.
        p.push_str("(deny network*)\n");
        if let Some(port) = proxy_port {
            let _ = writeln!(p, "(allow network-outbound (remote ip \"localhost:{port}\"))");
        }
        p.push_str("(allow network-outbound (remote unix-socket))\n");
    }

    p
}

/// Canonicalize and quote a path for the profile.
fn quoted(path: &Path) -> String {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    format!("\"{}\"", canonical.display())
}

#[cfg(test)]
#[path = "macos_tests.rs"]
mod tests;
