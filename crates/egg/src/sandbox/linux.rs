// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Linux sandbox backend: user/PID/mount/network namespaces plus the
//! re-exec'd mount wrapper.
//!
//! A purely read-only policy spawns the agent directly inside fresh
//! namespaces. Anything needing mount surgery (write isolation, deny
//! paths) re-execs this binary as the `_deny_init` wrapper with uid/gid
//! mapped to 0 so it holds CAP_SYS_ADMIN inside its user namespace; the
//! wrapper then spawns the agent in a nested user+PID namespace that maps
//! root back to the real user.

use std::io::Write as _;
use std::path::Path;

use anyhow::{bail, Context};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getgid, getuid, ForkResult, Pid};

use super::{MountPlan, NamespaceEntry, Sandbox, SandboxOptions, WRAPPER_ARG};
use crate::policy::Resources;

/// Floor on `RLIMIT_AS`: JIT runtimes reserve around a GiB of virtual
/// address space at startup, so anything lower kills them before main.
const MIN_ADDRESS_SPACE: u64 = 4 << 30;

/// Ubuntu-specific sysctl gating unprivileged user namespaces.
const USERNS_SYSCTL: &str = "/proc/sys/kernel/unprivileged_userns_clone";

pub fn prepare(opts: &SandboxOptions<'_>) -> anyhow::Result<Sandbox> {
    probe_capabilities()?;

    if opts.command.is_empty() {
        bail!("no agent command to sandbox");
    }

    let plan = MountPlan::from_policy(opts.policy, &opts.home, &opts.cwd);
    let deny_network = opts.policy.network.is_empty();

    if !plan.needs_wrapper() {
        // Single-stage: the agent runs directly in fresh namespaces with an
        // identity uid/gid mapping.
        let entry = NamespaceEntry {
            user: true,
            mount: true,
            pid: true,
            net: deny_network,
            map_root: false,
        };
        return Ok(Sandbox::new(
            opts.command[0].clone(),
            opts.command[1..].to_vec(),
            entry,
        ));
    }

    // Two-stage: re-exec as the wrapper. The wrapper keeps the host PID
    // namespace so `/proc/<child>` stays writable for the nested uid_map.
    let entry = NamespaceEntry {
        user: true,
        mount: true,
        pid: false,
        net: deny_network,
        map_root: true,
    };

    let exe = std::env::current_exe().context("resolving own binary for wrapper re-exec")?;
    let mut args = vec![
        WRAPPER_ARG.to_owned(),
        "--uid".to_owned(),
        getuid().as_raw().to_string(),
        "--gid".to_owned(),
        getgid().as_raw().to_string(),
        "--log".to_owned(),
        opts.session_dir.join("deny_init.log").display().to_string(),
        "--home".to_owned(),
        opts.home.display().to_string(),
    ];
    for path in &plan.deny {
        args.push("--deny".to_owned());
        args.push(path.display().to_string());
    }
    for path in &plan.deny_write {
        args.push("--deny-write".to_owned());
        args.push(path.display().to_string());
    }
    for path in &plan.writable {
        args.push("--writable".to_owned());
        args.push(path.display().to_string());
    }
    for prefix in opts.overlay_prefixes {
        args.push("--overlay-prefix".to_owned());
        args.push(prefix.clone());
    }
    args.push("--".to_owned());
    args.extend(opts.command.iter().cloned());

    Ok(Sandbox::new(exe.display().to_string(), args, entry))
}

/// Verify this system can enforce the policy at all.
///
/// Passes when running as root, when the unprivileged-userns sysctl is
/// enabled, or when an actual probe clone into a new user namespace
/// succeeds. Fails with the specific gaps; there is no unenforced fallback.
pub fn probe_capabilities() -> anyhow::Result<()> {
    if getuid().is_root() {
        return Ok(());
    }

    let mut gaps = Vec::new();
    match std::fs::read_to_string(USERNS_SYSCTL) {
        Ok(v) if v.trim() == "1" => return Ok(()),
        Ok(v) => gaps.push(format!("{USERNS_SYSCTL} = {}", v.trim())),
        // Absent on most distros; fall through to the live probe.
        Err(_) => {}
    }

    match probe_userns_clone() {
        Ok(true) => return Ok(()),
        Ok(false) => gaps.push("creating a user namespace failed (EPERM)".to_owned()),
        Err(e) => gaps.push(format!("user namespace probe failed: {e}")),
    }

    bail!(
        "this system cannot enforce the sandbox: {}. Run as root, or enable \
         unprivileged user namespaces (sysctl kernel.unprivileged_userns_clone=1 \
         on Ubuntu, kernel.apparmor_restrict_unprivileged_userns=0 on 24.04+)",
        gaps.join("; ")
    )
}

/// Fork a probe child that attempts `unshare(CLONE_NEWUSER)` with an
/// identity self-mapping.
// fork requires unsafe: the child runs only async-signal-safe calls and exits
#[allow(unsafe_code)]
fn probe_userns_clone() -> anyhow::Result<bool> {
    use nix::sys::wait::{waitpid, WaitStatus};

    // SAFETY: the child performs only unshare/write/_exit before exiting;
    // no allocation or locking happens after the fork.
    match unsafe { nix::unistd::fork() }.context("probe fork failed")? {
        ForkResult::Child => {
            let (uid, gid) = (getuid().as_raw(), getgid().as_raw());
            let ok = unshare(CloneFlags::CLONE_NEWUSER).is_ok()
                && write_self_maps(uid, uid, gid, gid).is_ok();
            // SAFETY: _exit is async-signal-safe and skips atexit handlers.
            unsafe { nix::libc::_exit(if ok { 0 } else { 1 }) }
        }
        ForkResult::Parent { child } => match waitpid(child, None)? {
            WaitStatus::Exited(_, 0) => Ok(true),
            _ => Ok(false),
        },
    }
}

/// Enter the namespaces described by `entry` and exec `argv` with `env`.
///
/// Must be called from a freshly forked, single-threaded child (the PTY
/// fork): `unshare(CLONE_NEWUSER)` is a per-thread operation that is
/// hostile to threaded runtimes, which is the whole reason the wrapper is a
/// re-exec rather than an in-place unshare.
///
/// Only returns on error.
#[allow(unsafe_code)] // fork for the PID-namespace init; _exit in the waiter
pub fn enter_and_exec(
    entry: &NamespaceEntry,
    argv: &[String],
    env: &[(String, String)],
) -> anyhow::Error {
    match enter_and_exec_inner(entry, argv, env) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

enum Never {}

#[allow(unsafe_code)]
fn enter_and_exec_inner(
    entry: &NamespaceEntry,
    argv: &[String],
    env: &[(String, String)],
) -> anyhow::Result<Never> {
    use std::ffi::CString;

    let uid = getuid().as_raw();
    let gid = getgid().as_raw();

    if entry.any() {
        let mut flags = CloneFlags::empty();
        if entry.user && !getuid().is_root() {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if entry.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if entry.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if entry.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        unshare(flags).context("unshare failed")?;
        if flags.contains(CloneFlags::CLONE_NEWUSER) {
            if entry.map_root {
                write_self_maps(0, uid, 0, gid).context("writing uid/gid maps")?;
            } else {
                write_self_maps(uid, uid, gid, gid).context("writing uid/gid maps")?;
            }
        }
    }

    if entry.pid {
        // unshare(CLONE_NEWPID) only applies to children: fork once so the
        // agent becomes PID 1 of the new namespace. The intermediate ignores
        // job-control signals (the agent shares its foreground process
        // group) and mirrors the agent's exit.
        // SAFETY: single-threaded here; the parent arm only waits and exits.
        match unsafe { nix::unistd::fork() }.context("pid-namespace fork failed")? {
            ForkResult::Child => {}
            ForkResult::Parent { child } => {
                let code = wait_for_code(child);
                // SAFETY: _exit is async-signal-safe.
                unsafe { nix::libc::_exit(code) }
            }
        }
    }

    let c_args: Vec<CString> = argv
        .iter()
        .map(|s| CString::new(s.as_bytes()))
        .collect::<Result<_, _>>()
        .context("invalid command argument")?;
    let c_env: Vec<CString> = env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")))
        .collect::<Result<_, _>>()
        .context("invalid environment entry")?;

    nix::unistd::execvpe(&c_args[0], &c_args, &c_env).context("execvpe failed")?;
    unreachable!()
}

#[allow(unsafe_code)]
fn wait_for_code(child: Pid) -> i32 {
    use nix::sys::signal::{signal, SigHandler, Signal};
    use nix::sys::wait::{waitpid, WaitStatus};

    // SAFETY: setting SIG_IGN has no handler to be unsafe about.
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::SigIgn);
        let _ = signal(Signal::SIGHUP, SigHandler::SigIgn);
        let _ = signal(Signal::SIGTERM, SigHandler::SigIgn);
    }
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, sig, _)) => return 128 + sig as i32,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return 1,
        }
    }
}

/// Write `setgroups`, `gid_map`, and `uid_map` for the current process after
/// `unshare(CLONE_NEWUSER)`.
///
/// One single-line mapping is all an unprivileged process may write; a
/// process holding CAP_SETUID in the outer namespace (the wrapper spawning
/// its nested agent) may map arbitrary ids.
pub fn write_self_maps(
    inside_uid: u32,
    outside_uid: u32,
    inside_gid: u32,
    outside_gid: u32,
) -> std::io::Result<()> {
    std::fs::write("/proc/self/setgroups", "deny")?;
    let mut f = std::fs::File::create("/proc/self/gid_map")?;
    writeln!(f, "{inside_gid} {outside_gid} 1")?;
    let mut f = std::fs::File::create("/proc/self/uid_map")?;
    writeln!(f, "{inside_uid} {outside_uid} 1")?;
    Ok(())
}

/// Post-start resource limits on the spawned child.
///
/// True memory caps belong to cgroup `memory.max`; `RLIMIT_AS` only gets a
/// floored value because address-space reservations are not memory use.
#[allow(unsafe_code)] // prlimit has no nix wrapper for a foreign pid
pub fn apply_rlimits(pid: u32, resources: &Resources) -> anyhow::Result<()> {
    fn set(pid: u32, which: nix::libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
        let lim = nix::libc::rlimit { rlim_cur: value, rlim_max: value };
        // SAFETY: prlimit reads the provided struct and writes nothing back
        // (old_limit is null).
        let rc = unsafe {
            nix::libc::prlimit(pid as nix::libc::pid_t, which, &lim, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    if !resources.cpu.is_zero() {
        set(pid, nix::libc::RLIMIT_CPU, resources.cpu.as_secs())
            .context("setting RLIMIT_CPU")?;
    }
    if resources.max_fds != 0 {
        set(pid, nix::libc::RLIMIT_NOFILE, resources.max_fds as u64)
            .context("setting RLIMIT_NOFILE")?;
    }
    if resources.memory != 0 {
        set(pid, nix::libc::RLIMIT_AS, resources.memory.max(MIN_ADDRESS_SPACE))
            .context("setting RLIMIT_AS")?;
    }
    Ok(())
}

/// Diagnostic context for the watchdog: recent sandbox denial messages.
pub fn denial_log_hint(session_dir: &Path) -> String {
    let log = session_dir.join("deny_init.log");
    match std::fs::read_to_string(&log) {
        Ok(text) => {
            let tail: Vec<&str> = text.lines().rev().take(10).collect();
            tail.into_iter().rev().collect::<Vec<_>>().join("\n")
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
#[path = "linux_tests.rs"]
mod tests;
