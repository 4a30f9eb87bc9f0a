// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The `_deny_init` wrapper: mount and seccomp setup inside the namespaces
//! the supervisor created, followed by the nested agent spawn.
//!
//! Runs as uid 0 of its own user namespace (CAP_SYS_ADMIN there, nothing on
//! the host) and in the host PID namespace so `/proc/<child>` stays valid
//! for the nested uid_map write. Deliberately synchronous: no runtime, no
//! threads, so the nested `unshare` calls stay reliable.
//!
//! Order matters: mounts first, seccomp second (the filter denies `mount`),
//! agent spawn last.

use std::ffi::{CString, OsStr};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{bail, Context};
use clap::Parser;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::ForkResult;

use super::linux::write_self_maps;
use super::seccomp;

/// Wrapper argument grammar (everything after the reserved argv[1]).
#[derive(Debug, Parser)]
#[command(name = "_deny_init")]
pub struct WrapperArgs {
    /// Real uid the agent maps back to.
    #[arg(long)]
    pub uid: u32,

    /// Real gid the agent maps back to.
    #[arg(long)]
    pub gid: u32,

    /// Wrapper log file.
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Paths hidden behind empty read-only tmpfs mounts.
    #[arg(long = "deny")]
    pub deny: Vec<PathBuf>,

    /// Files kept readable but remounted read-only.
    #[arg(long = "deny-write")]
    pub deny_write: Vec<PathBuf>,

    /// Home directory to write-isolate.
    #[arg(long)]
    pub home: Option<PathBuf>,

    /// Writable subpaths punched through the isolation.
    #[arg(long = "writable")]
    pub writable: Vec<PathBuf>,

    /// Upper-dir filename prefixes persisted to the real home on exit;
    /// presence selects overlay mode.
    #[arg(long = "overlay-prefix")]
    pub overlay_prefix: Vec<String>,

    /// Agent command (after `--`).
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Entry point from `main` when argv[1] is the reserved wrapper argument.
/// Returns the process exit code.
pub fn run(args: WrapperArgs) -> i32 {
    let mut log = WrapperLog::open(args.log.as_deref());
    match run_inner(&args, &mut log) {
        Ok(code) => code,
        Err(e) => {
            log.line(&format!("fatal: {e:#}"));
            1
        }
    }
}

fn run_inner(args: &WrapperArgs, log: &mut WrapperLog) -> anyhow::Result<i32> {
    if args.command.is_empty() {
        bail!("no agent command after --");
    }

    // 1. Keep every mount below private so nothing escapes to the host
    //    mount table.
    mount(Some("none"), "/", None::<&str>, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None::<&str>)
        .context("remounting / private-recursive")?;

    // 2. Write isolation over home.
    let mut overlay = None;
    if let Some(ref home) = args.home {
        if args.overlay_prefix.is_empty() {
            setup_bind_isolation(home, &args.writable, log)?;
        } else {
            match setup_overlay(home, &args.writable, log) {
                Ok(state) => overlay = Some(state),
                Err(e) => {
                    // Never run with silently ephemeral auth state: tear the
                    // overlay down and isolate with plain binds instead.
                    log.line(&format!("overlay setup failed ({e:#}), using bind isolation"));
                    setup_bind_isolation(home, &args.writable, log)?;
                }
            }
        }
    }

    // 3. Deny paths. Per-entry failures log and continue.
    for path in &args.deny {
        if let Err(e) = mount_deny(path) {
            log.line(&format!("deny {} failed: {e:#}", path.display()));
        }
    }
    for path in &args.deny_write {
        if let Err(e) = mount_deny_write(path) {
            log.line(&format!("deny-write {} failed: {e:#}", path.display()));
        }
    }

    // 4. Seccomp. Failing open here would hand the agent mount/ptrace.
    seccomp::install().context("seccomp install")?;
    log.line("mounts and seccomp in place");

    // 5. Nested agent spawn.
    let code = spawn_agent(&args.command, args.uid, args.gid, log)?;

    if let Some(state) = overlay {
        state.persist(&args.overlay_prefix, log);
    }
    log.line(&format!("agent exited with code {code}"));
    Ok(code)
}

// -- Write isolation ----------------------------------------------------------

/// Bind-mount mode: bind home and each writable subpath onto themselves,
/// then remount home read-only. The child binds stay writable because they
/// are distinct mount points.
fn setup_bind_isolation(
    home: &Path,
    writable: &[PathBuf],
    log: &mut WrapperLog,
) -> anyhow::Result<()> {
    mount(Some(home), home, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .with_context(|| format!("bind-mounting {}", home.display()))?;

    for path in writable {
        if let Err(e) = bind_self(path) {
            log.line(&format!("writable bind {} failed: {e:#}", path.display()));
            continue;
        }
        // Files sharing the directory's filename prefix (e.g. `.claude.json`
        // next to a writable `.claude`) must stay writable too.
        for sibling in prefix_siblings(path) {
            if let Err(e) = bind_self(&sibling) {
                log.line(&format!("sibling bind {} failed: {e:#}", sibling.display()));
            }
        }
    }

    // A read-only remount that fails would leave home writable; that is
    // more privilege than the policy grants, so it aborts the session.
    mount(
        None::<&str>,
        home,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .with_context(|| format!("read-only remount of {}", home.display()))?;

    log.line(&format!("bind isolation over {} ({} writable)", home.display(), writable.len()));
    Ok(())
}

/// Overlay state needed for the exit-time persistence pass.
struct OverlayState {
    side: PathBuf,
    upper: PathBuf,
    _tmp: tempfile::TempDir,
}

/// Overlay mode: bind the real home aside, mount an overlayfs on home, and
/// punch writable subpaths straight through to the side bind so their
/// writes bypass the copy-on-write layer.
fn setup_overlay(
    home: &Path,
    writable: &[PathBuf],
    log: &mut WrapperLog,
) -> anyhow::Result<OverlayState> {
    let tmp = tempfile::Builder::new()
        .prefix("wt-egg-overlay-")
        .tempdir()
        .context("creating overlay work area")?;
    let side = tmp.path().join("side");
    let upper = tmp.path().join("upper");
    let work = tmp.path().join("work");
    for dir in [&side, &upper, &work] {
        std::fs::create_dir_all(dir)?;
    }

    mount(Some(home), &side, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .context("binding home aside")?;

    let data = format!(
        "lowerdir={},upperdir={},workdir={}",
        side.display(),
        upper.display(),
        work.display()
    );
    mount(Some("overlay"), home, Some("overlay"), MsFlags::empty(), Some(data.as_str()))
        .context("mounting overlayfs on home")?;

    // Writable subpaths reach the real home through the side bind. Any
    // failure aborts the whole overlay: a writable path that silently lands
    // in the discard-on-exit upper layer would eat agent auth state.
    let result = (|| -> anyhow::Result<()> {
        for path in writable {
            let Ok(rel) = path.strip_prefix(home) else {
                continue;
            };
            let src = side.join(rel);
            if !src.exists() {
                std::fs::create_dir_all(&src)
                    .with_context(|| format!("creating {}", src.display()))?;
            }
            mount(Some(&src), path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
                .with_context(|| format!("binding {} through overlay", path.display()))?;
            for sibling in prefix_siblings_in(&side, rel) {
                let target = home.join(
                    sibling.strip_prefix(&side).unwrap_or(&sibling),
                );
                mount(Some(&sibling), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>)
                    .with_context(|| format!("binding {} through overlay", target.display()))?;
            }
        }
        Ok(())
    })();

    if let Err(e) = result {
        let _ = umount2(home, MntFlags::MNT_DETACH);
        let _ = umount2(&side, MntFlags::MNT_DETACH);
        return Err(e);
    }

    log.line(&format!("overlay isolation over {} ({} writable)", home.display(), writable.len()));
    Ok(OverlayState { side, upper, _tmp: tmp })
}

impl OverlayState {
    /// Copy top-level upper-dir entries whose name matches a configured
    /// prefix back to the real home (via the side bind).
    fn persist(&self, prefixes: &[String], log: &mut WrapperLog) {
        let entries = match std::fs::read_dir(&self.upper) {
            Ok(entries) => entries,
            Err(e) => {
                log.line(&format!("overlay persist: reading upper dir failed: {e}"));
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !matches_any_prefix(&name, prefixes) {
                continue;
            }
            let dst = self.side.join(&name);
            match copy_recursive(&entry.path(), &dst) {
                Ok(()) => log.line(&format!("persisted {}", name.to_string_lossy())),
                Err(e) => {
                    log.line(&format!("persisting {} failed: {e:#}", name.to_string_lossy()));
                }
            }
        }
    }
}

/// Whether `name` starts with any of the configured overlay prefixes.
fn matches_any_prefix(name: &OsStr, prefixes: &[String]) -> bool {
    let name = name.to_string_lossy();
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

/// Recursive copy skipping anything that is neither file nor directory
/// (overlayfs whiteouts are character devices).
fn copy_recursive(src: &Path, dst: &Path) -> anyhow::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if meta.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)?.flatten() {
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else if meta.is_file() {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dst)
            .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
    }
    Ok(())
}

/// Bind a path onto itself, creating it first if missing.
fn bind_self(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))?;
    }
    mount(Some(path), path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .with_context(|| format!("bind-mounting {}", path.display()))?;
    Ok(())
}

/// Regular files next to `dir` whose name extends `dir`'s file name.
fn prefix_siblings(dir: &Path) -> Vec<PathBuf> {
    let (Some(parent), Some(name)) = (dir.parent(), dir.file_name()) else {
        return Vec::new();
    };
    siblings_with_prefix(parent, name)
}

/// Same, but for a path relative to the side bind.
fn prefix_siblings_in(root: &Path, rel: &Path) -> Vec<PathBuf> {
    let abs = root.join(rel);
    let (Some(parent), Some(name)) = (abs.parent(), abs.file_name()) else {
        return Vec::new();
    };
    siblings_with_prefix(parent, name)
}

fn siblings_with_prefix(parent: &Path, name: &OsStr) -> Vec<PathBuf> {
    let prefix = name.to_string_lossy().into_owned();
    let Ok(entries) = std::fs::read_dir(parent) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| {
            let entry_name = e.file_name();
            let entry_name = entry_name.to_string_lossy();
            entry_name.starts_with(prefix.as_str())
                && entry_name != prefix
                && e.file_type().map(|t| t.is_file()).unwrap_or(false)
        })
        .map(|e| e.path())
        .collect()
}

// -- Deny mounts --------------------------------------------------------------

/// Hide a path behind an empty read-only tmpfs; files get an empty bind of
/// `/dev/null` instead (tmpfs only mounts on directories).
fn mount_deny(path: &Path) -> anyhow::Result<()> {
    if path.is_file() {
        mount(Some("/dev/null"), path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
            .with_context(|| format!("masking file {}", path.display()))?;
        return remount_ro(path);
    }
    if !path.exists() {
        std::fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))?;
    }
    mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("size=0"),
    )
    .with_context(|| format!("tmpfs over {}", path.display()))
}

/// Keep a file readable but reject writes.
fn mount_deny_write(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        // Nothing to protect.
        return Ok(());
    }
    mount(Some(path), path, None::<&str>, MsFlags::MS_BIND, None::<&str>)
        .with_context(|| format!("bind-mounting {}", path.display()))?;
    remount_ro(path)
}

fn remount_ro(path: &Path) -> anyhow::Result<()> {
    mount(
        None::<&str>,
        path,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .with_context(|| format!("read-only remount of {}", path.display()))
}

// -- Agent spawn --------------------------------------------------------------

static AGENT_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_signal(sig: nix::libc::c_int) {
    let pid = AGENT_PID.load(Ordering::Acquire);
    if pid > 0 {
        // SAFETY: kill(2) is async-signal-safe.
        #[allow(unsafe_code)]
        unsafe {
            nix::libc::kill(pid, sig);
        }
    }
}

/// Spawn the agent as PID 1 of a fresh PID namespace, in a nested user
/// namespace mapping root back to the real uid/gid, forward
/// SIGTERM/SIGINT/SIGHUP, and wait for its exit.
#[allow(unsafe_code)] // fork + execvp + signal handlers
fn spawn_agent(
    command: &[String],
    uid: u32,
    gid: u32,
    log: &mut WrapperLog,
) -> anyhow::Result<i32> {
    use nix::sys::signal::{signal, SigHandler, Signal};
    use nix::sys::wait::{waitpid, WaitStatus};

    unshare(CloneFlags::CLONE_NEWPID).context("unshare(CLONE_NEWPID)")?;

    // SAFETY: the child performs only unshare, /proc writes, and exec.
    match unsafe { nix::unistd::fork() }.context("agent fork failed")? {
        ForkResult::Child => {
            // Drop the nested user namespace only when the real caller is
            // already root; everyone else must not see uid 0.
            if uid != 0 {
                if unshare(CloneFlags::CLONE_NEWUSER).is_err()
                    || write_self_maps(uid, 0, gid, 0).is_err()
                {
                    // SAFETY: _exit is async-signal-safe.
                    unsafe { nix::libc::_exit(126) }
                }
            }
            let c_args: Vec<CString> = command
                .iter()
                .filter_map(|s| CString::new(s.as_bytes()).ok())
                .collect();
            if c_args.len() == command.len() {
                let _ = nix::unistd::execvp(&c_args[0], &c_args);
            }
            // SAFETY: _exit is async-signal-safe.
            unsafe { nix::libc::_exit(127) }
        }
        ForkResult::Parent { child } => {
            AGENT_PID.store(child.as_raw(), Ordering::Release);
            let handler = SigHandler::Handler(forward_signal);
            // SAFETY: forward_signal only reads an atomic and calls kill.
            unsafe {
                let _ = signal(Signal::SIGTERM, handler);
                let _ = signal(Signal::SIGINT, handler);
                let _ = signal(Signal::SIGHUP, handler);
            }
            log.line(&format!("agent spawned as pid {child}"));

            loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                    Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
                    Ok(_) => continue,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => bail!("waitpid failed: {e}"),
                }
            }
        }
    }
}

// -- Logging ------------------------------------------------------------------

/// Line-oriented log for the wrapper; the supervisor's structured logging is
/// unavailable across the exec boundary, and the watchdog tails this file.
struct WrapperLog {
    file: Option<std::fs::File>,
}

impl WrapperLog {
    fn open(path: Option<&Path>) -> Self {
        let file = path.and_then(|p| {
            std::fs::OpenOptions::new().create(true).append(true).open(p).ok()
        });
        Self { file }
    }

    fn line(&mut self, msg: &str) {
        if let Some(ref mut f) = self.file {
            let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            let _ = writeln!(f, "{ts} {msg}");
        }
    }
}

#[cfg(test)]
#[path = "wrapper_tests.rs"]
mod tests;
