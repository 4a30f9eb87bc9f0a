// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};

use anyhow::{bail, Context};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;

use super::ExitStatus;
use crate::sandbox::Sandbox;

/// Newtype wrapper around the PTY master for use with `AsyncFd`.
#[derive(Debug)]
pub struct PtyFd(OwnedFd);

impl AsRawFd for PtyFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for PtyFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Sandboxed child process on a pseudo-terminal.
///
/// All I/O methods take `&self`: the supervisor's reader loop, the RPC input
/// path, and resize requests share one handle through an `Arc`.
pub struct NativePty {
    master: AsyncFd<PtyFd>,
    child_pid: Pid,
    cols: AtomicU16,
    rows: AtomicU16,
}

impl NativePty {
    /// Fork a child on a fresh PTY, enter the sandbox's namespaces, and exec
    /// its launch argv with exactly the given environment.
    ///
    /// The namespace entry happens in the forked child while it is still
    /// single-threaded; a multithreaded runtime cannot `unshare` a user
    /// namespace in place.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(
        sandbox: &Sandbox,
        env: &[(String, String)],
        cwd: &Path,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<Self> {
        let winsize = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
        let argv = sandbox.argv();

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. The child branch only
        // chdirs, enters namespaces, and execs.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                if let Err(e) = std::env::set_current_dir(cwd) {
                    eprintln!("egg: chdir {} failed: {e}", cwd.display());
                    // SAFETY: _exit is async-signal-safe.
                    unsafe { libc::_exit(125) }
                }
                #[cfg(target_os = "linux")]
                {
                    let err = crate::sandbox::linux::enter_and_exec(&sandbox.entry, &argv, env);
                    eprintln!("egg: launching agent failed: {err:#}");
                }
                #[cfg(not(target_os = "linux"))]
                {
                    let err = exec_with_env(&argv, env);
                    eprintln!("egg: launching agent failed: {err:#}");
                }
                // SAFETY: _exit is async-signal-safe.
                unsafe { libc::_exit(127) }
            }
            ForkptyResult::Parent { child, master } => {
                // O_NONBLOCK on the master so AsyncFd readiness drives all
                // I/O; a blocking read here would wedge the whole runtime.
                let flags = fcntl(&master, FcntlArg::F_GETFL)
                    .context("reading PTY master flags")?;
                let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
                fcntl(&master, FcntlArg::F_SETFL(flags))
                    .context("setting PTY master non-blocking")?;

                let master =
                    AsyncFd::new(PtyFd(master)).context("registering PTY master with reactor")?;
                Ok(Self {
                    master,
                    child_pid: child,
                    cols: AtomicU16::new(cols),
                    rows: AtomicU16::new(rows),
                })
            }
        }
    }

    /// Read one chunk from the PTY. `Ok(0)` or `EIO` means the child side is
    /// gone.
    ///
    /// The readiness-then-`try_io` retry here (and in [`Self::write_all`])
    /// is the canonical `AsyncFd` shape: readiness can be spurious, and a
    /// `WouldBlock` result clears it so the next await parks properly.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;
            let attempt = guard.try_io(|fd| {
                nix::unistd::read(fd, buf).map_err(std::io::Error::from)
            });
            if let Ok(read) = attempt {
                return read;
            }
        }
    }

    /// Write the full buffer to the PTY.
    pub async fn write_all(&self, data: &[u8]) -> std::io::Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut guard = self.master.writable().await?;
            let attempt = guard.try_io(|fd| {
                nix::unistd::write(fd.get_ref(), remaining).map_err(std::io::Error::from)
            });
            if let Ok(wrote) = attempt {
                remaining = &remaining[wrote?..];
            }
        }
        Ok(())
    }

    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        self.cols.store(cols, Ordering::Relaxed);
        self.rows.store(rows, Ordering::Relaxed);

        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };
        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd; the Winsize struct is fully
        // initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn size(&self) -> (u16, u16) {
        (self.cols.load(Ordering::Relaxed), self.rows.load(Ordering::Relaxed))
    }

    pub fn pid(&self) -> u32 {
        self.child_pid.as_raw() as u32
    }

    /// Deliver a signal to the child's process group (the PTY child is the
    /// session leader; with PID-namespace intermediaries the group reaches
    /// the agent where a single-pid kill would not).
    pub fn signal(&self, sig: Signal) {
        if killpg(self.child_pid, sig).is_err() {
            let _ = kill(self.child_pid, sig);
        }
    }

    /// Reap the child on a blocking thread and return how it ended.
    pub async fn wait(&self) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .context("join wait thread")?
    }
}

impl Drop for NativePty {
    fn drop(&mut self) {
        // Best-effort shutdown if the session loop did not reap: SIGHUP,
        // brief grace, SIGKILL.
        let _ = kill(self.child_pid, Signal::SIGHUP);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = kill(self.child_pid, Signal::SIGKILL);
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

#[cfg(not(target_os = "linux"))]
fn exec_with_env(argv: &[String], env: &[(String, String)]) -> anyhow::Error {
    use std::ffi::CString;

    let c_args: Result<Vec<CString>, _> = argv.iter().map(|s| CString::new(s.as_bytes())).collect();
    let c_env: Result<Vec<CString>, _> =
        env.iter().map(|(k, v)| CString::new(format!("{k}={v}"))).collect();
    match (c_args, c_env) {
        (Ok(args), Ok(env)) if !args.is_empty() => {
            match nix::unistd::execvpe(&args[0], &args, &env) {
                Ok(infallible) => match infallible {},
                Err(e) => anyhow::anyhow!("execvpe failed: {e}"),
            }
        }
        _ => anyhow::anyhow!("invalid argv or environment"),
    }
}

/// Block until the child exits and convert to [`ExitStatus`].
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus { code: Some(code), signal: None });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}
