// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! First-output watchdog.
//!
//! A freshly sandboxed agent that produces no PTY bytes is the classic
//! symptom of a misconfigured sandbox (binary outside the readable tree,
//! denied config read, dead proxy). The watchdog fires staged diagnostics
//! while the session keeps running; silence is suspicious, not fatal.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default diagnostic stages after spawn.
pub const DEFAULT_STAGES: [Duration; 2] = [Duration::from_secs(15), Duration::from_secs(30)];

/// Spawn the watchdog task.
///
/// `output_bytes` is the session's total-output counter; any progress on it
/// disarms all remaining stages. Later stages add heavier diagnostics
/// (`lsof`).
pub fn spawn(
    pid: u32,
    session_dir: PathBuf,
    output_bytes: Arc<AtomicU64>,
    stages: Vec<Duration>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now();
        for (stage, deadline) in stages.into_iter().enumerate() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(start + deadline) => {}
            }
            if output_bytes.load(Ordering::Acquire) > 0 {
                return;
            }
            let report = diagnose(pid, &session_dir, stage);
            warn!(pid, stage, "agent produced no output after {deadline:?}\n{report}");
        }
    })
}

/// Collect a diagnostic report for a silent child.
fn diagnose(pid: u32, session_dir: &std::path::Path, stage: usize) -> String {
    let mut report = String::new();

    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
    report.push_str(&format!("liveness: pid {pid} {}\n", if alive { "alive" } else { "gone" }));

    report.push_str("process tree:\n");
    report.push_str(&run_tool("ps", &["-o", "pid,ppid,stat,args", "-p", &pid.to_string()]));
    report.push_str(&run_tool("pgrep", &["-a", "-P", &pid.to_string()]));

    let denials = sandbox_denials(session_dir);
    if !denials.is_empty() {
        report.push_str("sandbox log tail:\n");
        report.push_str(&denials);
        report.push('\n');
    }

    // Open file descriptors are expensive to collect; second stage only.
    if stage > 0 {
        report.push_str("lsof:\n");
        report.push_str(&run_tool("lsof", &["-p", &pid.to_string()]));
    }

    report
}

fn run_tool(tool: &str, args: &[&str]) -> String {
    match Command::new(tool).args(args).output() {
        Ok(out) => {
            let mut text = String::from_utf8_lossy(&out.stdout).into_owned();
            if text.len() > 4096 {
                text.truncate(4096);
                text.push_str("…\n");
            }
            text
        }
        Err(e) => format!("{tool} unavailable: {e}\n"),
    }
}

#[cfg(target_os = "linux")]
fn sandbox_denials(session_dir: &std::path::Path) -> String {
    crate::sandbox::linux::denial_log_hint(session_dir)
}

#[cfg(target_os = "macos")]
fn sandbox_denials(_session_dir: &std::path::Path) -> String {
    run_tool(
        "log",
        &["show", "--style", "syslog", "--last", "30s", "--predicate", "sender == \"Sandbox\""],
    )
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn sandbox_denials(_session_dir: &std::path::Path) -> String {
    String::new()
}

#[cfg(test)]
#[path = "watchdog_tests.rs"]
mod tests;
