// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn diagnose_reports_liveness_for_self() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let report = diagnose(std::process::id(), dir.path(), 0);
    assert!(report.contains("alive"));
    // lsof is reserved for the second stage.
    assert!(!report.contains("lsof:"));
    Ok(())
}

#[test]
fn diagnose_reports_dead_pid() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // PID far beyond pid_max defaults; kill(sig 0) fails with ESRCH.
    let report = diagnose(3_999_999, dir.path(), 0);
    assert!(report.contains("gone"));
    Ok(())
}

#[test]
fn second_stage_includes_lsof_section() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let report = diagnose(std::process::id(), dir.path(), 1);
    assert!(report.contains("lsof:"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn output_progress_disarms_the_watchdog() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let counter = Arc::new(AtomicU64::new(0));
    let shutdown = CancellationToken::new();
    let handle = spawn(
        std::process::id(),
        dir.path().to_path_buf(),
        Arc::clone(&counter),
        vec![Duration::from_secs(15), Duration::from_secs(30)],
        shutdown.clone(),
    );

    // Output arrives before the first stage.
    counter.store(4096, Ordering::Release);
    tokio::time::advance(Duration::from_secs(31)).await;
    handle.await?;
    shutdown.cancel();
    Ok(())
}

#[tokio::test]
async fn shutdown_cancels_pending_stages() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let shutdown = CancellationToken::new();
    let handle = spawn(
        std::process::id(),
        dir.path().to_path_buf(),
        Arc::new(AtomicU64::new(0)),
        vec![Duration::from_secs(600)],
        shutdown.clone(),
    );
    shutdown.cancel();
    handle.await?;
    Ok(())
}
