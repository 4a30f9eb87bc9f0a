// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level session runner: policy to sandboxed child to reaped exit code.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::audit::{AuditRecorder, InputAuditor};
use super::{watchdog, Session, SessionDir, SESSIONS_DIR};
use crate::config::Config;
use crate::policy::resolve::{default_policy, needs_domain_proxy, resolve_file};
use crate::policy::{home_dir, Policy};
use crate::profile::{self, AgentProfile};
use crate::proxy::DomainProxy;
use crate::pty::NativePty;
use crate::replay::ReplayBuffer;
use crate::rpc;
use crate::sandbox::{Sandbox, SandboxOptions};
use crate::vt::{self, VtEmu, VtMsg};

/// Grace given to attached clients to drain bytes and receive the exit
/// code before the RPC endpoint goes away.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// SIGTERM to SIGKILL escalation on shutdown.
const KILL_ESCALATION: Duration = Duration::from_secs(3);

/// PTY read chunk size.
const READ_CHUNK: usize = 4096;

/// Initialize tracing/logging from config.
///
/// Uses `try_init` so it's safe to call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};

    // Priority: --debug > --log-level / EGG_LOG_LEVEL > RUST_LOG > "info".
    let filter = if config.debug {
        EnvFilter::new("debug")
    } else if std::env::var("EGG_LOG_LEVEL").is_err() && config.log_level == "info" {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    } else {
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run one session to completion; returns the supervisor's exit code.
pub async fn run(config: Config) -> anyhow::Result<i32> {
    let shutdown = CancellationToken::new();

    // 1. Resolve the effective policy.
    let mut policy = match config.policy {
        Some(ref path) => resolve_file(path)?,
        None => default_policy(),
    };
    if config.audit {
        policy.audit = true;
    }

    // 2. Agent profile, command, binary resolution.
    let profile = profile::lookup(&config.agent).with_context(|| {
        format!(
            "unknown agent {:?} (known agents: {})",
            config.agent,
            profile::known_agents().join(", ")
        )
    })?;
    let mut command: Vec<String> = if config.command.is_empty() {
        vec![profile.command.to_owned()]
    } else {
        config.command.clone()
    };
    if policy.dangerously_skip_permissions {
        if let Some(flag) = profile.skip_permissions_flag {
            command.push(flag.to_owned());
        }
    }
    command[0] = resolve_binary(&command[0])?;

    // 3. Session identity and on-disk layout.
    let home = config.home.clone().unwrap_or_else(home_dir);
    let cwd = match config.cwd {
        Some(ref dir) => dir.clone(),
        None => std::env::current_dir().context("resolving working directory")?,
    };
    let session_id = uuid::Uuid::new_v4().to_string();
    let dir = SessionDir::create(&home.join(SESSIONS_DIR), &session_id)?;
    dir.write_pid()?;
    let token = dir.write_token()?;
    info!(session_id = %session_id, agent = %config.agent, "session starting");

    // 4. Snapshot agent settings so exit can restore them.
    let settings_snapshot = policy
        .agent_settings
        .get(&config.agent)
        .map(|path| crate::policy::expand_tilde(&path.display().to_string(), &home))
        .map(|path| (path.clone(), std::fs::read(&path).ok()));

    // 5. Domain proxy, when the allowlist is real.
    let proxy = if needs_domain_proxy(&policy.network) {
        let proxy = DomainProxy::start(&policy.network, shutdown.clone()).await?;
        info!(port = proxy.port(), "domain proxy listening");
        Some(proxy)
    } else {
        None
    };

    // 6. Child environment and browser shims.
    write_browser_shims(&dir)?;
    let env = build_child_env(&policy, profile, &dir, &home, proxy.as_ref());

    // 7. Sandbox construction.
    let overlay_prefixes: Vec<String> =
        profile.overlay_prefixes.iter().map(|p| (*p).to_owned()).collect();
    let sandbox = Sandbox::prepare(&SandboxOptions {
        policy: &policy,
        command: &command,
        session_dir: dir.path(),
        overlay_prefixes: &overlay_prefixes,
        home: home.clone(),
        cwd: cwd.clone(),
        proxy_port: proxy.as_ref().map(DomainProxy::port),
    })?;

    // 8. PTY spawn, then resource hooks on the visible pid.
    let pty = Arc::new(NativePty::spawn(&sandbox, &env, &cwd, config.cols, config.rows)?);
    let pid = pty.pid();
    info!(pid, "agent spawned");

    #[cfg(target_os = "linux")]
    let cgroup = {
        if let Err(e) = crate::sandbox::linux::apply_rlimits(pid, &policy.resources) {
            warn!("rlimit application failed: {e:#}");
        }
        let cgroup = crate::sandbox::cgroup::CgroupScope::create(&session_id, &policy.resources);
        cgroup.add_process(pid);
        cgroup
    };

    // 9. Session state: replay buffer, VT emulator, audit artifacts.
    let replay = Arc::new(ReplayBuffer::new(profile.replay_preamble.to_vec()));
    let (vt, vt_tx) = if config.vt {
        let vt = Arc::new(Mutex::new(VtEmu::new(config.cols, config.rows)));
        let (tx, rx) = mpsc::channel(256);
        vt::spawn(Arc::clone(&vt), rx);
        (Some(vt), Some(tx))
    } else {
        (None, None)
    };
    let recorder = Arc::new(std::sync::Mutex::new(if policy.audit {
        Some(AuditRecorder::create(&dir.audit_pty_path(), config.cols, config.rows)?)
    } else {
        None
    }));
    let auditor = Arc::new(std::sync::Mutex::new(InputAuditor::create(&dir.audit_log_path())));

    dir.write_meta(
        &config.agent,
        &cwd,
        &Session::network_summary(&policy.network),
        config.cols,
        config.rows,
    )?;

    // 10. Session entity shared with the RPC layer.
    let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(256);
    let (exit_tx, exit_rx) = watch::channel(None);
    let output_bytes = Arc::new(AtomicU64::new(0));
    let session = Arc::new(Session {
        id: session_id.clone(),
        agent: config.agent.clone(),
        cwd: cwd.clone(),
        rendered_policy: policy.render(),
        network_summary: Session::network_summary(&policy.network),
        started_at: Instant::now(),
        child_pid: AtomicU32::new(pid),
        last_input_ms: AtomicU64::new(0),
        last_output_ms: AtomicU64::new(0),
        output_bytes: Arc::clone(&output_bytes),
        replay: Arc::clone(&replay),
        vt,
        vt_tx: vt_tx.clone(),
        pty: Arc::clone(&pty),
        input_tx,
        auditor: Arc::clone(&auditor),
        recorder: Arc::clone(&recorder),
        exit_rx,
        dir: dir.clone(),
        shutdown: shutdown.clone(),
    });

    // 11. Watchdog, RPC endpoint, signal handling.
    watchdog::spawn(
        pid,
        dir.path().to_path_buf(),
        Arc::clone(&output_bytes),
        watchdog::DEFAULT_STAGES.to_vec(),
        shutdown.clone(),
    );
    rpc::spawn_server(Arc::clone(&session), token, shutdown.clone())
        .await
        .context("starting RPC endpoint")?;
    spawn_signal_handler(shutdown.clone());

    // 12. I/O loop: PTY output into replay/VT/audit, client input out.
    let mut buf = vec![0u8; READ_CHUNK];
    let mut idle_tick = tokio::time::interval(Duration::from_millis(500));
    idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut killer_armed = false;

    // Errors break out with a status so teardown below runs on every path.
    let status: anyhow::Result<crate::pty::ExitStatus> = loop {
        tokio::select! {
            read = pty.read_chunk(&mut buf) => {
                match read {
                    Ok(0) => break pty.wait().await,
                    Ok(n) => {
                        let chunk = &buf[..n];
                        replay.write(chunk).await;
                        if let Some(ref tx) = vt_tx {
                            // Dropped on a full channel; replay stays the
                            // source of truth.
                            let _ = tx.try_send(VtMsg::Output(Bytes::copy_from_slice(chunk)));
                        }
                        record_output(&recorder, chunk);
                        output_bytes.fetch_add(n as u64, Ordering::Release);
                        session.last_output_ms.store(Session::now_ms(), Ordering::Relaxed);
                    }
                    Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => {
                        break pty.wait().await;
                    }
                    Err(e) => break Err(e).context("PTY read"),
                }
            }
            input = input_rx.recv() => {
                if let Some(data) = input {
                    if let Ok(mut a) = auditor.lock() {
                        a.feed(&data);
                    }
                    if let Err(e) = pty.write_all(&data).await {
                        break Err(e).context("PTY write");
                    }
                    session.last_input_ms.store(Session::now_ms(), Ordering::Relaxed);
                }
            }
            _ = idle_tick.tick() => {
                if let Ok(mut a) = auditor.lock() {
                    a.flush_idle();
                }
            }
            _ = shutdown.cancelled(), if !killer_armed => {
                killer_armed = true;
                spawn_killer(Arc::clone(&pty));
                // Keep draining until the PTY reports EOF.
            }
        }
    };

    // 13. Exit sequence. Clients get the 128+signo convention; the
    // supervisor's own exit code is the child's only for a normal exit.
    let (reported, code) = match status {
        Ok(ref s) => (s.report_code(), s.code.unwrap_or(1)),
        Err(_) => (1, 1),
    };
    info!(code = reported, "agent exited");
    replay.close().await;
    let _ = exit_tx.send(Some(reported));

    if let Ok(mut slot) = recorder.lock() {
        if let Some(rec) = slot.take() {
            if let Err(e) = rec.finish() {
                warn!("closing audit stream failed: {e:#}");
            }
        }
    }
    if let Some((path, Some(bytes))) = settings_snapshot {
        if let Err(e) = std::fs::write(&path, bytes) {
            warn!("restoring agent settings {} failed: {e}", path.display());
        }
    }

    // Let attached clients flush and receive the exit code.
    tokio::time::sleep(EXIT_GRACE).await;
    shutdown.cancel();

    sandbox.destroy();
    #[cfg(target_os = "linux")]
    cgroup.destroy();

    let _ = std::fs::remove_file(dir.socket_path());
    let _ = std::fs::remove_file(dir.token_path());
    dir.cleanup(policy.audit);

    status?;
    Ok(code)
}

/// TERM, wait, then KILL the whole process group.
fn spawn_killer(pty: Arc<NativePty>) {
    tokio::spawn(async move {
        pty.signal(nix::sys::signal::Signal::SIGTERM);
        tokio::time::sleep(KILL_ESCALATION).await;
        pty.signal(nix::sys::signal::Signal::SIGKILL);
    });
}

fn record_output(recorder: &std::sync::Mutex<Option<AuditRecorder>>, chunk: &[u8]) {
    if let Ok(mut slot) = recorder.lock() {
        if let Some(ref mut rec) = *slot {
            if let Err(e) = rec.record_output(chunk) {
                error!("audit frame write failed: {e:#}");
            }
        }
    }
}

/// First SIGTERM/SIGINT: graceful shutdown. Second: force exit.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGTERM again, forcing exit");
            }
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => {
                info!("received SIGINT again, forcing exit");
            }
        }
        std::process::exit(130);
    });
}

/// Resolve the agent binary via PATH and canonicalize symlinks.
fn resolve_binary(name: &str) -> anyhow::Result<String> {
    let candidate = if name.contains('/') {
        PathBuf::from(name)
    } else {
        let path_var = std::env::var("PATH").unwrap_or_default();
        let found = path_var
            .split(':')
            .map(|dir| Path::new(dir).join(name))
            .find(|p| is_executable(p));
        match found {
            Some(p) => p,
            None => bail!("agent binary {name:?} not found on PATH"),
        }
    };
    let canonical = std::fs::canonicalize(&candidate)
        .with_context(|| format!("resolving agent binary {}", candidate.display()))?;
    Ok(canonical.display().to_string())
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata().map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

/// Assemble the child environment: the policy's allowlist filter, the
/// profile's required variables, the browser-interception shims, proxy
/// injection, and the SSH agent strip when `~/.ssh` is denied.
fn build_child_env(
    policy: &Policy,
    profile: &AgentProfile,
    dir: &SessionDir,
    home: &Path,
    proxy: Option<&DomainProxy>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = if policy.env_unrestricted() {
        std::env::vars().collect()
    } else {
        policy
            .env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect()
    };

    let mut set = |key: &str, value: String, env: &mut Vec<(String, String)>| {
        match env.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => env.push((key.to_owned(), value)),
        }
    };

    for (key, value) in profile.required_env {
        set(key, (*value).to_owned(), &mut env);
    }
    if !env.iter().any(|(k, _)| k == "TERM") {
        set("TERM", "xterm-256color".to_owned(), &mut env);
    }
    set("HOME", home.display().to_string(), &mut env);

    // Browser interception: any open/xdg-open lands in the session file
    // instead of a host browser.
    let shims = dir.shims_dir();
    set("BROWSER", shims.join("browser").display().to_string(), &mut env);
    set("EGG_SESSION_DIR", dir.path().display().to_string(), &mut env);
    let base_path = env
        .iter()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.clone())
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_else(|| "/usr/bin:/bin".to_owned());
    set("PATH", format!("{}:{base_path}", shims.display()), &mut env);

    if let Some(proxy) = proxy {
        set("HTTPS_PROXY", proxy.url(), &mut env);
        set("HTTP_PROXY", proxy.url(), &mut env);
        set("NODE_USE_ENV_PROXY", "1".to_owned(), &mut env);
    }

    // A forwarded SSH agent would sidestep the ~/.ssh deny.
    if policy.denies(home, &home.join(".ssh")) {
        env.retain(|(k, _)| k != "SSH_AUTH_SOCK");
    }

    env
}

/// Write the browser-interception scripts into `shims/`.
fn write_browser_shims(dir: &SessionDir) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let script = format!(
        "#!/bin/sh\nprintf '%s\\n' \"$@\" >> \"${{EGG_SESSION_DIR}}/{}\"\n",
        super::BROWSER_REQUESTS_FILE
    );
    for name in ["browser", "open", "xdg-open"] {
        let path = dir.shims_dir().join(name);
        std::fs::write(&path, &script)
            .with_context(|| format!("writing shim {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .context("marking shim executable")?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "run_tests.rs"]
mod tests;
