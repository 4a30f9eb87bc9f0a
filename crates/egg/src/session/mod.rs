// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session entity and on-disk layout.
//!
//! Each session owns a directory named by its id holding the RPC socket and
//! token, pid and metadata files, the audit artifacts, the browser shims,
//! and the wrapper log. Non-audit sessions delete the directory at exit;
//! audit sessions retain the audit artifacts and metadata.

pub mod audit;
pub mod run;
pub mod watchdog;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::pty::NativePty;
use crate::replay::ReplayBuffer;
use crate::vt::{VtEmu, VtMsg};

/// Root for session directories, under `$HOME`.
pub const SESSIONS_DIR: &str = ".wingthing/sessions";

/// Filenames inside a session directory.
pub const SOCKET_FILE: &str = "egg.sock";
pub const TOKEN_FILE: &str = "egg.token";
pub const PID_FILE: &str = "egg.pid";
pub const META_FILE: &str = "egg.meta";
pub const AUDIT_PTY_FILE: &str = "audit.pty.gz";
pub const AUDIT_LOG_FILE: &str = "audit.log";
pub const BROWSER_REQUESTS_FILE: &str = "browser-requests";
pub const WRAPPER_LOG_FILE: &str = "deny_init.log";
pub const SHIMS_DIR: &str = "shims";

/// Artifacts an audit session keeps after exit.
const AUDIT_KEEPERS: &[&str] = &[META_FILE, PID_FILE, AUDIT_PTY_FILE, AUDIT_LOG_FILE];

/// The per-session directory.
#[derive(Debug, Clone)]
pub struct SessionDir {
    root: PathBuf,
}

impl SessionDir {
    /// Create `<base>/<session-id>` with its shims subdirectory.
    pub fn create(base: &Path, session_id: &str) -> anyhow::Result<Self> {
        let root = base.join(session_id);
        std::fs::create_dir_all(root.join(SHIMS_DIR))
            .with_context(|| format!("creating session dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join(SOCKET_FILE)
    }

    pub fn token_path(&self) -> PathBuf {
        self.root.join(TOKEN_FILE)
    }

    pub fn audit_pty_path(&self) -> PathBuf {
        self.root.join(AUDIT_PTY_FILE)
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join(AUDIT_LOG_FILE)
    }

    pub fn shims_dir(&self) -> PathBuf {
        self.root.join(SHIMS_DIR)
    }

    pub fn browser_requests_path(&self) -> PathBuf {
        self.root.join(BROWSER_REQUESTS_FILE)
    }

    /// Write the supervisor's pid file.
    pub fn write_pid(&self) -> anyhow::Result<()> {
        std::fs::write(self.root.join(PID_FILE), std::process::id().to_string())
            .context("writing egg.pid")
    }

    /// Generate and persist the RPC token: 32 random bytes, hex-encoded,
    /// file mode 0600.
    pub fn write_token(&self) -> anyhow::Result<String> {
        use rand::RngCore;

        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        let token: String = secret.iter().map(|b| format!("{b:02x}")).collect();

        let path = self.token_path();
        std::fs::write(&path, &token).context("writing egg.token")?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .context("restricting egg.token permissions")?;
        Ok(token)
    }

    /// Rewrite `egg.meta` (called at start and on every resize).
    pub fn write_meta(
        &self,
        agent: &str,
        cwd: &Path,
        network_summary: &str,
        cols: u16,
        rows: u16,
    ) -> anyhow::Result<()> {
        let body = format!(
            "agent={agent}\ncwd={}\nnetwork={network_summary}\ncols={cols}\nrows={rows}\n",
            cwd.display()
        );
        std::fs::write(self.root.join(META_FILE), body).context("writing egg.meta")
    }

    /// Remove the session directory, or just its transient pieces when the
    /// session was audited.
    pub fn cleanup(&self, retain_audit: bool) {
        if !retain_audit {
            let _ = std::fs::remove_dir_all(&self.root);
            return;
        }
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if AUDIT_KEEPERS.iter().any(|k| name.to_string_lossy() == *k) {
                continue;
            }
            let path = entry.path();
            if path.is_dir() {
                let _ = std::fs::remove_dir_all(&path);
            } else {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

/// Everything the RPC layer needs to serve one live session.
pub struct Session {
    pub id: String,
    pub agent: String,
    pub cwd: PathBuf,
    /// Effective policy rendered back to YAML for `Status`.
    pub rendered_policy: String,
    /// One-line network summary reused whenever `egg.meta` is rewritten.
    pub network_summary: String,
    pub started_at: Instant,
    pub child_pid: AtomicU32,
    pub last_input_ms: AtomicU64,
    pub last_output_ms: AtomicU64,
    /// Total PTY output bytes; shared with the watchdog.
    pub output_bytes: Arc<AtomicU64>,
    pub replay: Arc<ReplayBuffer>,
    pub vt: Option<Arc<Mutex<VtEmu>>>,
    pub vt_tx: Option<mpsc::Sender<VtMsg>>,
    pub pty: Arc<NativePty>,
    /// Client input on its way to the PTY (already audited by the RPC side).
    pub input_tx: mpsc::Sender<Bytes>,
    pub auditor: Arc<std::sync::Mutex<audit::InputAuditor>>,
    /// `None` inside when the session is not audited; taken (and finished)
    /// at exit.
    pub recorder: Arc<std::sync::Mutex<Option<audit::AuditRecorder>>>,
    /// Fires once with the child's report code.
    pub exit_rx: watch::Receiver<Option<i32>>,
    pub dir: SessionDir,
    pub shutdown: CancellationToken,
}

impl Session {
    /// Milliseconds since the Unix epoch, for activity stamps.
    pub fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// One-line network summary for `egg.meta`.
    pub fn network_summary(network: &[String]) -> String {
        if network.is_empty() {
            "denied".to_owned()
        } else if network.iter().any(|d| d == "*") {
            "unrestricted".to_owned()
        } else {
            network.join(",")
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
