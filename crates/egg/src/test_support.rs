// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for unit and integration tests.
//!
//! Builds a live [`Session`] around a real PTY running `/bin/cat` (no
//! sandbox namespaces, so tests run unprivileged) and serves the gRPC
//! service over loopback TCP so tests can drive it with a plain tonic
//! client. Production uses the Unix socket; the service logic is identical.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::pty::NativePty;
use crate::replay::ReplayBuffer;
use crate::rpc::{proto, EggGrpc, TokenInterceptor};
use crate::sandbox::{NamespaceEntry, Sandbox};
use crate::session::audit::InputAuditor;
use crate::session::{Session, SessionDir};
use crate::vt::VtEmu;

/// A built test session plus the handles a test needs to drive it.
pub struct SessionCtx {
    pub session: Arc<Session>,
    /// Receiver side of the client-input channel (the session loop's end).
    pub input_rx: mpsc::Receiver<Bytes>,
    /// Publish the child's exit code.
    pub exit_tx: watch::Sender<Option<i32>>,
    /// Owns the on-disk session directory.
    pub tmp: tempfile::TempDir,
}

/// Builder for test sessions.
pub struct SessionBuilder {
    session_id: String,
    vt: bool,
    replay_limits: Option<(usize, usize)>,
    preamble: Vec<u8>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            session_id: "test-session".to_owned(),
            vt: false,
            replay_limits: None,
            preamble: Vec::new(),
        }
    }

    pub fn session_id(mut self, id: &str) -> Self {
        self.session_id = id.to_owned();
        self
    }

    pub fn vt(mut self) -> Self {
        self.vt = true;
        self
    }

    pub fn replay_limits(mut self, capacity: usize, window: usize) -> Self {
        self.replay_limits = Some((capacity, window));
        self
    }

    pub fn preamble(mut self, preamble: &[u8]) -> Self {
        self.preamble = preamble.to_vec();
        self
    }

    /// Spawn `/bin/cat` on a PTY and assemble the session around it.
    pub fn build(self) -> anyhow::Result<SessionCtx> {
        let tmp = tempfile::tempdir()?;
        let dir = SessionDir::create(tmp.path(), &self.session_id)?;

        let sandbox =
            Sandbox::new("/bin/cat".to_owned(), Vec::new(), NamespaceEntry::default());
        let env = [("TERM".to_owned(), "dumb".to_owned())];
        let pty = Arc::new(NativePty::spawn(&sandbox, &env, Path::new("/"), 80, 24)?);
        let pid = pty.pid();

        let replay = Arc::new(match self.replay_limits {
            Some((capacity, window)) => {
                ReplayBuffer::with_limits(self.preamble, capacity, window)
            }
            None => ReplayBuffer::new(self.preamble),
        });
        let (vt, vt_tx) = if self.vt {
            let vt = Arc::new(Mutex::new(VtEmu::new(80, 24)));
            let (tx, rx) = mpsc::channel(64);
            crate::vt::spawn(Arc::clone(&vt), rx);
            (Some(vt), Some(tx))
        } else {
            (None, None)
        };

        let (input_tx, input_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = watch::channel(None);

        let session = Arc::new(Session {
            id: self.session_id,
            agent: "claude".to_owned(),
            cwd: Path::new("/").to_path_buf(),
            rendered_policy: "fs:\n- ro:/\n".to_owned(),
            network_summary: "denied".to_owned(),
            started_at: Instant::now(),
            child_pid: AtomicU32::new(pid),
            last_input_ms: AtomicU64::new(0),
            last_output_ms: AtomicU64::new(0),
            output_bytes: Arc::new(AtomicU64::new(0)),
            replay,
            vt,
            vt_tx,
            pty,
            input_tx,
            auditor: Arc::new(std::sync::Mutex::new(InputAuditor::create(
                &dir.audit_log_path(),
            ))),
            recorder: Arc::new(std::sync::Mutex::new(None)),
            exit_rx,
            dir,
            shutdown: CancellationToken::new(),
        });

        Ok(SessionCtx { session, input_rx, exit_tx, tmp })
    }
}

/// Serve the gRPC service on an ephemeral loopback port.
pub async fn spawn_grpc_server(
    session: Arc<Session>,
    token: &str,
) -> anyhow::Result<(SocketAddr, CancellationToken)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();

    let service = proto::egg_server::EggServer::with_interceptor(
        EggGrpc::new(session),
        TokenInterceptor::new(token.to_owned()),
    );
    let sd = shutdown.clone();
    tokio::spawn(async move {
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        let _ = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(incoming, sd.cancelled_owned())
            .await;
    });

    Ok((addr, shutdown))
}

/// Client carrying a bearer token on every request.
pub type AuthedClient = proto::egg_client::EggClient<
    tonic::service::interceptor::InterceptedService<
        tonic::transport::Channel,
        BearerInterceptor,
    >,
>;

#[derive(Clone)]
pub struct BearerInterceptor {
    header: tonic::metadata::MetadataValue<tonic::metadata::Ascii>,
}

impl tonic::service::Interceptor for BearerInterceptor {
    fn call(
        &mut self,
        mut req: tonic::Request<()>,
    ) -> Result<tonic::Request<()>, tonic::Status> {
        req.metadata_mut().insert("authorization", self.header.clone());
        Ok(req)
    }
}

/// Connect an authenticated client to a test server.
pub async fn grpc_client(addr: SocketAddr, token: &str) -> anyhow::Result<AuthedClient> {
    let channel = tonic::transport::Channel::from_shared(format!("http://{addr}"))
        .context("endpoint")?
        .connect()
        .await
        .context("grpc connect")?;
    let header = format!("Bearer {token}")
        .parse()
        .map_err(|e| anyhow::anyhow!("building auth header: {e}"))?;
    Ok(proto::egg_client::EggClient::with_interceptor(channel, BearerInterceptor { header }))
}
