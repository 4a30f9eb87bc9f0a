// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session RPC endpoint: the `egg.v1.Egg` service on the per-session Unix
//! socket.
//!
//! Every request authenticates with the bearer token from `egg.token`.
//! Handler panics are caught, logged, and returned as internal errors; the
//! supervisor never dies to an RPC bug.

mod service;

use std::os::unix::fs::PermissionsExt;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use futures_util::FutureExt;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Status};
use tracing::{error, info};

use crate::session::Session;

/// Generated protobuf types for the `egg.v1` package.
pub mod proto {
    tonic::include_proto!("egg.v1");
}

type GrpcStream<T> = Pin<Box<dyn tokio_stream::Stream<Item = Result<T, Status>> + Send + 'static>>;

/// gRPC implementation of `egg.v1.Egg`, serving one session.
pub struct EggGrpc {
    session: Arc<Session>,
}

impl EggGrpc {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }
}

/// Bind the session socket (mode 0600) and serve until shutdown.
pub async fn spawn_server(
    session: Arc<Session>,
    token: String,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let path = session.dir.socket_path();
    let _ = std::fs::remove_file(&path);
    let listener = tokio::net::UnixListener::bind(&path)
        .with_context(|| format!("binding RPC socket {}", path.display()))?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        .context("restricting RPC socket permissions")?;
    info!("RPC listening on {}", path.display());

    let service = proto::egg_server::EggServer::with_interceptor(
        EggGrpc::new(session),
        TokenInterceptor { token },
    );
    tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                shutdown.cancelled().await;
            })
            .await;
        if let Err(e) = result {
            error!("RPC server error: {e}");
        }
    });
    Ok(())
}

/// Interceptor enforcing the session token on every RPC.
#[derive(Clone)]
pub struct TokenInterceptor {
    token: String,
}

impl TokenInterceptor {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

impl tonic::service::Interceptor for TokenInterceptor {
    fn call(&mut self, req: Request<()>) -> Result<Request<()>, Status> {
        let header = req
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("missing authorization header"))?;

        let bearer = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Status::unauthenticated("invalid authorization scheme"))?;

        if token_matches(bearer, &self.token) {
            Ok(req)
        } else {
            Err(Status::unauthenticated("invalid token"))
        }
    }
}

/// Timing-uniform token check.
///
/// Length and byte mismatches fold into one accumulator and the whole
/// candidate is always walked, so rejection time does not leak how much of
/// the token a caller got right.
pub fn token_matches(candidate: &str, expected: &str) -> bool {
    let candidate = candidate.as_bytes();
    let expected = expected.as_bytes();
    let mut mismatch = u32::from(candidate.len() != expected.len());
    for (i, &byte) in candidate.iter().enumerate() {
        // Out-of-range positions compare a byte against itself: no-op on
        // the accumulator, same work per iteration.
        let reference = expected.get(i).copied().unwrap_or(byte);
        mismatch |= u32::from(byte ^ reference);
    }
    mismatch == 0
}

/// Run a handler future, converting panics into logged internal errors.
async fn catch_panics<T>(
    fut: impl std::future::Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_owned());
            error!(backtrace = %std::backtrace::Backtrace::force_capture(), "RPC handler panicked: {msg}");
            Err(Status::internal("internal error"))
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
