// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `Egg` trait implementation — all RPC handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::debug;

use super::{catch_panics, proto, EggGrpc, GrpcStream};
use crate::replay::Drained;
use crate::session::Session;
use crate::vt;

/// How long the writer waits for the exit code after the byte stream ends.
const EXIT_CODE_WAIT: Duration = Duration::from_secs(5);

impl EggGrpc {
    fn check_session(&self, session_id: &str) -> Result<(), Status> {
        if session_id == self.session.id {
            Ok(())
        } else {
            Err(Status::not_found(format!("unknown session {session_id}")))
        }
    }
}

#[tonic::async_trait]
impl proto::egg_server::Egg for EggGrpc {
    async fn kill(
        &self,
        request: Request<proto::KillRequest>,
    ) -> Result<Response<proto::KillResponse>, Status> {
        catch_panics(async {
            let req = request.into_inner();
            self.check_session(&req.session_id)?;
            self.session.pty.signal(nix::sys::signal::Signal::SIGTERM);
            Ok(Response::new(proto::KillResponse {}))
        })
        .await
    }

    async fn resize(
        &self,
        request: Request<proto::ResizeRequest>,
    ) -> Result<Response<proto::ResizeResponse>, Status> {
        catch_panics(async {
            let req = request.into_inner();
            self.check_session(&req.session_id)?;
            let cols: u16 = req
                .cols
                .try_into()
                .map_err(|_| Status::invalid_argument("cols must be a positive u16"))?;
            let rows: u16 = req
                .rows
                .try_into()
                .map_err(|_| Status::invalid_argument("rows must be a positive u16"))?;
            if cols == 0 || rows == 0 {
                return Err(Status::invalid_argument("cols and rows must be positive"));
            }
            apply_resize(&self.session, cols, rows)
                .map_err(|e| Status::internal(format!("{e:#}")))?;
            Ok(Response::new(proto::ResizeResponse {}))
        })
        .await
    }

    async fn status(
        &self,
        request: Request<proto::StatusRequest>,
    ) -> Result<Response<proto::StatusResponse>, Status> {
        catch_panics(async {
            let req = request.into_inner();
            self.check_session(&req.session_id)?;
            let stats = self.session.replay.stats().await;
            Ok(Response::new(proto::StatusResponse {
                agent: self.session.agent.clone(),
                buffer_bytes: stats.buffer_bytes,
                total_written: stats.total_written,
                total_trimmed: stats.total_trimmed,
                readers: stats.readers,
                uptime_seconds: self.session.started_at.elapsed().as_secs(),
                rendered_config: self.session.rendered_policy.clone(),
            }))
        })
        .await
    }

    type SessionStream = GrpcStream<proto::SessionServerMsg>;

    async fn session(
        &self,
        request: Request<Streaming<proto::SessionClientMsg>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let session = Arc::clone(&self.session);
        catch_panics(async move {
            let mut inbound = request.into_inner();

            // The first client message must identify the session.
            let first = inbound
                .message()
                .await?
                .ok_or_else(|| Status::invalid_argument("stream closed before hello"))?;
            let hello = match first.msg {
                Some(proto::session_client_msg::Msg::Hello(hello)) => hello,
                _ => return Err(Status::invalid_argument("first message must be hello")),
            };
            if hello.session_id != session.id {
                return Err(Status::not_found(format!("unknown session {}", hello.session_id)));
            }

            let (tx, rx) = mpsc::channel(64);

            // Attach: lead with a coherent snapshot, then register the
            // cursor at its end offset so the continuation follows exactly.
            let cursor = if hello.attach {
                let (snapshot, offset) = attach_snapshot(&session).await;
                if !snapshot.is_empty() {
                    let _ = tx
                        .send(Ok(proto::SessionServerMsg {
                            msg: Some(proto::session_server_msg::Msg::Output(snapshot)),
                        }))
                        .await;
                }
                session.replay.register(offset).await
            } else {
                let end = session.replay.written().await;
                session.replay.register(end).await
            };

            let detached = Arc::new(AtomicBool::new(false));

            // Writer: cursor to wire.
            {
                let session = Arc::clone(&session);
                let detached = Arc::clone(&detached);
                let tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match session.replay.next(cursor).await {
                            Drained::Data(data) => {
                                let msg = proto::SessionServerMsg {
                                    msg: Some(proto::session_server_msg::Msg::Output(
                                        data.to_vec(),
                                    )),
                                };
                                if tx.send(Ok(msg)).await.is_err() {
                                    break;
                                }
                            }
                            Drained::Closed => break,
                        }
                    }
                    // Producer closed (as opposed to client detach): deliver
                    // the exit code once it lands.
                    if !detached.load(Ordering::Acquire) {
                        if let Some(code) = await_exit_code(&session).await {
                            let msg = proto::SessionServerMsg {
                                msg: Some(proto::session_server_msg::Msg::ExitCode(code)),
                            };
                            let _ = tx.send(Ok(msg)).await;
                        }
                    }
                    session.replay.unregister(cursor).await;
                });
            }

            // Reader: client messages to PTY / resize / detach.
            {
                let session = Arc::clone(&session);
                let detached = Arc::clone(&detached);
                tokio::spawn(async move {
                    loop {
                        let msg = match inbound.message().await {
                            Ok(Some(msg)) => msg,
                            Ok(None) | Err(_) => break,
                        };
                        match msg.msg {
                            Some(proto::session_client_msg::Msg::Input(data)) => {
                                if session.input_tx.send(Bytes::from(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(proto::session_client_msg::Msg::Resize(size)) => {
                                let (Ok(cols), Ok(rows)) =
                                    (u16::try_from(size.cols), u16::try_from(size.rows))
                                else {
                                    continue;
                                };
                                if cols == 0 || rows == 0 {
                                    continue;
                                }
                                if let Err(e) = apply_resize(&session, cols, rows) {
                                    debug!("stream resize failed: {e:#}");
                                }
                            }
                            Some(proto::session_client_msg::Msg::Detach(true)) => break,
                            _ => {}
                        }
                    }
                    // Unregistering may unblock a backpressured producer.
                    detached.store(true, Ordering::Release);
                    session.replay.unregister(cursor).await;
                });
            }

            Ok(Response::new(Box::pin(ReceiverStream::new(rx)) as Self::SessionStream))
        })
        .await
    }
}

/// Resize everywhere it matters: PTY winsize, VT emulator, audit stream,
/// session metadata.
fn apply_resize(session: &Session, cols: u16, rows: u16) -> anyhow::Result<()> {
    session.pty.resize(cols, rows)?;
    if let Some(ref tx) = session.vt_tx {
        let _ = tx.try_send(vt::VtMsg::Resize(cols, rows));
    }
    if let Ok(mut slot) = session.recorder.lock() {
        if let Some(ref mut rec) = *slot {
            rec.record_resize(cols, rows)?;
        }
    }
    session.dir.write_meta(&session.agent, &session.cwd, &session.network_summary, cols, rows)?;
    Ok(())
}

/// Snapshot for a fresh attach: the VT render when the fence clears in
/// time, the replay buffer otherwise.
async fn attach_snapshot(session: &Session) -> (Vec<u8>, u64) {
    if let (Some(vt_handle), Some(vt_tx)) = (&session.vt, &session.vt_tx) {
        if vt::fence(vt_tx, vt::FENCE_BUDGET).await {
            let payload = vt_handle.lock().await.attach_payload();
            let offset = session.replay.written().await;
            return (payload, offset);
        }
        debug!("VT fence timed out; falling back to replay snapshot");
    }
    let (bytes, offset) = session.replay.snapshot().await;
    (bytes.to_vec(), offset)
}

/// Wait (bounded) for the session's exit code after the stream drains.
async fn await_exit_code(session: &Session) -> Option<i32> {
    let mut exit_rx = session.exit_rx.clone();
    let deadline = tokio::time::Instant::now() + EXIT_CODE_WAIT;
    loop {
        if let Some(code) = *exit_rx.borrow() {
            return Some(code);
        }
        match tokio::time::timeout_at(deadline, exit_rx.changed()).await {
            Ok(Ok(())) => continue,
            _ => return None,
        }
    }
}
