// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Domain-filtering HTTPS CONNECT proxy.
//!
//! The sandbox cannot do per-destination network filtering in an
//! unprivileged user namespace, so when a policy carries a domain allowlist
//! the child's only permitted egress is this local proxy. It accepts
//! `CONNECT host:port` and nothing else, matches the host against the
//! allowlist, and splices bytes between client and upstream. No TLS
//! interception — enforcement happens at connect time only.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum bytes of request head we are willing to buffer.
const MAX_HEAD: usize = 8 * 1024;

/// Compiled domain allowlist.
///
/// A pattern is an exact hostname, a `*.suffix` wildcard matching strict
/// subdomains (the apex itself does not match), or the universal `*`.
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    exact: HashSet<String>,
    wildcard_suffixes: Vec<String>,
    allow_all: bool,
}

impl DomainFilter {
    pub fn new(patterns: &[String]) -> Self {
        let mut filter = Self::default();
        for pattern in patterns {
            if pattern == "*" {
                filter.allow_all = true;
            } else if let Some(suffix) = pattern.strip_prefix("*.") {
                filter.wildcard_suffixes.push(suffix.to_ascii_lowercase());
            } else {
                filter.exact.insert(pattern.to_ascii_lowercase());
            }
        }
        filter
    }

    /// Whether `host` (no port) is allowed.
    pub fn allows(&self, host: &str) -> bool {
        if self.allow_all {
            return true;
        }
        let host = host.to_ascii_lowercase();
        if self.exact.contains(&host) {
            return true;
        }
        self.wildcard_suffixes.iter().any(|suffix| {
            host.len() > suffix.len() + 1
                && host.ends_with(suffix.as_str())
                && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
        })
    }
}

/// Running proxy listener; terminates with its cancellation token.
pub struct DomainProxy {
    local_addr: SocketAddr,
}

impl DomainProxy {
    /// Bind an ephemeral loopback port and start serving.
    pub async fn start(patterns: &[String], shutdown: CancellationToken) -> anyhow::Result<Self> {
        let listener =
            TcpListener::bind("127.0.0.1:0").await.context("binding domain proxy listener")?;
        let local_addr = listener.local_addr()?;
        let filter = Arc::new(DomainFilter::new(patterns));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let filter = Arc::clone(&filter);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, &filter).await {
                                        debug!("proxy connection from {peer}: {e:#}");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("proxy accept error: {e}");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { local_addr })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// URL for `HTTP_PROXY`/`HTTPS_PROXY` injection.
    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.local_addr.port())
    }
}

async fn handle_connection(mut client: TcpStream, filter: &DomainFilter) -> anyhow::Result<()> {
    let head = read_head(&mut client).await?;
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if method != "CONNECT" {
        respond(&mut client, "405 Method Not Allowed").await?;
        return Ok(());
    }

    let (host, port) = match target.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().unwrap_or(443)),
        None => (target, 443),
    };

    if !filter.allows(host) {
        debug!(host, "proxy denied CONNECT");
        respond(&mut client, "403 Forbidden").await?;
        return Ok(());
    }

    let upstream = match TcpStream::connect((host, port)).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(host, port, "proxy dial failed: {e}");
            respond(&mut client, "502 Bad Gateway").await?;
            return Ok(());
        }
    };

    // The client reads this status line before starting TLS inside the
    // tunnel; it must hit the wire before the splice begins or the
    // handshake deadlocks on a buffered response.
    client.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n").await?;
    client.flush().await?;

    debug!(host, port, "proxy tunnel established");
    let mut client = client;
    let mut upstream = upstream;
    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// Read the request head (through the blank line), bounded by [`MAX_HEAD`].
async fn read_head(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_HEAD {
            anyhow::bail!("request head exceeds {MAX_HEAD} bytes");
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            anyhow::bail!("client closed before completing request head");
        }
        buf.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn respond(stream: &mut TcpStream, status: &str) -> anyhow::Result<()> {
    stream.write_all(format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\n\r\n").as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
