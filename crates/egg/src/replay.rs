// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded append-only byte log for PTY output with cursor-based readers.
//!
//! Every byte the child ever wrote has a stable absolute offset. Readers
//! hold cursors (offsets) and drain independently; the producer blocks when
//! the slowest cursor would lose data to a trim. Trimming never cuts at an
//! arbitrary byte: it searches for a terminal-safe boundary and splices a
//! re-initialization preamble in front of the surviving tail so late
//! attachers see coherent terminal state.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{watch, Mutex};

/// Default buffer capacity.
pub const DEFAULT_CAPACITY: usize = 2 * 1024 * 1024;

/// End of a synchronized-update frame (DECRST 2026).
const SYNC_END: &[u8] = b"\x1b[?2026l";
/// Erase-line followed by cursor-column reset.
const ERASE_LINE: &[u8] = b"\x1b[2K\x1b[G";
const CRLF: &[u8] = b"\r\n";

/// Longest tail that could hold a split cursor-position sequence
/// (`ESC [ NNNN ; NNNN H` minus its final byte).
const CARRY_LEN: usize = 15;

/// Result of draining a cursor.
#[derive(Debug, PartialEq, Eq)]
pub enum Drained {
    /// Bytes in PTY order, starting at the cursor's (possibly clamped) offset.
    Data(Bytes),
    /// Producer closed and the cursor has consumed everything.
    Closed,
}

/// Counters exposed through the `Status` RPC.
#[derive(Debug, Clone, Copy)]
pub struct ReplayStats {
    pub buffer_bytes: u64,
    pub total_written: u64,
    pub total_trimmed: u64,
    pub readers: u32,
}

struct Inner {
    buf: Vec<u8>,
    /// Bytes removed from the front of the offset space, net of injected
    /// preamble bytes; `written = trimmed + buf.len()` always holds.
    trimmed: u64,
    readers: HashMap<u64, u64>,
    next_reader: u64,
    /// Last absolute cursor position observed in the output stream (1-based).
    cursor: Option<(u16, u16)>,
    carry: Vec<u8>,
    closed: bool,
}

impl Inner {
    fn written(&self) -> u64 {
        self.trimmed + self.buf.len() as u64
    }
}

/// Append-only replay log. See module docs.
pub struct ReplayBuffer {
    capacity: usize,
    window: usize,
    prefix: Vec<u8>,
    cursor_re: regex::bytes::Regex,
    inner: Mutex<Inner>,
    /// Version counter bumped on every append, trim, or close.
    notify_tx: watch::Sender<u64>,
    /// Version counter bumped whenever a cursor advances or unregisters.
    advance_tx: watch::Sender<u64>,
}

impl ReplayBuffer {
    /// Create a buffer with the default 2 MiB capacity and a safe-cut window
    /// of capacity/8.
    ///
    /// `prefix` is the static agent mode preamble (e.g. hide-cursor +
    /// bracketed-paste + sync-update enable) replayed ahead of any trimmed
    /// buffer.
    pub fn new(prefix: Vec<u8>) -> Self {
        Self::with_limits(prefix, DEFAULT_CAPACITY, DEFAULT_CAPACITY / 8)
    }

    /// Create a buffer with explicit capacity and safe-cut window.
    pub fn with_limits(prefix: Vec<u8>, capacity: usize, window: usize) -> Self {
        let (notify_tx, _) = watch::channel(0);
        let (advance_tx, _) = watch::channel(0);
        // Absolute cursor position: CSI row ; col H (or f).
        #[allow(clippy::unwrap_used)] // fixed pattern, cannot fail
        let cursor_re = regex::bytes::Regex::new(r"(?-u)\x1b\[(\d{1,4});(\d{1,4})[Hf]").unwrap();
        Self {
            capacity,
            window,
            prefix,
            cursor_re,
            inner: Mutex::new(Inner {
                buf: Vec::new(),
                trimmed: 0,
                readers: HashMap::new(),
                next_reader: 0,
                cursor: None,
                carry: Vec::new(),
                closed: false,
            }),
            notify_tx,
            advance_tx,
        }
    }

    /// Append a PTY chunk, trimming as needed.
    ///
    /// This is the sole suspension point of the PTY read path: when the
    /// slowest registered cursor has not consumed past the chosen cut point,
    /// the append is undone and the call waits for a cursor to advance
    /// before retrying. The kernel then backpressures the child through the
    /// full PTY once the caller stops draining it.
    pub async fn write(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut scanned = false;
        loop {
            let mut advance_rx = self.advance_tx.subscribe();
            {
                let mut inner = self.inner.lock().await;
                if !scanned {
                    self.track_cursor(&mut inner, chunk);
                    scanned = true;
                }

                let before = inner.buf.len();
                inner.buf.extend_from_slice(chunk);
                if inner.buf.len() <= self.capacity {
                    self.notify_tx.send_modify(|v| *v += 1);
                    return;
                }

                let excess = inner.buf.len() - self.capacity;
                let cut = self.find_cut(&inner.buf, excess);
                let preamble = self.preamble_locked(&inner);
                if cut <= preamble.len() {
                    // Splicing the preamble would not shrink the buffer;
                    // the next write retries with a larger excess.
                    self.notify_tx.send_modify(|v| *v += 1);
                    return;
                }
                let cut_abs = inner.trimmed + cut as u64;
                let all_past_cut =
                    inner.readers.values().all(|&offset| offset >= cut_abs);

                if all_past_cut {
                    let tail = inner.buf.split_off(cut);
                    inner.buf = preamble;
                    inner.buf.extend_from_slice(&tail);
                    inner.trimmed = cut_abs - (inner.buf.len() - tail.len()) as u64;
                    self.notify_tx.send_modify(|v| *v += 1);
                    return;
                }

                // A reader is behind the cut: undo, wake readers, wait.
                inner.buf.truncate(before);
                self.notify_tx.send_modify(|v| *v += 1);
            }
            let _ = advance_rx.changed().await;
        }
    }

    /// Signal end of stream. Readers drain remaining bytes, then observe
    /// [`Drained::Closed`]; the exit code travels through the RPC layer, not
    /// the byte stream.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        self.notify_tx.send_modify(|v| *v += 1);
    }

    /// Register a cursor at `offset` (clamped into the live range).
    pub async fn register(&self, offset: u64) -> u64 {
        let mut inner = self.inner.lock().await;
        let offset = offset.clamp(inner.trimmed, inner.written());
        let id = inner.next_reader;
        inner.next_reader += 1;
        inner.readers.insert(id, offset);
        id
    }

    /// Remove a cursor, unblocking a backpressured producer.
    pub async fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.readers.remove(&id).is_some() {
            self.advance_tx.send_modify(|v| *v += 1);
        }
    }

    /// Copy the current buffer contents and return the offset of its end.
    ///
    /// After any trim the copy begins with a valid re-initialization
    /// preamble, so it is safe to hand to a fresh terminal.
    pub async fn snapshot(&self) -> (Bytes, u64) {
        let inner = self.inner.lock().await;
        (Bytes::copy_from_slice(&inner.buf), inner.written())
    }

    /// Drain new bytes for cursor `id`, waiting if it is fully caught up.
    pub async fn next(&self, id: u64) -> Drained {
        loop {
            let mut notify_rx = self.notify_tx.subscribe();
            {
                let mut inner = self.inner.lock().await;
                let Some(&offset) = inner.readers.get(&id) else {
                    return Drained::Closed;
                };
                let offset = offset.max(inner.trimmed);
                let written = inner.written();
                if offset < written {
                    let start = (offset - inner.trimmed) as usize;
                    let data = Bytes::copy_from_slice(&inner.buf[start..]);
                    inner.readers.insert(id, written);
                    self.advance_tx.send_modify(|v| *v += 1);
                    return Drained::Data(data);
                }
                if inner.closed {
                    return Drained::Closed;
                }
            }
            let _ = notify_rx.changed().await;
        }
    }

    /// Total bytes ever written.
    pub async fn written(&self) -> u64 {
        self.inner.lock().await.written()
    }

    /// Counters for `Status`.
    pub async fn stats(&self) -> ReplayStats {
        let inner = self.inner.lock().await;
        ReplayStats {
            buffer_bytes: inner.buf.len() as u64,
            total_written: inner.written(),
            total_trimmed: inner.trimmed,
            readers: inner.readers.len() as u32,
        }
    }

    /// The preamble that would be injected by a trim right now.
    pub async fn preamble(&self) -> Vec<u8> {
        let inner = self.inner.lock().await;
        self.preamble_locked(&inner)
    }

    fn preamble_locked(&self, inner: &Inner) -> Vec<u8> {
        let mut out = self.prefix.clone();
        if let Some((row, col)) = inner.cursor {
            out.extend_from_slice(format!("\x1b[{row};{col}H").as_bytes());
        }
        out
    }

    /// Update the tracked absolute cursor position from `chunk`, carrying a
    /// short tail across calls so split sequences are still seen.
    fn track_cursor(&self, inner: &mut Inner, chunk: &[u8]) {
        let mut haystack = std::mem::take(&mut inner.carry);
        haystack.extend_from_slice(chunk);
        if let Some(caps) = self.cursor_re.captures_iter(&haystack).last() {
            let row = parse_u16(&caps[1]);
            let col = parse_u16(&caps[2]);
            if let (Some(row), Some(col)) = (row, col) {
                inner.cursor = Some((row, col));
            }
        }
        let keep = haystack.len().min(CARRY_LEN);
        inner.carry = haystack[haystack.len() - keep..].to_vec();
    }

    /// Choose the trim point: at least `excess`, at most `excess + window`,
    /// preferring terminal-safe boundaries.
    fn find_cut(&self, buf: &[u8], excess: usize) -> usize {
        let end = buf.len().min(excess + self.window);
        let region = &buf[excess..end];
        if let Some(pos) = find_subslice(region, SYNC_END) {
            return excess + pos + SYNC_END.len();
        }
        if let Some(pos) = find_subslice(region, ERASE_LINE) {
            return excess + pos + ERASE_LINE.len();
        }
        if let Some(pos) = find_subslice(region, CRLF) {
            return excess + pos + CRLF.len();
        }
        excess
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_u16(digits: &[u8]) -> Option<u16> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
#[path = "replay_tests.rs"]
mod tests;
