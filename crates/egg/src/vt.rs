// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Optional high-fidelity terminal emulation for attach snapshots.
//!
//! Wraps an avt virtual terminal with the pieces avt does not track itself:
//! a bounded scrollback ring fed by scroll events on the primary screen,
//! alt-screen and cursor-visibility state scanned from the raw byte stream,
//! and an ANSI attach snapshot that reproduces scrollback + grid + cursor
//! on a receiving terminal.
//!
//! The emulator is driven by a single consumer task; PTY chunks arrive
//! through a bounded channel and are dropped when the channel is full (the
//! replay buffer stays the source of truth for non-VT clients).

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Upper bound on captured scrollback lines.
pub const SCROLLBACK_LIMIT: usize = 50_000;

/// How long an attach waits for the VT loop to drain queued chunks before
/// falling back to the replay-buffer snapshot.
pub const FENCE_BUDGET: Duration = Duration::from_secs(5);

/// Messages consumed by the VT task.
#[derive(Debug)]
pub enum VtMsg {
    Output(Bytes),
    Resize(u16, u16),
    /// Attach fence: acked once everything enqueued before it has been fed.
    Fence(oneshot::Sender<()>),
}

/// Point-in-time capture of the emulator state.
#[derive(Debug, Clone)]
pub struct VtSnapshot {
    pub lines: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub cursor_visible: bool,
    pub alt_screen: bool,
    pub scrollback_lines: u64,
    pub sequence: u64,
}

/// avt virtual terminal plus scrollback ring and raw-stream state tracking.
pub struct VtEmu {
    vt: avt::Vt,
    cols: u16,
    rows: u16,
    scrollback: VecDeque<String>,
    alt_screen: bool,
    cursor_visible: bool,
    /// Trailing bytes held back between feeds: a split escape sequence or an
    /// incomplete UTF-8 tail.
    pending: Vec<u8>,
    seq: u64,
}

impl std::fmt::Debug for VtEmu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VtEmu")
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("scrollback", &self.scrollback.len())
            .field("alt_screen", &self.alt_screen)
            .field("seq", &self.seq)
            .finish()
    }
}

impl VtEmu {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            vt: avt::Vt::new(cols as usize, rows as usize),
            cols,
            rows,
            scrollback: VecDeque::new(),
            alt_screen: false,
            cursor_visible: true,
            pending: Vec::new(),
            seq: 0,
        }
    }

    /// Feed raw PTY bytes.
    ///
    /// The stream is walked for events avt does not surface: line feeds and
    /// index/scroll sequences that push the top primary-screen line into the
    /// scrollback ring, alt-screen and cursor-visibility mode toggles, and
    /// the scrollback-clear / full-reset sequences that empty the ring.
    pub fn feed(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(data);

        let mut fed_until = 0;
        let mut i = 0;
        while i < input.len() {
            match input[i] {
                b'\n' => {
                    self.feed_vt(&input[fed_until..i]);
                    self.capture_scroll_at_bottom(1);
                    self.feed_vt(b"\n");
                    i += 1;
                    fed_until = i;
                }
                0x1b => match classify_escape(&input[i..]) {
                    Escape::Incomplete => {
                        self.feed_vt(&input[fed_until..i]);
                        self.pending = input[i..].to_vec();
                        self.seq += 1;
                        return;
                    }
                    Escape::Other(len) => i += len,
                    Escape::Index(len) => {
                        self.feed_vt(&input[fed_until..i]);
                        self.capture_scroll_at_bottom(1);
                        self.feed_vt(&input[i..i + len]);
                        i += len;
                        fed_until = i;
                    }
                    Escape::ScrollUp(n, len) => {
                        self.feed_vt(&input[fed_until..i]);
                        self.capture_scroll(n);
                        self.feed_vt(&input[i..i + len]);
                        i += len;
                        fed_until = i;
                    }
                    Escape::ClearScrollback(len) => {
                        self.feed_vt(&input[fed_until..i + len]);
                        self.scrollback.clear();
                        i += len;
                        fed_until = i;
                    }
                    Escape::FullReset(len) => {
                        self.feed_vt(&input[fed_until..i + len]);
                        self.scrollback.clear();
                        self.alt_screen = false;
                        self.cursor_visible = true;
                        i += len;
                        fed_until = i;
                    }
                    Escape::AltScreen(on, len) => {
                        self.alt_screen = on;
                        i += len;
                    }
                    Escape::CursorVisible(on, len) => {
                        self.cursor_visible = on;
                        i += len;
                    }
                },
                _ => i += 1,
            }
        }

        // Hold back an incomplete trailing UTF-8 sequence for the next feed.
        let tail = &input[fed_until..];
        let keep = incomplete_utf8_tail_len(tail);
        let (now, later) = tail.split_at(tail.len() - keep);
        self.feed_vt(now);
        self.pending = later.to_vec();
        self.seq += 1;
    }

    fn feed_vt(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let s = String::from_utf8_lossy(bytes);
        let _ = self.vt.feed_str(&s);
    }

    /// Capture the top line if the next line feed will scroll the primary
    /// screen (cursor already on the bottom row).
    fn capture_scroll_at_bottom(&mut self, n: usize) {
        let cursor = self.vt.cursor();
        if cursor.row + 1 >= self.rows as usize {
            self.capture_scroll(n);
        }
    }

    /// Push the top `n` primary-screen lines into the scrollback ring.
    fn capture_scroll(&mut self, n: usize) {
        if self.alt_screen {
            return;
        }
        for line in self.vt.view().take(n) {
            self.scrollback.push_back(line.text().trim_end().to_owned());
        }
        while self.scrollback.len() > SCROLLBACK_LIMIT {
            self.scrollback.pop_front();
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
        let _ = self.vt.resize(cols as usize, rows as usize);
        self.seq += 1;
    }

    pub fn is_alt_screen(&self) -> bool {
        self.alt_screen
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    /// Rendered text of the primary grid, one string per row.
    pub fn grid_text(&self) -> Vec<String> {
        self.vt.view().map(|line| line.text().trim_end().to_owned()).collect()
    }

    pub fn snapshot(&self) -> VtSnapshot {
        let cursor = self.vt.cursor();
        VtSnapshot {
            lines: self.grid_text(),
            cols: self.cols,
            rows: self.rows,
            cursor_row: cursor.row as u16,
            cursor_col: cursor.col as u16,
            cursor_visible: self.cursor_visible,
            alt_screen: self.alt_screen,
            scrollback_lines: self.scrollback.len() as u64,
            sequence: self.seq,
        }
    }

    /// Build the attach snapshot: an ANSI document that reproduces the
    /// session state on a fresh terminal of the same dimensions.
    ///
    /// Sections, in order: scrollback (CRLF-separated, oldest first), blank
    /// lines pushing it into the receiver's own scrollback, SGR reset + home
    /// + full grid re-render, absolute cursor restore, cursor visibility.
    /// Alt-screen mode suppresses the scrollback sections.
    pub fn attach_payload(&self) -> Vec<u8> {
        let mut out = String::new();

        if !self.alt_screen && !self.scrollback.is_empty() {
            for line in &self.scrollback {
                out.push_str(line);
                out.push_str("\r\n");
            }
            for _ in 1..self.rows {
                out.push('\n');
            }
        }

        out.push_str("\x1b[0m\x1b[H");
        let mut first = true;
        for line in self.vt.view() {
            if !first {
                out.push_str("\r\n");
            }
            first = false;
            render_line(line, &mut out);
            out.push_str("\x1b[K");
        }

        let cursor = self.vt.cursor();
        let _ = write!(out, "\x1b[{};{}H", cursor.row + 1, cursor.col + 1);
        out.push_str(if self.cursor_visible { "\x1b[?25h" } else { "\x1b[?25l" });
        out.into_bytes()
    }
}

/// Spawn the single-threaded VT consumer task.
pub fn spawn(vt: Arc<Mutex<VtEmu>>, mut rx: mpsc::Receiver<VtMsg>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                VtMsg::Output(data) => vt.lock().await.feed(&data),
                VtMsg::Resize(cols, rows) => vt.lock().await.resize(cols, rows),
                VtMsg::Fence(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    })
}

/// Post a fence and wait (bounded) for the VT loop to drain everything
/// enqueued before it. Returns false on timeout or a closed channel; the
/// caller then falls back to the replay-buffer snapshot.
pub async fn fence(tx: &mpsc::Sender<VtMsg>, budget: Duration) -> bool {
    let (ack_tx, ack_rx) = oneshot::channel();
    let post = async {
        if tx.send(VtMsg::Fence(ack_tx)).await.is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    };
    tokio::time::timeout(budget, post).await.unwrap_or(false)
}

enum Escape {
    /// Sequence continues past the end of this chunk.
    Incomplete,
    /// Recognized or irrelevant sequence of the given length; feed as-is.
    Other(usize),
    /// IND / NEL: line feed semantics, may scroll.
    Index(usize),
    /// CSI n S: scroll up n lines unconditionally.
    ScrollUp(usize, usize),
    /// CSI 3 J.
    ClearScrollback(usize),
    /// ESC c (RIS).
    FullReset(usize),
    AltScreen(bool, usize),
    CursorVisible(bool, usize),
}

/// Classify the escape sequence starting at `data[0] == ESC`.
fn classify_escape(data: &[u8]) -> Escape {
    let Some(&kind) = data.get(1) else {
        return Escape::Incomplete;
    };
    match kind {
        b'D' | b'E' => Escape::Index(2),
        b'c' => Escape::FullReset(2),
        b'[' => classify_csi(data),
        // Two-byte escape (ESC 7, ESC 8, charset selectors, ...).
        _ => Escape::Other(2),
    }
}

fn classify_csi(data: &[u8]) -> Escape {
    let mut i = 2;
    let private = data.get(i) == Some(&b'?');
    if private {
        i += 1;
    }
    let params_start = i;
    while i < data.len() && (data[i].is_ascii_digit() || data[i] == b';') {
        i += 1;
    }
    let Some(&final_byte) = data.get(i) else {
        return Escape::Incomplete;
    };
    if !(0x40..=0x7e).contains(&final_byte) {
        // Intermediate bytes we do not model; treat the CSI intro as opaque.
        return Escape::Other(i);
    }
    let len = i + 1;
    let params = &data[params_start..i];
    let first_param = || {
        std::str::from_utf8(params)
            .ok()
            .and_then(|s| s.split(';').next())
            .and_then(|p| p.parse::<usize>().ok())
    };

    match (private, final_byte) {
        (false, b'S') => Escape::ScrollUp(first_param().unwrap_or(1).max(1), len),
        (false, b'J') if params == b"3" => Escape::ClearScrollback(len),
        (true, b'h') | (true, b'l') => {
            let on = final_byte == b'h';
            if param_list_contains(params, b"1049") {
                Escape::AltScreen(on, len)
            } else if param_list_contains(params, b"25") {
                Escape::CursorVisible(on, len)
            } else {
                Escape::Other(len)
            }
        }
        _ => Escape::Other(len),
    }
}

fn param_list_contains(params: &[u8], wanted: &[u8]) -> bool {
    params.split(|b| *b == b';').any(|p| p == wanted)
}

/// Number of trailing bytes forming an incomplete (truncated) UTF-8
/// sequence.
///
/// Walks the decoder's own error reporting instead of classifying lead
/// bytes by hand: a `None` error length means the input ended mid-sequence,
/// anything else is a hard encoding error that lossy conversion should
/// replace, not hold back.
fn incomplete_utf8_tail_len(data: &[u8]) -> usize {
    let mut rest = data;
    loop {
        match std::str::from_utf8(rest) {
            Ok(_) => return 0,
            Err(e) => match e.error_len() {
                None => return rest.len() - e.valid_up_to(),
                Some(bad) => rest = &rest[e.valid_up_to() + bad..],
            },
        }
    }
}

// -- ANSI re-render ----------------------------------------------------------

/// Encode one avt color as SGR parameters.
fn color_sgr(c: &avt::Color, base: u8, out: &mut String) {
    match c {
        avt::Color::Indexed(n) if *n < 8 => {
            let _ = write!(out, ";{}", base + n);
        }
        avt::Color::Indexed(n) if *n < 16 => {
            let _ = write!(out, ";{}", base + 52 + n);
        }
        avt::Color::Indexed(n) => {
            let _ = write!(out, ";{};5;{}", base + 8, n);
        }
        avt::Color::RGB(rgb) => {
            let _ = write!(out, ";{};2;{};{};{}", base + 8, rgb.r, rgb.g, rgb.b);
        }
    }
}

/// Emit a reset-and-set SGR sequence for `pen`.
fn pen_to_sgr(pen: &avt::Pen, out: &mut String) {
    out.push_str("\x1b[0");
    if let Some(c) = pen.foreground() {
        color_sgr(&c, 30, out);
    }
    if let Some(c) = pen.background() {
        color_sgr(&c, 40, out);
    }
    if pen.is_bold() {
        out.push_str(";1");
    }
    if pen.is_faint() {
        out.push_str(";2");
    }
    if pen.is_italic() {
        out.push_str(";3");
    }
    if pen.is_underline() {
        out.push_str(";4");
    }
    if pen.is_blink() {
        out.push_str(";5");
    }
    if pen.is_inverse() {
        out.push_str(";7");
    }
    if pen.is_strikethrough() {
        out.push_str(";9");
    }
    out.push('m');
}

/// Render one grid line with its SGR attributes, trailing blanks trimmed.
fn render_line(line: &avt::Line, out: &mut String) {
    let start = out.len();
    let mut styled = false;

    for cells in line.chunks(|c1, c2| c1.pen() != c2.pen()) {
        let pen = cells[0].pen();
        if pen.is_default() {
            if styled {
                out.push_str("\x1b[0m");
                styled = false;
            }
        } else {
            pen_to_sgr(pen, out);
            styled = true;
        }
        for cell in &cells {
            out.push(cell.char());
        }
    }

    if styled {
        out.push_str("\x1b[0m");
    }
    let trimmed = out[start..].trim_end().len();
    out.truncate(start + trimmed);
}

#[cfg(test)]
#[path = "vt_tests.rs"]
mod tests;
