// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Audit artifacts: the binary PTY stream and the human-readable input log.
//!
//! The binary stream is a gzip file of `WTA2` + initial dimensions followed
//! by `(delta_ms, frame_type, data_len, bytes)` frames, varint-encoded.
//! Frame type 0 is raw PTY output; type 1 is a resize whose payload is two
//! varints `(cols, rows)`. The input log is one line per submitted input,
//! RFC-3339 UTC timestamped.

use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Buf;
use flate2::write::GzEncoder;
use flate2::Compression;
use prost::encoding::{decode_varint, encode_varint};

/// File magic of the binary audit stream.
pub const AUDIT_MAGIC: &[u8; 4] = b"WTA2";

/// Frames between flush-and-sync passes.
const FLUSH_INTERVAL: u32 = 100;

/// Idle time after which buffered input is force-emitted to the log.
pub const INPUT_IDLE_FLUSH: Duration = Duration::from_secs(2);

const FRAME_OUTPUT: u64 = 0;
const FRAME_RESIZE: u64 = 1;

// -- Binary recorder ----------------------------------------------------------

/// Gzip writer over the binary audit stream.
pub struct AuditRecorder {
    encoder: GzEncoder<std::fs::File>,
    prev_frame: Instant,
    frames: u32,
}

impl AuditRecorder {
    /// Create the audit file and write the header.
    pub fn create(path: &Path, cols: u16, rows: u16) -> anyhow::Result<Self> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating audit stream {}", path.display()))?;
        let mut encoder = GzEncoder::new(file, Compression::default());

        let mut header = Vec::with_capacity(8);
        header.extend_from_slice(AUDIT_MAGIC);
        encode_varint(cols as u64, &mut header);
        encode_varint(rows as u64, &mut header);
        encoder.write_all(&header).context("writing audit header")?;

        Ok(Self { encoder, prev_frame: Instant::now(), frames: 0 })
    }

    /// Record one chunk of PTY output.
    pub fn record_output(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.frame(FRAME_OUTPUT, data)
    }

    /// Record a window resize.
    pub fn record_resize(&mut self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let mut payload = Vec::with_capacity(4);
        encode_varint(cols as u64, &mut payload);
        encode_varint(rows as u64, &mut payload);
        self.frame(FRAME_RESIZE, &payload)
    }

    fn frame(&mut self, frame_type: u64, data: &[u8]) -> anyhow::Result<()> {
        let now = Instant::now();
        let delta_ms = now.duration_since(self.prev_frame).as_millis() as u64;
        self.prev_frame = now;

        let mut head = Vec::with_capacity(12);
        encode_varint(delta_ms, &mut head);
        encode_varint(frame_type, &mut head);
        encode_varint(data.len() as u64, &mut head);
        self.encoder.write_all(&head).context("writing audit frame head")?;
        self.encoder.write_all(data).context("writing audit frame data")?;

        self.frames += 1;
        if self.frames % FLUSH_INTERVAL == 0 {
            self.encoder.flush().context("flushing audit stream")?;
            self.encoder.get_ref().sync_data().context("syncing audit stream")?;
        }
        Ok(())
    }

    /// Finish compression and sync. Call on PTY EOF.
    pub fn finish(self) -> anyhow::Result<()> {
        let file = self.encoder.finish().context("finishing audit gzip stream")?;
        file.sync_all().context("syncing audit stream")?;
        Ok(())
    }
}

// -- Decoder ------------------------------------------------------------------

/// A decoded audit frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditFrame {
    Output { delta_ms: u64, data: Vec<u8> },
    Resize { delta_ms: u64, cols: u16, rows: u16 },
}

/// Header + frames of a decoded audit stream.
#[derive(Debug)]
pub struct AuditStream {
    pub cols: u16,
    pub rows: u16,
    pub frames: Vec<AuditFrame>,
}

/// Decode a complete gzip audit stream (replay tooling and tests).
pub fn decode_audit_stream(reader: impl Read) -> anyhow::Result<AuditStream> {
    let mut raw = Vec::new();
    flate2::read::GzDecoder::new(reader)
        .read_to_end(&mut raw)
        .context("decompressing audit stream")?;

    let mut buf = &raw[..];
    if buf.len() < AUDIT_MAGIC.len() || &buf[..AUDIT_MAGIC.len()] != AUDIT_MAGIC {
        bail!("bad audit magic");
    }
    buf.advance(AUDIT_MAGIC.len());

    let cols = decode_varint(&mut buf).context("audit header cols")? as u16;
    let rows = decode_varint(&mut buf).context("audit header rows")? as u16;

    let mut frames = Vec::new();
    while buf.has_remaining() {
        let delta_ms = decode_varint(&mut buf).context("frame delta")?;
        let frame_type = decode_varint(&mut buf).context("frame type")?;
        let len = decode_varint(&mut buf).context("frame length")? as usize;
        if buf.remaining() < len {
            bail!("truncated audit frame");
        }
        match frame_type {
            FRAME_OUTPUT => {
                let data = buf[..len].to_vec();
                buf.advance(len);
                frames.push(AuditFrame::Output { delta_ms, data });
            }
            FRAME_RESIZE => {
                let mut payload = &buf[..len];
                let cols = decode_varint(&mut payload).context("resize cols")? as u16;
                let rows = decode_varint(&mut payload).context("resize rows")? as u16;
                buf.advance(len);
                frames.push(AuditFrame::Resize { delta_ms, cols, rows });
            }
            other => bail!("unknown audit frame type {other}"),
        }
    }

    Ok(AuditStream { cols, rows, frames })
}

// -- Input auditor ------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Normal,
    GotEsc,
    InCsi,
}

/// Line-oriented audit of everything clients type.
///
/// Printable bytes and TAB accumulate; CR/LF, Ctrl+C, Ctrl+D, or two idle
/// seconds emit the buffered line. Backspace edits the buffer, escape
/// sequences (arrow keys, etc.) are discarded.
pub struct InputAuditor {
    sink: Sink,
    buf: Vec<u8>,
    state: ParseState,
    last_input: Option<Instant>,
}

enum Sink {
    File(std::fs::File),
    Null,
    #[cfg(test)]
    Memory(Vec<String>),
}

impl InputAuditor {
    /// Open `audit.log` for appending; a failed open degrades to a no-op
    /// auditor rather than blocking input.
    pub fn create(path: &Path) -> Self {
        let sink = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Sink::File(file),
            Err(e) => {
                tracing::warn!("input audit log unavailable: {e}");
                Sink::Null
            }
        };
        Self { sink, buf: Vec::new(), state: ParseState::Normal, last_input: None }
    }

    #[cfg(test)]
    fn memory() -> Self {
        Self {
            sink: Sink::Memory(Vec::new()),
            buf: Vec::new(),
            state: ParseState::Normal,
            last_input: None,
        }
    }

    #[cfg(test)]
    fn lines(&self) -> &[String] {
        match self.sink {
            Sink::Memory(ref lines) => lines,
            _ => &[],
        }
    }

    /// Feed client input bytes on their way to the PTY.
    pub fn feed(&mut self, data: &[u8]) {
        for &byte in data {
            match self.state {
                ParseState::GotEsc => {
                    self.state = if byte == b'[' { ParseState::InCsi } else { ParseState::Normal };
                }
                ParseState::InCsi => {
                    if (0x40..=0x7e).contains(&byte) {
                        self.state = ParseState::Normal;
                    }
                }
                ParseState::Normal => match byte {
                    0x1b => self.state = ParseState::GotEsc,
                    b'\r' | b'\n' => self.emit(),
                    0x03 => {
                        self.buf.extend_from_slice(b"^C");
                        self.emit();
                    }
                    0x04 => {
                        self.buf.extend_from_slice(b"^D");
                        self.emit();
                    }
                    0x08 | 0x7f => {
                        self.buf.pop();
                    }
                    b'\t' => self.buf.push(byte),
                    b if b >= 0x20 => self.buf.push(byte),
                    _ => {}
                },
            }
        }
        if !self.buf.is_empty() {
            self.last_input = Some(Instant::now());
        }
    }

    /// Emit buffered input that has sat idle past the flush window. The
    /// session loop calls this on a coarse tick.
    pub fn flush_idle(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if let Some(last) = self.last_input {
            if last.elapsed() >= INPUT_IDLE_FLUSH {
                self.emit();
            }
        }
    }

    fn emit(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        self.last_input = None;
        let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        match self.sink {
            Sink::File(ref mut f) => {
                let _ = writeln!(f, "{ts} {line}");
            }
            Sink::Null => {}
            #[cfg(test)]
            Sink::Memory(ref mut lines) => lines.push(format!("{ts} {line}")),
        }
    }

    #[cfg(test)]
    fn pending(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
