// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn line_text(line: &str) -> &str {
    // Strip the RFC-3339 prefix ("2026-… payload").
    match line.split_once(' ') {
        Some((_, rest)) => rest,
        None => line,
    }
}

#[test]
fn recorder_round_trips_frames() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("audit.pty.gz");

    let mut recorder = AuditRecorder::create(&path, 120, 40)?;
    recorder.record_output(b"$ cargo test\r\n")?;
    recorder.record_resize(200, 50)?;
    recorder.record_output(b"running 3 tests\r\n")?;
    recorder.finish()?;

    let stream = decode_audit_stream(std::fs::File::open(&path)?)?;
    assert_eq!((stream.cols, stream.rows), (120, 40));
    assert_eq!(stream.frames.len(), 3);
    match &stream.frames[0] {
        AuditFrame::Output { data, .. } => assert_eq!(data, b"$ cargo test\r\n"),
        other => anyhow::bail!("expected output frame, got {other:?}"),
    }
    match &stream.frames[1] {
        AuditFrame::Resize { cols, rows, .. } => assert_eq!((*cols, *rows), (200, 50)),
        other => anyhow::bail!("expected resize frame, got {other:?}"),
    }
    Ok(())
}

#[test]
fn recorder_survives_many_frames_with_flushing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("audit.pty.gz");

    let mut recorder = AuditRecorder::create(&path, 80, 24)?;
    for i in 0..350 {
        recorder.record_output(format!("chunk {i}\r\n").as_bytes())?;
    }
    recorder.finish()?;

    let stream = decode_audit_stream(std::fs::File::open(&path)?)?;
    assert_eq!(stream.frames.len(), 350);
    Ok(())
}

#[test]
fn decoder_rejects_bad_magic() {
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let _ = std::io::Write::write_all(&mut gz, b"NOPE");
    let Ok(raw) = gz.finish() else {
        unreachable!("in-memory gzip cannot fail");
    };
    assert!(decode_audit_stream(&raw[..]).is_err());
}

#[test]
fn audit_replay_reproduces_terminal_grid() -> anyhow::Result<()> {
    // The live emulator and one fed from the decoded audit stream agree.
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("audit.pty.gz");
    let chunks: &[&[u8]] =
        &[b"$ make\r\n", b"\x1b[32mok\x1b[0m\r\n", b"\x1b[3;1Hcursor here", b"tail"];

    let mut live = crate::vt::VtEmu::new(80, 24);
    let mut recorder = AuditRecorder::create(&path, 80, 24)?;
    for chunk in chunks {
        live.feed(chunk);
        recorder.record_output(chunk)?;
    }
    recorder.finish()?;

    let stream = decode_audit_stream(std::fs::File::open(&path)?)?;
    let mut replayed = crate::vt::VtEmu::new(stream.cols, stream.rows);
    for frame in &stream.frames {
        match frame {
            AuditFrame::Output { data, .. } => replayed.feed(data),
            AuditFrame::Resize { cols, rows, .. } => replayed.resize(*cols, *rows),
        }
    }

    assert_eq!(replayed.grid_text(), live.grid_text());
    let (a, b) = (replayed.snapshot(), live.snapshot());
    assert_eq!((a.cursor_row, a.cursor_col), (b.cursor_row, b.cursor_col));
    Ok(())
}

#[test]
fn input_auditor_emits_on_newline() {
    let mut auditor = InputAuditor::memory();
    auditor.feed(b"cargo test\r");
    assert_eq!(auditor.lines().len(), 1);
    assert_eq!(line_text(&auditor.lines()[0]), "cargo test");
}

#[test]
fn crlf_does_not_double_emit() {
    let mut auditor = InputAuditor::memory();
    auditor.feed(b"ls\r\n");
    assert_eq!(auditor.lines().len(), 1);
}

#[test]
fn control_chars_are_annotated() {
    let mut auditor = InputAuditor::memory();
    auditor.feed(b"abor");
    auditor.feed(&[0x03]);
    auditor.feed(&[0x04]);
    assert_eq!(auditor.lines().len(), 2);
    assert_eq!(line_text(&auditor.lines()[0]), "abor^C");
    assert_eq!(line_text(&auditor.lines()[1]), "^D");
}

#[test]
fn backspace_edits_the_buffer() {
    let mut auditor = InputAuditor::memory();
    auditor.feed(b"lss");
    auditor.feed(&[0x7f]);
    auditor.feed(b"\n");
    assert_eq!(line_text(&auditor.lines()[0]), "ls");
}

#[test]
fn escape_sequences_are_discarded() {
    let mut auditor = InputAuditor::memory();
    // Up-arrow, then text, then a multi-param CSI.
    auditor.feed(b"\x1b[Als \x1b[1;5Cdone\r");
    assert_eq!(line_text(&auditor.lines()[0]), "ls done");
}

#[test]
fn tab_is_buffered() {
    let mut auditor = InputAuditor::memory();
    auditor.feed(b"ls\tsrc\r");
    assert_eq!(line_text(&auditor.lines()[0]), "ls\tsrc");
}

#[test]
fn idle_flush_waits_for_the_window() {
    let mut auditor = InputAuditor::memory();
    auditor.feed(b"half-typed");
    auditor.flush_idle();
    // Still within the idle window: nothing emitted.
    assert!(auditor.lines().is_empty());
    assert_eq!(auditor.pending(), b"half-typed");

    auditor.last_input = Some(Instant::now() - INPUT_IDLE_FLUSH);
    auditor.flush_idle();
    assert_eq!(line_text(&auditor.lines()[0]), "half-typed");
    assert!(auditor.pending().is_empty());
}
