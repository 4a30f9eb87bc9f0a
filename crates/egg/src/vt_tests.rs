// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use super::*;

fn feed_lines(vt: &mut VtEmu, n: usize) {
    for i in 0..n {
        vt.feed(format!("line{i}\r\n").as_bytes());
    }
}

#[test]
fn plain_feed_renders_grid() {
    let mut vt = VtEmu::new(20, 5);
    vt.feed(b"hello world");
    assert_eq!(vt.grid_text()[0], "hello world");
    assert!(!vt.is_alt_screen());
}

#[test]
fn scrolled_lines_land_in_ring() {
    let mut vt = VtEmu::new(20, 5);
    feed_lines(&mut vt, 7);

    assert_eq!(vt.scrollback_len(), 3);
    let snap = vt.snapshot();
    assert_eq!(snap.scrollback_lines, 3);
    assert_eq!(vt.grid_text()[0], "line3");
}

#[test]
fn alt_screen_suspends_capture() {
    let mut vt = VtEmu::new(20, 5);
    feed_lines(&mut vt, 6);
    let before = vt.scrollback_len();

    vt.feed(b"\x1b[?1049h");
    assert!(vt.is_alt_screen());
    feed_lines(&mut vt, 10);
    assert_eq!(vt.scrollback_len(), before);

    vt.feed(b"\x1b[?1049l");
    assert!(!vt.is_alt_screen());
}

#[test]
fn clear_scrollback_empties_ring() {
    let mut vt = VtEmu::new(20, 5);
    feed_lines(&mut vt, 10);
    assert!(vt.scrollback_len() > 0);

    vt.feed(b"\x1b[3J");
    assert_eq!(vt.scrollback_len(), 0);
}

#[test]
fn full_reset_clears_everything() {
    let mut vt = VtEmu::new(20, 5);
    feed_lines(&mut vt, 10);
    vt.feed(b"\x1b[?25l\x1b[?1049h");

    vt.feed(b"\x1bc");
    assert_eq!(vt.scrollback_len(), 0);
    assert!(!vt.is_alt_screen());
    assert!(vt.snapshot().cursor_visible);
}

#[test]
fn csi_scroll_up_captures_unconditionally() {
    let mut vt = VtEmu::new(20, 5);
    vt.feed(b"top\r\nsecond");
    vt.feed(b"\x1b[2S");
    assert_eq!(vt.scrollback_len(), 2);
}

#[test]
fn cursor_visibility_is_tracked() {
    let mut vt = VtEmu::new(20, 5);
    assert!(vt.snapshot().cursor_visible);
    vt.feed(b"\x1b[?25l");
    assert!(!vt.snapshot().cursor_visible);
    vt.feed(b"\x1b[?25h");
    assert!(vt.snapshot().cursor_visible);
}

#[test]
fn split_escape_sequences_survive_chunk_boundaries() {
    let mut vt = VtEmu::new(20, 5);
    vt.feed(b"\x1b[?104");
    vt.feed(b"9h");
    assert!(vt.is_alt_screen());

    vt.feed(b"\x1b");
    vt.feed(b"[?1049l");
    assert!(!vt.is_alt_screen());
}

#[test]
fn utf8_tail_scan_distinguishes_truncation_from_garbage() {
    // Truncated multi-byte sequences at the end are held back.
    assert_eq!(incomplete_utf8_tail_len(&"é".as_bytes()[..1]), 1);
    assert_eq!(incomplete_utf8_tail_len(&"€".as_bytes()[..2]), 2);
    assert_eq!(incomplete_utf8_tail_len(&"🦀".as_bytes()[..3]), 3);

    // Complete text, pure ASCII, and hard encoding errors hold nothing.
    assert_eq!(incomplete_utf8_tail_len(b"plain"), 0);
    assert_eq!(incomplete_utf8_tail_len("héllo".as_bytes()), 0);
    assert_eq!(incomplete_utf8_tail_len(&[0xff, 0xfe]), 0);
    // An earlier hard error does not mask a truncated tail after it.
    assert_eq!(incomplete_utf8_tail_len(&[0xff, b'a', 0xc3]), 1);
}

#[test]
fn split_utf8_survives_chunk_boundaries() {
    let mut vt = VtEmu::new(20, 5);
    let text = "héllo".as_bytes();
    vt.feed(&text[..2]); // splits the two-byte é
    vt.feed(&text[2..]);
    assert_eq!(vt.grid_text()[0], "héllo");
}

#[test]
fn ring_is_bounded() {
    let mut vt = VtEmu::new(20, 2);
    for i in 0..(SCROLLBACK_LIMIT + 50) {
        vt.feed(format!("l{i}\r\n").as_bytes());
    }
    assert_eq!(vt.scrollback_len(), SCROLLBACK_LIMIT);
}

#[test]
fn attach_payload_round_trips_grid_and_cursor() {
    let mut source = VtEmu::new(30, 6);
    feed_lines(&mut source, 9);
    source.feed(b"\x1b[31mred text\x1b[0m");
    source.feed(b"\x1b[2;5H");

    let payload = source.attach_payload();
    let mut receiver = VtEmu::new(30, 6);
    receiver.feed(&payload);

    assert_eq!(receiver.grid_text(), source.grid_text());
    let src = source.snapshot();
    let dst = receiver.snapshot();
    assert_eq!((dst.cursor_row, dst.cursor_col), (src.cursor_row, src.cursor_col));
    assert_eq!(dst.cursor_visible, src.cursor_visible);
}

#[test]
fn attach_payload_restores_hidden_cursor() {
    let mut source = VtEmu::new(20, 5);
    source.feed(b"quiet\x1b[?25l");

    let payload = source.attach_payload();
    assert!(payload.ends_with(b"\x1b[?25l"));

    let mut receiver = VtEmu::new(20, 5);
    receiver.feed(&payload);
    assert!(!receiver.snapshot().cursor_visible);
}

#[test]
fn alt_screen_payload_skips_scrollback() {
    let mut vt = VtEmu::new(20, 5);
    feed_lines(&mut vt, 10);
    vt.feed(b"\x1b[?1049h\x1b[Hfullscreen");

    let payload = vt.attach_payload();
    let text = String::from_utf8_lossy(&payload);
    assert!(!text.contains("line0"), "scrollback must not leak into alt-screen attach");
    assert!(text.contains("fullscreen"));
}

#[tokio::test]
async fn consumer_task_feeds_and_acks_fence() -> anyhow::Result<()> {
    let vt = Arc::new(Mutex::new(VtEmu::new(20, 5)));
    let (tx, rx) = mpsc::channel(16);
    let handle = spawn(Arc::clone(&vt), rx);

    tx.send(VtMsg::Output(bytes::Bytes::from_static(b"queued"))).await?;
    assert!(fence(&tx, FENCE_BUDGET).await);
    assert_eq!(vt.lock().await.grid_text()[0], "queued");

    tx.send(VtMsg::Resize(40, 10)).await?;
    assert!(fence(&tx, FENCE_BUDGET).await);
    let snap = vt.lock().await.snapshot();
    assert_eq!((snap.cols, snap.rows), (40, 10));

    drop(tx);
    handle.await?;
    Ok(())
}

#[tokio::test]
async fn fence_fails_closed_on_dead_task() {
    let (tx, rx) = mpsc::channel(1);
    drop(rx);
    assert!(!fence(&tx, Duration::from_millis(100)).await);
}
