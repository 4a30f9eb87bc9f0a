// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;

use super::*;

#[test]
fn create_lays_out_session_directory() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "abc-123")?;

    assert!(dir.path().ends_with("abc-123"));
    assert!(dir.shims_dir().is_dir());
    Ok(())
}

#[test]
fn token_is_hex_and_private() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    let token = dir.write_token()?;

    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    let mode = std::fs::metadata(dir.token_path())?.permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    assert_eq!(std::fs::read_to_string(dir.token_path())?, token);
    Ok(())
}

#[test]
fn tokens_are_unique_per_session() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let a = SessionDir::create(base.path(), "a")?.write_token()?;
    let b = SessionDir::create(base.path(), "b")?.write_token()?;
    assert_ne!(a, b);
    Ok(())
}

#[test]
fn meta_file_holds_key_value_lines() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    dir.write_meta("claude", Path::new("/work"), "api.anthropic.com", 200, 50)?;

    let meta = std::fs::read_to_string(dir.path().join(META_FILE))?;
    assert!(meta.contains("agent=claude\n"));
    assert!(meta.contains("cwd=/work\n"));
    assert!(meta.contains("network=api.anthropic.com\n"));
    assert!(meta.contains("cols=200\n"));
    assert!(meta.contains("rows=50\n"));
    Ok(())
}

#[test]
fn cleanup_without_audit_removes_everything() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    dir.write_pid()?;
    dir.write_token()?;

    dir.cleanup(false);
    assert!(!dir.path().exists());
    Ok(())
}

#[test]
fn cleanup_with_audit_retains_audit_artifacts() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    dir.write_pid()?;
    dir.write_token()?;
    dir.write_meta("claude", Path::new("/work"), "denied", 80, 24)?;
    std::fs::write(dir.audit_pty_path(), b"gzdata")?;
    std::fs::write(dir.audit_log_path(), b"input log")?;
    std::fs::write(dir.browser_requests_path(), b"https://example.com")?;

    dir.cleanup(true);
    assert!(dir.path().join(META_FILE).exists());
    assert!(dir.path().join(PID_FILE).exists());
    assert!(dir.audit_pty_path().exists());
    assert!(dir.audit_log_path().exists());
    assert!(!dir.token_path().exists());
    assert!(!dir.browser_requests_path().exists());
    assert!(!dir.shims_dir().exists());
    Ok(())
}

#[test]
fn network_summary_forms() {
    assert_eq!(Session::network_summary(&[]), "denied");
    assert_eq!(Session::network_summary(&["*".to_owned()]), "unrestricted");
    assert_eq!(
        Session::network_summary(&["a.com".to_owned(), "*.b.com".to_owned()]),
        "a.com,*.b.com"
    );
}
