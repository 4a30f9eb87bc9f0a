// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::ffi::OsStr;

use clap::Parser as _;

use super::*;

#[test]
fn grammar_parses_full_argument_set() -> anyhow::Result<()> {
    let args = WrapperArgs::try_parse_from([
        "_deny_init",
        "--uid",
        "1000",
        "--gid",
        "1000",
        "--log",
        "/tmp/deny_init.log",
        "--deny",
        "/home/user/.ssh",
        "--deny",
        "/home/user/.aws",
        "--deny-write",
        "/work/egg.yaml",
        "--home",
        "/home/user",
        "--writable",
        "/home/user/.claude",
        "--overlay-prefix",
        ".claude",
        "--",
        "claude",
        "--dangerously-skip-permissions",
    ])?;

    assert_eq!(args.uid, 1000);
    assert_eq!(args.deny.len(), 2);
    assert_eq!(args.deny_write.len(), 1);
    assert_eq!(args.overlay_prefix, vec![".claude".to_owned()]);
    assert_eq!(args.command, vec![
        "claude".to_owned(),
        "--dangerously-skip-permissions".to_owned()
    ]);
    Ok(())
}

#[test]
fn grammar_requires_uid_and_gid() {
    assert!(WrapperArgs::try_parse_from(["_deny_init", "--", "claude"]).is_err());
}

#[test]
fn prefix_matching_is_literal() {
    let prefixes = vec![".claude".to_owned(), ".config".to_owned()];
    assert!(matches_any_prefix(OsStr::new(".claude"), &prefixes));
    assert!(matches_any_prefix(OsStr::new(".claude.json"), &prefixes));
    assert!(matches_any_prefix(OsStr::new(".config"), &prefixes));
    assert!(!matches_any_prefix(OsStr::new("claude"), &prefixes));
    assert!(!matches_any_prefix(OsStr::new(".clavier"), &prefixes));
}

#[test]
fn prefix_siblings_finds_adjacent_files_only() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let claude_dir = dir.path().join(".claude");
    std::fs::create_dir(&claude_dir)?;
    std::fs::write(dir.path().join(".claude.json"), "{}")?;
    std::fs::write(dir.path().join(".claude.json.backup"), "{}")?;
    std::fs::write(dir.path().join(".clownfish"), "")?;
    std::fs::create_dir(dir.path().join(".claude-workspace"))?;

    let mut found: Vec<String> = prefix_siblings(&claude_dir)
        .into_iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    found.sort();

    // The directory itself and non-file entries are excluded.
    assert_eq!(found, vec![".claude.json".to_owned(), ".claude.json.backup".to_owned()]);
    Ok(())
}

#[test]
fn copy_recursive_preserves_tree() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let src = dir.path().join("src");
    std::fs::create_dir_all(src.join("nested"))?;
    std::fs::write(src.join("a.txt"), "alpha")?;
    std::fs::write(src.join("nested/b.txt"), "beta")?;

    let dst = dir.path().join("dst");
    copy_recursive(&src, &dst)?;

    assert_eq!(std::fs::read_to_string(dst.join("a.txt"))?, "alpha");
    assert_eq!(std::fs::read_to_string(dst.join("nested/b.txt"))?, "beta");
    Ok(())
}

#[test]
fn persist_copies_only_matching_prefixes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let upper = dir.path().join("upper");
    let side = dir.path().join("side");
    std::fs::create_dir_all(upper.join(".claude"))?;
    std::fs::write(upper.join(".claude/settings.json"), "{}")?;
    std::fs::write(upper.join(".claude.json"), "{}")?;
    std::fs::write(upper.join("scratch.txt"), "ephemeral")?;
    std::fs::create_dir_all(&side)?;

    let state = OverlayState {
        side: side.clone(),
        upper,
        _tmp: tempfile::tempdir()?,
    };
    let mut log = WrapperLog::open(None);
    state.persist(&[".claude".to_owned()], &mut log);

    assert!(side.join(".claude/settings.json").exists());
    assert!(side.join(".claude.json").exists());
    assert!(!side.join("scratch.txt").exists());
    Ok(())
}
