// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;
use std::time::Duration;

use super::*;

#[test]
fn parse_minimal() -> anyhow::Result<()> {
    let policy = Policy::parse("fs:\n  - rw:./\n")?;
    assert_eq!(policy.fs, vec![MountRule::new(MountMode::Rw, "./")]);
    assert!(policy.network.is_empty());
    assert!(policy.env.is_empty());
    assert!(!policy.audit);
    Ok(())
}

#[test]
fn network_accepts_scalar_or_list() -> anyhow::Result<()> {
    let scalar = Policy::parse("network: \"*.anthropic.com\"\n")?;
    assert_eq!(scalar.network, vec!["*.anthropic.com".to_owned()]);

    let list = Policy::parse("network:\n  - api.anthropic.com\n  - \"*.npmjs.org\"\n")?;
    assert_eq!(list.network.len(), 2);
    Ok(())
}

#[test]
fn env_scalar_wildcard() -> anyhow::Result<()> {
    let policy = Policy::parse("env: \"*\"\n")?;
    assert_eq!(policy.env, vec![WILDCARD.to_owned()]);
    assert!(policy.env_unrestricted());
    Ok(())
}

#[test]
fn wildcard_collapses_set() -> anyhow::Result<()> {
    let policy = Policy::parse("network:\n  - api.anthropic.com\n  - \"*\"\n  - evil.com\n")?;
    assert_eq!(policy.network, vec![WILDCARD.to_owned()]);
    assert!(policy.network_unrestricted());
    Ok(())
}

#[test]
fn duplicate_domains_deduped() -> anyhow::Result<()> {
    let policy = Policy::parse("network:\n  - a.com\n  - b.com\n  - a.com\n")?;
    assert_eq!(policy.network, vec!["a.com".to_owned(), "b.com".to_owned()]);
    Ok(())
}

#[test]
fn mount_rule_rejects_unknown_mode() {
    assert!(Policy::parse("fs:\n  - frobnicate:/tmp\n").is_err());
}

#[test]
fn mount_rule_rejects_relative_path() {
    assert!(Policy::parse("fs:\n  - rw:src/main.rs\n").is_err());
}

#[test]
fn deny_write_mode_round_trips() -> anyhow::Result<()> {
    let policy = Policy::parse("fs:\n  - deny-write:./egg.yaml\n")?;
    assert_eq!(policy.fs[0].mode, MountMode::DenyWrite);
    assert_eq!(policy.fs[0].to_string(), "deny-write:./egg.yaml");
    Ok(())
}

#[test]
fn base_scalar_and_record() -> anyhow::Result<()> {
    let scalar = Policy::parse("base: strict\n")?;
    assert_eq!(scalar.base, Some(Base::Ref("strict".to_owned())));

    let record = Policy::parse("base:\n  name: strict\n  network: none\n")?;
    match record.base {
        Some(Base::Masked(ref masks)) => {
            assert_eq!(masks.name.as_deref(), Some("strict"));
            assert_eq!(masks.network.as_deref(), Some("none"));
            assert!(masks.fs.is_none());
        }
        other => anyhow::bail!("expected masked base, got {other:?}"),
    }
    Ok(())
}

#[test]
fn resources_accept_suffixes() -> anyhow::Result<()> {
    let policy = Policy::parse(
        "resources:\n  cpu: 2m\n  memory: 4g\n  max_fds: 1024\n  max_pids: 256\n",
    )?;
    assert_eq!(policy.resources.cpu, Duration::from_secs(120));
    assert_eq!(policy.resources.memory, 4 << 30);
    assert_eq!(policy.resources.max_fds, 1024);
    assert_eq!(policy.resources.max_pids, 256);
    Ok(())
}

#[test]
fn resources_accept_plain_numbers() -> anyhow::Result<()> {
    let policy = Policy::parse("resources:\n  cpu: 30\n  memory: 1048576\n")?;
    assert_eq!(policy.resources.cpu, Duration::from_secs(30));
    assert_eq!(policy.resources.memory, 1 << 20);
    Ok(())
}

#[test]
fn unknown_fields_ignored() -> anyhow::Result<()> {
    let policy = Policy::parse("fs:\n  - rw:./\nfuture_field: 42\n")?;
    assert_eq!(policy.fs.len(), 1);
    Ok(())
}

#[test]
fn render_round_trips() -> anyhow::Result<()> {
    let policy = Policy::parse(
        "fs:\n  - rw:./\n  - deny:~/.ssh\nnetwork:\n  - \"*.anthropic.com\"\naudit: true\n",
    )?;
    let rendered = policy.render();
    let reparsed = Policy::parse(&rendered)?;
    assert_eq!(reparsed.fs, policy.fs);
    assert_eq!(reparsed.network, policy.network);
    assert!(reparsed.audit);
    Ok(())
}

#[test]
fn tilde_expansion() {
    let home = Path::new("/home/user");
    assert_eq!(expand_tilde("~/.ssh", home), Path::new("/home/user/.ssh"));
    assert_eq!(expand_tilde("~", home), Path::new("/home/user"));
    assert_eq!(expand_tilde("/etc", home), Path::new("/etc"));
}

#[test]
fn effective_fs_last_entry_wins() -> anyhow::Result<()> {
    let policy = Policy::parse("fs:\n  - deny:~/.ssh\n  - ro:~/.ssh\n")?;
    let home = Path::new("/home/user");
    let map = policy.effective_fs(home);
    assert_eq!(map.get(Path::new("/home/user/.ssh")), Some(&MountMode::Ro));
    assert!(!policy.denies(home, Path::new("/home/user/.ssh")));
    Ok(())
}

#[test]
fn byte_size_rejects_garbage() {
    assert!(parse_byte_size("lots").is_err());
    assert!(parse_byte_size("").is_err());
}
