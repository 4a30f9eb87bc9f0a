// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;

use serial_test::serial;

use super::*;
use crate::policy::Policy;
use crate::session::SessionDir;

fn test_profile() -> &'static AgentProfile {
    match crate::profile::lookup("claude") {
        Some(p) => p,
        None => unreachable!("claude profile must exist"),
    }
}

fn env_get<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

#[test]
#[serial]
fn env_allowlist_filters_parent_environment() -> anyhow::Result<()> {
    std::env::set_var("EGG_TEST_SECRET", "hunter2");
    std::env::set_var("EGG_TEST_WANTED", "yes");

    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    let policy = Policy::parse("env:\n  - EGG_TEST_WANTED\n")?;
    let env = build_child_env(&policy, test_profile(), &dir, Path::new("/home/u"), None);

    assert_eq!(env_get(&env, "EGG_TEST_WANTED"), Some("yes"));
    assert_eq!(env_get(&env, "EGG_TEST_SECRET"), None);

    std::env::remove_var("EGG_TEST_SECRET");
    std::env::remove_var("EGG_TEST_WANTED");
    Ok(())
}

#[test]
#[serial]
fn env_wildcard_forwards_everything() -> anyhow::Result<()> {
    std::env::set_var("EGG_TEST_ANY", "1");

    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    let policy = Policy::parse("env: \"*\"\n")?;
    let env = build_child_env(&policy, test_profile(), &dir, Path::new("/home/u"), None);

    assert_eq!(env_get(&env, "EGG_TEST_ANY"), Some("1"));

    std::env::remove_var("EGG_TEST_ANY");
    Ok(())
}

#[test]
#[serial]
fn shim_variables_are_forced() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    let policy = Policy::parse("env:\n  - PATH\n")?;
    let env = build_child_env(&policy, test_profile(), &dir, Path::new("/home/u"), None);

    let shims = dir.shims_dir().display().to_string();
    assert_eq!(env_get(&env, "BROWSER"), Some(format!("{shims}/browser").as_str()));
    assert_eq!(env_get(&env, "EGG_SESSION_DIR"), Some(dir.path().display().to_string().as_str()));
    let path = env_get(&env, "PATH").unwrap_or_default();
    assert!(path.starts_with(&shims), "PATH must lead with the shim dir: {path}");
    assert_eq!(env_get(&env, "HOME"), Some("/home/u"));
    assert_eq!(env_get(&env, "TERM"), Some("xterm-256color"));
    Ok(())
}

#[test]
#[serial]
fn ssh_agent_is_stripped_when_ssh_denied() -> anyhow::Result<()> {
    std::env::set_var("SSH_AUTH_SOCK", "/tmp/agent.sock");

    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;

    let denying = Policy::parse("env: \"*\"\nfs:\n  - deny:~/.ssh\n")?;
    let env = build_child_env(&denying, test_profile(), &dir, Path::new("/home/u"), None);
    assert_eq!(env_get(&env, "SSH_AUTH_SOCK"), None);

    // A later ro: entry re-opens ~/.ssh; the agent socket survives.
    let reopened = Policy::parse("env: \"*\"\nfs:\n  - deny:~/.ssh\n  - ro:~/.ssh\n")?;
    let env = build_child_env(&reopened, test_profile(), &dir, Path::new("/home/u"), None);
    assert_eq!(env_get(&env, "SSH_AUTH_SOCK"), Some("/tmp/agent.sock"));

    std::env::remove_var("SSH_AUTH_SOCK");
    Ok(())
}

#[tokio::test]
#[serial]
async fn proxy_injection_sets_all_three_variables() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    let shutdown = tokio_util::sync::CancellationToken::new();
    let proxy = DomainProxy::start(&["api.anthropic.com".to_owned()], shutdown.clone()).await?;

    let policy = Policy::parse("network:\n  - api.anthropic.com\n")?;
    let env = build_child_env(&policy, test_profile(), &dir, Path::new("/home/u"), Some(&proxy));

    assert_eq!(env_get(&env, "HTTPS_PROXY"), Some(proxy.url().as_str()));
    assert_eq!(env_get(&env, "HTTP_PROXY"), Some(proxy.url().as_str()));
    assert_eq!(env_get(&env, "NODE_USE_ENV_PROXY"), Some("1"));

    shutdown.cancel();
    Ok(())
}

#[test]
fn browser_shims_are_executable_scripts() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    write_browser_shims(&dir)?;

    for name in ["browser", "open", "xdg-open"] {
        let path = dir.shims_dir().join(name);
        let text = std::fs::read_to_string(&path)?;
        assert!(text.starts_with("#!/bin/sh"));
        assert!(text.contains("browser-requests"));
        let mode = std::fs::metadata(&path)?.permissions().mode();
        assert_ne!(mode & 0o111, 0, "{name} must be executable");
    }
    Ok(())
}

#[test]
fn resolve_binary_finds_absolute_and_path_entries() -> anyhow::Result<()> {
    // /bin/sh exists everywhere we build.
    let resolved = resolve_binary("/bin/sh")?;
    assert!(resolved.starts_with('/'));

    assert!(resolve_binary("definitely-not-a-real-binary-egg").is_err());
    Ok(())
}

#[test]
fn profile_required_env_is_applied() -> anyhow::Result<()> {
    let base = tempfile::tempdir()?;
    let dir = SessionDir::create(base.path(), "s1")?;
    let policy = Policy::default();
    let env = build_child_env(&policy, test_profile(), &dir, Path::new("/home/u"), None);
    assert_eq!(env_get(&env, "CLAUDE_CODE_ENTRYPOINT"), Some("egg"));
    Ok(())
}
