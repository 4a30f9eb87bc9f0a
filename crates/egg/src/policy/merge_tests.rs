// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use yare::parameterized;

use super::*;
use crate::policy::Policy;

fn policy(yaml: &str) -> Policy {
    match Policy::parse(yaml) {
        Ok(p) => p,
        Err(e) => unreachable!("test yaml must parse: {e}"),
    }
}

#[test]
fn disjoint_fs_is_concatenation() {
    let parent = policy("fs:\n  - ro:/\n  - rw:/tmp\n");
    let child = policy("fs:\n  - rw:./\n");
    let merged = merge(parent, child);
    let rendered: Vec<String> = merged.fs.iter().map(ToString::to_string).collect();
    assert_eq!(rendered, vec!["ro:/", "rw:/tmp", "rw:./"]);
}

#[parameterized(
    ro_reopens = { "ro" },
    rw_reopens = { "rw" },
)]
fn child_reopen_removes_parent_deny(mode: &str) {
    let parent = policy("fs:\n  - deny:~/.ssh\n  - deny:~/.aws\n");
    let child = policy(&format!("fs:\n  - {mode}:~/.ssh\n"));
    let merged = merge(parent, child);
    let rendered: Vec<String> = merged.fs.iter().map(ToString::to_string).collect();
    assert_eq!(rendered, vec!["deny:~/.aws".to_owned(), format!("{mode}:~/.ssh")]);
}

#[test]
fn child_deny_does_not_remove_parent_deny() {
    let parent = policy("fs:\n  - deny:~/.ssh\n");
    let child = policy("fs:\n  - deny:~/.ssh\n");
    let merged = merge(parent, child);
    // Duplicate deny entries survive; enforcement dedups.
    assert_eq!(merged.fs.len(), 2);
}

#[test]
fn network_union_dedups() {
    let parent = policy("network:\n  - a.com\n  - b.com\n");
    let child = policy("network:\n  - b.com\n  - c.com\n");
    let merged = merge(parent, child);
    assert_eq!(
        merged.network,
        vec!["a.com".to_owned(), "b.com".to_owned(), "c.com".to_owned()]
    );
}

#[parameterized(
    wildcard_in_parent = { "network: \"*\"\n", "network:\n  - a.com\n" },
    wildcard_in_child = { "network:\n  - a.com\n", "network: \"*\"\n" },
)]
fn network_wildcard_collapses(parent_yaml: &str, child_yaml: &str) {
    let merged = merge(policy(parent_yaml), policy(child_yaml));
    assert_eq!(merged.network, vec!["*".to_owned()]);
}

#[test]
fn env_union_and_wildcard() {
    let merged = merge(policy("env:\n  - HOME\n  - PATH\n"), policy("env:\n  - TERM\n"));
    assert_eq!(merged.env, vec!["HOME".to_owned(), "PATH".to_owned(), "TERM".to_owned()]);

    let merged = merge(policy("env:\n  - HOME\n"), policy("env: \"*\"\n"));
    assert_eq!(merged.env, vec!["*".to_owned()]);
}

#[test]
fn resources_child_nonzero_field_wins() {
    let parent = policy("resources:\n  cpu: 60\n  memory: 1g\n  max_fds: 512\n");
    let child = policy("resources:\n  memory: 2g\n  max_pids: 64\n");
    let merged = merge(parent, child);
    assert_eq!(merged.resources.cpu, Duration::from_secs(60));
    assert_eq!(merged.resources.memory, 2 << 30);
    assert_eq!(merged.resources.max_fds, 512);
    assert_eq!(merged.resources.max_pids, 64);
}

#[test]
fn shell_child_wins_when_set() {
    let parent = policy("shell: /bin/bash\n");
    let merged = merge(parent.clone(), Policy::default());
    assert_eq!(merged.shell.as_deref(), Some(std::path::Path::new("/bin/bash")));

    let merged = merge(parent, policy("shell: /bin/zsh\n"));
    assert_eq!(merged.shell.as_deref(), Some(std::path::Path::new("/bin/zsh")));
}

#[test]
fn booleans_are_monotone() {
    let merged = merge(policy("audit: true\n"), policy("dangerously_skip_permissions: true\n"));
    assert!(merged.audit);
    assert!(merged.dangerously_skip_permissions);

    // A child cannot clear a parent's audit flag.
    let merged = merge(policy("audit: true\n"), policy("audit: false\n"));
    assert!(merged.audit);
}

#[test]
fn agent_settings_child_overrides_per_key() {
    let parent = policy("agent_settings:\n  claude: /old/settings.json\n  codex: /codex.toml\n");
    let child = policy("agent_settings:\n  claude: /new/settings.json\n");
    let merged = merge(parent, child);
    assert_eq!(
        merged.agent_settings.get("claude").map(|p| p.display().to_string()),
        Some("/new/settings.json".to_owned())
    );
    assert!(merged.agent_settings.contains_key("codex"));
}

#[test]
fn merged_policy_has_no_base() {
    let parent = policy("base: none\nfs:\n  - ro:/\n");
    let merged = merge(parent, Policy::default());
    assert!(merged.base.is_none());
}

#[test]
fn normalize_path_handles_dot_and_trailing_slash() {
    use std::path::Path;
    assert_eq!(normalize_path(Path::new("/a/b/")), Path::new("/a/b"));
    assert_eq!(normalize_path(Path::new("./")), Path::new("."));
    assert_eq!(normalize_path(Path::new("/a/./b")), Path::new("/a/b"));
}

#[test]
fn reopen_matches_trailing_slash_variants() {
    let parent = policy("fs:\n  - deny:/var/data/\n");
    let child = policy("fs:\n  - rw:/var/data\n");
    let merged = merge(parent, child);
    let rendered: Vec<String> = merged.fs.iter().map(ToString::to_string).collect();
    assert_eq!(rendered, vec!["rw:/var/data"]);
}
