// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn parses_unified_hierarchy_line() {
    let text = "0::/user.slice/user-1000.slice/session-2.scope\n";
    assert_eq!(
        parse_unified_cgroup(text),
        Some("/user.slice/user-1000.slice/session-2.scope")
    );
}

#[test]
fn skips_v1_controllers() {
    let text = "12:memory:/legacy\n7:cpu,cpuacct:/legacy\n0::/unified/path\n";
    assert_eq!(parse_unified_cgroup(text), Some("/unified/path"));
}

#[test]
fn missing_unified_entry_is_none() {
    assert_eq!(parse_unified_cgroup("12:memory:/legacy\n"), None);
}

#[test]
fn unconfigured_resources_skip_cgroup_entirely() {
    let scope = CgroupScope::create("test-session", &crate::policy::Resources::default());
    assert!(!scope.active());
    // No-ops on a degraded scope.
    scope.add_process(1);
    scope.destroy();
}
