// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent launch profiles.
//!
//! The full catalog of known AI products lives outside the supervisor; this
//! table is the interface it consumes: per-agent command, the flag implied
//! by `dangerously_skip_permissions`, environment the agent needs, the
//! terminal mode preamble re-injected after replay trims, and the home
//! prefixes persisted out of overlay isolation.

/// Launch description for one known agent.
#[derive(Debug, Clone, Copy)]
pub struct AgentProfile {
    pub name: &'static str,
    pub command: &'static str,
    /// Appended to argv when the policy sets `dangerously_skip_permissions`.
    pub skip_permissions_flag: Option<&'static str>,
    /// Environment forced into the child regardless of the env allowlist.
    pub required_env: &'static [(&'static str, &'static str)],
    /// Static terminal mode sequences ahead of trimmed replay buffers.
    pub replay_preamble: &'static [u8],
    /// Home entries persisted from the overlay upper dir on exit.
    pub overlay_prefixes: &'static [&'static str],
}

/// Hide-cursor, bracketed paste, synchronized updates.
const FULL_TUI_PREAMBLE: &[u8] = b"\x1b[?25l\x1b[?2004h\x1b[?2026h";

const PROFILES: &[AgentProfile] = &[
    AgentProfile {
        name: "claude",
        command: "claude",
        skip_permissions_flag: Some("--dangerously-skip-permissions"),
        required_env: &[("CLAUDE_CODE_ENTRYPOINT", "egg")],
        replay_preamble: FULL_TUI_PREAMBLE,
        overlay_prefixes: &[".claude"],
    },
    AgentProfile {
        name: "codex",
        command: "codex",
        skip_permissions_flag: Some("--dangerously-bypass-approvals-and-sandbox"),
        required_env: &[],
        replay_preamble: FULL_TUI_PREAMBLE,
        overlay_prefixes: &[".codex"],
    },
    AgentProfile {
        name: "gemini",
        command: "gemini",
        skip_permissions_flag: Some("--yolo"),
        required_env: &[],
        replay_preamble: b"\x1b[?2004h",
        overlay_prefixes: &[".gemini"],
    },
];

/// Look up a known agent by name (case-insensitive).
pub fn lookup(name: &str) -> Option<&'static AgentProfile> {
    PROFILES.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Names of all known agents, for error messages.
pub fn known_agents() -> Vec<&'static str> {
    PROFILES.iter().map(|p| p.name).collect()
}

#[cfg(test)]
#[path = "profile_tests.rs"]
mod tests;
