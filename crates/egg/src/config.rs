// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Per-session sandbox supervisor for AI coding agents.
#[derive(Debug, Parser)]
#[command(name = "egg", version, about)]
pub struct Config {
    /// Agent to launch (claude, codex, gemini).
    #[arg(long, env = "EGG_AGENT", default_value = "claude")]
    pub agent: String,

    /// Working directory for the agent.
    #[arg(long, env = "EGG_CWD")]
    pub cwd: Option<PathBuf>,

    /// Terminal columns.
    #[arg(long, env = "EGG_COLS", default_value = "200")]
    pub cols: u16,

    /// Terminal rows.
    #[arg(long, env = "EGG_ROWS", default_value = "50")]
    pub rows: u16,

    /// Policy file; absent means the built-in default policy.
    #[arg(long, env = "EGG_POLICY")]
    pub policy: Option<PathBuf>,

    /// Keep and log extra diagnostics.
    #[arg(long, env = "EGG_DEBUG")]
    pub debug: bool,

    /// Record the binary PTY stream and retain audit artifacts at exit.
    #[arg(long, env = "EGG_AUDIT")]
    pub audit: bool,

    /// High-fidelity attach snapshots through a VT emulator.
    #[arg(long, env = "EGG_VT")]
    pub vt: bool,

    /// Home directory override (multi-tenant relay).
    #[arg(long, env = "EGG_HOME_OVERRIDE")]
    pub home: Option<PathBuf>,

    /// Log format (json or text).
    #[arg(long, env = "EGG_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "EGG_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Agent command override (after --); defaults to the agent profile's
    /// command.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cols == 0 || self.rows == 0 {
            anyhow::bail!("terminal dimensions must be positive");
        }
        if crate::profile::lookup(&self.agent).is_none() {
            anyhow::bail!(
                "unknown agent {:?} (known agents: {})",
                self.agent,
                crate::profile::known_agents().join(", ")
            );
        }
        if let Some(ref path) = self.cwd {
            if !path.is_dir() {
                anyhow::bail!("working directory {} does not exist", path.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
