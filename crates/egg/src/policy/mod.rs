// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Declarative sandbox policy: mount rules, network/env allowlists,
//! resource limits, and the `base` inheritance reference.
//!
//! The YAML schema is deliberately forgiving: `network` and `env` accept a
//! scalar or a list, `base` accepts a scalar or a per-section mask record,
//! and unknown fields are ignored. Everything collapses to a canonical
//! in-memory form at parse time.

pub mod merge;
pub mod resolve;

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Universal wildcard accepted by `network` and `env`.
pub const WILDCARD: &str = "*";

/// Access mode of a filesystem mount rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountMode {
    Rw,
    Ro,
    Deny,
    DenyWrite,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rw => "rw",
            Self::Ro => "ro",
            Self::Deny => "deny",
            Self::DenyWrite => "deny-write",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "rw" => Some(Self::Rw),
            "ro" => Some(Self::Ro),
            "deny" => Some(Self::Deny),
            "deny-write" => Some(Self::DenyWrite),
            _ => None,
        }
    }
}

/// A single `mode:path` filesystem rule.
///
/// Order in the `fs` list is preserved for display; enforcement resolves
/// duplicate paths with last-entry-wins semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MountRule {
    pub mode: MountMode,
    pub path: String,
}

impl MountRule {
    pub fn new(mode: MountMode, path: impl Into<String>) -> Self {
        Self { mode, path: path.into() }
    }

    /// The rule path with a leading `~` expanded against `home`.
    pub fn expanded(&self, home: &Path) -> PathBuf {
        expand_tilde(&self.path, home)
    }
}

impl TryFrom<String> for MountRule {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (mode, path) = s
            .split_once(':')
            .ok_or_else(|| format!("mount rule {s:?} is missing a mode prefix"))?;
        let mode =
            MountMode::parse(mode).ok_or_else(|| format!("unknown mount mode {mode:?} in {s:?}"))?;
        if path.is_empty() {
            return Err(format!("mount rule {s:?} has an empty path"));
        }
        if !(path.starts_with('/') || path.starts_with('~') || path.starts_with("./")) {
            return Err(format!("mount rule path {path:?} must be absolute, ~-prefixed, or ./"));
        }
        Ok(Self { mode, path: path.to_owned() })
    }
}

impl From<MountRule> for String {
    fn from(rule: MountRule) -> Self {
        format!("{}:{}", rule.mode.as_str(), rule.path)
    }
}

impl std::fmt::Display for MountRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.mode.as_str(), self.path)
    }
}

/// The `base` field: a scalar reference or a per-section mask record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Base {
    Ref(String),
    Masked(BaseMasks),
}

/// Structured `base` record with optional per-section replacement references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseMasks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
}

impl BaseMasks {
    pub fn has_mask(&self) -> bool {
        self.fs.is_some() || self.network.is_some() || self.env.is_some()
    }
}

/// Resource limits; a zero field means "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    #[serde(
        deserialize_with = "de_duration",
        serialize_with = "ser_duration",
        skip_serializing_if = "duration_is_zero"
    )]
    pub cpu: Duration,
    #[serde(deserialize_with = "de_byte_size", skip_serializing_if = "u64_is_zero")]
    pub memory: u64,
    #[serde(skip_serializing_if = "u32_is_zero")]
    pub max_fds: u32,
    #[serde(skip_serializing_if = "u32_is_zero")]
    pub max_pids: u32,
}

impl Resources {
    pub fn is_unset(&self) -> bool {
        self.cpu.is_zero() && self.memory == 0 && self.max_fds == 0 && self.max_pids == 0
    }
}

/// Full sandbox policy as loaded from one config file (pre-resolution) or
/// as the effective merged result (post-resolution, `base` cleared).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<Base>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fs: Vec<MountRule>,
    #[serde(deserialize_with = "de_string_or_list", skip_serializing_if = "Vec::is_empty")]
    pub network: Vec<String>,
    #[serde(deserialize_with = "de_string_or_list", skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Resources::is_unset")]
    pub resources: Resources,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<PathBuf>,
    #[serde(skip_serializing_if = "bool_is_false")]
    pub dangerously_skip_permissions: bool,
    #[serde(skip_serializing_if = "bool_is_false")]
    pub audit: bool,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub agent_settings: IndexMap<String, PathBuf>,
}

impl Policy {
    /// Parse a policy document from YAML text.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut policy: Policy = serde_yaml::from_str(text)?;
        policy.normalize();
        Ok(policy)
    }

    /// Render the policy back to YAML for introspection (`Status` RPC).
    pub fn render(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }

    /// Collapse `network` and `env` to canonical sets: duplicates removed,
    /// and either list reduced to `["*"]` when the wildcard is present.
    pub fn normalize(&mut self) {
        collapse_set(&mut self.network);
        collapse_set(&mut self.env);
    }

    /// Whether the policy grants unrestricted network access.
    pub fn network_unrestricted(&self) -> bool {
        self.network.iter().any(|d| d == WILDCARD)
    }

    /// Whether the policy forwards the full parent environment.
    pub fn env_unrestricted(&self) -> bool {
        self.env.iter().any(|e| e == WILDCARD)
    }

    /// Effective per-path modes with last-entry-wins resolution, keyed by the
    /// tilde-expanded path. Preserves first-appearance order.
    pub fn effective_fs(&self, home: &Path) -> IndexMap<PathBuf, MountMode> {
        let mut map = IndexMap::new();
        for rule in &self.fs {
            map.insert(rule.expanded(home), rule.mode);
        }
        map
    }

    /// Whether `path` resolves to `deny` under last-entry-wins semantics.
    pub fn denies(&self, home: &Path, path: &Path) -> bool {
        self.effective_fs(home).get(path).is_some_and(|m| *m == MountMode::Deny)
    }
}

/// Expand a leading `~` or `~/` against `home`; other paths pass through.
pub fn expand_tilde(path: &str, home: &Path) -> PathBuf {
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// The user's home directory from the environment.
pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))
}

fn collapse_set(items: &mut Vec<String>) {
    if items.iter().any(|i| i == WILDCARD) {
        items.clear();
        items.push(WILDCARD.to_owned());
        return;
    }
    let mut seen = std::collections::HashSet::new();
    items.retain(|i| seen.insert(i.clone()));
}

fn de_string_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

fn de_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Secs(n) => Ok(Duration::from_secs(n)),
        Raw::Text(s) => humantime::parse_duration(&s).map_err(D::Error::custom),
    }
}

fn ser_duration<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&humantime::format_duration(*dur).to_string())
}

fn de_byte_size<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bytes(u64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Bytes(n) => Ok(n),
        Raw::Text(s) => parse_byte_size(&s).map_err(D::Error::custom),
    }
}

/// Parse `512`, `512k`, `256m`, `4g` (case-insensitive) into bytes.
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1u64 << 10),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1 << 20),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1 << 30),
        _ => (s, 1),
    };
    let n: u64 = digits.trim().parse().map_err(|_| format!("invalid byte size {s:?}"))?;
    n.checked_mul(multiplier).ok_or_else(|| format!("byte size {s:?} overflows"))
}

fn bool_is_false(b: &bool) -> bool {
    !*b
}

fn u64_is_zero(n: &u64) -> bool {
    *n == 0
}

fn u32_is_zero(n: &u32) -> bool {
    *n == 0
}

fn duration_is_zero(d: &Duration) -> bool {
    d.is_zero()
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
