//! Shared data model for LumenFlow: the Work Unit record, its lifecycle
//! status, the event log's record shape, and the error taxonomy every
//! other crate in the workspace propagates.
//!
//! This crate does no I/O; it exists so `lumenflow-yaml`, `lumenflow-state`,
//! and `lumenflow-core` can agree on one definition of a WU without a
//! dependency cycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A Work Unit identifier of the shape `WU-<positive-integer>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WuId(pub u64);

impl WuId {
    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn number(self) -> u64 {
        self.0
    }

    /// Lowercased slug suitable for branch/worktree names (`wu-123`).
    pub fn slug(self) -> String {
        format!("wu-{}", self.0)
    }
}

impl fmt::Display for WuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WU-{}", self.0)
    }
}

impl FromStr for WuId {
    type Err = ParseWuIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("WU-").ok_or(ParseWuIdError::BadPrefix)?;
        let n: u64 = rest.parse().map_err(|_| ParseWuIdError::BadNumber)?;
        if n == 0 {
            return Err(ParseWuIdError::BadNumber);
        }
        Ok(Self(n))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseWuIdError {
    #[error("id does not start with \"WU-\"")]
    BadPrefix,
    #[error("id suffix is not a positive integer")]
    BadNumber,
}

impl Serialize for WuId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WuId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Finite-state lifecycle status, plus the transient `completed` alias
/// some producers emit in place of `done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ready,
    InProgress,
    Blocked,
    Done,
    /// Transient alias for `Done`; normalised away by the YAML store.
    Completed,
}

impl Status {
    /// Collapse the `Completed` alias into its canonical `Done` value.
    pub fn normalize(self) -> Self {
        match self {
            Status::Completed => Status::Done,
            other => other,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self.normalize(), Status::Done)
    }
}

/// Enumerated WU type. `Documentation` and `Process` are exempt from
/// code-path and test requirements (spec.md §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WuType {
    Engineering,
    Documentation,
    Process,
    Bug,
    Refactor,
}

impl WuType {
    pub fn exempt_from_code_and_test_requirements(self) -> bool {
        matches!(self, WuType::Documentation | WuType::Process)
    }
}

/// Two-part classifier `Parent: Sublane` (e.g. `Operations: Tooling`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Lane {
    pub parent: String,
    pub sublane: String,
}

impl Lane {
    pub fn new(parent: impl Into<String>, sublane: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            sublane: sublane.into(),
        }
    }

    /// Lowercase, non-alphanumerics collapsed to `-`; colons and spaces
    /// collapse together (spec.md §6 worktree-dir naming rule).
    pub fn slug(&self) -> String {
        let combined = format!("{}-{}", self.parent, self.sublane);
        let mut out = String::with_capacity(combined.len());
        let mut last_was_dash = false;
        for ch in combined.chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch.to_ascii_lowercase());
                last_was_dash = false;
            } else if !last_was_dash {
                out.push('-');
                last_was_dash = true;
            }
        }
        out.trim_matches('-').to_string()
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.parent, self.sublane)
    }
}

impl TryFrom<String> for Lane {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (parent, sublane) = value
            .split_once(':')
            .ok_or_else(|| format!("lane \"{value}\" is not of the form \"Parent: Sublane\""))?;
        Ok(Lane::new(parent.trim(), sublane.trim()))
    }
}

impl From<Lane> for String {
    fn from(lane: Lane) -> Self {
        lane.to_string()
    }
}

/// `{unit, e2e, integration, manual}` test path lists (spec.md §3.1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestPaths {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unit: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub e2e: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integration: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manual: Vec<String>,
}

impl TestPaths {
    pub fn is_empty(&self) -> bool {
        self.unit.is_empty()
            && self.e2e.is_empty()
            && self.integration.is_empty()
            && self.manual.is_empty()
    }

    /// True if at least one automated (non-manual) list is non-empty.
    pub fn has_automated(&self) -> bool {
        !self.unit.is_empty() || !self.e2e.is_empty() || !self.integration.is_empty()
    }
}

/// Acceptance statements: either a flat list, or a nested mapping of
/// section name to statements (spec.md §3.1). Order-preserving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Acceptance {
    List(Vec<String>),
    Mapping(IndexMap<String, Vec<String>>),
}

impl Default for Acceptance {
    fn default() -> Self {
        Acceptance::List(Vec::new())
    }
}

impl Acceptance {
    pub fn is_empty(&self) -> bool {
        match self {
            Acceptance::List(v) => v.is_empty(),
            Acceptance::Mapping(m) => m.values().all(|v| v.is_empty()),
        }
    }
}

/// Escalation record carried on a WU.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub escalation_triggers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_resolved_at: Option<DateTime<Utc>>,
}

impl Escalation {
    pub fn is_unresolved(&self) -> bool {
        !self.escalation_triggers.is_empty() && self.escalation_resolved_by.is_none()
    }
}

/// A Work Unit record (spec.md §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: WuId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub lane: Lane,
    #[serde(rename = "type")]
    pub wu_type: WuType,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<NaiveDate>,
    #[serde(default)]
    pub locked: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "TestPaths::is_empty")]
    pub tests: TestPaths,
    #[serde(default, skip_serializing_if = "Acceptance::is_empty")]
    pub acceptance: Acceptance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<WuId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<WuId>,
    #[serde(flatten)]
    pub escalation: Escalation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
}

impl WorkUnit {
    /// (I2) the done-state invariant, checked against the WU's own fields
    /// only (stamp existence and event-log fold are checked elsewhere).
    pub fn satisfies_done_field_invariant(&self) -> bool {
        self.status.normalize() == Status::Done
            && self.locked
            && self.completed_at.is_some()
            && self.completed.is_some()
    }
}

/// Event kinds appended to the event log (spec.md §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Claim,
    Release,
    Complete,
    Block,
    Unblock,
    Create,
}

/// One line of the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(rename = "wuId")]
    pub wu_id: WuId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Unknown fields are ignored on read, per spec.md §6.
    #[serde(flatten, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// The error taxonomy of spec.md §7: kinds, not type names. Every variant
/// carries enough structured detail for a CLI adapter to render the
/// four-part user-visible error shape (§7) without re-deriving it.
#[derive(Debug, thiserror::Error)]
pub enum LumenError {
    #[error("{message}")]
    Validation { message: String },

    #[error("file not found: {path}")]
    FileNotFound { path: String },

    #[error("git {args:?} failed (exit {exit_code:?}): {stderr}")]
    Git {
        args: Vec<String>,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("{message}")]
    Schema { message: String },

    #[error("recovery failed: {message}")]
    Recovery { message: String },

    #[error("retry exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },
}

impl LumenError {
    /// Process exit code per spec.md §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            LumenError::Validation { .. } | LumenError::Schema { .. } => 2,
            LumenError::Git { .. } => 3,
            LumenError::RetryExhausted { .. } => 4,
            LumenError::FileNotFound { .. } | LumenError::Recovery { .. } => 1,
        }
    }
}
