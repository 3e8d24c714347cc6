//! Trigger events and run keys.

use serde::{Deserialize, Serialize};

use crate::domain::error::BuildGateError;

/// What kind of external event started a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Commits pushed to a ref.
    Push,
    /// Pull request opened or updated.
    PullRequest,
    /// Dispatched by hand.
    #[serde(alias = "workflow_dispatch")]
    Manual,
}

impl TriggerKind {
    /// Every trigger kind, in declaration order.
    pub const ALL: [TriggerKind; 3] = [
        TriggerKind::Push,
        TriggerKind::PullRequest,
        TriggerKind::Manual,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = BuildGateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(TriggerKind::PullRequest),
            "manual" | "workflow_dispatch" => Ok(TriggerKind::Manual),
            other => Err(BuildGateError::UnknownTrigger(other.to_string())),
        }
    }
}

/// An external event asking for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    pub kind: TriggerKind,

    /// Git ref the event concerns (e.g. "refs/heads/main", "refs/pull/7/merge").
    #[serde(rename = "ref")]
    pub git_ref: String,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
        }
    }

    pub fn push(git_ref: impl Into<String>) -> Self {
        Self::new(TriggerKind::Push, git_ref)
    }

    pub fn pull_request(git_ref: impl Into<String>) -> Self {
        Self::new(TriggerKind::PullRequest, git_ref)
    }

    pub fn manual(git_ref: impl Into<String>) -> Self {
        Self::new(TriggerKind::Manual, git_ref)
    }

    /// Run key for this event under the given workflow.
    pub fn run_key(&self, workflow: &str) -> RunKey {
        RunKey::derive(workflow, &self.git_ref)
    }
}

/// Concurrency identity of a run: `"<workflow>-<ref>"`.
///
/// Two events for the same workflow and ref map to the same key, so the
/// later one supersedes the earlier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey(String);

impl RunKey {
    pub fn derive(workflow: &str, git_ref: &str) -> Self {
        RunKey(format!("{workflow}-{git_ref}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
