//! Persisted reconciliation state.
//!
//! [`AppState`] is the single value persisted to the state file. Higher
//! layers treat it as immutable: updates derive a new value via
//! [`AppState::with_agent`] / [`AgentState::apply`] and persist it through
//! the store. The on-disk shape is the versioned JSON document described in
//! the state-file section of the README (camelCase keys, `stateVersion`,
//! `agents` map).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current on-disk schema version.
pub const STATE_VERSION: u32 = 2;

/// Mapping from agent-relative file path to the ordered passage IDs that
/// currently represent that file on the provider.
pub type PassageMap = BTreeMap<String, Vec<String>>;

// ---------------------------------------------------------------------------
// AgentState
// ---------------------------------------------------------------------------

/// Persisted record of one repo's agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    /// Opaque agent ID issued by the provider.
    pub agent_id: String,

    /// The repo this agent serves (key in the config's `repos:` map).
    pub repo_name: String,

    /// File path → non-empty ordered passage-ID list.
    #[serde(default)]
    pub passages: PassageMap,

    /// When the bootstrap prompt sequence last completed, if ever.
    #[serde(default)]
    pub last_bootstrap: Option<DateTime<Utc>>,

    /// HEAD commit of the last completed sync; `None` iff no sync completed.
    #[serde(default)]
    pub last_sync_commit: Option<String>,

    /// When the last sync completed.
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,

    /// When the agent was created.
    pub created_at: DateTime<Utc>,
}

impl AgentState {
    /// Fresh record for a newly created agent.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, repo_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            repo_name: repo_name.into(),
            passages: PassageMap::new(),
            last_bootstrap: None,
            last_sync_commit: None,
            last_sync_at: None,
            created_at: Utc::now(),
        }
    }

    /// Derive a new state with the patch's set fields applied.
    #[must_use]
    pub fn apply(&self, patch: AgentPatch) -> Self {
        let mut next = self.clone();
        if let Some(passages) = patch.passages {
            next.passages = passages;
        }
        if let Some(ts) = patch.last_bootstrap {
            next.last_bootstrap = Some(ts);
        }
        if let Some(commit) = patch.last_sync_commit {
            next.last_sync_commit = Some(commit);
        }
        if let Some(ts) = patch.last_sync_at {
            next.last_sync_at = Some(ts);
        }
        next
    }
}

/// The mutable subset of [`AgentState`], for explicit state transitions.
///
/// Unset fields leave the current value untouched.
#[derive(Clone, Debug, Default)]
pub struct AgentPatch {
    /// Replace the passage map.
    pub passages: Option<PassageMap>,
    /// Record a completed bootstrap.
    pub last_bootstrap: Option<DateTime<Utc>>,
    /// Record the commit a sync completed at.
    pub last_sync_commit: Option<String>,
    /// Record when a sync completed.
    pub last_sync_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Top-level persisted structure: schema version plus one record per repo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppState {
    /// On-disk schema version; always [`STATE_VERSION`] in memory.
    pub state_version: u32,

    /// Repo name → agent record.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentState>,
}

impl AppState {
    /// The state used when no file exists yet.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            state_version: STATE_VERSION,
            agents: BTreeMap::new(),
        }
    }

    /// Agent record for `repo_name`, if one exists.
    #[must_use]
    pub fn agent(&self, repo_name: &str) -> Option<&AgentState> {
        self.agents.get(repo_name)
    }

    /// Derive a new state with `agent` inserted under `repo_name`.
    #[must_use]
    pub fn with_agent(&self, repo_name: impl Into<String>, agent: AgentState) -> Self {
        let mut next = self.clone();
        next.agents.insert(repo_name.into(), agent);
        next
    }

    /// Derive a new state without the record for `repo_name`.
    #[must_use]
    pub fn without_agent(&self, repo_name: &str) -> Self {
        let mut next = self.clone();
        next.agents.remove(repo_name);
        next
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_only_touches_set_fields() {
        let agent = AgentState::new("ag-1", "myrepo");
        let mut passages = PassageMap::new();
        passages.insert("src/a.rs".to_owned(), vec!["p-1".to_owned()]);

        let patched = agent.apply(AgentPatch {
            passages: Some(passages.clone()),
            last_sync_commit: Some("abc123".to_owned()),
            ..AgentPatch::default()
        });

        assert_eq!(patched.passages, passages);
        assert_eq!(patched.last_sync_commit.as_deref(), Some("abc123"));
        assert_eq!(patched.last_bootstrap, None);
        assert_eq!(patched.created_at, agent.created_at);
    }

    #[test]
    fn json_shape_uses_camel_case() {
        let state = AppState::empty().with_agent("r", AgentState::new("ag-1", "r"));
        let json = serde_json::to_value(&state).expect("serialize");
        assert_eq!(json["stateVersion"], STATE_VERSION);
        assert!(json["agents"]["r"]["agentId"].is_string());
        assert!(json["agents"]["r"]["lastSyncCommit"].is_null());
        assert!(json["agents"]["r"]["createdAt"].is_string());
    }

    #[test]
    fn functional_updates_leave_original_untouched() {
        let base = AppState::empty();
        let with = base.with_agent("r", AgentState::new("ag-1", "r"));
        assert!(base.agents.is_empty());
        assert_eq!(with.agents.len(), 1);
        assert!(with.without_agent("r").agents.is_empty());
    }
}
