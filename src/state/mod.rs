//! The reconciliation index: persisted agent state and its durable store.

pub mod store;
pub mod types;

pub use store::{StateError, StateStore};
pub use types::{AgentPatch, AgentState, AppState, PassageMap, STATE_VERSION};

/// Default state file name, resolved in the working directory.
pub const DEFAULT_STATE_FILE: &str = ".repo-expert-state.json";
