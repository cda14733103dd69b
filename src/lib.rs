//! repo-expert core — keeps long-lived AI expert agents in step with git
//! repositories.
//!
//! Each configured repo gets one agent at a remote memory-service provider.
//! The agent's archival memory mirrors the repo's indexable files; this
//! crate owns the machinery that keeps the mirror honest:
//!
//! - [`state`] — the durable reconciliation index (crash-safe JSON file)
//! - [`collect`] — which files an agent sees, and how their paths look
//! - [`chunk`] — file → passage chunking strategies
//! - [`provider`] — the memory-service port, retry discipline, Letta client
//! - [`sync`] — copy-on-write reconciliation of one repo's passage set
//! - [`setup`] — resumable cold-start (create → index → bootstrap)
//! - [`watch`] — the concurrent poll + fs-event auto-sync loop
//! - [`broadcast`] / [`cache`] — query fan-out and answer caching
//!
//! The CLI binary lives in the `expert-cli` crate; git subprocess plumbing
//! lives in `expert-git`.

pub mod broadcast;
pub mod cache;
pub mod chunk;
pub mod collect;
pub mod config;
pub mod prompts;
pub mod provider;
pub mod setup;
pub mod state;
pub mod sync;
pub mod watch;

pub use config::{Config, ConfigError, RepoConfig};
pub use state::{AgentState, AppState, StateStore};
