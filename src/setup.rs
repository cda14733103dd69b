//! Cold-start pipeline: create → index → bootstrap, resumable.
//!
//! The pipeline inspects the persisted [`AgentState`] and derives a
//! [`SetupMode`] — so a crash between stages resumes at the right place on
//! the next run instead of repeating work. State is persisted after every
//! stage through the store's read-modify-write path.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use expert_git::{GitError, GitRepo};
use thiserror::Error;
use tracing::{info, warn};

use crate::chunk::Chunker;
use crate::collect::{self, CollectError};
use crate::config::{ProviderSettings, RepoConfig};
use crate::prompts;
use crate::provider::{CreateAgentParams, Provider, ProviderError, SendOpts};
use crate::state::{AgentPatch, AgentState, StateError, StateStore};
use crate::sync::{self, SyncError, SyncOptions};

/// Default wall-clock budget for one passage-loading attempt.
pub const INDEX_TIMEOUT: Duration = Duration::from_secs(300);

/// Default wall-clock budget for one bootstrap message.
pub const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Modes and options
// ---------------------------------------------------------------------------

/// What the pipeline decided to do, given the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupMode {
    /// No agent yet: create, index everything, optionally bootstrap.
    Create,
    /// Agent exists but indexing never completed: index everything.
    ResumeFull,
    /// Indexed, but the bootstrap stage never completed: bootstrap only.
    ResumeBootstrap,
    /// Operator requested a full re-index of an existing agent.
    ReindexFull,
    /// Everything is current.
    Skip,
}

impl fmt::Display for SetupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::ResumeFull => "resume_full",
            Self::ResumeBootstrap => "resume_bootstrap",
            Self::ReindexFull => "reindex_full",
            Self::Skip => "skip",
        };
        write!(f, "{s}")
    }
}

/// Pipeline knobs.
#[derive(Clone, Copy, Debug)]
pub struct SetupOptions {
    /// Force a full re-index even when the agent looks current.
    pub reindex: bool,
    /// Budget for one indexing attempt.
    pub index_timeout: Duration,
    /// Budget for one bootstrap message.
    pub bootstrap_timeout: Duration,
    /// Extra attempts per stage after the first.
    pub stage_retries: u32,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            reindex: false,
            index_timeout: INDEX_TIMEOUT,
            bootstrap_timeout: BOOTSTRAP_TIMEOUT,
            stage_retries: 2,
        }
    }
}

/// What a setup run did.
#[derive(Clone, Debug)]
pub struct SetupReport {
    /// The mode the pipeline ran in.
    pub mode: SetupMode,
    /// The agent serving this repo.
    pub agent_id: String,
    /// Files re-indexed by the indexing stage (0 when skipped).
    pub files_indexed: usize,
    /// Whether the bootstrap stage ran to completion in this invocation.
    pub bootstrapped: bool,
}

/// Errors that abort the pipeline.
#[derive(Debug, Error)]
pub enum SetupError {
    /// State file load/save failure.
    #[error(transparent)]
    State(#[from] StateError),

    /// Git query failure.
    #[error(transparent)]
    Git(#[from] GitError),

    /// File enumeration failure.
    #[error(transparent)]
    Collect(#[from] CollectError),

    /// Agent creation failed (after the provider's own retries).
    #[error("failed to create agent: {0}")]
    CreateAgent(#[source] ProviderError),

    /// Passage loading kept failing after the stage's retry budget.
    #[error("indexing failed for {} file(s) after retries: {}", failed.len(), failed.join(", "))]
    IndexIncomplete {
        /// Files that still had upload failures.
        failed: Vec<String>,
    },

    /// A stage hit its timeout on every attempt.
    #[error("{stage} stage timed out after {attempts} attempt(s) of {timeout:?}")]
    StageTimeout {
        /// Stage name, for the operator.
        stage: &'static str,
        /// Attempts made.
        attempts: u32,
        /// Per-attempt budget.
        timeout: Duration,
    },

    /// Bootstrap messaging failed after retries.
    #[error("bootstrap failed: {0}")]
    Bootstrap(#[source] ProviderError),

    /// The sync pass was cancelled.
    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ---------------------------------------------------------------------------
// Mode detection
// ---------------------------------------------------------------------------

/// Derive the mode from the persisted agent state and flags.
#[must_use]
pub fn determine_mode(agent: Option<&AgentState>, cfg: &RepoConfig, reindex: bool) -> SetupMode {
    let Some(agent) = agent else {
        return SetupMode::Create;
    };
    if reindex {
        return SetupMode::ReindexFull;
    }
    if agent.passages.is_empty() || agent.last_sync_commit.is_none() {
        return SetupMode::ResumeFull;
    }
    if cfg.bootstrap_on_create && agent.last_bootstrap.is_none() {
        return SetupMode::ResumeBootstrap;
    }
    SetupMode::Skip
}

// ---------------------------------------------------------------------------
// The pipeline
// ---------------------------------------------------------------------------

/// Run the cold-start pipeline for one repo.
///
/// # Errors
/// See [`SetupError`]. Per-file sync failures only surface once the
/// stage's retry budget is exhausted.
#[allow(clippy::too_many_arguments)]
pub async fn run_setup(
    provider: &dyn Provider,
    settings: &ProviderSettings,
    cfg: &RepoConfig,
    repo_name: &str,
    store: &StateStore,
    chunker: &dyn Chunker,
    opts: &SetupOptions,
) -> Result<SetupReport, SetupError> {
    let state = store.load().await?;
    let mode = determine_mode(state.agent(repo_name), cfg, opts.reindex);
    info!("setup mode for {repo_name}: {mode}");

    let mut agent = match state.agent(repo_name) {
        Some(agent) => agent.clone(),
        None => create_stage(provider, settings, cfg, repo_name, store).await?,
    };

    let mut files_indexed = 0;
    if matches!(mode, SetupMode::Create | SetupMode::ResumeFull | SetupMode::ReindexFull) {
        let (updated, count) = index_stage(provider, cfg, repo_name, &agent, store, chunker, opts)
            .await?;
        agent = updated;
        files_indexed = count;
    }

    let wants_bootstrap = cfg.bootstrap_on_create && agent.last_bootstrap.is_none();
    let mut bootstrapped = false;
    if wants_bootstrap && mode != SetupMode::Skip {
        agent = bootstrap_stage(provider, repo_name, &agent, store, opts).await?;
        bootstrapped = true;
    }

    Ok(SetupReport {
        mode,
        agent_id: agent.agent_id,
        files_indexed,
        bootstrapped,
    })
}

/// Create the agent and persist its record before anything else runs.
async fn create_stage(
    provider: &dyn Provider,
    settings: &ProviderSettings,
    cfg: &RepoConfig,
    repo_name: &str,
    store: &StateStore,
) -> Result<AgentState, SetupError> {
    let params = CreateAgentParams {
        name: format!("{repo_name}-expert"),
        repo_name: repo_name.to_owned(),
        description: cfg.description.clone(),
        tags: cfg.tags.clone(),
        model: settings.model.clone(),
        embedding: settings.embedding.clone(),
        memory_block_limit: cfg.memory_block_limit,
        persona: cfg.persona.clone(),
        tools: cfg.tools.clone(),
    };
    let agent_id = provider
        .create_agent(&params)
        .await
        .map_err(SetupError::CreateAgent)?;
    info!("created agent {agent_id} for {repo_name}");

    let agent = AgentState::new(agent_id, repo_name);
    let persisted = agent.clone();
    store.update(move |s| s.with_agent(repo_name.to_owned(), persisted)).await?;
    Ok(agent)
}

/// Index all files, retrying failed files within the stage budget.
async fn index_stage(
    provider: &dyn Provider,
    cfg: &RepoConfig,
    repo_name: &str,
    agent: &AgentState,
    store: &StateStore,
    chunker: &dyn Chunker,
    opts: &SetupOptions,
) -> Result<(AgentState, usize), SetupError> {
    let git = GitRepo::new(&cfg.path);
    let head = git.head().await?;
    let all_paths = collect::collect_paths(cfg, &git).await?;

    // A full pass also reconciles map entries whose files vanished since
    // the last sync, so the changed set is the union of both.
    let mut changed: Vec<String> = all_paths;
    changed.extend(agent.passages.keys().cloned());
    changed.sort();
    changed.dedup();

    let mut passages = agent.passages.clone();
    let mut files_indexed = 0;
    let mut attempts = 0;
    let max_attempts = opts.stage_retries + 1;

    loop {
        attempts += 1;
        let sync_opts = SyncOptions {
            is_full_reindex: true,
            ..SyncOptions::default()
        };
        let pass = tokio::time::timeout(
            opts.index_timeout,
            sync::sync_repo(
                provider,
                cfg,
                chunker,
                &agent.agent_id,
                &passages,
                &changed,
                Some(head.clone()),
                &sync_opts,
            ),
        )
        .await;

        match pass {
            Err(_elapsed) => {
                warn!("indexing attempt {attempts} for {repo_name} timed out");
                if attempts >= max_attempts {
                    return Err(SetupError::StageTimeout {
                        stage: "indexing",
                        attempts,
                        timeout: opts.index_timeout,
                    });
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(outcome)) => {
                files_indexed += outcome.files_reindexed;
                passages = outcome.passages.clone();

                if outcome.failed_files.is_empty() {
                    let patch = AgentPatch {
                        passages: Some(outcome.passages),
                        last_sync_commit: outcome.last_sync_commit,
                        last_sync_at: Some(Utc::now()),
                        ..AgentPatch::default()
                    };
                    let updated = agent.apply(patch);
                    let persisted = updated.clone();
                    store
                        .update(move |s| s.with_agent(repo_name.to_owned(), persisted))
                        .await?;
                    return Ok((updated, files_indexed));
                }

                warn!(
                    "indexing attempt {attempts} for {repo_name}: {} file(s) failed",
                    outcome.failed_files.len()
                );
                if attempts >= max_attempts {
                    return Err(SetupError::IndexIncomplete {
                        failed: outcome.failed_files,
                    });
                }
                changed = outcome.failed_files;
            }
        }
    }
}

/// Send the bootstrap sequence, then record completion.
async fn bootstrap_stage(
    provider: &dyn Provider,
    repo_name: &str,
    agent: &AgentState,
    store: &StateStore,
    opts: &SetupOptions,
) -> Result<AgentState, SetupError> {
    let max_attempts = opts.stage_retries + 1;

    for message in prompts::bootstrap_sequence(repo_name) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let send = tokio::time::timeout(
                opts.bootstrap_timeout,
                provider.send_message(&agent.agent_id, &message, &SendOpts::default()),
            )
            .await;
            match send {
                Ok(Ok(_reply)) => break,
                Ok(Err(e)) if attempts >= max_attempts => return Err(SetupError::Bootstrap(e)),
                Ok(Err(e)) => warn!("bootstrap message failed (attempt {attempts}): {e}"),
                Err(_elapsed) if attempts >= max_attempts => {
                    return Err(SetupError::StageTimeout {
                        stage: "bootstrap",
                        attempts,
                        timeout: opts.bootstrap_timeout,
                    });
                }
                Err(_elapsed) => warn!("bootstrap message timed out (attempt {attempts})"),
            }
        }
    }

    let updated = agent.apply(AgentPatch {
        last_bootstrap: Some(Utc::now()),
        ..AgentPatch::default()
    });
    let persisted = updated.clone();
    store.update(move |s| s.with_agent(repo_name.to_owned(), persisted)).await?;
    info!("bootstrap complete for {repo_name}");
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
