//! The watch orchestrator: keep agents in step with their repos.
//!
//! One cooperative loop drives every watched repo. Work arrives from two
//! merged sources:
//!
//! 1. **Poll timer** — every `interval`, compare `git rev-parse HEAD` with
//!    the stored last-synced commit; on movement, sync the files `git diff
//!    --name-only` reports (or everything, when no commit is stored).
//! 2. **Filesystem events** — a recursive watcher per repo feeds a pending
//!    set, coalesced by a debounce timer. An event-driven sync runs even
//!    when HEAD is unchanged, capturing unstaged edits.
//!
//! Per repo, at most one sync is in flight at a time; concurrent triggers
//! coalesce. Consecutive failures back the repo off exponentially (capped);
//! a success resets the counter. Every state write goes through the store's
//! read-modify-write path, and all writes happen on this loop, so
//! interleaved repo updates cannot clobber each other.
//!
//! Shutdown is cooperative: on cancellation the loop stops starting work,
//! drops the watchers, then awaits in-flight syncs (persisting their
//! results) before returning.

pub mod backoff;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use expert_git::{GitError, GitRepo};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::{self, Chunker};
use crate::collect::{self, CollectError};
use crate::config::{Config, RepoConfig};
use crate::provider::Provider;
use crate::state::{AgentPatch, AppState, StateError, StateStore};
use crate::sync::{self, SyncError, SyncOptions, SyncOutcome};

pub use backoff::backoff_delay;

/// Default HEAD poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Default debounce window for filesystem events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Cap on the failure backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(900);

// ---------------------------------------------------------------------------
// Options and errors
// ---------------------------------------------------------------------------

/// Watch loop knobs.
#[derive(Clone, Copy, Debug)]
pub struct WatchOptions {
    /// HEAD poll interval.
    pub interval: Duration,
    /// Debounce window for filesystem events.
    pub debounce: Duration,
    /// Cap on the failure backoff.
    pub max_backoff: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// Errors that prevent the watch loop from starting. Once running, the
/// loop catches, logs, and backs off instead of failing.
#[derive(Debug, Error)]
pub enum WatchError {
    /// A requested repo is not in the config.
    #[error("unknown repo `{0}`\n  To fix: declare it under `repos:` in the config.")]
    UnknownRepo(String),

    /// A requested repo has no agent yet.
    #[error("repo `{0}` has no agent\n  To fix: run `repo-expert setup {0}` first.")]
    NoAgent(String),

    /// Initial state load failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// The filesystem watcher could not be started.
    #[error("failed to start filesystem watcher: {0}")]
    Notify(#[from] notify::Error),
}

// ---------------------------------------------------------------------------
// Internal plumbing
// ---------------------------------------------------------------------------

/// Why a sync was started — determines how the changed set is computed.
enum SyncKind {
    /// HEAD moved; sync the diff (or everything when `since` is `None`).
    Poll { head: String, since: Option<String> },
    /// Debounced filesystem events; sync exactly these files.
    Event { files: Vec<String> },
}

/// Errors a sync task can end with. Per-file provider failures are not
/// errors; they ride inside the outcome.
#[derive(Debug)]
enum SyncTaskError {
    Git(GitError),
    Collect(CollectError),
    Cancelled,
}

impl std::fmt::Display for SyncTaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Git(e) => write!(f, "{e}"),
            Self::Collect(e) => write!(f, "{e}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

struct SyncDone {
    repo_idx: usize,
    result: Result<SyncOutcome, SyncTaskError>,
}

/// Per-repo watch state.
struct RepoWatch {
    name: String,
    cfg: Arc<RepoConfig>,
    git: GitRepo,
    chunker: Arc<dyn Chunker>,
    /// Canonicalized repo root, for stripping event paths.
    canonical_root: PathBuf,
    /// Debounced event paths, agent-root-relative.
    pending: BTreeSet<String>,
    /// When the pending set should be drained.
    debounce_deadline: Option<Instant>,
    /// At most one sync in flight per repo.
    syncing: bool,
    /// Consecutive failed syncs.
    failures: u32,
    /// No sync may start before this instant.
    next_allowed: Instant,
    /// Keeps the recursive watcher alive.
    _watcher: RecommendedWatcher,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Watch `repo_names` until `cancel` fires.
///
/// # Errors
/// Startup failures only; see [`WatchError`].
pub async fn watch_repos(
    provider: Arc<dyn Provider>,
    config: &Config,
    repo_names: &[String],
    store: Arc<StateStore>,
    cancel: CancellationToken,
    opts: WatchOptions,
) -> Result<(), WatchError> {
    let state = store.load().await?;

    // The state file may live inside a watched repo; its events must never
    // trigger a sync.
    let state_path = canonical_or_absolute(store.path());

    let (event_tx, event_rx) = mpsc::unbounded_channel::<(usize, PathBuf)>();
    let mut repos = Vec::with_capacity(repo_names.len());
    for (idx, name) in repo_names.iter().enumerate() {
        let cfg = config
            .repo(name)
            .ok_or_else(|| WatchError::UnknownRepo(name.clone()))?;
        if state.agent(name).is_none() {
            return Err(WatchError::NoAgent(name.clone()));
        }
        repos.push(start_repo_watch(idx, name, cfg, &state_path, &event_tx)?);
    }

    info!(
        "watching {} repo(s), poll interval {:?}, debounce {:?}",
        repos.len(),
        opts.interval,
        opts.debounce
    );

    let mut orchestrator = Orchestrator {
        provider,
        store,
        opts,
        repos,
        state,
        cancel: cancel.clone(),
        tasks: JoinSet::new(),
        task_repos: HashMap::new(),
    };
    orchestrator.run(event_rx).await;
    Ok(())
}

fn start_repo_watch(
    idx: usize,
    name: &str,
    cfg: &RepoConfig,
    state_path: &Path,
    event_tx: &mpsc::UnboundedSender<(usize, PathBuf)>,
) -> Result<RepoWatch, WatchError> {
    let root = collect::agent_root(cfg);
    let canonical_root = canonical_or_absolute(&root);
    let ignored = state_path.to_path_buf();
    let tx = event_tx.clone();

    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, _>| {
        let Ok(event) = res else { return };
        for path in event.paths {
            // Self-trigger suppression: writes to the state file are ours.
            if path == ignored {
                continue;
            }
            let _ = tx.send((idx, path));
        }
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;

    Ok(RepoWatch {
        name: name.to_owned(),
        cfg: Arc::new(cfg.clone()),
        git: GitRepo::new(&cfg.path),
        chunker: Arc::from(chunk::chunker_for(cfg.chunker)),
        canonical_root,
        pending: BTreeSet::new(),
        debounce_deadline: None,
        syncing: false,
        failures: 0,
        next_allowed: Instant::now(),
        _watcher: watcher,
    })
}

fn canonical_or_absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    })
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

struct Orchestrator {
    provider: Arc<dyn Provider>,
    store: Arc<StateStore>,
    opts: WatchOptions,
    repos: Vec<RepoWatch>,
    /// In-memory view of the persisted state, refreshed on every write.
    state: AppState,
    cancel: CancellationToken,
    tasks: JoinSet<SyncDone>,
    /// Task ID → repo index, so a panicked task still releases its repo.
    task_repos: HashMap<tokio::task::Id, usize>,
}

impl Orchestrator {
    async fn run(&mut self, mut event_rx: mpsc::UnboundedReceiver<(usize, PathBuf)>) {
        let mut poll = tokio::time::interval(self.opts.interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; syncing right at startup is
        // what we want after a gap between runs.

        loop {
            let next_debounce = self.repos.iter().filter_map(|r| r.debounce_deadline).min();

            tokio::select! {
                () = self.cancel.cancelled() => break,

                _ = poll.tick() => {
                    for idx in 0..self.repos.len() {
                        self.poll_repo(idx).await;
                    }
                }

                Some((idx, path)) = event_rx.recv() => {
                    self.note_event(idx, &path);
                    // Drain whatever else is already queued before
                    // re-entering select, so bursts stay one wakeup.
                    while let Ok((idx, path)) = event_rx.try_recv() {
                        self.note_event(idx, &path);
                    }
                }

                Some(done) = self.tasks.join_next_with_id() => {
                    self.reap(done).await;
                }

                () = sleep_until_opt(next_debounce), if next_debounce.is_some() => {
                    self.fire_due_debounces();
                }
            }
        }

        self.shutdown().await;
    }

    /// Clean shutdown: stop event sources, then drain in-flight syncs,
    /// persisting their results.
    async fn shutdown(&mut self) {
        for repo in &mut self.repos {
            repo.debounce_deadline = None;
        }
        while let Some(done) = self.tasks.join_next_with_id().await {
            self.reap(done).await;
        }
        info!("watch loop stopped");
    }

    /// Handle one finished task, releasing its repo even on panic.
    async fn reap(&mut self, done: Result<(tokio::task::Id, SyncDone), tokio::task::JoinError>) {
        match done {
            Ok((id, done)) => {
                self.task_repos.remove(&id);
                self.handle_done(done).await;
            }
            Err(e) => {
                warn!("sync task panicked: {e}");
                if let Some(idx) = self.task_repos.remove(&e.id()) {
                    self.repos[idx].syncing = false;
                    self.record_failure(idx);
                }
            }
        }
    }

    // -- poll path ---------------------------------------------------------

    async fn poll_repo(&mut self, idx: usize) {
        if self.repos[idx].syncing || Instant::now() < self.repos[idx].next_allowed {
            return;
        }

        let git = self.repos[idx].git.clone();
        let head = match git.head().await {
            Ok(head) => head,
            Err(e) => {
                warn!("{}: failed to read HEAD: {e}", self.repos[idx].name);
                self.record_failure(idx);
                return;
            }
        };

        let stored = self
            .state
            .agent(&self.repos[idx].name)
            .and_then(|a| a.last_sync_commit.clone());

        if stored.as_deref() == Some(head.as_str()) {
            debug!("{}: no changes (HEAD={})", self.repos[idx].name, short_hash(&head));
            return;
        }

        info!(
            "{}: HEAD moved to {}, syncing",
            self.repos[idx].name,
            short_hash(&head)
        );
        self.spawn_sync(idx, SyncKind::Poll { head, since: stored });
    }

    // -- event path --------------------------------------------------------

    /// Normalize one watcher event and add it to the repo's pending set.
    fn note_event(&mut self, idx: usize, path: &Path) {
        let Some(repo) = self.repos.get_mut(idx) else {
            return;
        };
        let Some(rel) = normalize_event_path(&repo.cfg, &repo.canonical_root, path) else {
            return;
        };
        repo.pending.insert(rel);
        repo.debounce_deadline = Some(Instant::now() + self.opts.debounce);
    }

    /// Drain pending sets whose debounce window elapsed.
    fn fire_due_debounces(&mut self) {
        let now = Instant::now();
        for idx in 0..self.repos.len() {
            let due = self.repos[idx].debounce_deadline.is_some_and(|d| d <= now);
            if !due {
                continue;
            }

            // Busy or backing off: hold the pending set and try again
            // later; events keep coalescing meanwhile.
            if self.repos[idx].syncing || now < self.repos[idx].next_allowed {
                let retry_at = self.repos[idx].next_allowed.max(now + self.opts.debounce);
                self.repos[idx].debounce_deadline = Some(retry_at);
                continue;
            }

            self.repos[idx].debounce_deadline = None;
            let files: Vec<String> = std::mem::take(&mut self.repos[idx].pending)
                .into_iter()
                .collect();
            if files.is_empty() {
                continue;
            }
            info!("{}: [event] syncing {} file(s)", self.repos[idx].name, files.len());
            self.spawn_sync(idx, SyncKind::Event { files });
        }
    }

    // -- sync tasks --------------------------------------------------------

    fn spawn_sync(&mut self, idx: usize, kind: SyncKind) {
        let Some(agent) = self.state.agent(&self.repos[idx].name) else {
            warn!("{}: no agent in state; skipping sync", self.repos[idx].name);
            return;
        };
        let agent_id = agent.agent_id.clone();
        let old_passages = agent.passages.clone();

        let repo = &mut self.repos[idx];
        repo.syncing = true;

        let provider = Arc::clone(&self.provider);
        let cfg = Arc::clone(&repo.cfg);
        let chunker = Arc::clone(&repo.chunker);
        let git = repo.git.clone();
        let cancel = self.cancel.clone();
        let name = repo.name.clone();

        let handle = self.tasks.spawn(async move {
            let result = run_sync_task(
                provider.as_ref(),
                &cfg,
                chunker.as_ref(),
                &git,
                &name,
                &agent_id,
                &old_passages,
                kind,
                &cancel,
            )
            .await;
            SyncDone {
                repo_idx: idx,
                result,
            }
        });
        self.task_repos.insert(handle.id(), idx);
    }

    async fn handle_done(&mut self, done: SyncDone) {
        let idx = done.repo_idx;
        self.repos[idx].syncing = false;
        let name = self.repos[idx].name.clone();

        match done.result {
            Ok(outcome) => {
                self.repos[idx].failures = 0;
                self.repos[idx].next_allowed = Instant::now();
                if !outcome.failed_files.is_empty() {
                    warn!(
                        "{name}: {} file(s) failed to upload and keep their old passages",
                        outcome.failed_files.len()
                    );
                }
                info!(
                    "{name}: synced ({} re-indexed, {} removed)",
                    outcome.files_reindexed, outcome.files_removed
                );
                self.persist(&name, outcome).await;
            }
            Err(SyncTaskError::Cancelled) => {
                debug!("{name}: sync cancelled");
            }
            Err(e) => {
                warn!("{name}: sync failed: {e}");
                self.record_failure(idx);
            }
        }
    }

    /// Single-writer state persistence with re-read-before-write.
    async fn persist(&mut self, repo_name: &str, outcome: SyncOutcome) {
        let patch = AgentPatch {
            passages: Some(outcome.passages),
            last_sync_commit: outcome.last_sync_commit,
            last_sync_at: Some(chrono::Utc::now()),
            ..AgentPatch::default()
        };
        let name = repo_name.to_owned();
        let result = self
            .store
            .update(move |state| match state.agent(&name) {
                Some(agent) => {
                    let updated = agent.apply(patch);
                    state.with_agent(name.clone(), updated)
                }
                None => state,
            })
            .await;
        match result {
            Ok(new_state) => self.state = new_state,
            Err(e) => warn!("failed to persist state for {repo_name}: {e}"),
        }
    }

    fn record_failure(&mut self, idx: usize) {
        let repo = &mut self.repos[idx];
        repo.failures += 1;
        let delay = backoff_delay(repo.failures, self.opts.interval, self.opts.max_backoff);
        repo.next_allowed = Instant::now() + delay;
        warn!(
            "{}: {} consecutive failure(s), backing off {delay:?}",
            repo.name, repo.failures
        );
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// The sync task body
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_sync_task(
    provider: &dyn Provider,
    cfg: &RepoConfig,
    chunker: &dyn Chunker,
    git: &GitRepo,
    name: &str,
    agent_id: &str,
    old_passages: &crate::state::PassageMap,
    kind: SyncKind,
    cancel: &CancellationToken,
) -> Result<SyncOutcome, SyncTaskError> {
    let (head, changed, is_full) = match kind {
        SyncKind::Poll { head, since } => match since {
            None => {
                let all = collect::collect_paths(cfg, git).await.map_err(SyncTaskError::Collect)?;
                (head, all, true)
            }
            Some(since) => match git.changed_files(&since).await {
                Ok(repo_relative) => {
                    let changed = collect::expand_changed(cfg, git, &repo_relative)
                        .await
                        .map_err(SyncTaskError::Collect)?;
                    (head, changed, false)
                }
                // The stored commit is gone (rewritten history, gc). The
                // only safe reconciliation is a full pass.
                Err(GitError::DiffFailed { range, stderr }) => {
                    warn!("{name}: diff failed for {range} ({stderr}); falling back to full re-index");
                    let all =
                        collect::collect_paths(cfg, git).await.map_err(SyncTaskError::Collect)?;
                    (head, all, true)
                }
                Err(e) => return Err(SyncTaskError::Git(e)),
            },
        },
        SyncKind::Event { files } => {
            // Event-driven syncs run even when HEAD is unchanged; the
            // current HEAD is still recorded as the sync point.
            let head = git.head().await.map_err(SyncTaskError::Git)?;
            (head, files, false)
        }
    };

    let opts = SyncOptions {
        progress: None,
        cancel: Some(cancel),
        is_full_reindex: is_full,
    };
    match sync::sync_repo(provider, cfg, chunker, agent_id, old_passages, &changed, Some(head), &opts)
        .await
    {
        Ok(outcome) => Ok(outcome),
        Err(SyncError::Cancelled) => Err(SyncTaskError::Cancelled),
    }
}

// ---------------------------------------------------------------------------
// Event-path normalization
// ---------------------------------------------------------------------------

/// Map a raw watcher path to an agent-root-relative indexable path.
///
/// Watcher payloads vary by platform: absolute or repo-relative, and
/// backslash-separated on Windows. Anything that does not resolve to an
/// indexable file under the agent root yields `None`.
fn normalize_event_path(cfg: &RepoConfig, canonical_root: &Path, path: &Path) -> Option<String> {
    let text = path.to_str()?.replace('\\', "/");
    let text = text.strip_prefix("./").unwrap_or(&text);

    let rel = if Path::new(text).is_absolute() {
        let root = canonical_root.to_str()?;
        let stripped = text.strip_prefix(root)?;
        stripped.strip_prefix('/').unwrap_or(stripped).to_owned()
    } else {
        collect::strip_base_path(cfg, text)?
    };

    if rel.is_empty() || !collect::path_matches(cfg, &rel) {
        return None;
    }
    Some(rel)
}

/// First seven characters of a commit hash, for logs.
fn short_hash(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
