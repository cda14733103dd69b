//! The reconciliation core: copy-on-write sync of one repo's passage set.
//!
//! Given the agent's current passage map and a set of changed files, bring
//! the provider's passages in line with the working tree. The discipline:
//!
//! 1. For each changed file, upload *all* new chunks first.
//! 2. Only when every upload for that file succeeded are the file's old
//!    passage IDs scheduled for deletion and the map entry replaced.
//! 3. A file whose upload fails keeps its old IDs untouched — the agent
//!    still answers from the pre-update passages.
//! 4. Deletions run in a second phase after every file is processed;
//!    delete failures are logged, never fatal (the invariant already holds,
//!    the orphan is minor).
//!
//! Per-file errors never fail the sync as a whole. Cancellation is checked
//! between files, preserving per-file atomicity.

use futures::StreamExt as _;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::Chunker;
use crate::collect::{self, FileInfo};
use crate::config::RepoConfig;
use crate::provider::Provider;
use crate::state::PassageMap;

/// Upper bound on concurrent `store_passage` calls within one file, and on
/// concurrent deletes in the second phase.
pub const UPLOAD_WINDOW: usize = 20;

/// Progress callback: `(completed, total, file_path)`, invoked exactly once
/// per file regardless of outcome.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, usize, &str) + Send + Sync);

/// Errors that abort a whole sync pass. Per-file failures do not; they land
/// in [`SyncOutcome::failed_files`].
#[derive(Debug, Error)]
pub enum SyncError {
    /// The cancellation signal fired between files.
    #[error("sync cancelled")]
    Cancelled,
}

/// Options for one sync pass.
#[derive(Default)]
pub struct SyncOptions<'a> {
    /// Invoked once per processed file.
    pub progress: Option<ProgressFn<'a>>,
    /// Checked between files.
    pub cancel: Option<&'a CancellationToken>,
    /// Caller's hint that `changed` spans the entire repo.
    pub is_full_reindex: bool,
}

/// Result of one sync pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The new passage map to persist.
    pub passages: PassageMap,
    /// The HEAD commit this pass reconciled against.
    pub last_sync_commit: Option<String>,
    /// Files whose passages were deleted without replacement.
    pub files_removed: usize,
    /// Files whose passages were replaced.
    pub files_reindexed: usize,
    /// Files whose uploads failed; their old passages are untouched.
    pub failed_files: Vec<String>,
    /// Echo of [`SyncOptions::is_full_reindex`].
    pub is_full_reindex: bool,
}

/// Reconcile `changed` files against the provider.
///
/// `changed` paths are agent-root-relative; they are processed in the order
/// supplied. `head` is the commit this pass represents and is echoed into
/// the outcome for the caller to persist.
///
/// # Errors
/// Only [`SyncError::Cancelled`]. Everything else is isolated per file.
pub async fn sync_repo(
    provider: &dyn Provider,
    cfg: &RepoConfig,
    chunker: &dyn Chunker,
    agent_id: &str,
    old_passages: &PassageMap,
    changed: &[String],
    head: Option<String>,
    opts: &SyncOptions<'_>,
) -> Result<SyncOutcome, SyncError> {
    let mut passages = old_passages.clone();
    let mut to_delete: Vec<String> = Vec::new();
    let mut files_removed = 0;
    let mut files_reindexed = 0;
    let mut failed_files = Vec::new();

    let total = changed.len();
    for (i, path) in changed.iter().enumerate() {
        if opts.cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(SyncError::Cancelled);
        }

        match process_file(provider, cfg, chunker, agent_id, path).await {
            FileAction::Removed => {
                if let Some(old) = passages.remove(path) {
                    to_delete.extend(old);
                    files_removed += 1;
                }
            }
            FileAction::Replaced(new_ids) => {
                if let Some(old) = passages.insert(path.clone(), new_ids) {
                    to_delete.extend(old);
                }
                files_reindexed += 1;
            }
            FileAction::Failed => {
                failed_files.push(path.clone());
            }
        }

        if let Some(progress) = opts.progress {
            progress(i + 1, total, path);
        }
    }

    delete_phase(provider, agent_id, to_delete).await;

    Ok(SyncOutcome {
        passages,
        last_sync_commit: head,
        files_removed,
        files_reindexed,
        failed_files,
        is_full_reindex: opts.is_full_reindex,
    })
}

enum FileAction {
    /// File gone or oversized: drop its passages.
    Removed,
    /// All chunks uploaded: replace with these IDs.
    Replaced(Vec<String>),
    /// An upload failed: keep the old passages.
    Failed,
}

async fn process_file(
    provider: &dyn Provider,
    cfg: &RepoConfig,
    chunker: &dyn Chunker,
    agent_id: &str,
    path: &str,
) -> FileAction {
    let file = match collect::collect_file(cfg, path) {
        Ok(Some(file)) => file,
        Ok(None) => return FileAction::Removed,
        Err(e) => {
            warn!("failed to read {path}: {e}");
            return FileAction::Failed;
        }
    };

    #[allow(clippy::cast_precision_loss)]
    if cfg.max_file_size_kb.is_some_and(|max| file.size_kb > max as f64) {
        debug!("{path} exceeds the size ceiling ({:.0} KB), dropping", file.size_kb);
        return FileAction::Removed;
    }

    match upload_chunks(provider, chunker, agent_id, &file).await {
        Ok(ids) if ids.is_empty() => FileAction::Removed,
        Ok(ids) => FileAction::Replaced(ids),
        Err(e) => {
            warn!("upload failed for {path}: {e}");
            FileAction::Failed
        }
    }
}

/// Upload every chunk of `file`, preserving chunk order in the returned IDs.
///
/// Uploads run through a window of at most [`UPLOAD_WINDOW`] in-flight
/// calls. On the first failure the remaining uploads are dropped; any
/// passages that did land are orphans the next full re-index clears.
async fn upload_chunks(
    provider: &dyn Provider,
    chunker: &dyn Chunker,
    agent_id: &str,
    file: &FileInfo,
) -> Result<Vec<String>, crate::provider::ProviderError> {
    let chunks = chunker.chunk(file);
    let mut uploads = futures::stream::iter(chunks)
        .map(|chunk| async move { provider.store_passage(agent_id, &chunk.text).await })
        .buffered(UPLOAD_WINDOW);

    let mut ids = Vec::new();
    while let Some(result) = uploads.next().await {
        ids.push(result?);
    }
    Ok(ids)
}

/// Second phase: delete superseded passages concurrently. First-in,
/// first-delete order is preserved at issue time; failures are independent
/// and only logged.
async fn delete_phase(provider: &dyn Provider, agent_id: &str, to_delete: Vec<String>) {
    if to_delete.is_empty() {
        return;
    }
    debug!("deleting {} superseded passages", to_delete.len());
    futures::stream::iter(to_delete)
        .map(|id| async move {
            if let Err(e) = provider.delete_passage(agent_id, &id).await {
                warn!("failed to delete passage {id}: {e}");
            }
        })
        .buffer_unordered(UPLOAD_WINDOW)
        .collect::<Vec<()>>()
        .await;
}
