//! Durable, versioned persistence of [`AppState`] to a single JSON file.
//!
//! # Atomic write protocol
//!
//! Saves serialize to a sibling temp file with a random suffix, then rename
//! over the target. The rename is retried with exponential backoff on the
//! transient error codes (`EBUSY`, `EPERM`, `EACCES` — on Windows these
//! surface while a reader holds the file open). No temp file remains after
//! a successful save.
//!
//! # Corruption handling
//!
//! A file that fails to parse (malformed JSON, schema violation, or a
//! `stateVersion` newer than this build supports) is copied to a
//! timestamped `.bak` sibling before the error surfaces. The error message
//! names the backup path so the operator can repair or delete the file.
//!
//! # Concurrency
//!
//! Saves through one [`StateStore`] are serialized by an async mutex, and
//! [`StateStore::update`] holds the lock across its load, so read-modify-
//! write cycles from concurrent tasks in one process cannot lose updates.
//! Concurrent *processes* are not coordinated; by convention the watch
//! daemon is the single writer.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng as _;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::{AppState, STATE_VERSION};

/// Rename retry attempts after the initial try.
const RENAME_RETRIES: u32 = 3;

/// Base delay for rename retries.
const RENAME_BASE_DELAY: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from loading or saving the state file.
#[derive(Debug, Error)]
pub enum StateError {
    /// The file exists but could not be parsed into the current schema.
    #[error(
        "state file {} is corrupt ({detail}); a backup was written to {}\n  \
         To fix: repair the file from the backup, or delete it to start fresh.",
        path.display(),
        backup.display()
    )]
    Corrupt {
        /// Path to the state file.
        path: PathBuf,
        /// Where the unreadable original was copied.
        backup: PathBuf,
        /// What failed to parse.
        detail: String,
    },

    /// The file carries a `stateVersion` newer than this build supports.
    #[error(
        "state file {} has stateVersion {found}, but this build supports up to {supported}; \
         a backup was written to {}\n  \
         To fix: upgrade repo-expert, or delete the state file to start fresh.",
        path.display(),
        backup.display()
    )]
    VersionTooNew {
        /// Path to the state file.
        path: PathBuf,
        /// Where the original was copied.
        backup: PathBuf,
        /// The version found on disk.
        found: u64,
        /// The newest version this build reads.
        supported: u32,
    },

    /// Serializing the state to JSON failed.
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// An I/O error outside the corruption cases above.
    #[error("state file I/O error: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Handle to the state file at a fixed path.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    save_lock: Mutex<()>,
}

impl StateStore {
    /// Create a store for the state file at `path`. No I/O happens here.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            save_lock: Mutex::new(()),
        }
    }

    /// Absolute-or-relative path this store reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state file.
    ///
    /// A missing file yields [`AppState::empty`]. Legacy files without a
    /// `stateVersion` are migrated in memory to the current version.
    ///
    /// # Errors
    /// [`StateError::Corrupt`] / [`StateError::VersionTooNew`] after writing
    /// a backup; I/O errors otherwise.
    pub async fn load(&self) -> Result<AppState, StateError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(AppState::empty()),
            Err(e) => return Err(e.into()),
        };
        self.parse(&text).await
    }

    /// Save `state` with the atomic write protocol.
    ///
    /// # Errors
    /// Serialization failures and non-transient I/O errors. On failure the
    /// previous file content is intact.
    pub async fn save(&self, state: &AppState) -> Result<(), StateError> {
        let _guard = self.save_lock.lock().await;
        self.save_locked(state).await
    }

    /// Read-modify-write under the store lock.
    ///
    /// Loads the current on-disk state (not a cached copy), applies `f`,
    /// saves the result, and returns it. This is the single write path the
    /// watch orchestrator uses so interleaved repo updates never clobber
    /// each other.
    ///
    /// # Errors
    /// Same as [`StateStore::load`] and [`StateStore::save`].
    pub async fn update<F>(&self, f: F) -> Result<AppState, StateError>
    where
        F: FnOnce(AppState) -> AppState,
    {
        let _guard = self.save_lock.lock().await;
        let current = self.load_unlocked().await?;
        let next = f(current);
        self.save_locked(&next).await?;
        Ok(next)
    }

    async fn load_unlocked(&self) -> Result<AppState, StateError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => self.parse(&text).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(AppState::empty()),
            Err(e) => Err(e.into()),
        }
    }

    async fn parse(&self, text: &str) -> Result<AppState, StateError> {
        let mut value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return Err(self.corrupt(text, format!("malformed JSON: {e}")).await),
        };

        let Some(obj) = value.as_object_mut() else {
            return Err(self.corrupt(text, "top level is not an object".to_owned()).await);
        };

        // Legacy files predate the version field; migrate in memory.
        if !obj.contains_key("stateVersion") {
            debug!("migrating legacy state file to version {STATE_VERSION}");
            obj.insert("stateVersion".to_owned(), STATE_VERSION.into());
        }

        let found = obj
            .get("stateVersion")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        if found > u64::from(STATE_VERSION) {
            let backup = self.write_backup(text).await;
            return Err(StateError::VersionTooNew {
                path: self.path.clone(),
                backup,
                found,
                supported: STATE_VERSION,
            });
        }
        // Older versions share the v2 field layout; reading them through the
        // current schema plus the injected version field is the migration.
        obj.insert("stateVersion".to_owned(), STATE_VERSION.into());

        match serde_json::from_value::<AppState>(value) {
            Ok(state) => Ok(state),
            Err(e) => Err(self.corrupt(text, format!("schema violation: {e}")).await),
        }
    }

    /// Write a backup of the unreadable file and build the corrupt error.
    async fn corrupt(&self, original: &str, detail: String) -> StateError {
        let backup = self.write_backup(original).await;
        StateError::Corrupt {
            path: self.path.clone(),
            backup,
            detail,
        }
    }

    async fn write_backup(&self, original: &str) -> PathBuf {
        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let backup = PathBuf::from(format!("{}.bak.{ts}", self.path.display()));
        if let Err(e) = tokio::fs::write(&backup, original).await {
            warn!("failed to write state backup {}: {e}", backup.display());
        }
        backup
    }

    async fn save_locked(&self, state: &AppState) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(state)?;

        let suffix: u32 = rand::rng().random();
        let tmp = PathBuf::from(format!("{}.tmp.{suffix:08x}", self.path.display()));
        tokio::fs::write(&tmp, &json).await?;

        let mut attempt = 0;
        loop {
            match tokio::fs::rename(&tmp, &self.path).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < RENAME_RETRIES && is_transient_rename_error(&e) => {
                    let delay = RENAME_BASE_DELAY * 2u32.pow(attempt);
                    debug!(
                        "rename of {} busy ({e}); retrying in {delay:?}",
                        self.path.display()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    // Leave the target untouched; clean up our temp file.
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            }
        }
    }
}

/// Whether a rename failure is worth retrying.
///
/// `EPERM`/`EACCES` map to `PermissionDenied`; `EBUSY` has no stable
/// `ErrorKind`, so the raw OS codes are checked too (1, 13, 16 on unix).
fn is_transient_rename_error(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied || matches!(e.raw_os_error(), Some(1 | 13 | 16))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::AgentState;

    fn store_in(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join(".repo-expert-state.json"))
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = store_in(&dir).load().await.expect("load");
        assert_eq!(state, AppState::empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let state = AppState::empty().with_agent("r", AgentState::new("ag-1", "r"));
        store.save(&state).await.expect("save");
        assert_eq!(store.load().await.expect("load"), state);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store.save(&AppState::empty()).await.expect("save");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp files linger: {leftovers:?}");
    }

    #[tokio::test]
    async fn corrupt_file_gets_backup_and_distinct_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        std::fs::write(store.path(), "{ not json").expect("write");

        match store.load().await {
            Err(StateError::Corrupt { backup, .. }) => {
                assert!(backup.exists(), "backup should exist at {}", backup.display());
                let saved = std::fs::read_to_string(&backup).expect("read backup");
                assert_eq!(saved, "{ not json");
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_message_names_the_backup_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        std::fs::write(store.path(), "[]").expect("write");
        let err = store.load().await.expect_err("should fail");
        assert!(err.to_string().contains(".bak."), "message: {err}");
    }

    #[tokio::test]
    async fn legacy_file_without_version_migrates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        let legacy = serde_json::json!({
            "agents": {
                "r": {
                    "agentId": "ag-1",
                    "repoName": "r",
                    "passages": { "src/a.rs": ["p-1"] },
                    "createdAt": "2024-01-01T00:00:00Z"
                }
            }
        });
        std::fs::write(store.path(), legacy.to_string()).expect("write");

        let state = store.load().await.expect("load");
        assert_eq!(state.state_version, STATE_VERSION);
        let agent = state.agent("r").expect("agent kept");
        assert_eq!(agent.agent_id, "ag-1");
        assert_eq!(agent.passages["src/a.rs"], vec!["p-1"]);
    }

    #[tokio::test]
    async fn newer_version_is_fatal_with_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        std::fs::write(store.path(), r#"{"stateVersion": 99, "agents": {}}"#).expect("write");

        match store.load().await {
            Err(StateError::VersionTooNew { found, backup, .. }) => {
                assert_eq!(found, 99);
                assert!(backup.exists());
            }
            other => panic!("expected VersionTooNew, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_saves_end_with_one_valid_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = std::sync::Arc::new(store_in(&dir));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let state =
                    AppState::empty().with_agent(format!("r{i}"), AgentState::new("ag", "r"));
                store.save(&state).await
            }));
        }
        for h in handles {
            h.await.expect("join").expect("save");
        }

        // Final file parses and matches one of the written inputs.
        let state = store.load().await.expect("load");
        assert_eq!(state.agents.len(), 1);
    }

    #[tokio::test]
    async fn update_reads_current_disk_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);

        store
            .update(|s| s.with_agent("a", AgentState::new("ag-a", "a")))
            .await
            .expect("update a");
        store
            .update(|s| s.with_agent("b", AgentState::new("ag-b", "b")))
            .await
            .expect("update b");

        let state = store.load().await.expect("load");
        assert_eq!(state.agents.len(), 2, "second update must not lose the first");
    }
}
