//! File filtering and collection.
//!
//! Decides which files an agent indexes and enumerates them. Paths handed
//! to the rest of the engine are always *agent-root-relative*: relative to
//! `path + base_path`, forward-slash separated. Dotfiles are included,
//! symbolic links are never followed.

use std::io;
use std::path::{Path, PathBuf};

use expert_git::{GitError, GitRepo};
use thiserror::Error;
use tracing::debug;

use crate::config::RepoConfig;

/// Errors from file collection.
#[derive(Debug, Error)]
pub enum CollectError {
    /// Filesystem walk or read failure.
    #[error("collect I/O error: {0}")]
    Io(#[from] io::Error),

    /// Submodule listing failed.
    #[error(transparent)]
    Git(#[from] GitError),
}

// ---------------------------------------------------------------------------
// FileInfo
// ---------------------------------------------------------------------------

/// One collected file, ready for chunking.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// Agent-root-relative path, forward-slash separated.
    pub path: String,
    /// File content (lossily decoded as UTF-8).
    pub content: String,
    /// Size in KB (bytes / 1024).
    pub size_kb: f64,
}

// ---------------------------------------------------------------------------
// Filter predicate
// ---------------------------------------------------------------------------

/// Whether a path passes the extension and ignore-directory filters.
///
/// The ignore check is segment-exact: `ignore_dirs = ["dist"]` skips
/// `dist/a.js` and `pkg/dist/a.js` but not `distros/a.js`.
#[must_use]
pub fn path_matches(cfg: &RepoConfig, rel_path: &str) -> bool {
    let normalized = rel_path.replace('\\', "/");
    let mut segments = normalized.split('/').filter(|s| !s.is_empty() && *s != ".");
    let has_ignored = segments.any(|seg| cfg.ignore_dirs.iter().any(|d| d == seg));
    if has_ignored {
        return false;
    }
    extension_of(&normalized)
        .is_some_and(|ext| cfg.extensions.iter().any(|e| e.as_str() == ext))
}

/// Full indexability predicate: filters plus the size ceiling.
#[must_use]
pub fn is_indexable(cfg: &RepoConfig, rel_path: &str, size_kb: f64) -> bool {
    if !path_matches(cfg, rel_path) {
        return false;
    }
    match cfg.max_file_size_kb {
        #[allow(clippy::cast_precision_loss)]
        Some(max) => size_kb <= max as f64,
        None => true,
    }
}

/// The `.ext` suffix of a path's final segment, if it has one.
fn extension_of(rel_path: &str) -> Option<&str> {
    let name = rel_path.rsplit('/').next()?;
    let dot = name.rfind('.')?;
    // A leading dot is a hidden file name, not an extension.
    if dot == 0 {
        return None;
    }
    Some(&name[dot..])
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// The directory whose contents form the agent's logical root.
#[must_use]
pub fn agent_root(cfg: &RepoConfig) -> PathBuf {
    match &cfg.base_path {
        Some(base) => cfg.path.join(base),
        None => cfg.path.clone(),
    }
}

/// Enumerate every indexable file for this repo, agent-root-relative.
///
/// When `include_submodules` is set, submodules reported as initialized by
/// `git submodule status` are expanded with their path as prefix. Nested
/// submodules are not recursed into.
///
/// # Errors
/// I/O errors from the walk, git errors from submodule listing.
pub async fn collect_paths(cfg: &RepoConfig, git: &GitRepo) -> Result<Vec<String>, CollectError> {
    let mut out = Vec::new();
    walk(cfg, &agent_root(cfg), "", &mut out)?;

    if cfg.include_submodules {
        for sub in git.submodules().await? {
            if !sub.initialized {
                debug!("skipping uninitialized submodule {}", sub.path);
                continue;
            }
            walk(cfg, &cfg.path.join(&sub.path), &format!("{}/", sub.path), &mut out)?;
        }
    }

    out.sort();
    Ok(out)
}

/// Read one file by agent-root-relative path.
///
/// Returns `None` if the file no longer exists (the sync engine treats that
/// as a deletion). Content is decoded lossily, so a stray non-UTF-8 byte
/// does not fail the file.
///
/// # Errors
/// I/O errors other than not-found.
pub fn collect_file(cfg: &RepoConfig, rel_path: &str) -> Result<Option<FileInfo>, CollectError> {
    let full = agent_root(cfg).join(rel_path);
    let bytes = match std::fs::read(&full) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        // A directory at the path means the file is gone.
        Err(e) if full.is_dir() => {
            debug!("{} is a directory, treating as removed: {e}", full.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    #[allow(clippy::cast_precision_loss)]
    let size_kb = bytes.len() as f64 / 1024.0;
    Ok(Some(FileInfo {
        path: rel_path.to_owned(),
        content: String::from_utf8_lossy(&bytes).into_owned(),
        size_kb,
    }))
}

/// Map a repo-relative changed set (as printed by `git diff --name-only`)
/// to the agent-root-relative indexable set.
///
/// Paths outside `base_path` are dropped. A changed path that names an
/// initialized submodule (the superproject diff reports pointer moves that
/// way) expands to that submodule's full indexable file list.
///
/// # Errors
/// Git errors from submodule listing, I/O errors from expansion walks.
pub async fn expand_changed(
    cfg: &RepoConfig,
    git: &GitRepo,
    repo_relative: &[String],
) -> Result<Vec<String>, CollectError> {
    let submodules = if cfg.include_submodules {
        git.submodules().await?
    } else {
        Vec::new()
    };

    let mut out = Vec::new();
    for path in repo_relative {
        let path = path.replace('\\', "/");

        if let Some(sub) = submodules.iter().find(|s| s.initialized && s.path == path) {
            let mut files = Vec::new();
            walk(cfg, &cfg.path.join(&sub.path), &format!("{}/", sub.path), &mut files)?;
            out.extend(files);
            continue;
        }

        let Some(rel) = strip_base_path(cfg, &path) else {
            continue;
        };
        if path_matches(cfg, &rel) {
            out.push(rel);
        }
    }

    out.sort();
    out.dedup();
    Ok(out)
}

/// Strip the configured `base_path` prefix from a repo-relative path.
///
/// Returns `None` for paths outside the agent root.
#[must_use]
pub fn strip_base_path(cfg: &RepoConfig, repo_relative: &str) -> Option<String> {
    match &cfg.base_path {
        None => Some(repo_relative.to_owned()),
        Some(base) => {
            let base = base.trim_end_matches('/');
            let rest = repo_relative.strip_prefix(base)?;
            let rest = rest.strip_prefix('/')?;
            Some(rest.to_owned())
        }
    }
}

/// Recursive walk under `dir`, appending indexable files as `prefix + rel`.
fn walk(cfg: &RepoConfig, dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
    walk_inner(cfg, dir, dir, prefix, out)
}

fn walk_inner(
    cfg: &RepoConfig,
    root: &Path,
    dir: &Path,
    prefix: &str,
    out: &mut Vec<String>,
) -> io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if file_type.is_dir() {
            if cfg.ignore_dirs.iter().any(|d| d.as_str() == name) {
                continue;
            }
            walk_inner(cfg, root, &entry.path(), prefix, out)?;
        } else if file_type.is_file() {
            let rel = entry
                .path()
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|_| name.into_owned());
            let rel = format!("{prefix}{rel}");

            #[allow(clippy::cast_precision_loss)]
            let size_kb = entry.metadata()?.len() as f64 / 1024.0;
            if is_indexable(cfg, &rel, size_kb) {
                out.push(rel);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
