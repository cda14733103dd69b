//! Error types for git operations.
//!
//! [`GitError`] is the single error type returned by all [`GitRepo`](crate::GitRepo)
//! queries. Variants distinguish the failure modes callers react to
//! differently: a directory that is not a repository, a diff that cannot be
//! computed (e.g. the stored commit was garbage-collected), and everything
//! else.

use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by [`GitRepo`](crate::GitRepo) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The path is not inside a git repository (or git itself is missing).
    #[error("not a git repository: {}\n  To fix: check the repo path in your config, or run `git init`.", path.display())]
    NotARepo {
        /// The directory that was queried.
        path: PathBuf,
    },

    /// `git diff` failed — usually because the stored base commit no longer
    /// exists (history rewrite, gc). Callers typically fall back to a full
    /// re-index.
    #[error("git diff failed for `{range}`: {stderr}")]
    DiffFailed {
        /// The `<old>..<new>` range that was requested.
        range: String,
        /// Captured stderr from git.
        stderr: String,
    },

    /// A git command exited non-zero for a reason other than the cases above.
    #[error("`{command}` failed{}: {stderr}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    CommandFailed {
        /// The command that was run (e.g. `"git submodule status"`).
        command: String,
        /// Process exit code, if available.
        exit_code: Option<i32>,
        /// Captured stderr from git.
        stderr: String,
    },

    /// The command did not complete within the per-invocation timeout.
    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout {
        /// The command that was run.
        command: String,
        /// The timeout that elapsed.
        timeout_secs: u64,
    },

    /// Spawning git or reading its output failed at the OS level.
    #[error("I/O error running git: {0}")]
    Io(#[from] std::io::Error),

    /// Git produced output that could not be decoded as UTF-8.
    #[error("`{command}` produced non-UTF-8 output")]
    InvalidOutput {
        /// The command that was run.
        command: String,
    },
}
