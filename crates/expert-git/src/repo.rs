//! The [`GitRepo`] handle — every git query the engine makes goes through it.
//!
//! The engine needs exactly three things from git:
//!
//! | Query | Command | Used by |
//! |---|---|---|
//! | current HEAD | `git rev-parse HEAD` | poll loop, sync |
//! | changed files | `git diff --name-only <old>..HEAD` | incremental sync |
//! | submodules | `git submodule status` | collector expansion |
//!
//! All commands run in the repository directory with a 10 second timeout.
//! Commands are spawned through `tokio::process` so the watch loop stays
//! responsive while git runs.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::GitError;

/// Per-invocation timeout for every git subprocess.
const GIT_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// SubmoduleInfo
// ---------------------------------------------------------------------------

/// One line of `git submodule status`, parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmoduleInfo {
    /// Submodule path, relative to the repository root.
    pub path: String,
    /// The commit the submodule currently points at.
    pub commit: String,
    /// Whether the submodule working tree is initialized.
    ///
    /// From the status prefix character: `' '` and `'+'`/`'U'` (drifted but
    /// checked out) are initialized; `'-'` is not.
    pub initialized: bool,
}

// ---------------------------------------------------------------------------
// GitRepo
// ---------------------------------------------------------------------------

/// Handle for running git queries against one repository.
#[derive(Clone, Debug)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Create a handle for the repository at `root`.
    ///
    /// No validation happens here; a bad path surfaces as
    /// [`GitError::NotARepo`] on the first query.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The repository root this handle queries.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve the current HEAD commit.
    ///
    /// # Errors
    /// [`GitError::NotARepo`] if the path is not a git repository;
    /// other variants for spawn/timeout failures.
    pub async fn head(&self) -> Result<String, GitError> {
        let out = self.run(&["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_owned())
    }

    /// Files changed between `since` and HEAD, as repo-relative paths.
    ///
    /// Paths are exactly as git prints them: forward-slash separated,
    /// relative to the repository root.
    ///
    /// # Errors
    /// [`GitError::DiffFailed`] if git cannot compute the diff (e.g. the
    /// base commit no longer exists) — callers fall back to a full re-index.
    pub async fn changed_files(&self, since: &str) -> Result<Vec<String>, GitError> {
        let range = format!("{since}..HEAD");
        let out = match self.run(&["diff", "--name-only", &range]).await {
            Ok(out) => out,
            Err(GitError::CommandFailed { stderr, .. }) => {
                return Err(GitError::DiffFailed { range, stderr });
            }
            Err(e) => return Err(e),
        };
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_owned).collect())
    }

    /// List submodules as reported by `git submodule status`.
    ///
    /// Repositories without submodules yield an empty list. Lines that do
    /// not parse (unexpected format) are skipped.
    ///
    /// # Errors
    /// Propagates command failures; a repo without a `.gitmodules` file is
    /// not an error.
    pub async fn submodules(&self) -> Result<Vec<SubmoduleInfo>, GitError> {
        let out = self.run(&["submodule", "status"]).await?;
        Ok(out.lines().filter_map(parse_submodule_line).collect())
    }

    /// Run `git <args>` in the repo root with [`GIT_TIMEOUT`].
    async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        let command = format!("git {}", args.join(" "));
        debug!(repo = %self.root.display(), %command, "running git");

        let mut git = Command::new("git");
        git.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(GIT_TIMEOUT, git.output())
            .await
            .map_err(|_| GitError::Timeout {
                command: command.clone(),
                timeout_secs: GIT_TIMEOUT.as_secs(),
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            if stderr.contains("not a git repository") {
                return Err(GitError::NotARepo {
                    path: self.root.clone(),
                });
            }
            return Err(GitError::CommandFailed {
                command,
                exit_code: output.status.code(),
                stderr,
            });
        }

        String::from_utf8(output.stdout).map_err(|_| GitError::InvalidOutput { command })
    }
}

/// Parse one `git submodule status` line.
///
/// Format: `<flag><sha> <path> [(describe)]` where flag is `' '`, `'-'`,
/// `'+'` or `'U'`.
fn parse_submodule_line(line: &str) -> Option<SubmoduleInfo> {
    let flag = line.chars().next()?;
    let rest = &line[flag.len_utf8()..];
    let mut parts = rest.split_whitespace();
    let commit = parts.next()?.to_owned();
    let path = parts.next()?.to_owned();
    Some(SubmoduleInfo {
        path,
        commit,
        initialized: flag != '-',
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_initialized_submodule() {
        let info = parse_submodule_line(" 0123abc vendor/dep (v1.2.0)").expect("should parse");
        assert_eq!(info.path, "vendor/dep");
        assert_eq!(info.commit, "0123abc");
        assert!(info.initialized);
    }

    #[test]
    fn parses_uninitialized_submodule() {
        let info = parse_submodule_line("-0123abc vendor/dep").expect("should parse");
        assert!(!info.initialized);
    }

    #[test]
    fn drifted_submodule_counts_as_initialized() {
        for prefix in ['+', 'U'] {
            let line = format!("{prefix}0123abc vendor/dep");
            let info = parse_submodule_line(&line).expect("should parse");
            assert!(info.initialized, "prefix {prefix:?} should be initialized");
        }
    }

    #[test]
    fn blank_line_does_not_parse() {
        assert!(parse_submodule_line("").is_none());
    }

    #[tokio::test]
    async fn head_outside_a_repo_is_not_a_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = GitRepo::new(dir.path());
        match repo.head().await {
            Err(GitError::NotARepo { path }) => assert_eq!(path, dir.path()),
            other => panic!("expected NotARepo, got {other:?}"),
        }
    }
}
