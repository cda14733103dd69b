//! Git abstraction layer for repo-expert.
//!
//! The engine interacts with git exclusively through [`GitRepo`]: resolving
//! HEAD, computing name-only diffs, and listing submodules. Everything is
//! subprocess-backed (no libgit2/gix linkage) so behavior matches whatever
//! git the operator has installed, and every invocation is bounded by a
//! timeout so a hung git never wedges the watch loop.

pub mod error;
pub mod repo;

pub use error::GitError;
pub use repo::{GitRepo, SubmoduleInfo};
