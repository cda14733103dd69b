//! Shared test infrastructure.
#![allow(dead_code)]
//!
//! Provides [`TestRepo`], a real git repository in a temp dir, and
//! [`MockProvider`], an in-memory [`Provider`] with an operation log and
//! programmable failures. Each `TestRepo` lives in its own temp dir and is
//! cleaned up on drop, so tests are parallel-safe.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use repo_expert::config::{ChunkStrategy, RepoConfig};
use repo_expert::provider::{
    Block, CreateAgentParams, PassageEntry, Provider, ProviderError, SendOpts,
};
use repo_expert::state::{AgentState, PassageMap};

// ---------------------------------------------------------------------------
// TestRepo
// ---------------------------------------------------------------------------

/// A self-contained git repository in a temporary directory.
pub struct TestRepo {
    _dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    /// `git init` a fresh repo with one initial commit.
    ///
    /// # Panics
    /// Panics if any git command fails.
    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let root = dir.path().to_path_buf();

        git_ok(&root, &["init", "-b", "main"]);
        git_ok(&root, &["config", "user.name", "Test"]);
        git_ok(&root, &["config", "user.email", "test@localhost"]);
        git_ok(&root, &["config", "commit.gpgsign", "false"]);
        std::fs::write(root.join("README.md"), "# test repo\n").expect("write README");
        git_ok(&root, &["add", "-A"]);
        git_ok(&root, &["commit", "-m", "init"]);

        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a file (creating parent dirs) without committing.
    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, content).expect("write file");
    }

    /// Delete a file without committing.
    pub fn remove(&self, rel: &str) {
        std::fs::remove_file(self.root.join(rel)).expect("remove file");
    }

    /// Stage everything and commit; returns the new HEAD.
    pub fn commit(&self, message: &str) -> String {
        git_ok(&self.root, &["add", "-A"]);
        git_ok(&self.root, &["commit", "-m", message, "--allow-empty"]);
        self.head()
    }

    /// Current HEAD commit.
    pub fn head(&self) -> String {
        git_stdout(&self.root, &["rev-parse", "HEAD"]).trim().to_owned()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn git_ok(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_stdout(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(output.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&output.stdout).into_owned()
}

// ---------------------------------------------------------------------------
// Config and state helpers
// ---------------------------------------------------------------------------

/// A [`RepoConfig`] for a [`TestRepo`]: `.rs` files only, raw chunking, no
/// bootstrap.
#[must_use]
pub fn repo_config(root: &Path) -> RepoConfig {
    RepoConfig {
        path: root.to_path_buf(),
        description: "test repo".to_owned(),
        base_path: None,
        extensions: vec![".rs".to_owned()],
        ignore_dirs: vec![".git".to_owned(), "target".to_owned()],
        max_file_size_kb: Some(50),
        memory_block_limit: 4096,
        bootstrap_on_create: false,
        tags: vec![],
        persona: None,
        tools: vec![],
        include_submodules: false,
        chunker: ChunkStrategy::Raw,
    }
}

/// Agent record with the given passage map and synced commit.
#[must_use]
pub fn agent_with_passages(
    agent_id: &str,
    repo_name: &str,
    passages: &[(&str, &[&str])],
    commit: Option<&str>,
) -> AgentState {
    let mut agent = AgentState::new(agent_id, repo_name);
    let mut map = PassageMap::new();
    for (path, ids) in passages {
        map.insert((*path).to_owned(), ids.iter().map(|s| (*s).to_owned()).collect());
    }
    agent.passages = map;
    agent.last_sync_commit = commit.map(str::to_owned);
    agent
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// One provider call, in global order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    CreateAgent { name: String },
    Store { agent: String, id: String, text: String },
    Delete { agent: String, id: String },
    Send { agent: String, text: String },
}

#[derive(Default)]
struct MockInner {
    next_id: u32,
    ops: Vec<Op>,
    /// Fail `store_passage` when the text contains any of these.
    fail_store_containing: Vec<String>,
    /// Fail the next N `store_passage` calls with a transient 429.
    fail_store_times: u32,
    /// Fail every `send_message` with a permanent error.
    fail_send: bool,
    /// Live `store_passage` calls and the high-water mark.
    in_flight: u32,
    max_in_flight: u32,
    reply: String,
}

/// In-memory provider double with an op log.
pub struct MockProvider {
    inner: Mutex<MockInner>,
    store_delay: Duration,
    send_delay: Duration,
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                reply: "mock answer".to_owned(),
                ..MockInner::default()
            }),
            store_delay: Duration::ZERO,
            send_delay: Duration::ZERO,
        }
    }

    /// Delay every `store_passage`, to widen concurrency windows in tests.
    #[must_use]
    pub fn with_store_delay(mut self, delay: Duration) -> Self {
        self.store_delay = delay;
        self
    }

    /// Delay every `send_message`.
    #[must_use]
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    pub fn fail_store_containing(&self, needle: &str) {
        self.inner.lock().expect("lock").fail_store_containing.push(needle.to_owned());
    }

    pub fn fail_store_times(&self, times: u32) {
        self.inner.lock().expect("lock").fail_store_times = times;
    }

    pub fn fail_send(&self) {
        self.inner.lock().expect("lock").fail_send = true;
    }

    pub fn set_reply(&self, reply: &str) {
        self.inner.lock().expect("lock").reply = reply.to_owned();
    }

    /// The full op log, in call order.
    #[must_use]
    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().expect("lock").ops.clone()
    }

    /// Texts of every successful store, in order.
    #[must_use]
    pub fn stored_texts(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Store { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    /// IDs deleted, in order.
    #[must_use]
    pub fn deleted_ids(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Delete { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn store_count(&self) -> usize {
        self.stored_texts().len()
    }

    /// High-water mark of concurrent `store_passage` calls.
    #[must_use]
    pub fn max_in_flight(&self) -> u32 {
        self.inner.lock().expect("lock").max_in_flight
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn transient_429() -> ProviderError {
    ProviderError::Http {
        status: 429,
        retry_after: None,
        message: "slow down".to_owned(),
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_agent(&self, params: &CreateAgentParams) -> Result<String, ProviderError> {
        let mut inner = self.inner.lock().expect("lock");
        inner.next_id += 1;
        let id = format!("agent-{}", inner.next_id);
        let name = params.name.clone();
        inner.ops.push(Op::CreateAgent { name });
        Ok(id)
    }

    async fn delete_agent(&self, _agent_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn store_passage(&self, agent_id: &str, text: &str) -> Result<String, ProviderError> {
        {
            let mut inner = self.inner.lock().expect("lock");
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }
        if self.store_delay > Duration::ZERO {
            tokio::time::sleep(self.store_delay).await;
        }

        let mut inner = self.inner.lock().expect("lock");
        inner.in_flight -= 1;

        if inner.fail_store_times > 0 {
            inner.fail_store_times -= 1;
            return Err(transient_429());
        }
        if inner.fail_store_containing.iter().any(|n| text.contains(n.as_str())) {
            return Err(ProviderError::Http {
                status: 500,
                retry_after: None,
                message: "scripted failure".to_owned(),
            });
        }

        inner.next_id += 1;
        let id = format!("new-{}", inner.next_id);
        inner.ops.push(Op::Store {
            agent: agent_id.to_owned(),
            id: id.clone(),
            text: text.to_owned(),
        });
        Ok(id)
    }

    async fn delete_passage(
        &self,
        agent_id: &str,
        passage_id: &str,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().expect("lock");
        inner.ops.push(Op::Delete {
            agent: agent_id.to_owned(),
            id: passage_id.to_owned(),
        });
        Ok(())
    }

    async fn list_passages(&self, agent_id: &str) -> Result<Vec<PassageEntry>, ProviderError> {
        let inner = self.inner.lock().expect("lock");
        Ok(inner
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Store { agent, id, text } if agent == agent_id => Some(PassageEntry {
                    id: id.clone(),
                    text: text.clone(),
                }),
                _ => None,
            })
            .collect())
    }

    async fn get_block(&self, _agent_id: &str, _label: &str) -> Result<Block, ProviderError> {
        Ok(Block {
            value: String::new(),
            limit: 4096,
        })
    }

    async fn send_message(
        &self,
        agent_id: &str,
        text: &str,
        _opts: &SendOpts,
    ) -> Result<String, ProviderError> {
        if self.send_delay > Duration::ZERO {
            tokio::time::sleep(self.send_delay).await;
        }
        let mut inner = self.inner.lock().expect("lock");
        if inner.fail_send {
            return Err(ProviderError::Http {
                status: 400,
                retry_after: None,
                message: "scripted send failure".to_owned(),
            });
        }
        inner.ops.push(Op::Send {
            agent: agent_id.to_owned(),
            text: text.to_owned(),
        });
        Ok(inner.reply.clone())
    }
}

/// Build a passage map literal.
#[must_use]
pub fn passages(entries: &[(&str, &[&str])]) -> PassageMap {
    let mut map = BTreeMap::new();
    for (path, ids) in entries {
        map.insert((*path).to_owned(), ids.iter().map(|s| (*s).to_owned()).collect());
    }
    map
}
