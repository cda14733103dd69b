//! Integration tests for the watch orchestrator.
//!
//! These drive a real filesystem watcher and real git repos, so timing
//! windows are deliberately generous.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{MockProvider, TestRepo, agent_with_passages, repo_config};
use tokio_util::sync::CancellationToken;

use repo_expert::config::{Config, ProviderKind, ProviderSettings, RepoConfig};
use repo_expert::provider::Provider;
use repo_expert::state::StateStore;
use repo_expert::watch::{WatchError, WatchOptions, watch_repos};

fn make_config(name: &str, cfg: RepoConfig) -> Config {
    let mut repos = BTreeMap::new();
    repos.insert(name.to_owned(), cfg);
    Config {
        provider: ProviderSettings {
            kind: ProviderKind::Letta,
            base_url: "http://localhost:8283".to_owned(),
            model: "test/model".to_owned(),
            embedding: "test/embedding".to_owned(),
            fast_model: None,
            api_key_env: "TEST_API_KEY".to_owned(),
        },
        repos,
    }
}

fn fast_opts() -> WatchOptions {
    WatchOptions {
        // Only the immediate startup tick fires during a test.
        interval: Duration::from_secs(3600),
        debounce: Duration::from_millis(100),
        max_backoff: Duration::from_secs(3600),
    }
}

struct Running {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), WatchError>>,
}

impl Running {
    async fn start(
        provider: Arc<dyn Provider>,
        config: Config,
        repo_name: &str,
        store: Arc<StateStore>,
        opts: WatchOptions,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let name = repo_name.to_owned();
        let handle = tokio::spawn(async move {
            watch_repos(provider, &config, &[name], store, task_cancel, opts).await
        });
        // Give the watcher a moment to register before tests touch files.
        tokio::time::sleep(Duration::from_millis(300)).await;
        Self { cancel, handle }
    }

    /// Cancel and require a prompt, clean shutdown.
    async fn stop(self) {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("watch loop must shut down promptly")
            .expect("watch task must not panic");
        result.expect("watch loop must exit cleanly");
    }
}

#[tokio::test]
async fn event_burst_coalesces_into_one_deduplicated_sync() {
    let repo = TestRepo::new();
    let head = repo.head();
    let store = Arc::new(StateStore::new(repo.root().join(".repo-expert-state.json")));
    store
        .update(|s| s.with_agent("r", agent_with_passages("ag-1", "r", &[], Some(&head))))
        .await
        .expect("seed state");

    let provider = Arc::new(MockProvider::new());
    let config = make_config("r", repo_config(repo.root()));
    let running = Running::start(
        provider.clone(),
        config,
        "r",
        Arc::clone(&store),
        fast_opts(),
    )
    .await;

    // Two files in one burst, each producing several watcher events.
    repo.write("src/a.rs", "fn a() {}");
    repo.write("src/b.rs", "fn b() {}");
    tokio::time::sleep(Duration::from_secs(2)).await;

    let texts = provider.stored_texts();
    assert_eq!(texts.len(), 2, "one store per file, events deduplicated: {texts:?}");
    assert_eq!(texts.iter().filter(|t| t.starts_with("FILE: src/a.rs\n")).count(), 1);
    assert_eq!(texts.iter().filter(|t| t.starts_with("FILE: src/b.rs\n")).count(), 1);

    // Event-driven sync runs with HEAD unchanged and records that HEAD.
    let state = store.load().await.expect("load");
    let agent = state.agent("r").expect("agent");
    assert_eq!(agent.last_sync_commit.as_deref(), Some(head.as_str()));
    assert_eq!(agent.passages.len(), 2);

    running.stop().await;
}

#[tokio::test]
async fn state_file_events_never_trigger_a_sync() {
    let repo = TestRepo::new();
    let head = repo.head();
    let store = Arc::new(StateStore::new(repo.root().join(".repo-expert-state.json")));
    store
        .update(|s| s.with_agent("r", agent_with_passages("ag-1", "r", &[], Some(&head))))
        .await
        .expect("seed state");

    // Index .json too, so the state file would match the filters if the
    // suppression failed.
    let mut cfg = repo_config(repo.root());
    cfg.extensions.push(".json".to_owned());
    let provider = Arc::new(MockProvider::new());
    let running = Running::start(
        provider.clone(),
        make_config("r", cfg),
        "r",
        Arc::clone(&store),
        fast_opts(),
    )
    .await;

    repo.write("src/a.rs", "fn a() {}");
    // Long settle: a broken suppression would loop state-write → event →
    // sync → state-write and keep storing.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let texts = provider.stored_texts();
    assert_eq!(texts.len(), 1, "exactly the edited file, nothing else: {texts:?}");
    assert!(texts[0].starts_with("FILE: src/a.rs\n"));
    assert!(
        !texts.iter().any(|t| t.contains(".repo-expert-state.json")),
        "the state file must never be indexed"
    );

    running.stop().await;
}

#[tokio::test]
async fn poll_syncs_commits_made_while_not_watching() {
    let repo = TestRepo::new();
    let head0 = repo.head();
    repo.write("src/a.rs", "fn a() {}");
    let head1 = repo.commit("add a.rs");

    let state_dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(StateStore::new(state_dir.path().join("state.json")));
    store
        .update(|s| s.with_agent("r", agent_with_passages("ag-1", "r", &[], Some(&head0))))
        .await
        .expect("seed state");

    let provider = Arc::new(MockProvider::new());
    let running = Running::start(
        provider.clone(),
        make_config("r", repo_config(repo.root())),
        "r",
        Arc::clone(&store),
        fast_opts(),
    )
    .await;

    // The immediate startup poll sees HEAD != stored and syncs the diff.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let texts = provider.stored_texts();
    assert_eq!(texts.len(), 1, "only the committed file: {texts:?}");
    assert!(texts[0].starts_with("FILE: src/a.rs\n"));

    let state = store.load().await.expect("load");
    assert_eq!(
        state.agent("r").expect("agent").last_sync_commit.as_deref(),
        Some(head1.as_str())
    );

    running.stop().await;
}

#[tokio::test]
async fn syncs_for_one_repo_never_overlap() {
    let repo = TestRepo::new();
    let head = repo.head();
    let store = Arc::new(StateStore::new(repo.root().join(".repo-expert-state.json")));
    store
        .update(|s| s.with_agent("r", agent_with_passages("ag-1", "r", &[], Some(&head))))
        .await
        .expect("seed state");

    // Slow uploads widen the window where a second sync could overlap.
    let provider = Arc::new(MockProvider::new().with_store_delay(Duration::from_millis(300)));
    let mut opts = fast_opts();
    opts.debounce = Duration::from_millis(50);
    let running = Running::start(
        provider.clone(),
        make_config("r", repo_config(repo.root())),
        "r",
        Arc::clone(&store),
        opts,
    )
    .await;

    repo.write("src/a.rs", "fn a() {}");
    // Land the second edit while the first sync is still uploading.
    tokio::time::sleep(Duration::from_millis(250)).await;
    repo.write("src/b.rs", "fn b() {}");
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(provider.store_count(), 2);
    assert_eq!(
        provider.max_in_flight(),
        1,
        "per-repo serialization: one upload stream at a time"
    );

    running.stop().await;
}

#[tokio::test]
async fn unknown_repo_fails_at_startup() {
    let repo = TestRepo::new();
    let store = Arc::new(StateStore::new(repo.root().join("state.json")));
    let provider = Arc::new(MockProvider::new());
    let err = watch_repos(
        provider,
        &make_config("r", repo_config(repo.root())),
        &["nope".to_owned()],
        store,
        CancellationToken::new(),
        fast_opts(),
    )
    .await
    .expect_err("unknown repo must fail");
    assert!(matches!(err, WatchError::UnknownRepo(name) if name == "nope"));
}

#[tokio::test]
async fn repo_without_agent_fails_at_startup() {
    let repo = TestRepo::new();
    let store = Arc::new(StateStore::new(repo.root().join("state.json")));
    let provider = Arc::new(MockProvider::new());
    let err = watch_repos(
        provider,
        &make_config("r", repo_config(repo.root())),
        &["r".to_owned()],
        store,
        CancellationToken::new(),
        fast_opts(),
    )
    .await
    .expect_err("repo without an agent must fail");
    assert!(matches!(err, WatchError::NoAgent(name) if name == "r"));
}
