use anyhow::{Context as _, Result, bail};
use clap::Args;
use expert_git::{GitError, GitRepo};
use tracing::warn;

use repo_expert::chunk;
use repo_expert::collect;
use repo_expert::state::AgentPatch;
use repo_expert::sync::{self, SyncOptions};

use crate::context::Context;

/// One-shot sync of repos against their current HEAD
///
/// Compares HEAD with the stored last-synced commit and reconciles the
/// changed files. Per-file upload failures keep that file's previous
/// passages and are reported, not fatal.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Repos to sync (default: all configured repos)
    pub repos: Vec<String>,

    /// Sync the full file set regardless of the stored commit
    #[arg(long)]
    pub full: bool,
}

pub async fn run(ctx: &Context, args: &SyncArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let provider = ctx.provider(&config)?;
    let store = ctx.store();
    let names = ctx.select_repos(&config, &args.repos)?;

    let mut reports = Vec::new();
    for name in names {
        let cfg = config.repo(name).expect("selected repos exist");
        let state = store.load().await?;
        let Some(agent) = state.agent(name) else {
            bail!("repo `{name}` has no agent\n  To fix: run `repo-expert setup {name}` first.");
        };

        let git = GitRepo::new(&cfg.path);
        let head = git.head().await.context("failed to resolve HEAD")?;
        let stored = agent.last_sync_commit.clone();

        if !args.full && stored.as_deref() == Some(head.as_str()) {
            if !ctx.json {
                println!("{name}: up to date (HEAD={})", &head[..7.min(head.len())]);
            }
            reports.push((name.to_owned(), None));
            continue;
        }

        let (changed, is_full) = match (&stored, args.full) {
            (Some(since), false) => match git.changed_files(since).await {
                Ok(repo_relative) => {
                    (collect::expand_changed(cfg, &git, &repo_relative).await?, false)
                }
                Err(GitError::DiffFailed { range, stderr }) => {
                    warn!("diff failed for {range} ({stderr}); doing a full sync");
                    (collect::collect_paths(cfg, &git).await?, true)
                }
                Err(e) => return Err(e.into()),
            },
            _ => (collect::collect_paths(cfg, &git).await?, true),
        };

        let chunker = chunk::chunker_for(cfg.chunker);
        let progress = |done: usize, total: usize, path: &str| {
            tracing::debug!("[{done}/{total}] {path}");
        };
        let opts = SyncOptions {
            progress: Some(&progress),
            cancel: None,
            is_full_reindex: is_full,
        };
        let outcome = sync::sync_repo(
            provider.as_ref(),
            cfg,
            chunker.as_ref(),
            &agent.agent_id,
            &agent.passages,
            &changed,
            Some(head),
            &opts,
        )
        .await?;

        let patch = AgentPatch {
            passages: Some(outcome.passages.clone()),
            last_sync_commit: outcome.last_sync_commit.clone(),
            last_sync_at: Some(chrono::Utc::now()),
            ..AgentPatch::default()
        };
        let repo_name = name.to_owned();
        store
            .update(move |s| match s.agent(&repo_name) {
                Some(agent) => {
                    let updated = agent.apply(patch);
                    s.with_agent(repo_name.clone(), updated)
                }
                None => s,
            })
            .await?;

        if !ctx.json {
            println!(
                "{name}: {} re-indexed, {} removed{}",
                outcome.files_reindexed,
                outcome.files_removed,
                if outcome.failed_files.is_empty() {
                    String::new()
                } else {
                    format!(", {} FAILED", outcome.failed_files.len())
                }
            );
            for failed in &outcome.failed_files {
                eprintln!("  failed: {failed}");
            }
        }
        reports.push((name.to_owned(), Some(outcome)));
    }

    if ctx.json {
        let report = serde_json::json!({
            "ok": true,
            "repos": reports.iter().map(|(name, outcome)| match outcome {
                None => serde_json::json!({ "repo": name, "upToDate": true }),
                Some(o) => serde_json::json!({
                    "repo": name,
                    "filesReIndexed": o.files_reindexed,
                    "filesRemoved": o.files_removed,
                    "failedFiles": o.failed_files,
                    "lastSyncCommit": o.last_sync_commit,
                    "isFullReIndex": o.is_full_reindex,
                }),
            }).collect::<Vec<_>>(),
        });
        println!("{report}");
    }
    Ok(())
}
