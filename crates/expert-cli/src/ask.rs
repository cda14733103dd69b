use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;

use repo_expert::broadcast::{self, BroadcastTarget};
use repo_expert::cache::AnswerCache;
use repo_expert::provider::SendOpts;

use crate::context::Context;

/// Ask one or more repo experts a question
///
/// The question is broadcast to every selected agent in parallel; each
/// reply (or failure) is reported per repo. Answers are cached briefly per
/// (agent, question, model, commit) unless --no-cache is given.
#[derive(Args, Debug)]
pub struct AskArgs {
    /// The question to ask
    pub question: String,

    /// Restrict to these repos (default: all with agents)
    #[arg(long = "repo")]
    pub repos: Vec<String>,

    /// Override the model for this question
    #[arg(long)]
    pub model: Option<String>,

    /// Per-agent timeout in seconds
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    /// Bypass the answer cache
    #[arg(long)]
    pub no_cache: bool,
}

pub async fn run(ctx: &Context, args: &AskArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let provider = ctx.provider(&config)?;
    let store = ctx.store();
    let state = store.load().await?;
    let names = ctx.select_repos(&config, &args.repos)?;

    let mut targets = Vec::new();
    let mut commits = Vec::new();
    for name in names {
        if let Some(agent) = state.agent(name) {
            targets.push(BroadcastTarget {
                repo_name: name.to_owned(),
                agent_id: agent.agent_id.clone(),
            });
            commits.push(agent.last_sync_commit.clone());
        }
    }
    if targets.is_empty() {
        bail!("no agents found\n  To fix: run `repo-expert setup` first.");
    }

    let cache = AnswerCache::default();
    let opts = SendOpts {
        override_model: args.model.clone(),
        max_steps: None,
    };
    let timeout = Duration::from_secs(args.timeout.max(1));

    // Serve cache hits without touching the provider; broadcast the rest.
    let mut results: Vec<Option<broadcast::BroadcastResult>> = vec![None; targets.len()];
    let mut to_ask = Vec::new();
    for (i, target) in targets.iter().enumerate() {
        let cached = if args.no_cache {
            None
        } else {
            cache
                .get(
                    &target.agent_id,
                    &args.question,
                    args.model.as_deref(),
                    commits[i].as_deref(),
                )
                .await
        };
        match cached {
            Some(answer) => {
                results[i] = Some(broadcast::BroadcastResult {
                    repo_name: target.repo_name.clone(),
                    response: Some(answer),
                    error: None,
                });
            }
            None => to_ask.push((i, target.clone())),
        }
    }

    let asked = broadcast::broadcast(
        provider.as_ref(),
        &to_ask.iter().map(|(_, t)| t.clone()).collect::<Vec<_>>(),
        &args.question,
        &opts,
        timeout,
    )
    .await;

    for ((i, target), result) in to_ask.into_iter().zip(asked) {
        if let Some(answer) = &result.response
            && !args.no_cache
        {
            cache
                .put(
                    &target.agent_id,
                    &args.question,
                    args.model.as_deref(),
                    commits[i].as_deref(),
                    answer.clone(),
                )
                .await;
        }
        results[i] = Some(result);
    }

    let results: Vec<_> = results.into_iter().flatten().collect();

    if ctx.json {
        let report = serde_json::json!({
            "ok": true,
            "answers": results.iter().map(|r| serde_json::json!({
                "repo": r.repo_name,
                "response": r.response,
                "error": r.error,
            })).collect::<Vec<_>>(),
        });
        println!("{report}");
    } else {
        for result in &results {
            println!("## {}", result.repo_name);
            match (&result.response, &result.error) {
                (Some(answer), _) => println!("{answer}\n"),
                (None, Some(error)) => println!("(failed: {error})\n"),
                (None, None) => println!("(no answer)\n"),
            }
        }
    }
    Ok(())
}
