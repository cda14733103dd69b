use clap::Args;

use anyhow::Result;
use repo_expert::chunk;
use repo_expert::setup::{self, SetupOptions};

use crate::context::Context;

/// Create, index, and bootstrap agents
///
/// Resumable: each stage persists state when it completes, so a crash or
/// interrupt resumes at the next stage on re-run. With no repo argument,
/// every configured repo is set up in turn.
#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Repos to set up (default: all configured repos)
    pub repos: Vec<String>,

    /// Re-index everything even if the agent looks current
    #[arg(long)]
    pub reindex: bool,
}

pub async fn run(ctx: &Context, args: &SetupArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let provider = ctx.provider(&config)?;
    let store = ctx.store();
    let names = ctx.select_repos(&config, &args.repos)?;

    let opts = SetupOptions {
        reindex: args.reindex,
        ..SetupOptions::default()
    };

    let mut reports = Vec::new();
    for name in names {
        let cfg = config.repo(name).expect("selected repos exist");
        let chunker = chunk::chunker_for(cfg.chunker);
        let report = setup::run_setup(
            provider.as_ref(),
            &config.provider,
            cfg,
            name,
            &store,
            chunker.as_ref(),
            &opts,
        )
        .await?;

        if !ctx.json {
            println!(
                "{name}: {} (agent {}, {} file(s) indexed{})",
                report.mode,
                report.agent_id,
                report.files_indexed,
                if report.bootstrapped { ", bootstrapped" } else { "" }
            );
        }
        reports.push((name.to_owned(), report));
    }

    if ctx.json {
        let report = serde_json::json!({
            "ok": true,
            "repos": reports.iter().map(|(name, r)| serde_json::json!({
                "repo": name,
                "mode": r.mode.to_string(),
                "agentId": r.agent_id,
                "filesIndexed": r.files_indexed,
                "bootstrapped": r.bootstrapped,
            })).collect::<Vec<_>>(),
        });
        println!("{report}");
    }
    Ok(())
}
