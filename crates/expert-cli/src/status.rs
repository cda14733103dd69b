use anyhow::Result;
use clap::Args;

use crate::context::Context;

/// Show per-repo agent and sync status
#[derive(Args, Debug)]
pub struct StatusArgs {}

pub async fn run(ctx: &Context, _args: &StatusArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let store = ctx.store();
    let state = store.load().await?;

    if ctx.json {
        let report = serde_json::json!({
            "ok": true,
            "repos": config.repos.keys().map(|name| {
                match state.agent(name) {
                    Some(agent) => serde_json::json!({
                        "repo": name,
                        "agentId": agent.agent_id,
                        "files": agent.passages.len(),
                        "lastSyncCommit": agent.last_sync_commit,
                        "lastSyncAt": agent.last_sync_at,
                        "lastBootstrap": agent.last_bootstrap,
                        "createdAt": agent.created_at,
                    }),
                    None => serde_json::json!({ "repo": name, "agentId": null }),
                }
            }).collect::<Vec<_>>(),
        });
        println!("{report}");
        return Ok(());
    }

    for name in config.repos.keys() {
        match state.agent(name) {
            Some(agent) => {
                let commit = agent
                    .last_sync_commit
                    .as_deref()
                    .map_or("never synced".to_owned(), |c| c[..7.min(c.len())].to_owned());
                let synced = agent
                    .last_sync_at
                    .map_or("-".to_owned(), |t| t.to_rfc3339());
                println!(
                    "{name}: agent {} | {} file(s) | commit {commit} | synced {synced}",
                    agent.agent_id,
                    agent.passages.len()
                );
            }
            None => println!("{name}: no agent (run `repo-expert setup {name}`)"),
        }
    }
    Ok(())
}
