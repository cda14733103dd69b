use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use repo_expert::watch::{self, WatchOptions};

use crate::context::Context;

/// Watch repos and auto-sync until interrupted
///
/// Combines a HEAD poll with a recursive filesystem watcher. File-save
/// bursts are debounced into one sync; failing repos back off
/// exponentially. Ctrl-C shuts down cleanly, waiting for in-flight syncs.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Repos to watch (default: all configured repos)
    pub repos: Vec<String>,

    /// HEAD poll interval in seconds
    #[arg(long, default_value_t = 30)]
    pub interval: u64,

    /// Filesystem event debounce in milliseconds
    #[arg(long, default_value_t = 250)]
    pub debounce: u64,
}

pub async fn run(ctx: &Context, args: &WatchArgs) -> Result<()> {
    let config = ctx.load_config()?;
    let provider = ctx.provider(&config)?;
    let store = Arc::new(ctx.store());
    let names: Vec<String> = ctx
        .select_repos(&config, &args.repos)?
        .into_iter()
        .map(str::to_owned)
        .collect();

    let opts = WatchOptions {
        interval: Duration::from_secs(args.interval.max(1)),
        debounce: Duration::from_millis(args.debounce.max(1)),
        ..WatchOptions::default()
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    watch::watch_repos(provider, &config, &names, store, cancel, opts).await?;
    Ok(())
}
