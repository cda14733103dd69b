//! Fan a question out to several agents at once.
//!
//! Each agent gets its own timeout; failures are captured per agent and
//! never abort the batch. Results come back in input order.

use std::time::Duration;

use futures::future::join_all;
use tracing::debug;

use crate::provider::{Provider, SendOpts};

/// Default per-agent timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One agent to query.
#[derive(Clone, Debug)]
pub struct BroadcastTarget {
    /// The repo the agent serves, for labeling results.
    pub repo_name: String,
    /// The provider agent ID.
    pub agent_id: String,
}

/// One agent's answer (or failure).
#[derive(Clone, Debug)]
pub struct BroadcastResult {
    /// The repo the agent serves.
    pub repo_name: String,
    /// The reply text, when the call succeeded.
    pub response: Option<String>,
    /// The failure description, when it did not.
    pub error: Option<String>,
}

/// Ask every target the same question in parallel.
///
/// Returns one result per target, in the order given.
pub async fn broadcast(
    provider: &dyn Provider,
    targets: &[BroadcastTarget],
    question: &str,
    opts: &SendOpts,
    timeout: Duration,
) -> Vec<BroadcastResult> {
    debug!("broadcasting to {} agent(s)", targets.len());
    let queries = targets.iter().map(|target| async move {
        let reply =
            tokio::time::timeout(timeout, provider.send_message(&target.agent_id, question, opts))
                .await;
        match reply {
            Ok(Ok(response)) => BroadcastResult {
                repo_name: target.repo_name.clone(),
                response: Some(response),
                error: None,
            },
            Ok(Err(e)) => BroadcastResult {
                repo_name: target.repo_name.clone(),
                response: None,
                error: Some(e.to_string()),
            },
            Err(_elapsed) => BroadcastResult {
                repo_name: target.repo_name.clone(),
                response: None,
                error: Some(format!("timed out after {timeout:?}")),
            },
        }
    });
    join_all(queries).await
}
