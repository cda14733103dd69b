//! The memory-service port.
//!
//! [`Provider`] is the single abstraction boundary between the engine and
//! the remote agent service. The engine only ever tracks passage IDs; text
//! is never inspected after storage. Concrete backends (the Letta HTTP
//! client, test doubles) implement the trait; [`Retrying`] wraps any of
//! them with the uniform transient-error retry discipline.

pub mod error;
pub mod letta;
pub mod retry;

use async_trait::async_trait;

pub use error::{NetworkErrorKind, ProviderError};
pub use letta::LettaProvider;
pub use retry::{RetryPolicy, with_retry};

/// Labels of the fixed memory blocks attached to every agent.
pub const BLOCK_LABELS: &[&str] = &["persona", "architecture", "conventions"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Everything needed to create one agent.
#[derive(Clone, Debug, Default)]
pub struct CreateAgentParams {
    /// Agent display name.
    pub name: String,
    /// The repo this agent serves.
    pub repo_name: String,
    /// Human description of the repo.
    pub description: String,
    /// Tags attached to the agent.
    pub tags: Vec<String>,
    /// Chat model handle.
    pub model: String,
    /// Embedding model handle.
    pub embedding: String,
    /// Byte limit for each fixed memory block.
    pub memory_block_limit: u32,
    /// Persona text; a default is used when unset.
    pub persona: Option<String>,
    /// Extension tool names to enable.
    pub tools: Vec<String>,
}

/// One stored passage as returned by the provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PassageEntry {
    /// Opaque passage ID.
    pub id: String,
    /// The stored text.
    pub text: String,
}

/// A fixed-label memory block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Current block content.
    pub value: String,
    /// Byte limit.
    pub limit: u32,
}

/// Options for `send_message`.
#[derive(Clone, Debug, Default)]
pub struct SendOpts {
    /// Use this model instead of the agent's default.
    pub override_model: Option<String>,
    /// Cap on agent reasoning steps.
    pub max_steps: Option<u32>,
}

// ---------------------------------------------------------------------------
// The port
// ---------------------------------------------------------------------------

/// Abstract memory-service operations.
///
/// Object-safe: callers hold `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create an agent with the three fixed memory blocks attached
    /// (`persona`, `architecture`, `conventions`), each initialized and
    /// limited to `memory_block_limit` bytes.
    ///
    /// # Errors
    /// Provider/transport failures.
    async fn create_agent(&self, params: &CreateAgentParams) -> Result<String, ProviderError>;

    /// Delete an agent.
    ///
    /// # Errors
    /// Provider/transport failures.
    async fn delete_agent(&self, agent_id: &str) -> Result<(), ProviderError>;

    /// Store one passage; returns its non-empty ID.
    ///
    /// # Errors
    /// Provider/transport failures, or an empty ID from the service.
    async fn store_passage(&self, agent_id: &str, text: &str) -> Result<String, ProviderError>;

    /// Delete one passage.
    ///
    /// # Errors
    /// Provider/transport failures. A 404 from the service is surfaced
    /// here; [`Retrying`] swallows it (the passage is already gone).
    async fn delete_passage(&self, agent_id: &str, passage_id: &str)
    -> Result<(), ProviderError>;

    /// Every passage on the agent, in the service's stable ID order.
    ///
    /// Implementations page under the hood with an ascending cursor over
    /// passage IDs. This relies on the service keeping ID order stable
    /// under concurrent writes; the Letta API documents insertion-ordered
    /// IDs, and the engine assumes that holds.
    ///
    /// # Errors
    /// Provider/transport failures.
    async fn list_passages(&self, agent_id: &str) -> Result<Vec<PassageEntry>, ProviderError>;

    /// Read a fixed memory block by label.
    ///
    /// # Errors
    /// Provider/transport failures.
    async fn get_block(&self, agent_id: &str, label: &str) -> Result<Block, ProviderError>;

    /// Send a message and return the agent's reply text.
    ///
    /// # Errors
    /// Provider/transport failures.
    async fn send_message(
        &self,
        agent_id: &str,
        text: &str,
        opts: &SendOpts,
    ) -> Result<String, ProviderError>;
}

// ---------------------------------------------------------------------------
// Retrying wrapper
// ---------------------------------------------------------------------------

/// Wraps any [`Provider`] with the uniform retry discipline, the idempotent
/// delete rule, and the non-empty-passage-ID invariant.
pub struct Retrying<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: Provider> Retrying<P> {
    /// Wrap `inner` with the default [`RetryPolicy`].
    pub fn new(inner: P) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    /// Wrap `inner` with an explicit policy.
    pub fn with_policy(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped provider.
    pub fn get_ref(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: Provider> Provider for Retrying<P> {
    async fn create_agent(&self, params: &CreateAgentParams) -> Result<String, ProviderError> {
        with_retry(&self.policy, "create_agent", || self.inner.create_agent(params)).await
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), ProviderError> {
        with_retry(&self.policy, "delete_agent", || self.inner.delete_agent(agent_id)).await
    }

    async fn store_passage(&self, agent_id: &str, text: &str) -> Result<String, ProviderError> {
        let id =
            with_retry(&self.policy, "store_passage", || self.inner.store_passage(agent_id, text))
                .await?;
        if id.is_empty() {
            return Err(ProviderError::Other(
                "provider returned an empty passage ID".to_owned(),
            ));
        }
        Ok(id)
    }

    async fn delete_passage(
        &self,
        agent_id: &str,
        passage_id: &str,
    ) -> Result<(), ProviderError> {
        let result = with_retry(&self.policy, "delete_passage", || {
            self.inner.delete_passage(agent_id, passage_id)
        })
        .await;
        match result {
            // Already gone — the delete is idempotent.
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn list_passages(&self, agent_id: &str) -> Result<Vec<PassageEntry>, ProviderError> {
        with_retry(&self.policy, "list_passages", || self.inner.list_passages(agent_id)).await
    }

    async fn get_block(&self, agent_id: &str, label: &str) -> Result<Block, ProviderError> {
        with_retry(&self.policy, "get_block", || self.inner.get_block(agent_id, label)).await
    }

    async fn send_message(
        &self,
        agent_id: &str,
        text: &str,
        opts: &SendOpts,
    ) -> Result<String, ProviderError> {
        with_retry(&self.policy, "send_message", || {
            self.inner.send_message(agent_id, text, opts)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
