//! Letta HTTP client — the concrete [`Provider`] backend.
//!
//! A thin reqwest wrapper over the Letta agent API (a Viking deployment
//! speaks the same surface). All transport and status failures are
//! classified into [`ProviderError`] here, at the boundary, so the rest of
//! the engine never sees an SDK error shape.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode, header};
use serde_json::{Value, json};
use tracing::debug;

use super::error::{NetworkErrorKind, ProviderError};
use super::{Block, CreateAgentParams, PassageEntry, Provider, SendOpts};
use crate::config::ProviderSettings;
use crate::prompts;

/// Page size for archival-memory listing.
const LIST_PAGE_SIZE: usize = 100;

/// Socket-level timeout for individual HTTP requests. Operation-level
/// timeouts (indexing, bootstrap, broadcast) are enforced by callers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The Letta-backed provider.
pub struct LettaProvider {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl LettaProvider {
    /// Build a client from validated provider settings.
    ///
    /// The API token is read from the configured environment variable; a
    /// missing variable is fine for a local server.
    ///
    /// # Errors
    /// Client construction failures.
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_owned(),
            token: std::env::var(&settings.api_key_env).ok().filter(|t| !t.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Send a request and classify transport + status failures.
    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = self.request(builder).send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response_retry_after(&response);
            return Err(status_error(status, retry_after, response).await);
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        let text = response.text().await.map_err(classify_transport)?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::Other(format!("malformed provider response: {e}")))
    }
}

#[async_trait]
impl Provider for LettaProvider {
    async fn create_agent(&self, params: &CreateAgentParams) -> Result<String, ProviderError> {
        let persona = params
            .persona
            .clone()
            .unwrap_or_else(|| prompts::default_persona(&params.repo_name));
        let blocks = json!([
            { "label": "persona", "value": persona, "limit": params.memory_block_limit },
            { "label": "architecture", "value": prompts::ARCHITECTURE_SEED, "limit": params.memory_block_limit },
            { "label": "conventions", "value": prompts::CONVENTIONS_SEED, "limit": params.memory_block_limit },
        ]);
        let mut body = json!({
            "name": params.name,
            "description": params.description,
            "tags": params.tags,
            "model": params.model,
            "embedding": params.embedding,
            "memory_blocks": blocks,
        });
        if !params.tools.is_empty() {
            body["tools"] = json!(params.tools);
        }

        let value = self.send(self.http.post(self.url("/v1/agents/")).json(&body)).await?;
        value["id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ProviderError::Other("create_agent response missing `id`".to_owned()))
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), ProviderError> {
        self.send(self.http.delete(self.url(&format!("/v1/agents/{agent_id}")))).await?;
        Ok(())
    }

    async fn store_passage(&self, agent_id: &str, text: &str) -> Result<String, ProviderError> {
        let value = self
            .send(
                self.http
                    .post(self.url(&format!("/v1/agents/{agent_id}/archival-memory")))
                    .json(&json!({ "text": text })),
            )
            .await?;
        // The service answers with the created passage(s); either a bare
        // object or a one-element list depending on version.
        let id = value["id"]
            .as_str()
            .or_else(|| value.get(0).and_then(|p| p["id"].as_str()))
            .unwrap_or_default();
        if id.is_empty() {
            return Err(ProviderError::Other(
                "store_passage response missing passage ID".to_owned(),
            ));
        }
        Ok(id.to_owned())
    }

    async fn delete_passage(
        &self,
        agent_id: &str,
        passage_id: &str,
    ) -> Result<(), ProviderError> {
        self.send(
            self.http
                .delete(self.url(&format!("/v1/agents/{agent_id}/archival-memory/{passage_id}"))),
        )
        .await?;
        Ok(())
    }

    async fn list_passages(&self, agent_id: &str) -> Result<Vec<PassageEntry>, ProviderError> {
        // Cursor pages over ascending passage-ID order. Assumes the service
        // keeps that order stable under concurrent writes.
        let mut out = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("limit", LIST_PAGE_SIZE.to_string()),
                ("ascending", "true".to_owned()),
            ];
            if let Some(cursor) = &after {
                query.push(("after", cursor.clone()));
            }
            let value = self
                .send(
                    self.http
                        .get(self.url(&format!("/v1/agents/{agent_id}/archival-memory")))
                        .query(&query),
                )
                .await?;
            let page: Vec<PassageEntry> = value
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|p| {
                            Some(PassageEntry {
                                id: p["id"].as_str()?.to_owned(),
                                text: p["text"].as_str().unwrap_or_default().to_owned(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();

            let page_len = page.len();
            after = page.last().map(|p| p.id.clone());
            out.extend(page);
            if page_len < LIST_PAGE_SIZE {
                debug!("listed {} passages for {agent_id}", out.len());
                return Ok(out);
            }
        }
    }

    async fn get_block(&self, agent_id: &str, label: &str) -> Result<Block, ProviderError> {
        let value = self
            .send(
                self.http
                    .get(self.url(&format!("/v1/agents/{agent_id}/core-memory/blocks/{label}"))),
            )
            .await?;
        Ok(Block {
            value: value["value"].as_str().unwrap_or_default().to_owned(),
            limit: u32::try_from(value["limit"].as_u64().unwrap_or(0)).unwrap_or(u32::MAX),
        })
    }

    async fn send_message(
        &self,
        agent_id: &str,
        text: &str,
        opts: &SendOpts,
    ) -> Result<String, ProviderError> {
        let mut body = json!({
            "messages": [{ "role": "user", "content": text }],
        });
        if let Some(model) = &opts.override_model {
            body["model"] = json!(model);
        }
        if let Some(max_steps) = opts.max_steps {
            body["max_steps"] = json!(max_steps);
        }

        let value = self
            .send(self.http.post(self.url(&format!("/v1/agents/{agent_id}/messages"))).json(&body))
            .await?;
        extract_reply(&value)
            .ok_or_else(|| ProviderError::Other("reply contained no assistant message".to_owned()))
    }
}

/// Pull the assistant's reply text out of a messages response.
fn extract_reply(value: &Value) -> Option<String> {
    let messages = value["messages"].as_array()?;
    messages
        .iter()
        .rev()
        .find(|m| m["message_type"] == "assistant_message" || m["role"] == "assistant")
        .and_then(|m| m["content"].as_str())
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Classify a reqwest transport error into the taxonomy.
fn classify_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        return ProviderError::Network {
            kind: NetworkErrorKind::TimedOut,
            message: e.to_string(),
        };
    }
    if e.is_connect() {
        return ProviderError::Network {
            kind: NetworkErrorKind::ConnectionRefused,
            message: e.to_string(),
        };
    }
    if let Some(kind) = io_kind_in_chain(&e) {
        return ProviderError::Network {
            kind,
            message: e.to_string(),
        };
    }
    let message = e.to_string();
    if message.contains("dns") {
        return ProviderError::Network {
            kind: NetworkErrorKind::Dns,
            message,
        };
    }
    ProviderError::Other(message)
}

/// Walk the source chain for an `io::Error` with a transient kind.
fn io_kind_in_chain(e: &(dyn std::error::Error + 'static)) -> Option<NetworkErrorKind> {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::ConnectionReset => Some(NetworkErrorKind::ConnectionReset),
                std::io::ErrorKind::TimedOut => Some(NetworkErrorKind::TimedOut),
                std::io::ErrorKind::ConnectionRefused => Some(NetworkErrorKind::ConnectionRefused),
                std::io::ErrorKind::BrokenPipe => Some(NetworkErrorKind::BrokenPipe),
                _ => None,
            };
        }
        source = err.source();
    }
    None
}

fn response_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

async fn status_error(
    status: StatusCode,
    retry_after: Option<Duration>,
    response: Response,
) -> ProviderError {
    let message = response.text().await.unwrap_or_default();
    ProviderError::Http {
        status: status.as_u16(),
        retry_after,
        message: truncate(&message, 500),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
