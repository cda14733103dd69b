//! In-memory TTL cache for broadcast answers.
//!
//! Keyed by `(agent, normalized question, model, last-synced commit)` — a
//! new commit naturally invalidates every cached answer for the repo.
//! Callers can always bypass the cache; nothing here persists.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Default time-to-live for cached answers.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct CacheKey {
    agent_id: String,
    question: String,
    model_key: String,
    commit: String,
}

struct Entry {
    answer: String,
    expires_at: Instant,
}

/// TTL answer cache. Cheap to share behind an `Arc`.
pub struct AnswerCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl AnswerCache {
    /// Cache with the given time-to-live.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached answer for this key, if present and fresh.
    pub async fn get(
        &self,
        agent_id: &str,
        question: &str,
        model_key: Option<&str>,
        commit: Option<&str>,
    ) -> Option<String> {
        let key = make_key(agent_id, question, model_key, commit);
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.answer.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Store an answer under this key.
    pub async fn put(
        &self,
        agent_id: &str,
        question: &str,
        model_key: Option<&str>,
        commit: Option<&str>,
        answer: String,
    ) {
        let key = make_key(agent_id, question, model_key, commit);
        let mut entries = self.entries.lock().await;
        // Opportunistic cleanup so dead entries don't pile up.
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key,
            Entry {
                answer,
                expires_at: now + self.ttl,
            },
        );
    }
}

impl Default for AnswerCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

fn make_key(
    agent_id: &str,
    question: &str,
    model_key: Option<&str>,
    commit: Option<&str>,
) -> CacheKey {
    CacheKey {
        agent_id: agent_id.to_owned(),
        question: normalize_question(question),
        model_key: model_key.unwrap_or_default().to_owned(),
        commit: commit.unwrap_or_default().to_owned(),
    }
}

/// Collapse whitespace runs and lowercase, so trivially reworded questions
/// share an entry.
fn normalize_question(question: &str) -> String {
    question.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_within_ttl() {
        let cache = AnswerCache::new(Duration::from_secs(60));
        cache.put("ag", "what is this?", None, Some("abc"), "an answer".to_owned()).await;
        let hit = cache.get("ag", "what is this?", None, Some("abc")).await;
        assert_eq!(hit.as_deref(), Some("an answer"));
    }

    #[tokio::test]
    async fn miss_after_expiry() {
        let cache = AnswerCache::new(Duration::from_millis(10));
        cache.put("ag", "q", None, None, "a".to_owned()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("ag", "q", None, None).await, None);
    }

    #[tokio::test]
    async fn question_normalization_collapses_whitespace_and_case() {
        let cache = AnswerCache::default();
        cache.put("ag", "What   is\tthis?", None, None, "a".to_owned()).await;
        assert_eq!(cache.get("ag", "what is this?", None, None).await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn commit_changes_the_key() {
        let cache = AnswerCache::default();
        cache.put("ag", "q", None, Some("abc"), "a".to_owned()).await;
        assert_eq!(cache.get("ag", "q", None, Some("def")).await, None);
    }

    #[tokio::test]
    async fn model_changes_the_key() {
        let cache = AnswerCache::default();
        cache.put("ag", "q", Some("fast"), None, "a".to_owned()).await;
        assert_eq!(cache.get("ag", "q", Some("slow"), None).await, None);
        assert_eq!(cache.get("ag", "q", Some("fast"), None).await.as_deref(), Some("a"));
    }
}
