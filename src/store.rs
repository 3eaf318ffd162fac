//! Persistence interface.
//!
//! The gateway itself persists nothing: threads, items and the voice wait
//! state live with an external collaborator behind these traits. The
//! in-memory implementation backs tests and single-process deployments.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

/// Caller identity attached to store operations.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub user_id: String,
    pub authorization: Option<String>,
}

impl RequestContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            authorization: None,
        }
    }
}

/// A chat thread a voice call is associated with so the UI can resume it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
    /// Serialized wait state; present while a voice session is pending.
    pub wait_state: Option<Value>,
}

/// One finalized transcript line handed back to the workflow layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTranscript {
    pub id: String,
    pub role: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Thread persistence provided by the hosting application.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    async fn save_thread(&self, thread: &ThreadMetadata, ctx: &RequestContext)
        -> anyhow::Result<()>;

    async fn load_thread(
        &self,
        thread_id: &str,
        ctx: &RequestContext,
    ) -> anyhow::Result<Option<ThreadMetadata>>;

    async fn save_item(
        &self,
        thread_id: &str,
        item: &Value,
        ctx: &RequestContext,
    ) -> anyhow::Result<()>;
}

/// Receives the final transcripts when a browser finalizes a voice session.
#[async_trait]
pub trait FinalizeSink: Send + Sync {
    async fn finalize_voice_wait_state(
        &self,
        thread_id: &str,
        transcripts: &[SessionTranscript],
        ctx: &RequestContext,
    ) -> anyhow::Result<()>;
}

/// In-memory store for tests and single-process runs.
#[derive(Default)]
pub struct MemoryThreadStore {
    threads: Mutex<HashMap<String, ThreadMetadata>>,
    items: Mutex<HashMap<String, Vec<Value>>>,
    finalized: Mutex<Vec<(String, Vec<SessionTranscript>)>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn thread_count(&self) -> usize {
        self.threads.lock().await.len()
    }

    pub async fn items_for(&self, thread_id: &str) -> Vec<Value> {
        self.items
            .lock()
            .await
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn finalized(&self) -> Vec<(String, Vec<SessionTranscript>)> {
        self.finalized.lock().await.clone()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn save_thread(
        &self,
        thread: &ThreadMetadata,
        _ctx: &RequestContext,
    ) -> anyhow::Result<()> {
        self.threads
            .lock()
            .await
            .insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    async fn load_thread(
        &self,
        thread_id: &str,
        _ctx: &RequestContext,
    ) -> anyhow::Result<Option<ThreadMetadata>> {
        Ok(self.threads.lock().await.get(thread_id).cloned())
    }

    async fn save_item(
        &self,
        thread_id: &str,
        item: &Value,
        _ctx: &RequestContext,
    ) -> anyhow::Result<()> {
        self.items
            .lock()
            .await
            .entry(thread_id.to_string())
            .or_default()
            .push(item.clone());
        Ok(())
    }
}

#[async_trait]
impl FinalizeSink for MemoryThreadStore {
    async fn finalize_voice_wait_state(
        &self,
        thread_id: &str,
        transcripts: &[SessionTranscript],
        _ctx: &RequestContext,
    ) -> anyhow::Result<()> {
        if let Some(thread) = self.threads.lock().await.get_mut(thread_id) {
            thread.wait_state = None;
        }
        self.finalized
            .lock()
            .await
            .push((thread_id.to_string(), transcripts.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn thread_roundtrip_and_finalize_clears_wait_state() {
        let store = MemoryThreadStore::new();
        let ctx = RequestContext::for_user("sip:call-1");

        let thread = ThreadMetadata {
            id: "t1".to_string(),
            created_at: Utc::now(),
            metadata: json!({"sip_call_id": "call-1"}),
            wait_state: Some(json!({"type": "voice"})),
        };
        store.save_thread(&thread, &ctx).await.unwrap();

        let loaded = store.load_thread("t1", &ctx).await.unwrap().unwrap();
        assert!(loaded.wait_state.is_some());

        let transcripts = vec![SessionTranscript {
            id: "m1".to_string(),
            role: "assistant".to_string(),
            text: "Bonjour".to_string(),
            status: None,
        }];
        store
            .finalize_voice_wait_state("t1", &transcripts, &ctx)
            .await
            .unwrap();

        let loaded = store.load_thread("t1", &ctx).await.unwrap().unwrap();
        assert!(loaded.wait_state.is_none());
        assert_eq!(store.finalized().await.len(), 1);
    }

    #[tokio::test]
    async fn items_append_per_thread() {
        let store = MemoryThreadStore::new();
        let ctx = RequestContext::default();
        store
            .save_item("t1", &json!({"n": 1}), &ctx)
            .await
            .unwrap();
        store
            .save_item("t1", &json!({"n": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(store.items_for("t1").await.len(), 2);
        assert!(store.items_for("t2").await.is_empty());
    }
}
