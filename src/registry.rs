//! Process-wide directory of live voice sessions.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Typed session metadata threaded from call admission to the gateway.
#[derive(Debug, Clone, Default)]
pub struct SessionMetadata {
    pub user_id: String,
    pub model: String,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub thread_id: Option<String>,
    pub provider_id: Option<String>,
    pub provider_slug: Option<String>,
    pub realtime_config: Option<Value>,
    pub tools: Option<Vec<Value>>,
}

/// In-memory record of one open Realtime voice session.
#[derive(Debug, Clone)]
pub struct VoiceSessionHandle {
    pub session_id: String,
    /// Short-lived bearer credential for the model; secondary registry key.
    pub client_secret: Option<String>,
    /// Provider payload from the credential mint, kept for wait states.
    pub payload: Value,
    pub metadata: SessionMetadata,
}

impl VoiceSessionHandle {
    /// Summary for logs: never includes the secret itself.
    pub fn summary(&self) -> Value {
        json!({
            "session_id": self.session_id,
            "client_secret_present": self.client_secret.is_some(),
            "user_id": self.metadata.user_id,
            "model": self.metadata.model,
            "thread_id": self.metadata.thread_id,
        })
    }
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, Arc<VoiceSessionHandle>>,
    by_secret: HashMap<String, String>,
}

/// Registry of open sessions, indexed by id and by client secret. All
/// operations hold the single mutex; lookups are O(1).
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, handle: Arc<VoiceSessionHandle>) {
        let mut inner = self.inner.lock().await;
        if let Some(secret) = &handle.client_secret {
            inner.by_secret.insert(secret.clone(), handle.session_id.clone());
        }
        inner.by_id.insert(handle.session_id.clone(), handle);
    }

    /// Remove by session id or client secret; returns the handle if it was
    /// present.
    pub async fn remove(
        &self,
        session_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Option<Arc<VoiceSessionHandle>> {
        let mut inner = self.inner.lock().await;
        let target_id = match session_id {
            Some(id) => Some(id.to_string()),
            None => client_secret.and_then(|secret| inner.by_secret.remove(secret)),
        };
        let handle = target_id.and_then(|id| inner.by_id.remove(&id))?;
        if let Some(secret) = &handle.client_secret {
            inner.by_secret.remove(secret);
        }
        Some(handle)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<VoiceSessionHandle>> {
        self.inner.lock().await.by_id.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
