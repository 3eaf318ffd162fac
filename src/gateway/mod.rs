//! Browser session gateway.
//!
//! Multiplexes browser WebSocket connections over the live voice sessions
//! their user owns. Each connection gets every event of every owned
//! session; each session has at most one pump task reading its model event
//! stream. Writes to one browser are serialized through a per-connection
//! lock so concurrent fan-outs never interleave frames.

pub mod events;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::realtime::session::{ModelSessionControl, ModelSessionFactory, SessionEvent};
use crate::registry::{SessionRegistry, VoiceSessionHandle};
use crate::store::{FinalizeSink, RequestContext, SessionTranscript};

use events::{parse_control_frame, ControlFrame, GatewayEvent};

/// Authenticated identity behind one browser connection.
#[derive(Debug, Clone)]
pub struct GatewayUser {
    pub id: String,
    pub email: Option<String>,
}

/// Transport seam for one browser WebSocket; tests install a collector.
#[async_trait]
pub trait WsSender: Send + Sync {
    async fn send_text(&self, text: String) -> anyhow::Result<()>;
}

/// One browser WebSocket connection.
pub struct GatewayConnection {
    pub id: String,
    pub user: GatewayUser,
    pub authorization: Option<String>,
    websocket: Box<dyn WsSender>,
    send_lock: Mutex<()>,
}

impl GatewayConnection {
    pub fn new(
        websocket: Box<dyn WsSender>,
        user: GatewayUser,
        authorization: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            user,
            authorization,
            websocket,
            send_lock: Mutex::new(()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }

    /// Serialized write: frames from concurrent fan-outs never interleave.
    pub async fn send_event(&self, event: &GatewayEvent) -> anyhow::Result<()> {
        let message = event.to_json();
        let _guard = self.send_lock.lock().await;
        self.websocket.send_text(message).await
    }
}

/// Per-user connection sets, shared with the session pump tasks.
#[derive(Default)]
struct ConnectionTable {
    inner: Mutex<HashMap<String, Vec<Arc<GatewayConnection>>>>,
}

impl ConnectionTable {
    async fn add(&self, connection: Arc<GatewayConnection>) {
        self.inner
            .lock()
            .await
            .entry(connection.user_id().to_string())
            .or_default()
            .push(connection);
    }

    async fn remove(&self, user_id: &str, connection_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(connections) = inner.get_mut(user_id) {
            connections.retain(|c| c.id != connection_id);
            if connections.is_empty() {
                inner.remove(user_id);
            }
        }
    }

    async fn for_user(&self, user_id: &str) -> Vec<Arc<GatewayConnection>> {
        self.inner
            .lock()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Fan an event out to every connection of a user. Connections whose
    /// write fails fall out of the table on the spot.
    async fn broadcast(&self, user_id: &str, event: &GatewayEvent) {
        if user_id.is_empty() {
            return;
        }
        let connections = self.for_user(user_id).await;
        let mut dead: Vec<String> = Vec::new();
        for connection in connections {
            if connection.send_event(event).await.is_err() {
                dead.push(connection.id.clone());
            }
        }
        for connection_id in dead {
            self.remove(user_id, &connection_id).await;
        }
    }

    async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

/// Per-session gateway state. Invariant: at most one pump task per session.
pub struct SessionState {
    handle: Arc<VoiceSessionHandle>,
    owner_user_id: String,
    history: Mutex<Vec<Value>>,
    listeners: Mutex<Vec<Arc<GatewayConnection>>>,
    control: Mutex<Option<Arc<dyn ModelSessionControl>>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
    input_audio_log_skip: AtomicU32,
}

impl SessionState {
    fn new(handle: Arc<VoiceSessionHandle>) -> Self {
        let owner_user_id = handle.metadata.user_id.clone();
        Self {
            handle,
            owner_user_id,
            history: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            control: Mutex::new(None),
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
            input_audio_log_skip: AtomicU32::new(0),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.handle.session_id
    }

    pub fn owner_user_id(&self) -> &str {
        &self.owner_user_id
    }

    pub fn thread_id(&self) -> Option<String> {
        self.handle
            .metadata
            .thread_id
            .clone()
            .filter(|id| !id.trim().is_empty())
    }

    fn session_payload(&self) -> Value {
        let metadata = &self.handle.metadata;
        let mut payload = json!({
            "model": metadata.model,
            "voice": metadata.voice,
            "realtime": metadata.realtime_config,
        });
        if let Some(instructions) = &metadata.instructions {
            payload["instructions"] = json!(instructions);
        }
        if let Some(tools) = &metadata.tools {
            payload["tools"] = Value::Array(tools.clone());
        }
        payload
    }

    /// Rate-limit input-audio debug logs: every 25th non-commit frame plus
    /// every commit.
    fn should_log_input_audio(&self, commit: bool) -> bool {
        if commit {
            self.input_audio_log_skip.store(0, Ordering::Relaxed);
            return true;
        }
        let previous = self.input_audio_log_skip.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            return true;
        }
        if previous + 1 >= 25 {
            self.input_audio_log_skip.store(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Reduce the history to user/assistant utterances the UI can resume
    /// from. Items keep their first-seen order even when updated.
    pub async fn transcripts(&self) -> Vec<SessionTranscript> {
        let history = self.history.lock().await;
        let mut ordered_ids: Vec<String> = Vec::new();
        let mut by_id: HashMap<String, SessionTranscript> = HashMap::new();

        for item in history.iter() {
            if item.get("type").and_then(Value::as_str) != Some("message") {
                continue;
            }
            let role = item.get("role").and_then(Value::as_str).unwrap_or_default();
            if role != "user" && role != "assistant" {
                continue;
            }
            let status = item
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            if !status.is_empty() && status != "completed" && status != "in_progress" {
                continue;
            }

            let mut text_parts: Vec<String> = Vec::new();
            if let Some(contents) = item.get("content").and_then(Value::as_array) {
                for content in contents {
                    let text = match content.get("type").and_then(Value::as_str) {
                        Some("input_text") | Some("output_text") | Some("text") => {
                            content.get("text").and_then(Value::as_str)
                        }
                        Some("input_audio") | Some("output_audio") | Some("audio") => {
                            content.get("transcript").and_then(Value::as_str)
                        }
                        _ => None,
                    };
                    if let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) {
                        text_parts.push(text.to_string());
                    }
                }
            }
            if text_parts.is_empty() {
                continue;
            }

            let identifier = item
                .get("item_id")
                .or_else(|| item.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}-{}", role, ordered_ids.len()));

            let entry = SessionTranscript {
                id: identifier.clone(),
                role: role.to_string(),
                text: text_parts.join("\n"),
                status: if status.is_empty() {
                    None
                } else {
                    Some(status)
                },
            };
            if !by_id.contains_key(&identifier) {
                ordered_ids.push(identifier.clone());
            }
            by_id.insert(identifier, entry);
        }

        ordered_ids
            .into_iter()
            .filter_map(|id| by_id.remove(&id))
            .collect()
    }

    async fn remove_listener(&self, connection_id: &str) {
        self.listeners
            .lock()
            .await
            .retain(|c| c.id != connection_id);
    }

    /// Convert one model-session event into the browser frame, maintaining
    /// the history mirror.
    async fn render_event(&self, event: SessionEvent) -> GatewayEvent {
        let session_id = self.session_id().to_string();
        match event {
            SessionEvent::HistoryAdded(item) => {
                self.history.lock().await.push(item.clone());
                GatewayEvent::HistoryDelta { session_id, item }
            }
            SessionEvent::Audio {
                item_id,
                content_index,
                response_id,
                data,
            } => GatewayEvent::Audio {
                session_id,
                item_id,
                content_index,
                response_id,
                data: BASE64.encode(data),
            },
            SessionEvent::AudioEnd {
                item_id,
                content_index,
            } => GatewayEvent::AudioEnd {
                session_id,
                item_id,
                content_index,
            },
            SessionEvent::AudioInterrupted {
                item_id,
                content_index,
            } => GatewayEvent::AudioInterrupted {
                session_id,
                item_id,
                content_index,
            },
            SessionEvent::Error(error) => GatewayEvent::SessionError { session_id, error },
        }
    }

    /// Cancel the pump and close the model session. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        if let Some(control) = self.control.lock().await.take() {
            control.close().await;
        }
    }
}

/// Central fan-out between browser connections and live voice sessions.
pub struct Gateway {
    sessions: Mutex<HashMap<String, Arc<SessionState>>>,
    connections: Arc<ConnectionTable>,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn ModelSessionFactory>,
    finalize: Arc<dyn FinalizeSink>,
}

impl Gateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn ModelSessionFactory>,
        finalize: Arc<dyn FinalizeSink>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            connections: Arc::new(ConnectionTable::default()),
            registry,
            factory,
            finalize,
        }
    }

    /// Announce a freshly admitted voice session to its owner's browsers.
    pub async fn register_session(&self, handle: Arc<VoiceSessionHandle>) {
        tracing::info!(
            "gateway: registering voice session {} for user {}",
            handle.session_id,
            handle.metadata.user_id
        );
        let state = self.get_or_create_state(handle).await;
        self.connections
            .broadcast(&state.owner_user_id, &session_created_payload(&state))
            .await;
    }

    /// Tear down a session's gateway state and tell browsers it closed.
    pub async fn unregister_session(&self, session_id: &str) {
        let state = self.sessions.lock().await.remove(session_id);
        let Some(state) = state else {
            return;
        };
        tracing::info!(
            "gateway: unregister session {} (user={})",
            session_id,
            state.owner_user_id
        );
        state.shutdown().await;
        self.connections
            .broadcast(
                &state.owner_user_id,
                &GatewayEvent::SessionClosed {
                    session_id: session_id.to_string(),
                },
            )
            .await;
    }

    async fn get_or_create_state(&self, handle: Arc<VoiceSessionHandle>) -> Arc<SessionState> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(handle.session_id.clone())
            .or_insert_with(|| Arc::new(SessionState::new(handle)))
            .clone()
    }

    /// Open the model session and start the single pump task, if neither
    /// exists yet.
    async fn ensure_session_started(&self, state: &Arc<SessionState>) -> anyhow::Result<()> {
        let mut control = state.control.lock().await;
        if control.is_some() {
            return Ok(());
        }
        if state.handle.client_secret.is_none() {
            anyhow::bail!("realtime client secret is missing for the session");
        }

        let session = self.factory.open(&state.handle).await?;
        *control = Some(session.control.clone());
        drop(control);

        let pump_state = state.clone();
        let connections = self.connections.clone();
        let mut event_stream = session.events;
        let pump = tokio::spawn(async move {
            while let Some(event) = event_stream.recv().await {
                let outbound = pump_state.render_event(event).await;
                connections
                    .broadcast(&pump_state.owner_user_id, &outbound)
                    .await;
            }
            // Stream closed: closure is broadcast when the session
            // unregisters, nothing to do here.
        });
        *state.pump.lock().await = Some(pump);
        Ok(())
    }

    async fn add_listener(
        &self,
        state: &Arc<SessionState>,
        connection: Arc<GatewayConnection>,
    ) -> anyhow::Result<()> {
        {
            let mut listeners = state.listeners.lock().await;
            if !listeners.iter().any(|c| c.id == connection.id) {
                listeners.push(connection.clone());
            }
        }
        self.ensure_session_started(state).await?;

        let history = state.history.lock().await.clone();
        if !history.is_empty() {
            let _ = connection
                .send_event(&GatewayEvent::History {
                    session_id: state.session_id().to_string(),
                    history,
                })
                .await;
        }
        Ok(())
    }

    /// Store a new browser connection and replay the sessions it owns.
    pub async fn register_connection(&self, connection: Arc<GatewayConnection>) {
        tracing::info!(
            "gateway: registering connection {} for user {}",
            connection.id,
            connection.user_id()
        );
        self.connections.add(connection.clone()).await;

        let owned: Vec<Arc<SessionState>> = {
            let sessions = self.sessions.lock().await;
            sessions
                .values()
                .filter(|state| state.owner_user_id == connection.user_id())
                .cloned()
                .collect()
        };
        for state in owned {
            let _ = connection.send_event(&session_created_payload(&state)).await;
            if let Err(e) = self.add_listener(&state, connection.clone()).await {
                tracing::warn!(
                    "gateway: failed to attach listener to session {}: {}",
                    state.session_id(),
                    e
                );
            }
        }
    }

    pub async fn unregister_connection(&self, connection: &GatewayConnection) {
        tracing::info!(
            "gateway: unregistering connection {} for user {}",
            connection.id,
            connection.user_id()
        );
        self.connections
            .remove(connection.user_id(), &connection.id)
            .await;
        let states: Vec<Arc<SessionState>> =
            self.sessions.lock().await.values().cloned().collect();
        for state in states {
            state.remove_listener(&connection.id).await;
        }
    }

    pub async fn broadcast_session_event(&self, state: &Arc<SessionState>, event: GatewayEvent) {
        self.connections
            .broadcast(&state.owner_user_id, &event)
            .await;
    }

    async fn state_for_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Option<Arc<SessionState>> {
        if let Some(state) = self.sessions.lock().await.get(session_id).cloned() {
            if state.owner_user_id == user_id {
                return Some(state);
            }
            return None;
        }
        // A session admitted before this gateway saw it can still be
        // adopted from the registry.
        let handle = self.registry.get(session_id).await?;
        let state = self.get_or_create_state(handle).await;
        if state.owner_user_id == user_id {
            Some(state)
        } else {
            None
        }
    }

    /// Handle one inbound control frame from a browser.
    pub async fn handle_message(&self, connection: &Arc<GatewayConnection>, text: &str) {
        let frame = match parse_control_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    "gateway: bad frame on connection {}: {}",
                    connection.id,
                    e
                );
                let _ = connection
                    .send_event(&GatewayEvent::Error {
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let session_id = frame.session_id().to_string();
        let Some(state) = self.state_for_user(&session_id, connection.user_id()).await else {
            tracing::warn!(
                "gateway: session {} not found for user {}",
                session_id,
                connection.user_id()
            );
            let _ = connection
                .send_event(&GatewayEvent::Error {
                    error: "voice session not found".to_string(),
                })
                .await;
            return;
        };

        match frame {
            ControlFrame::InputAudio { data, commit, .. } => {
                let pcm = match BASE64.decode(data.as_bytes()) {
                    Ok(pcm) => pcm,
                    Err(_) => {
                        let _ = connection
                            .send_event(&GatewayEvent::Error {
                                error: "invalid audio payload".to_string(),
                            })
                            .await;
                        return;
                    }
                };
                if state.should_log_input_audio(commit) {
                    tracing::debug!(
                        "gateway: input_audio session={} bytes={} commit={}",
                        session_id,
                        pcm.len(),
                        commit
                    );
                }
                if let Err(e) = self.send_session_audio(&state, &pcm, commit).await {
                    tracing::warn!("gateway: input audio failed for {}: {}", session_id, e);
                    let _ = connection
                        .send_event(&GatewayEvent::Error {
                            error: "audio forwarding failed".to_string(),
                        })
                        .await;
                }
            }
            ControlFrame::Interrupt { .. } => {
                tracing::info!(
                    "gateway: interrupt session={} via connection={}",
                    session_id,
                    connection.id
                );
                if let Err(e) = self.interrupt_session(&state).await {
                    tracing::warn!("gateway: interrupt failed for {}: {}", session_id, e);
                }
            }
            ControlFrame::Finalize { thread_id, .. } => {
                let Some(thread_id) = thread_id.or_else(|| state.thread_id()) else {
                    let _ = connection
                        .send_event(&GatewayEvent::Error {
                            error: "thread_id missing".to_string(),
                        })
                        .await;
                    return;
                };
                self.finalize_session(connection, &state, &session_id, thread_id)
                    .await;
            }
        }
    }

    async fn send_session_audio(
        &self,
        state: &Arc<SessionState>,
        pcm: &[u8],
        commit: bool,
    ) -> anyhow::Result<()> {
        self.ensure_session_started(state).await?;
        let control = state.control.lock().await.clone();
        match control {
            Some(control) => control.send_audio(pcm, commit).await.map_err(Into::into),
            None => anyhow::bail!("realtime session not ready"),
        }
    }

    async fn interrupt_session(&self, state: &Arc<SessionState>) -> anyhow::Result<()> {
        self.ensure_session_started(state).await?;
        let control = state.control.lock().await.clone();
        if let Some(control) = control {
            control.interrupt().await?;
        }
        Ok(())
    }

    /// Flush transcripts, persist the wait-state resolution, close the
    /// model session and announce the finale. Safe to repeat: a session
    /// whose pump already exited still gets its `session_finalized`.
    async fn finalize_session(
        &self,
        connection: &Arc<GatewayConnection>,
        state: &Arc<SessionState>,
        session_id: &str,
        thread_id: String,
    ) {
        tracing::info!(
            "gateway: finalize session={} thread={} via connection={}",
            session_id,
            thread_id,
            connection.id
        );
        let transcripts = state.transcripts().await;

        let ctx = RequestContext {
            user_id: connection.user_id().to_string(),
            authorization: connection.authorization.clone(),
        };
        if let Err(e) = self
            .finalize
            .finalize_voice_wait_state(&thread_id, &transcripts, &ctx)
            .await
        {
            tracing::error!("gateway: finalize sink failed for {}: {}", thread_id, e);
        }

        if self.registry.remove(Some(session_id), None).await.is_none() {
            tracing::debug!("gateway: session {} already out of the registry", session_id);
        }
        self.unregister_session(session_id).await;

        self.connections
            .broadcast(
                &state.owner_user_id,
                &GatewayEvent::SessionFinalized {
                    session_id: session_id.to_string(),
                    thread_id,
                    transcripts,
                },
            )
            .await;
    }

    /// Serve one upgraded browser WebSocket until it disconnects.
    pub async fn serve_socket(
        self: Arc<Self>,
        socket: WebSocket,
        user: GatewayUser,
        authorization: Option<String>,
    ) {
        let (sender, mut receiver) = socket.split();
        let connection = Arc::new(GatewayConnection::new(
            Box::new(AxumWsSender {
                inner: Mutex::new(sender),
            }),
            user,
            authorization,
        ));

        self.register_connection(connection.clone()).await;

        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    self.handle_message(&connection, text.as_str()).await;
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {
                    let _ = connection
                        .send_event(&GatewayEvent::Error {
                            error: "unsupported frame type".to_string(),
                        })
                        .await;
                }
            }
        }

        tracing::debug!(
            "gateway: websocket closed for user {}",
            connection.user_id()
        );
        self.unregister_connection(&connection).await;
    }
}

fn session_created_payload(state: &Arc<SessionState>) -> GatewayEvent {
    GatewayEvent::SessionCreated {
        session_id: state.session_id().to_string(),
        thread_id: state.thread_id(),
        session: state.session_payload(),
    }
}

struct AxumWsSender {
    inner: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl WsSender for AxumWsSender {
    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        self.inner
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| anyhow::anyhow!("websocket send failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::session::ModelSession;
    use crate::realtime::RealtimeError;
    use crate::registry::SessionMetadata;
    use crate::store::MemoryThreadStore;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    struct CollectorSender {
        frames: Arc<StdMutex<Vec<Value>>>,
    }

    #[async_trait]
    impl WsSender for CollectorSender {
        async fn send_text(&self, text: String) -> anyhow::Result<()> {
            self.frames
                .lock()
                .unwrap()
                .push(serde_json::from_str(&text).unwrap());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeControl {
        audio: StdMutex<Vec<(Vec<u8>, bool)>>,
        interrupted: StdMutex<bool>,
        closed: StdMutex<bool>,
    }

    #[async_trait]
    impl ModelSessionControl for FakeControl {
        async fn send_audio(&self, pcm: &[u8], commit: bool) -> Result<(), RealtimeError> {
            self.audio.lock().unwrap().push((pcm.to_vec(), commit));
            Ok(())
        }

        async fn interrupt(&self) -> Result<(), RealtimeError> {
            *self.interrupted.lock().unwrap() = true;
            Ok(())
        }

        async fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    struct FakeFactory {
        control: Arc<FakeControl>,
        events: StdMutex<Option<mpsc::Receiver<SessionEvent>>>,
        opened: StdMutex<u32>,
    }

    impl FakeFactory {
        fn with_events() -> (Arc<Self>, mpsc::Sender<SessionEvent>) {
            let (tx, rx) = mpsc::channel(16);
            (
                Arc::new(Self {
                    control: Arc::new(FakeControl::default()),
                    events: StdMutex::new(Some(rx)),
                    opened: StdMutex::new(0),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl ModelSessionFactory for FakeFactory {
        async fn open(&self, _handle: &VoiceSessionHandle) -> Result<ModelSession, RealtimeError> {
            *self.opened.lock().unwrap() += 1;
            let events = self
                .events
                .lock()
                .unwrap()
                .take()
                .expect("session opened once");
            Ok(ModelSession {
                events,
                control: self.control.clone(),
            })
        }
    }

    fn handle(session_id: &str, user_id: &str) -> Arc<VoiceSessionHandle> {
        Arc::new(VoiceSessionHandle {
            session_id: session_id.to_string(),
            client_secret: Some("ek_test".to_string()),
            payload: Value::Null,
            metadata: SessionMetadata {
                user_id: user_id.to_string(),
                model: "gpt-realtime".to_string(),
                voice: Some("verse".to_string()),
                instructions: Some("Salut".to_string()),
                thread_id: Some("thread-1".to_string()),
                ..SessionMetadata::default()
            },
        })
    }

    struct Harness {
        gateway: Arc<Gateway>,
        registry: Arc<SessionRegistry>,
        store: Arc<MemoryThreadStore>,
        factory: Arc<FakeFactory>,
        _events_tx: mpsc::Sender<SessionEvent>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(MemoryThreadStore::new());
        let (factory, events_tx) = FakeFactory::with_events();
        let gateway = Arc::new(Gateway::new(
            registry.clone(),
            factory.clone(),
            store.clone(),
        ));
        Harness {
            gateway,
            registry,
            store,
            factory,
            _events_tx: events_tx,
        }
    }

    fn connection(frames: &Arc<StdMutex<Vec<Value>>>, user_id: &str) -> Arc<GatewayConnection> {
        Arc::new(GatewayConnection::new(
            Box::new(CollectorSender {
                frames: frames.clone(),
            }),
            GatewayUser {
                id: user_id.to_string(),
                email: Some("user@example.com".to_string()),
            },
            Some("Bearer token".to_string()),
        ))
    }

    async fn state_of(gateway: &Gateway, session_id: &str) -> Arc<SessionState> {
        gateway
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn register_connection_pushes_existing_sessions() {
        let h = harness();
        h.gateway.register_session(handle("s1", "user-1")).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "user-1");
        h.gateway.register_connection(conn.clone()).await;

        let frames = frames.lock().unwrap();
        assert!(!frames.is_empty(), "no frames received");
        assert_eq!(frames[0]["type"], "session_created");
        assert_eq!(frames[0]["session_id"], "s1");
        assert_eq!(frames[0]["thread_id"], "thread-1");
        assert_eq!(frames[0]["session"]["model"], "gpt-realtime");
        // Attaching the listener started the single model session.
        assert_eq!(*h.factory.opened.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn foreign_users_see_nothing() {
        let h = harness();
        h.gateway.register_session(handle("s1", "user-1")).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "someone-else");
        h.gateway.register_connection(conn.clone()).await;
        assert!(frames.lock().unwrap().is_empty());

        // And control frames against the session are refused.
        h.gateway
            .handle_message(
                &conn,
                &json!({"type": "interrupt", "session_id": "s1"}).to_string(),
            )
            .await;
        let frames = frames.lock().unwrap();
        assert_eq!(frames[0]["type"], "error");
    }

    #[tokio::test]
    async fn input_audio_reaches_the_model_session() {
        let h = harness();
        h.gateway.register_session(handle("s1", "user-1")).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "user-1");
        h.gateway.register_connection(conn.clone()).await;

        let payload = json!({
            "type": "input_audio",
            "session_id": "s1",
            "data": BASE64.encode(b"pcm"),
        });
        h.gateway.handle_message(&conn, &payload.to_string()).await;

        let audio = h.factory.control.audio.lock().unwrap();
        assert_eq!(audio.as_slice(), &[(b"pcm".to_vec(), false)]);
    }

    #[tokio::test]
    async fn invalid_base64_audio_is_an_error_frame() {
        let h = harness();
        h.gateway.register_session(handle("s1", "user-1")).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "user-1");
        h.gateway.register_connection(conn.clone()).await;
        frames.lock().unwrap().clear();

        let payload = json!({
            "type": "input_audio",
            "session_id": "s1",
            "data": "!!!",
        });
        h.gateway.handle_message(&conn, &payload.to_string()).await;

        let frames = frames.lock().unwrap();
        assert_eq!(frames[0]["type"], "error");
        assert!(h.factory.control.audio.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_returns_error_frame() {
        let h = harness();
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "user-1");
        h.gateway.register_connection(conn.clone()).await;

        h.gateway
            .handle_message(
                &conn,
                &json!({
                    "type": "input_audio",
                    "session_id": "missing",
                    "data": BASE64.encode(b"pcm"),
                })
                .to_string(),
            )
            .await;

        let frames = frames.lock().unwrap();
        assert_eq!(frames[0]["type"], "error");
    }

    #[tokio::test]
    async fn finalize_closes_session_and_broadcasts() {
        let h = harness();
        let handle = handle("s1", "user-1");
        h.registry.add(handle.clone()).await;
        h.gateway.register_session(handle).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "user-1");
        h.gateway.register_connection(conn.clone()).await;

        // Seed history as the pump would have.
        {
            let state = state_of(&h.gateway, "s1").await;
            state.history.lock().await.push(json!({
                "type": "message",
                "role": "assistant",
                "id": "m1",
                "status": "completed",
                "content": [{"type": "output_text", "text": "Bonjour"}],
            }));
        }

        h.gateway
            .handle_message(
                &conn,
                &json!({"type": "finalize", "session_id": "s1"}).to_string(),
            )
            .await;

        // The finalize sink saw the transcripts under the session's thread.
        let finalized = h.store.finalized().await;
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].0, "thread-1");
        assert_eq!(finalized[0].1[0].text, "Bonjour");

        // Registry and gateway state are both gone.
        assert!(h.registry.get("s1").await.is_none());
        assert!(h.gateway.sessions.lock().await.is_empty());
        assert!(*h.factory.control.closed.lock().unwrap());

        let frames = frames.lock().unwrap();
        let kinds: Vec<&str> = frames
            .iter()
            .map(|f| f["type"].as_str().unwrap())
            .collect();
        assert!(kinds.contains(&"session_closed"));
        let finalized_frame = frames
            .iter()
            .find(|f| f["type"] == "session_finalized")
            .expect("session_finalized frame");
        assert_eq!(finalized_frame["thread_id"], "thread-1");
        assert_eq!(finalized_frame["transcripts"][0]["text"], "Bonjour");
    }

    #[tokio::test]
    async fn finalize_with_empty_history_still_delivers_empty_transcripts() {
        let h = harness();
        let handle = handle("s1", "user-1");
        h.registry.add(handle.clone()).await;
        h.gateway.register_session(handle).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "user-1");
        h.gateway.register_connection(conn.clone()).await;

        h.gateway
            .handle_message(
                &conn,
                &json!({"type": "finalize", "session_id": "s1"}).to_string(),
            )
            .await;

        let frames = frames.lock().unwrap();
        let finalized_frame = frames
            .iter()
            .find(|f| f["type"] == "session_finalized")
            .expect("session_finalized frame");
        assert_eq!(
            finalized_frame["transcripts"],
            Value::Array(Vec::new()),
            "empty transcripts must still be delivered"
        );
    }

    #[tokio::test]
    async fn pump_events_fan_out_in_order() {
        let h = harness();
        let events_tx = h._events_tx.clone();
        h.gateway.register_session(handle("s1", "user-1")).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "user-1");
        h.gateway.register_connection(conn.clone()).await;

        events_tx
            .send(SessionEvent::Audio {
                item_id: Some("i1".to_string()),
                content_index: Some(0),
                response_id: Some("r1".to_string()),
                data: vec![1, 2],
            })
            .await
            .unwrap();
        events_tx
            .send(SessionEvent::HistoryAdded(json!({
                "type": "message",
                "role": "assistant",
                "id": "m1",
                "content": [{"type": "output_text", "text": "Salut"}],
            })))
            .await
            .unwrap();
        events_tx
            .send(SessionEvent::AudioEnd {
                item_id: Some("i1".to_string()),
                content_index: Some(0),
            })
            .await
            .unwrap();

        // Give the pump task a beat to drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let frames = frames.lock().unwrap();
        let kinds: Vec<&str> = frames
            .iter()
            .map(|f| f["type"].as_str().unwrap())
            .collect();
        assert_eq!(
            kinds,
            vec!["session_created", "audio", "history_delta", "audio_end"]
        );
        assert_eq!(frames[1]["data"], BASE64.encode([1u8, 2]));
        assert_eq!(frames[1]["session_id"], "s1");
    }

    #[tokio::test]
    async fn transcripts_extraction_filters_and_orders() {
        let h = harness();
        h.gateway.register_session(handle("s1", "user-1")).await;
        let state = state_of(&h.gateway, "s1").await;

        {
            let mut history = state.history.lock().await;
            history.push(json!({
                "type": "message", "role": "user", "id": "u1",
                "content": [{"type": "input_audio", "transcript": "Allo"}],
            }));
            history.push(json!({
                "type": "message", "role": "assistant", "id": "a1", "status": "completed",
                "content": [{"type": "output_text", "text": "Bonjour"}],
            }));
            // Updated item under the same id keeps its original position.
            history.push(json!({
                "type": "message", "role": "assistant", "id": "a1", "status": "completed",
                "content": [{"type": "output_text", "text": "Bonjour!"}],
            }));
            // Filtered out: wrong type, wrong role, failed status, no text.
            history.push(json!({"type": "tool_call", "id": "t1"}));
            history.push(json!({
                "type": "message", "role": "system", "id": "sys",
                "content": [{"type": "text", "text": "hidden"}],
            }));
            history.push(json!({
                "type": "message", "role": "assistant", "id": "bad", "status": "failed",
                "content": [{"type": "output_text", "text": "nope"}],
            }));
            history.push(json!({
                "type": "message", "role": "assistant", "id": "empty",
                "content": [],
            }));
        }

        let transcripts = state.transcripts().await;
        assert_eq!(transcripts.len(), 2);
        assert_eq!(transcripts[0].id, "u1");
        assert_eq!(transcripts[0].text, "Allo");
        assert_eq!(transcripts[1].id, "a1");
        assert_eq!(transcripts[1].text, "Bonjour!");
    }

    #[tokio::test]
    async fn input_audio_log_rate_limit() {
        let h = harness();
        h.gateway.register_session(handle("s1", "user-1")).await;
        let state = state_of(&h.gateway, "s1").await;

        assert!(state.should_log_input_audio(false), "first packet logs");
        let mut logged = 0;
        for _ in 0..48 {
            if state.should_log_input_audio(false) {
                logged += 1;
            }
        }
        assert_eq!(logged, 2, "every 25th packet logs");
        assert!(state.should_log_input_audio(true), "commits always log");
        assert!(state.should_log_input_audio(false), "counter resets on commit");
    }

    #[tokio::test]
    async fn unregister_connection_detaches_listeners() {
        let h = harness();
        h.gateway.register_session(handle("s1", "user-1")).await;

        let frames = Arc::new(StdMutex::new(Vec::new()));
        let conn = connection(&frames, "user-1");
        h.gateway.register_connection(conn.clone()).await;

        let state = state_of(&h.gateway, "s1").await;
        assert_eq!(state.listeners.lock().await.len(), 1);

        h.gateway.unregister_connection(&conn).await;
        assert_eq!(state.listeners.lock().await.len(), 0);
        assert!(h.gateway.connections.is_empty().await);
    }
}
