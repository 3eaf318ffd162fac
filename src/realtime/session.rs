//! Gateway-side model sessions.
//!
//! When a browser listens to a live call, the gateway opens its own
//! Realtime connection with the session's client secret and pumps model
//! events into the listener fan-out. This module owns that connection: the
//! factory opens it, the control handle feeds it, and a reader task
//! translates wire events into [`SessionEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::client::{RealtimeConnector, RealtimeSink};
use super::events::{parse_server_event, ClientEvent, ServerEvent, SessionConfig};
use super::{build_realtime_ws_url, RealtimeError};
use crate::registry::VoiceSessionHandle;

const RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Model-session events consumed by the gateway pump.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    HistoryAdded(Value),
    Audio {
        item_id: Option<String>,
        content_index: Option<i64>,
        response_id: Option<String>,
        data: Vec<u8>,
    },
    AudioEnd {
        item_id: Option<String>,
        content_index: Option<i64>,
    },
    AudioInterrupted {
        item_id: Option<String>,
        content_index: Option<i64>,
    },
    Error(Value),
}

/// Write side of an open model session.
#[async_trait]
pub trait ModelSessionControl: Send + Sync {
    /// Append caller audio; `commit` closes the input turn explicitly.
    async fn send_audio(&self, pcm: &[u8], commit: bool) -> Result<(), RealtimeError>;

    /// Cancel the in-flight model response.
    async fn interrupt(&self) -> Result<(), RealtimeError>;

    /// Stop the reader and close the connection.
    async fn close(&self);
}

/// An open model session: the event stream plus its control handle.
pub struct ModelSession {
    pub events: mpsc::Receiver<SessionEvent>,
    pub control: Arc<dyn ModelSessionControl>,
}

/// Opens model sessions for registered handles. The gateway takes this as a
/// seam; tests install a channel-backed fake.
#[async_trait]
pub trait ModelSessionFactory: Send + Sync {
    async fn open(&self, handle: &VoiceSessionHandle) -> Result<ModelSession, RealtimeError>;
}

/// Production factory connecting over the Realtime WebSocket.
pub struct RealtimeSessionFactory {
    connector: Arc<dyn RealtimeConnector>,
    api_base: String,
}

impl RealtimeSessionFactory {
    pub fn new(connector: Arc<dyn RealtimeConnector>, api_base: String) -> Self {
        Self {
            connector,
            api_base,
        }
    }
}

struct WsSessionControl {
    sink: Mutex<Box<dyn RealtimeSink>>,
    cancel: CancellationToken,
}

#[async_trait]
impl ModelSessionControl for WsSessionControl {
    async fn send_audio(&self, pcm: &[u8], commit: bool) -> Result<(), RealtimeError> {
        let mut sink = self.sink.lock().await;
        sink.send_text(
            ClientEvent::InputAudioAppend {
                audio: BASE64.encode(pcm),
            }
            .to_json(),
        )
        .await?;
        if commit {
            sink.send_text(ClientEvent::InputAudioCommit.to_json())
                .await?;
        }
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), RealtimeError> {
        self.sink
            .lock()
            .await
            .send_text(ClientEvent::ResponseCancel.to_json())
            .await
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.sink.lock().await.close().await;
    }
}

#[async_trait]
impl ModelSessionFactory for RealtimeSessionFactory {
    async fn open(&self, handle: &VoiceSessionHandle) -> Result<ModelSession, RealtimeError> {
        let client_secret = handle
            .client_secret
            .as_deref()
            .ok_or(RealtimeError::MissingClientSecret)?;

        let url = build_realtime_ws_url(&handle.metadata.model, &self.api_base);
        let (mut sink, mut source) = self.connector.connect(&url, client_secret).await?;

        let session = SessionConfig::new(
            &handle.metadata.model,
            handle.metadata.instructions.as_deref().unwrap_or_default(),
            handle.metadata.voice.as_deref(),
        );
        sink.send_text(ClientEvent::SessionUpdate { session }.to_json())
            .await?;

        let cancel = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(64);

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            // Transcript fragments per response, flushed on completion as a
            // history item.
            let mut buffers: HashMap<String, Vec<String>> = HashMap::new();

            loop {
                if reader_cancel.is_cancelled() {
                    break;
                }
                let raw = match source.recv_text(RECEIVE_TIMEOUT).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => continue,
                    Err(RealtimeError::Closed) => break,
                    Err(e) => {
                        let _ = event_tx.send(SessionEvent::Error(json!(e.to_string()))).await;
                        break;
                    }
                };
                let Some(event) = parse_server_event(&raw) else {
                    continue;
                };

                let forwarded = match event {
                    ServerEvent::SessionEnded => break,
                    ServerEvent::Error { message } => {
                        let _ = event_tx.send(SessionEvent::Error(json!(message))).await;
                        break;
                    }
                    ServerEvent::AudioDelta {
                        response_id,
                        chunks,
                    } => {
                        let mut ok = true;
                        for chunk in chunks {
                            let Ok(data) = BASE64.decode(chunk.as_bytes()) else {
                                tracing::debug!("invalid base64 audio delta ignored");
                                continue;
                            };
                            if data.is_empty() {
                                continue;
                            }
                            if event_tx
                                .send(SessionEvent::Audio {
                                    item_id: None,
                                    content_index: None,
                                    response_id: response_id.clone(),
                                    data,
                                })
                                .await
                                .is_err()
                            {
                                ok = false;
                                break;
                            }
                        }
                        ok
                    }
                    ServerEvent::TranscriptDelta { response_id, text } => {
                        if let Some(id) = response_id {
                            buffers.entry(id).or_default().push(text);
                        }
                        true
                    }
                    ServerEvent::ResponseCompleted {
                        response_id,
                        transcripts,
                    } => {
                        let mut texts: Vec<String> =
                            transcripts.into_iter().map(|t| t.text).collect();
                        if texts.is_empty() {
                            if let Some(id) = &response_id {
                                if let Some(parts) = buffers.remove(id) {
                                    let combined = parts.concat().trim().to_string();
                                    if !combined.is_empty() {
                                        texts.push(combined);
                                    }
                                }
                            }
                        } else if let Some(id) = &response_id {
                            buffers.remove(id);
                        }

                        let mut ok = true;
                        for text in texts {
                            let item = json!({
                                "type": "message",
                                "role": "assistant",
                                "status": "completed",
                                "id": response_id,
                                "content": [{"type": "output_text", "text": text}],
                            });
                            if event_tx
                                .send(SessionEvent::HistoryAdded(item))
                                .await
                                .is_err()
                            {
                                ok = false;
                                break;
                            }
                        }
                        ok && event_tx
                            .send(SessionEvent::AudioEnd {
                                item_id: response_id.clone(),
                                content_index: None,
                            })
                            .await
                            .is_ok()
                    }
                    ServerEvent::SpeechStarted => event_tx
                        .send(SessionEvent::AudioInterrupted {
                            item_id: None,
                            content_index: None,
                        })
                        .await
                        .is_ok(),
                    ServerEvent::SpeechStopped | ServerEvent::ResponseCancelled => true,
                    ServerEvent::Unknown { kind } => {
                        tracing::debug!("unhandled realtime event kind: {}", kind);
                        true
                    }
                };

                if !forwarded {
                    break;
                }
            }
        });

        Ok(ModelSession {
            events: event_rx,
            control: Arc::new(WsSessionControl {
                sink: Mutex::new(sink),
                cancel,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::client::RealtimeSource;
    use crate::registry::SessionMetadata;
    use std::sync::Mutex as StdMutex;

    struct FakeSink {
        sent: Arc<StdMutex<Vec<Value>>>,
    }

    #[async_trait]
    impl RealtimeSink for FakeSink {
        async fn send_text(&mut self, text: String) -> Result<(), RealtimeError> {
            self.sent
                .lock()
                .unwrap()
                .push(serde_json::from_str(&text).unwrap());
            Ok(())
        }

        async fn close(&mut self) {}
    }

    struct FakeSource {
        frames: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl RealtimeSource for FakeSource {
        async fn recv_text(&mut self, timeout: Duration) -> Result<Option<String>, RealtimeError> {
            match tokio::time::timeout(timeout, self.frames.recv()).await {
                Err(_) => Ok(None),
                Ok(Some(frame)) => Ok(Some(frame)),
                Ok(None) => Err(RealtimeError::Closed),
            }
        }
    }

    struct FakeConnector {
        sent: Arc<StdMutex<Vec<Value>>>,
        frames: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
    }

    #[async_trait]
    impl RealtimeConnector for FakeConnector {
        async fn connect(
            &self,
            _url: &str,
            _client_secret: &str,
        ) -> Result<(Box<dyn RealtimeSink>, Box<dyn RealtimeSource>), RealtimeError> {
            let frames = self.frames.lock().unwrap().take().expect("single connect");
            Ok((
                Box::new(FakeSink {
                    sent: self.sent.clone(),
                }),
                Box::new(FakeSource { frames }),
            ))
        }
    }

    fn handle() -> VoiceSessionHandle {
        VoiceSessionHandle {
            session_id: "s1".to_string(),
            client_secret: Some("ek_test".to_string()),
            payload: Value::Null,
            metadata: SessionMetadata {
                user_id: "user-1".to_string(),
                model: "gpt-realtime".to_string(),
                voice: Some("verse".to_string()),
                instructions: Some("Sois bref.".to_string()),
                ..SessionMetadata::default()
            },
        }
    }

    #[tokio::test]
    async fn open_sends_session_update_and_translates_events() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let factory = RealtimeSessionFactory::new(
            Arc::new(FakeConnector {
                sent: sent.clone(),
                frames: StdMutex::new(Some(frames_rx)),
            }),
            "https://api.example.com".to_string(),
        );

        let mut session = factory.open(&handle()).await.unwrap();

        assert_eq!(sent.lock().unwrap()[0]["type"], "session.update");

        frames_tx
            .send(
                json!({"type": "response.output_audio.delta", "response_id": "r1", "delta": BASE64.encode([1u8, 2, 3, 4])})
                    .to_string(),
            )
            .unwrap();
        frames_tx
            .send(
                json!({"type": "response.audio_transcript.delta", "response_id": "r1", "delta": "Salut"})
                    .to_string(),
            )
            .unwrap();
        frames_tx
            .send(json!({"type": "response.completed", "response_id": "r1"}).to_string())
            .unwrap();

        match session.events.recv().await.unwrap() {
            SessionEvent::Audio {
                response_id, data, ..
            } => {
                assert_eq!(response_id.as_deref(), Some("r1"));
                assert_eq!(data, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match session.events.recv().await.unwrap() {
            SessionEvent::HistoryAdded(item) => {
                assert_eq!(item["type"], "message");
                assert_eq!(item["content"][0]["text"], "Salut");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            session.events.recv().await.unwrap(),
            SessionEvent::AudioEnd { .. }
        ));

        session.control.close().await;
    }

    #[tokio::test]
    async fn control_sends_append_commit_and_cancel() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let (_frames_tx, frames_rx) = mpsc::unbounded_channel::<String>();
        let factory = RealtimeSessionFactory::new(
            Arc::new(FakeConnector {
                sent: sent.clone(),
                frames: StdMutex::new(Some(frames_rx)),
            }),
            "https://api.example.com".to_string(),
        );

        let session = factory.open(&handle()).await.unwrap();
        session.control.send_audio(&[0u8; 4], true).await.unwrap();
        session.control.interrupt().await.unwrap();

        let frames = sent.lock().unwrap();
        let kinds: Vec<String> = frames
            .iter()
            .map(|f| f["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "session.update",
                "input_audio_buffer.append",
                "input_audio_buffer.commit",
                "response.cancel",
            ]
        );
    }

    #[tokio::test]
    async fn missing_secret_fails_to_open() {
        let (_frames_tx, frames_rx) = mpsc::unbounded_channel::<String>();
        let factory = RealtimeSessionFactory::new(
            Arc::new(FakeConnector {
                sent: Arc::new(StdMutex::new(Vec::new())),
                frames: StdMutex::new(Some(frames_rx)),
            }),
            "https://api.example.com".to_string(),
        );

        let mut no_secret = handle();
        no_secret.client_secret = None;
        assert!(matches!(
            factory.open(&no_secret).await,
            Err(RealtimeError::MissingClientSecret)
        ));
    }
}
