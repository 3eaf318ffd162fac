//! Realtime wire events.
//!
//! Client → server frames are plain tagged structs. Server → client frames
//! arrive in both the GA shape (string `delta`) and the older beta shape
//! (nested objects), so inbound parsing goes through `serde_json::Value`
//! with tolerant extractors instead of a strict enum. Unknown kinds are
//! surfaced as [`ServerEvent::Unknown`] for the caller to log and skip.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One finished utterance attributed to a speaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub text: String,
}

/// Frames the gateway sends to the model.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,
    #[serde(rename = "response.cancel")]
    ResponseCancel,
    /// Ask the model for an unprompted turn; used when a route is
    /// configured to speak first.
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("client events serialize")
    }
}

/// GA-format `session.update` payload: PCM16 at 24 kHz both ways, server VAD.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
    pub instructions: String,
    pub audio: AudioConfig,
    pub turn_detection: TurnDetection,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioConfig {
    pub input: AudioDirection,
    pub output: AudioDirection,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioDirection {
    pub format: AudioFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioFormat {
    #[serde(rename = "type")]
    pub kind: String,
    pub rate: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f64,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

pub const MODEL_SAMPLE_RATE: u32 = 24_000;

impl SessionConfig {
    pub fn new(model: &str, instructions: &str, voice: Option<&str>) -> Self {
        let pcm = |voice: Option<String>| AudioDirection {
            format: AudioFormat {
                kind: "audio/pcm".to_string(),
                rate: MODEL_SAMPLE_RATE,
            },
            voice,
        };
        Self {
            kind: "realtime".to_string(),
            model: model.to_string(),
            instructions: instructions.to_string(),
            audio: AudioConfig {
                input: pcm(None),
                output: pcm(voice.map(str::to_string)),
            },
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
            },
        }
    }
}

/// Frames the model sends to the gateway, reduced to what the bridge acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SpeechStarted,
    SpeechStopped,
    ResponseCancelled,
    AudioDelta {
        response_id: Option<String>,
        chunks: Vec<String>,
    },
    TranscriptDelta {
        response_id: Option<String>,
        text: String,
    },
    ResponseCompleted {
        response_id: Option<String>,
        transcripts: Vec<TranscriptEntry>,
    },
    SessionEnded,
    Error {
        message: String,
    },
    Unknown {
        kind: String,
    },
}

/// Parse a raw WebSocket text frame. Returns `None` for empty or non-JSON
/// frames, which are skipped without ending the session.
pub fn parse_server_event(raw: &str) -> Option<ServerEvent> {
    let candidate = raw.trim();
    if candidate.is_empty() {
        return None;
    }
    let message: Value = match serde_json::from_str(candidate) {
        Ok(value) => value,
        Err(_) => {
            tracing::debug!("non-JSON realtime frame ignored");
            return None;
        }
    };

    let kind = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    let event = match kind.as_str() {
        "input_audio_buffer.speech_started" => ServerEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => ServerEvent::SpeechStopped,
        "response.cancelled" => ServerEvent::ResponseCancelled,
        "session.ended" => ServerEvent::SessionEnded,
        "error" => ServerEvent::Error {
            message: extract_error_message(&message),
        },
        "response.completed" => ServerEvent::ResponseCompleted {
            response_id: extract_response_id(&message),
            transcripts: extract_completed_transcripts(message.get("response")),
        },
        _ if kind.ends_with("audio.delta") => ServerEvent::AudioDelta {
            response_id: extract_response_id(&message),
            chunks: extract_audio_chunks(&message),
        },
        _ if kind.ends_with("transcript.delta") => {
            let text = extract_transcript_text(&message)?;
            ServerEvent::TranscriptDelta {
                response_id: extract_response_id(&message),
                text,
            }
        }
        _ => ServerEvent::Unknown { kind },
    };
    Some(event)
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    let text = value?.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Response id may sit at the top level or inside the `response` object,
/// under either naming convention.
pub fn extract_response_id(message: &Value) -> Option<String> {
    for key in ["response_id", "responseId", "id"] {
        if let Some(id) = non_empty(message.get(key)) {
            return Some(id);
        }
    }
    let response = message.get("response")?;
    for key in ["id", "response_id", "responseId"] {
        if let Some(id) = non_empty(response.get(key)) {
            return Some(id);
        }
    }
    None
}

/// Collect base64 audio chunks from GA (`delta` string) or beta (`audio`/
/// `chunk` fields, possibly nested under `delta`) framings.
pub fn extract_audio_chunks(message: &Value) -> Vec<String> {
    let mut chunks = Vec::new();

    let mut push = |value: &Value| match value {
        Value::String(text) => chunks.push(text.clone()),
        Value::Array(items) => {
            chunks.extend(items.iter().filter_map(Value::as_str).map(str::to_string))
        }
        _ => {}
    };

    for key in ["audio", "chunk"] {
        if let Some(value) = message.get(key) {
            push(value);
        }
    }

    match message.get("delta") {
        Some(Value::Object(delta)) => {
            if let Some(value) = delta.get("audio").or_else(|| delta.get("chunk")) {
                push(value);
            }
        }
        // GA framing: delta is the base64 string itself.
        Some(value) => push(value),
        None => {}
    }

    chunks
}

/// Transcript text from GA (`delta` string) or beta (`delta.text`,
/// `delta.transcript`, or top-level `text`/`transcript`) framings.
pub fn extract_transcript_text(message: &Value) -> Option<String> {
    match message.get("delta") {
        Some(Value::String(text)) if !text.trim().is_empty() => return Some(text.clone()),
        Some(Value::Object(delta)) => {
            for key in ["text", "transcript"] {
                if let Some(text) = non_empty(delta.get(key)) {
                    return Some(text);
                }
            }
        }
        _ => {}
    }
    for key in ["text", "transcript"] {
        if let Some(text) = non_empty(message.get(key)) {
            return Some(text);
        }
    }
    None
}

/// Human-readable description of a model `error` frame.
pub fn extract_error_message(message: &Value) -> String {
    if let Some(error) = message.get("error") {
        for key in ["message", "detail", "error"] {
            if let Some(text) = non_empty(error.get(key)) {
                return text;
            }
        }
    }
    non_empty(message.get("message")).unwrap_or_else(|| "realtime session error".to_string())
}

/// Explicit `output[].content[]` transcripts from a completed response.
pub fn extract_completed_transcripts(response: Option<&Value>) -> Vec<TranscriptEntry> {
    let mut transcripts = Vec::new();
    let Some(response) = response else {
        return transcripts;
    };
    let output = response
        .get("output")
        .or_else(|| response.get("outputs"))
        .and_then(Value::as_array);
    let Some(entries) = output else {
        return transcripts;
    };

    for entry in entries {
        let role = non_empty(entry.get("role")).unwrap_or_else(|| "assistant".to_string());
        let Some(contents) = entry.get("content").and_then(Value::as_array) else {
            continue;
        };
        for content in contents {
            let kind = content.get("type").and_then(Value::as_str);
            if !matches!(kind, Some("output_text") | Some("text")) {
                continue;
            }
            if let Some(text) = non_empty(content.get("text")) {
                transcripts.push(TranscriptEntry {
                    role: role.clone(),
                    text,
                });
            }
        }
    }
    transcripts
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_update_carries_24k_pcm_both_ways() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::new("gpt-realtime", "Be brief.", Some("verse")),
        };
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();

        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["type"], "realtime");
        assert_eq!(value["session"]["audio"]["input"]["format"]["rate"], 24_000);
        assert_eq!(value["session"]["audio"]["output"]["format"]["rate"], 24_000);
        assert_eq!(value["session"]["audio"]["output"]["voice"], "verse");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["turn_detection"]["threshold"], 0.5);
        assert!(value["session"]["audio"]["input"].get("voice").is_none());
    }

    #[test]
    fn append_frame_shape() {
        let event = ClientEvent::InputAudioAppend {
            audio: "AAAA".to_string(),
        };
        let value: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        assert_eq!(value["audio"], "AAAA");

        let commit: Value =
            serde_json::from_str(&ClientEvent::InputAudioCommit.to_json()).unwrap();
        assert_eq!(commit["type"], "input_audio_buffer.commit");
    }

    #[test]
    fn parses_ga_audio_delta() {
        let raw = json!({
            "type": "response.output_audio.delta",
            "response_id": "resp_1",
            "delta": "cGNt",
        })
        .to_string();

        match parse_server_event(&raw).unwrap() {
            ServerEvent::AudioDelta {
                response_id,
                chunks,
            } => {
                assert_eq!(response_id.as_deref(), Some("resp_1"));
                assert_eq!(chunks, vec!["cGNt"]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_beta_audio_delta_object() {
        let raw = json!({
            "type": "response.audio.delta",
            "id": "resp_2",
            "delta": {"audio": ["YQ==", "Yg=="]},
        })
        .to_string();

        match parse_server_event(&raw).unwrap() {
            ServerEvent::AudioDelta {
                response_id,
                chunks,
            } => {
                assert_eq!(response_id.as_deref(), Some("resp_2"));
                assert_eq!(chunks, vec!["YQ==", "Yg=="]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_transcript_delta_variants() {
        let ga = json!({"type": "response.audio_transcript.delta", "response_id": "r", "delta": "Bon"});
        match parse_server_event(&ga.to_string()).unwrap() {
            ServerEvent::TranscriptDelta { text, .. } => assert_eq!(text, "Bon"),
            other => panic!("unexpected event: {:?}", other),
        }

        let beta = json!({"type": "response.transcript.delta", "delta": {"text": "jour"}});
        match parse_server_event(&beta.to_string()).unwrap() {
            ServerEvent::TranscriptDelta { text, .. } => assert_eq!(text, "jour"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn completed_response_prefers_explicit_output_text() {
        let raw = json!({
            "type": "response.completed",
            "response": {
                "id": "resp_3",
                "output": [{
                    "role": "assistant",
                    "content": [
                        {"type": "output_text", "text": " Bonjour "},
                        {"type": "audio", "transcript": "ignored"},
                    ],
                }],
            },
        })
        .to_string();

        match parse_server_event(&raw).unwrap() {
            ServerEvent::ResponseCompleted {
                response_id,
                transcripts,
            } => {
                assert_eq!(response_id.as_deref(), Some("resp_3"));
                assert_eq!(
                    transcripts,
                    vec![TranscriptEntry {
                        role: "assistant".to_string(),
                        text: "Bonjour".to_string(),
                    }]
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn error_frame_message_extraction() {
        let raw = json!({"type": "error", "error": {"message": "boom"}}).to_string();
        assert_eq!(
            parse_server_event(&raw).unwrap(),
            ServerEvent::Error {
                message: "boom".to_string()
            }
        );

        let bare = json!({"type": "error"}).to_string();
        assert_eq!(
            parse_server_event(&bare).unwrap(),
            ServerEvent::Error {
                message: "realtime session error".to_string()
            }
        );
    }

    #[test]
    fn unknown_kinds_do_not_fail() {
        let raw = json!({"type": "rate_limits.updated"}).to_string();
        assert_eq!(
            parse_server_event(&raw).unwrap(),
            ServerEvent::Unknown {
                kind: "rate_limits.updated".to_string()
            }
        );
        assert!(parse_server_event("not json").is_none());
        assert!(parse_server_event("   ").is_none());
    }

    #[test]
    fn vad_hints_parse() {
        for (kind, expected) in [
            ("input_audio_buffer.speech_started", ServerEvent::SpeechStarted),
            ("input_audio_buffer.speech_stopped", ServerEvent::SpeechStopped),
            ("response.cancelled", ServerEvent::ResponseCancelled),
            ("session.ended", ServerEvent::SessionEnded),
        ] {
            let raw = json!({"type": kind}).to_string();
            assert_eq!(parse_server_event(&raw).unwrap(), expected);
        }
    }
}
