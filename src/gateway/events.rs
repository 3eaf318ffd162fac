//! Browser-facing wire frames.
//!
//! Everything crossing a gateway WebSocket is one of these JSON frames.
//! Inbound control frames go through [`parse_control_frame`] so malformed
//! input maps onto the error frames browsers expect instead of dropping the
//! connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::SessionTranscript;

/// Control frames a browser sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    InputAudio {
        session_id: String,
        /// Base64 PCM16 at the model rate.
        data: String,
        #[serde(default)]
        commit: bool,
    },
    Interrupt {
        session_id: String,
    },
    Finalize {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
    },
}

impl ControlFrame {
    pub fn session_id(&self) -> &str {
        match self {
            ControlFrame::InputAudio { session_id, .. }
            | ControlFrame::Interrupt { session_id }
            | ControlFrame::Finalize { session_id, .. } => session_id,
        }
    }
}

/// Why an inbound frame was refused; the message doubles as the error text
/// sent back to the browser.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlFrameError {
    #[error("invalid JSON message")]
    InvalidJson,
    #[error("unexpected message shape")]
    NotAnObject,
    #[error("session_id missing")]
    MissingSessionId,
    #[error("audio payload missing")]
    MissingAudio,
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

/// Parse one text frame from a browser.
pub fn parse_control_frame(text: &str) -> Result<ControlFrame, ControlFrameError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ControlFrameError::InvalidJson)?;
    let Some(object) = value.as_object() else {
        return Err(ControlFrameError::NotAnObject);
    };

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let session_id = object
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|id| !id.is_empty())
        .ok_or(ControlFrameError::MissingSessionId)?;

    match kind.as_str() {
        "input_audio" => {
            let data = object
                .get("data")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(ControlFrameError::MissingAudio)?;
            let commit = object
                .get("commit")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(ControlFrame::InputAudio {
                session_id,
                data,
                commit,
            })
        }
        "interrupt" => Ok(ControlFrame::Interrupt { session_id }),
        "finalize" => {
            let thread_id = object
                .get("thread_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|id| !id.is_empty());
            Ok(ControlFrame::Finalize {
                session_id,
                thread_id,
            })
        }
        other => Err(ControlFrameError::UnknownType(other.to_string())),
    }
}

/// Frames the gateway sends to browsers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    SessionCreated {
        session_id: String,
        thread_id: Option<String>,
        session: Value,
    },
    SessionClosed {
        session_id: String,
    },
    SessionFinalized {
        session_id: String,
        thread_id: String,
        transcripts: Vec<SessionTranscript>,
    },
    /// Full history snapshot, sent to newly attached listeners.
    History {
        session_id: String,
        history: Vec<Value>,
    },
    /// One appended history item; always follows any snapshot covering the
    /// same prefix.
    HistoryDelta {
        session_id: String,
        item: Value,
    },
    Audio {
        session_id: String,
        item_id: Option<String>,
        content_index: Option<i64>,
        response_id: Option<String>,
        /// Base64 PCM16 output chunk.
        data: String,
    },
    AudioEnd {
        session_id: String,
        item_id: Option<String>,
        content_index: Option<i64>,
    },
    AudioInterrupted {
        session_id: String,
        item_id: Option<String>,
        content_index: Option<i64>,
    },
    AgentStart {
        session_id: String,
    },
    AgentEnd {
        session_id: String,
    },
    Handoff {
        session_id: String,
        to_agent: Option<String>,
    },
    ToolStart {
        session_id: String,
        tool: Option<String>,
    },
    ToolEnd {
        session_id: String,
        tool: Option<String>,
        output: Value,
    },
    SessionError {
        session_id: String,
        error: Value,
    },
    /// Connection-level error, not tied to a session.
    Error {
        error: String,
    },
}

impl GatewayEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("gateway events serialize")
    }
}
