//! Realtime model integration.
//!
//! Credential minting against the provider's REST endpoint, the
//! authenticated WebSocket to the model, and the event vocabulary spoken
//! over it.

pub mod client;
pub mod events;
pub mod sanitize;
pub mod session;

pub use client::{
    build_realtime_ws_url, MintParams, MintTransport, MintedSecret, RealtimeConnector,
    RealtimeSink, RealtimeSource, TungsteniteConnector,
};
pub use events::{parse_server_event, ClientEvent, ServerEvent, SessionConfig, TranscriptEntry};

use thiserror::Error;

/// Realtime subsystem errors.
#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("client secret request rejected ({status}): {detail}")]
    UpstreamAuth { status: u16, detail: String },

    #[error("upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("realtime protocol error: {0}")]
    Protocol(String),

    #[error("client secret missing from provider response")]
    MissingClientSecret,

    #[error("realtime connection closed")]
    Closed,
}
