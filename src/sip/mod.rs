//! SIP/RTP telephony subsystem.
//!
//! Trunk-facing half of the gateway: REGISTER against the configured SIP
//! account, accept INVITEs, negotiate one audio codec from the SDP offer,
//! and run the per-call RTP endpoint that the voice bridge pumps.

pub mod codec;
pub mod invite;
pub mod registration;
pub mod resample;
pub mod rtp;
pub mod sdp;

pub use codec::AudioCodec;
pub use invite::{InviteOutcome, NegotiatedMedia, SipDialog};
pub use rtp::{RtpEndpoint, RtpEndpointConfig, RtpPacket, RtpPortAllocator};
pub use sdp::SelectedCodec;

use thiserror::Error;

/// SIP subsystem errors.
///
/// The variants map onto the SIP status the invite runtime emits:
/// `InvalidRequest` -> 400, `NoAudioMedia`/`NoCodec` -> 603,
/// `ResourceExhausted` -> 500.
#[derive(Error, Debug)]
pub enum SipError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("offer carries no usable audio media")]
    NoAudioMedia,

    #[error("no common codec with the offer")]
    NoCodec,

    #[error("media resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
