//! Inbound INVITE handling.
//!
//! Translates an INVITE's SDP offer into an [`InviteOutcome`] and drives the
//! reply sequence: `100 Trying` at once, `180 Ringing`, an optional ring
//! delay, then `200 OK` with the SDP answer. Failures never raise through the
//! dialog; they surface as `Rejected` with the status the SIP layer must
//! emit.

use std::time::Duration;

use async_trait::async_trait;

use super::codec::AudioCodec;
use super::sdp::{self, SdpOffer, SelectedCodec};
use super::SipError;

/// The slice of a SIP dialog the invite flow needs. Implemented over the
/// SIP stack's server dialog; tests substitute a recording fake.
#[async_trait]
pub trait SipDialog: Send + Sync {
    /// Send a provisional or final response, optionally with an SDP body.
    async fn reply(&self, status: u16, reason: &str, sdp: Option<String>) -> Result<(), SipError>;

    /// Terminate an established dialog (BYE).
    async fn hangup(&self) -> Result<(), SipError>;
}

/// Media parameters negotiated from the offer.
#[derive(Debug, Clone)]
pub struct NegotiatedMedia {
    pub codec: SelectedCodec,
    /// Peer RTP address when the offer carried one and is not on hold.
    pub remote_rtp: Option<(String, u16)>,
    /// Audio port from the offer; 0 means hold until re-INVITE.
    pub offered_port: u16,
}

/// Result of admission control over one INVITE.
#[derive(Debug, Clone)]
pub enum InviteOutcome {
    Admitted(NegotiatedMedia),
    Rejected { status: u16, reason: &'static str },
}

impl InviteOutcome {
    pub fn rejected(status: u16, reason: &'static str) -> Self {
        InviteOutcome::Rejected { status, reason }
    }
}

/// Evaluate an SDP offer without touching the dialog.
pub fn evaluate_offer(payload: &[u8], preferred: &[AudioCodec]) -> InviteOutcome {
    let offer: SdpOffer = match sdp::parse_offer(payload) {
        Ok(offer) => offer,
        Err(SipError::NoAudioMedia) => {
            tracing::warn!("INVITE without usable audio media");
            return InviteOutcome::rejected(603, "Decline");
        }
        Err(e) => {
            tracing::warn!("unreadable SDP in INVITE: {}", e);
            return InviteOutcome::rejected(400, "Bad Request");
        }
    };

    tracing::info!(
        "INVITE offer: audio port={}, payloads={:?}",
        offer.audio_port,
        offer.payloads
    );

    let Some(codec) = sdp::negotiate(&offer, preferred) else {
        tracing::warn!("no common codec in INVITE offer: {:?}", offer.payloads);
        return InviteOutcome::rejected(603, "Decline");
    };

    tracing::info!(
        "codec selected: payload={} ({}/{} Hz)",
        codec.payload_type,
        codec.codec,
        codec.clock_rate
    );

    InviteOutcome::Admitted(NegotiatedMedia {
        remote_rtp: offer.remote_rtp(),
        offered_port: offer.audio_port,
        codec,
    })
}

/// Run the INVITE reply sequence.
///
/// Replies `100` immediately, then either the rejection status or
/// `180` + optional ring delay + `200 OK` carrying the answer built for
/// `media_host:media_port`. Dialog transport failures map to a 500 attempt
/// and an error return.
pub async fn handle_incoming_invite(
    dialog: &dyn SipDialog,
    payload: &[u8],
    media_host: &str,
    media_port: u16,
    ring_timeout: Duration,
    preferred: &[AudioCodec],
) -> Result<InviteOutcome, SipError> {
    dialog.reply(100, "Trying", None).await?;

    let outcome = evaluate_offer(payload, preferred);
    let media = match outcome {
        InviteOutcome::Rejected { status, reason } => {
            dialog.reply(status, reason, None).await?;
            return Ok(InviteOutcome::Rejected { status, reason });
        }
        InviteOutcome::Admitted(media) => media,
    };

    dialog.reply(180, "Ringing", None).await?;

    if !ring_timeout.is_zero() {
        tracing::info!("holding in ringing for {:?} before answering", ring_timeout);
        tokio::time::sleep(ring_timeout).await;
    }

    let answer = sdp::build_answer(media_host, media_port, &media.codec);
    if let Err(e) = dialog.reply(200, "OK", Some(answer)).await {
        tracing::error!("failed to send 200 OK: {}", e);
        let _ = dialog.reply(500, "Server Internal Error", None).await;
        return Err(e);
    }

    Ok(InviteOutcome::Admitted(media))
}
