//! Minimal SDP offer/answer handling.
//!
//! Parses just enough of an inbound offer to negotiate one audio codec and
//! learn the peer's RTP address, and renders the matching answer. Anything
//! beyond `m=audio`, `a=rtpmap` and `c=` is ignored.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::codec::AudioCodec;
use super::SipError;

/// Codec retained for the RTP session after negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedCodec {
    pub payload_type: u8,
    pub codec: AudioCodec,
    pub clock_rate: u32,
}

/// The parts of an SDP offer the gateway acts on.
#[derive(Debug, Clone, Default)]
pub struct SdpOffer {
    /// `c=` connection address, session or media level.
    pub connection_address: Option<String>,
    /// Port from the first `m=audio` line. 0 means hold.
    pub audio_port: u16,
    /// Payload types offered on that line, in offer order.
    pub payloads: Vec<u8>,
    /// `a=rtpmap` entries: payload type -> (encoding name, clock rate).
    pub rtpmap: HashMap<u8, (String, u32)>,
}

impl SdpOffer {
    /// Remote RTP address when both host and a non-zero port are present.
    pub fn remote_rtp(&self) -> Option<(String, u16)> {
        let host = self.connection_address.clone()?;
        if self.audio_port == 0 {
            return None;
        }
        Some((host, self.audio_port))
    }
}

/// Split an SDP body into trimmed, non-empty lines. Some trunks send the
/// whole body on one line; in that case split on field markers instead.
fn sdp_lines(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut lines: Vec<String> = normalized
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if lines.len() == 1 && lines[0].len() > 50 {
        lines = split_single_line(&lines[0]);
    }
    lines
}

fn split_single_line(line: &str) -> Vec<String> {
    let bytes = line.as_bytes();
    let mut boundaries = vec![0usize];
    for i in 1..bytes.len().saturating_sub(1) {
        if bytes[i + 1] == b'='
            && matches!(bytes[i], b'v' | b'o' | b's' | b'c' | b't' | b'm' | b'a')
        {
            boundaries.push(i);
        }
    }
    boundaries.push(line.len());
    boundaries
        .windows(2)
        .map(|pair| line[pair[0]..pair[1]].trim().to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}

/// Parse the pieces of an offer needed for negotiation.
///
/// Fails with `InvalidRequest` only when the body is not valid UTF-8; a
/// missing or malformed `m=audio` line is reported as `NoAudioMedia` so the
/// caller can decline instead of rejecting the request outright.
pub fn parse_offer(payload: &[u8]) -> Result<SdpOffer, SipError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| SipError::InvalidRequest("SDP payload is not valid UTF-8".to_string()))?;

    let lines = sdp_lines(text);

    let mut offer = SdpOffer::default();
    let mut audio_seen = false;

    for line in &lines {
        if let Some(rest) = line.strip_prefix("c=") {
            // c=IN IP4 <address>
            let mut parts = rest.split_whitespace();
            if parts.next() == Some("IN") {
                let _family = parts.next();
                if let Some(address) = parts.next() {
                    if offer.connection_address.is_none() {
                        offer.connection_address = Some(address.to_string());
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix("a=rtpmap:") {
            // a=rtpmap:<pt> <name>/<rate>[/...]
            let Some((pt_text, encoding)) = rest.split_once(' ') else {
                tracing::debug!("rtpmap line ignored (malformed): {}", line);
                continue;
            };
            let Ok(pt) = pt_text.trim().parse::<u8>() else {
                tracing::debug!("rtpmap line ignored (bad payload type): {}", line);
                continue;
            };
            let Some((name, rate_text)) = encoding.split_once('/') else {
                tracing::debug!("rtpmap line ignored (no clock rate): {}", line);
                continue;
            };
            let rate = rate_text
                .split('/')
                .next()
                .and_then(|r| r.trim().parse::<u32>().ok());
            let Some(rate) = rate else {
                tracing::debug!("rtpmap line ignored (bad clock rate): {}", line);
                continue;
            };
            offer
                .rtpmap
                .insert(pt, (name.trim().to_ascii_lowercase(), rate));
        } else if line.starts_with("m=audio") && !audio_seen {
            // m=audio <port> RTP/AVP <pt> [<pt>...]; only the first counts.
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                tracing::debug!("m=audio line ignored (malformed): {}", line);
                continue;
            }
            let Ok(port) = parts[1].parse::<u16>() else {
                tracing::debug!("m=audio line ignored (bad port): {}", line);
                continue;
            };
            let mut payloads = Vec::new();
            let mut numeric = true;
            for value in &parts[3..] {
                match value.parse::<u8>() {
                    Ok(pt) => payloads.push(pt),
                    Err(_) => {
                        numeric = false;
                        break;
                    }
                }
            }
            if !numeric {
                tracing::debug!("m=audio line ignored (non-numeric payload): {}", line);
                continue;
            }
            offer.audio_port = port;
            offer.payloads = payloads;
            audio_seen = true;
        }
    }

    if !audio_seen {
        return Err(SipError::NoAudioMedia);
    }

    Ok(offer)
}

/// Pick the first offered payload matching the preferred codec list.
///
/// `a=rtpmap` entries take precedence over the static payload table, so a
/// trunk remapping a static number is honored.
pub fn negotiate(offer: &SdpOffer, preferred: &[AudioCodec]) -> Option<SelectedCodec> {
    for &pt in &offer.payloads {
        let resolved = match offer.rtpmap.get(&pt) {
            Some((name, rate)) => AudioCodec::from_name(name).map(|codec| (codec, *rate)),
            None => AudioCodec::from_payload_type(pt).map(|codec| (codec, codec.clock_rate())),
        };
        let Some((codec, clock_rate)) = resolved else {
            continue;
        };
        if preferred.contains(&codec) {
            return Some(SelectedCodec {
                payload_type: pt,
                codec,
                clock_rate,
            });
        }
    }
    None
}

/// Render the SDP answer advertising the negotiated codec on our media
/// address.
pub fn build_answer(connection_address: &str, media_port: u16, codec: &SelectedCodec) -> String {
    let session_id = rand::random::<u32>() >> 1;
    let session_version = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let lines = [
        "v=0".to_string(),
        format!(
            "o=- {} {} IN IP4 {}",
            session_id, session_version, connection_address
        ),
        "s=ChatKit Voice Session".to_string(),
        format!("c=IN IP4 {}", connection_address),
        "t=0 0".to_string(),
        format!("m=audio {} RTP/AVP {}", media_port, codec.payload_type),
        format!(
            "a=rtpmap:{} {}/{}",
            codec.payload_type,
            codec.codec.sdp_name(),
            codec.clock_rate
        ),
        "a=sendrecv".to_string(),
    ];
    let mut answer = lines.join("\r\n");
    answer.push_str("\r\n");
    answer
}
