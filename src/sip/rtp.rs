//! RTP endpoint for one call.
//!
//! Owns the UDP socket pair side of a SIP media session: parses inbound
//! RFC 3550 packets into a bounded queue and paces outbound PCM16 into
//! 20 ms G.711 frames. The remote peer address comes from the SDP offer or
//! from the first inbound datagram, whichever arrives first.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use super::codec::AudioCodec;
use super::resample::{bytes_to_samples, resample};
use super::SipError;

/// Bytes of encoded G.711 per 20 ms frame at 8 kHz.
const FRAME_BYTES: usize = 160;
const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// Inbound packets buffered before the reader starts dropping.
const PACKET_QUEUE_DEPTH: usize = 256;

/// RTP packet header (12 bytes minimum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serialize the fixed 12-byte header.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(12);

        // V(2) P(1) X(1) CC(4)
        buf.put_u8(
            (self.version << 6)
                | ((self.padding as u8) << 5)
                | ((self.extension as u8) << 4)
                | (self.csrc_count & 0x0F),
        );
        // M(1) PT(7)
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        buf
    }
}

/// A decoded RTP packet: header fields plus the raw payload.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = self.header.to_bytes();
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a raw datagram. CSRC lists and header extensions are skipped,
    /// padding is stripped; packets whose version is not 2 are rejected.
    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        if data.len() < 12 {
            return Err(SipError::Rtp("packet shorter than RTP header".to_string()));
        }

        let first = data[0];
        let version = first >> 6;
        if version != 2 {
            return Err(SipError::Rtp(format!("unsupported RTP version {}", version)));
        }

        let padding = first & 0x20 != 0;
        let extension = first & 0x10 != 0;
        let csrc_count = first & 0x0F;

        let second = data[1];
        let marker = second & 0x80 != 0;
        let payload_type = second & 0x7F;

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = 12 + csrc_count as usize * 4;

        if extension {
            if data.len() < offset + 4 {
                return Err(SipError::Rtp("truncated RTP extension header".to_string()));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }

        if data.len() < offset {
            return Err(SipError::Rtp("RTP payload offset past packet end".to_string()));
        }

        let mut payload = &data[offset..];
        if padding && !payload.is_empty() {
            let pad_len = payload[payload.len() - 1] as usize;
            if pad_len > 0 && pad_len <= payload.len() {
                payload = &payload[..payload.len() - pad_len];
            }
        }

        Ok(Self {
            header: RtpHeader {
                version,
                padding,
                extension,
                csrc_count,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
            },
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Configuration for one call's RTP endpoint.
#[derive(Debug, Clone)]
pub struct RtpEndpointConfig {
    /// Local bind address. Port 0 lets the OS assign one.
    pub local_host: String,
    pub local_port: u16,
    /// Remote peer, when the SDP offer carried a usable address.
    pub remote: Option<SocketAddr>,
    /// Payload type stamped on outbound packets.
    pub payload_type: u8,
    /// Codec for outbound encoding.
    pub output_codec: AudioCodec,
    /// Fixed SSRC for the session; random when absent.
    pub ssrc: Option<u32>,
    /// Sample rate of PCM handed to `send_audio` (the model emits 24 kHz).
    pub input_sample_rate: u32,
}

impl Default for RtpEndpointConfig {
    fn default() -> Self {
        Self {
            local_host: "0.0.0.0".to_string(),
            local_port: 0,
            remote: None,
            payload_type: AudioCodec::Pcmu.payload_type(),
            output_codec: AudioCodec::Pcmu,
            ssrc: None,
            input_sample_rate: 24_000,
        }
    }
}

/// UDP/RTP endpoint for a single call.
pub struct RtpEndpoint {
    config: RtpEndpointConfig,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    local_port: RwLock<u16>,
    remote_addr: Arc<RwLock<Option<SocketAddr>>>,
    ssrc: u32,
    sequence: RwLock<u16>,
    timestamp: RwLock<u32>,
    packet_tx: RwLock<Option<mpsc::Sender<RtpPacket>>>,
    packet_rx: RwLock<Option<mpsc::Receiver<RtpPacket>>>,
    cancel: CancellationToken,
}

impl RtpEndpoint {
    pub fn new(config: RtpEndpointConfig) -> Self {
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_DEPTH);
        let remote = config.remote;
        Self {
            ssrc: config.ssrc.unwrap_or_else(rand::random),
            local_port: RwLock::new(config.local_port),
            remote_addr: Arc::new(RwLock::new(remote)),
            sequence: RwLock::new(rand::random()),
            timestamp: RwLock::new(rand::random()),
            packet_tx: RwLock::new(Some(packet_tx)),
            packet_rx: RwLock::new(Some(packet_rx)),
            cancel: CancellationToken::new(),
            socket: RwLock::new(None),
            config,
        }
    }

    /// Bind the socket and spawn the reader task. Returns the actual local
    /// port, which differs from the configured one when it was 0.
    pub async fn start(&self) -> Result<u16, SipError> {
        if self.socket.read().await.is_some() {
            tracing::warn!("RTP endpoint already started");
            return Ok(*self.local_port.read().await);
        }

        let bind_addr = format!("{}:{}", self.config.local_host, self.config.local_port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|e| SipError::ResourceExhausted(format!("RTP bind {}: {}", bind_addr, e)))?;
        let actual_port = socket
            .local_addr()
            .map_err(|e| SipError::Rtp(e.to_string()))?
            .port();
        *self.local_port.write().await = actual_port;

        let socket = Arc::new(socket);
        *self.socket.write().await = Some(socket.clone());

        let packet_tx = self
            .packet_tx
            .write()
            .await
            .take()
            .ok_or_else(|| SipError::InvalidState("RTP endpoint restarted".to_string()))?;
        let remote_addr = self.remote_addr.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, addr)) => {
                        if remote_addr.read().await.is_none() {
                            *remote_addr.write().await = Some(addr);
                            tracing::info!("RTP remote peer discovered: {}", addr);
                        }
                        match RtpPacket::parse(&buf[..len]) {
                            Ok(packet) => {
                                if packet_tx.try_send(packet).is_err() {
                                    tracing::debug!("RTP packet queue full, packet dropped");
                                }
                            }
                            Err(e) => tracing::debug!("inbound RTP packet rejected: {}", e),
                        }
                    }
                    Err(e) => {
                        tracing::error!("RTP receive error: {}", e);
                        break;
                    }
                }
            }
            // packet_tx drops here, ending the consumer stream.
        });

        tracing::info!(
            "RTP endpoint listening on {}:{}",
            self.config.local_host,
            actual_port
        );
        Ok(actual_port)
    }

    /// Stop the reader and close the socket. The packet stream ends once the
    /// reader task drops its sender.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.packet_tx.write().await.take();
        if self.socket.write().await.take().is_some() {
            tracing::info!("RTP endpoint stopped");
        }
    }

    /// Take the inbound packet stream. Single consumer; the stream ends when
    /// `stop` is called or the socket errors.
    pub async fn take_packet_stream(&self) -> Option<mpsc::Receiver<RtpPacket>> {
        self.packet_rx.write().await.take()
    }

    pub async fn local_port(&self) -> u16 {
        *self.local_port.read().await
    }

    pub async fn set_remote(&self, addr: SocketAddr) {
        *self.remote_addr.write().await = Some(addr);
    }

    pub async fn remote(&self) -> Option<SocketAddr> {
        *self.remote_addr.read().await
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.config.payload_type
    }

    /// Send PCM16 audio to the peer, paced at one 20 ms frame per 160
    /// encoded bytes. Socket errors are logged, never surfaced: a call in
    /// teardown must not fail the bridge over a final frame.
    pub async fn send_audio(&self, pcm: &[u8]) {
        let Some(socket) = self.socket.read().await.clone() else {
            tracing::warn!("RTP send_audio: endpoint not started");
            return;
        };
        let Some(remote) = *self.remote_addr.read().await else {
            tracing::warn!("RTP send_audio: remote address unknown");
            return;
        };

        let encoded = self.encode_output(pcm);
        if encoded.is_empty() {
            return;
        }

        let frame_count = encoded.len().div_ceil(FRAME_BYTES);
        tracing::debug!(
            "RTP send_audio: {} PCM bytes -> {} {} bytes -> {} frames",
            pcm.len(),
            encoded.len(),
            self.config.output_codec,
            frame_count,
        );

        for (index, frame) in encoded.chunks(FRAME_BYTES).enumerate() {
            let packet = self.next_packet(frame).await;
            if let Err(e) = socket.send_to(&packet.to_bytes(), remote).await {
                tracing::warn!(
                    "RTP send error on frame {}/{}: {}",
                    index + 1,
                    frame_count,
                    e
                );
            }
            if index + 1 < frame_count {
                tokio::time::sleep(FRAME_INTERVAL).await;
            }
        }
    }

    /// Emit a single silence frame to open NAT bindings right after the SDP
    /// answer, before any model audio exists.
    pub async fn send_silence_packet(&self) {
        let Some(socket) = self.socket.read().await.clone() else {
            return;
        };
        let Some(remote) = *self.remote_addr.read().await else {
            tracing::debug!("RTP silence packet skipped: remote address unknown");
            return;
        };

        let payload = match self.config.output_codec.g711_law() {
            Some(law) => law.encode(&[0i16; FRAME_BYTES]),
            None => vec![0u8; self.config.output_codec.bytes_per_frame()],
        };
        let packet = self.next_packet(&payload).await;
        if let Err(e) = socket.send_to(&packet.to_bytes(), remote).await {
            tracing::debug!("RTP silence packet send failed: {}", e);
        }
    }

    async fn next_packet(&self, payload: &[u8]) -> RtpPacket {
        let sequence = {
            let mut seq = self.sequence.write().await;
            *seq = seq.wrapping_add(1);
            *seq
        };
        let timestamp = {
            let mut ts = self.timestamp.write().await;
            *ts = ts.wrapping_add(payload.len() as u32);
            *ts
        };
        let header = RtpHeader::new(self.config.payload_type, sequence, timestamp, self.ssrc);
        RtpPacket::new(header, Bytes::copy_from_slice(payload))
    }

    /// Convert model-rate PCM16 into trunk payload bytes.
    fn encode_output(&self, pcm: &[u8]) -> Vec<u8> {
        match self.config.output_codec.g711_law() {
            Some(law) => {
                let samples = bytes_to_samples(pcm);
                let at_trunk_rate = resample(&samples, self.config.input_sample_rate, 8000);
                law.encode(&at_trunk_rate)
            }
            // Passthrough codecs carry the payload unchanged.
            None => pcm.to_vec(),
        }
    }
}

/// Rotates through an even-numbered port range; odd ports stay free for RTCP.
pub struct RtpPortAllocator {
    start: u16,
    end: u16,
    current: RwLock<u16>,
}

impl RtpPortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            current: RwLock::new(start),
        }
    }

    pub async fn allocate(&self) -> u16 {
        let mut current = self.current.write().await;
        let port = *current;
        *current = if *current + 2 >= self.end {
            self.start
        } else {
            *current + 2
        };
        if port % 2 != 0 {
            port + 1
        } else {
            port
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sip::resample::samples_to_bytes;

    fn sample_header() -> RtpHeader {
        RtpHeader::new(0, 4212, 160_000, 0xDEADBEEF)
    }

    #[test]
    fn header_pack_parse_identity() {
        let header = RtpHeader {
            marker: true,
            ..RtpHeader::new(8, 100, 99_999, 12_345)
        };
        let packet = RtpPacket::new(header.clone(), Bytes::from_static(&[1, 2, 3]));
        let parsed = RtpPacket::parse(&packet.to_bytes()).unwrap();

        assert_eq!(parsed.header.sequence, header.sequence);
        assert_eq!(parsed.header.timestamp, header.timestamp);
        assert_eq!(parsed.header.ssrc, header.ssrc);
        assert_eq!(parsed.header.payload_type, header.payload_type);
        assert_eq!(parsed.header.marker, header.marker);
        assert_eq!(parsed.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn parse_rejects_wrong_version() {
        let mut raw = RtpPacket::new(sample_header(), Bytes::from_static(&[0; 4]))
            .to_bytes()
            .to_vec();
        raw[0] = (raw[0] & 0x3F) | (1 << 6);
        assert!(RtpPacket::parse(&raw).is_err());
    }

    #[test]
    fn parse_rejects_short_packet() {
        assert!(RtpPacket::parse(&[0x80, 0x00, 0x01]).is_err());
    }

    #[test]
    fn parse_skips_csrc_and_extension() {
        let mut raw = Vec::new();
        // V=2, no padding, extension present, CSRC count 1
        raw.push(0x80 | 0x10 | 0x01);
        raw.push(0x00);
        raw.extend_from_slice(&7u16.to_be_bytes());
        raw.extend_from_slice(&1000u32.to_be_bytes());
        raw.extend_from_slice(&42u32.to_be_bytes());
        // one CSRC entry
        raw.extend_from_slice(&0u32.to_be_bytes());
        // extension: profile + length of one 32-bit word, then the word
        raw.extend_from_slice(&0xBEDEu16.to_be_bytes());
        raw.extend_from_slice(&1u16.to_be_bytes());
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend_from_slice(&[9, 9]);

        let packet = RtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.header.csrc_count, 1);
        assert!(packet.header.extension);
        assert_eq!(packet.payload.as_ref(), &[9, 9]);
    }

    #[test]
    fn parse_strips_padding() {
        let mut raw = Vec::new();
        raw.push(0x80 | 0x20);
        raw.push(0x00);
        raw.extend_from_slice(&7u16.to_be_bytes());
        raw.extend_from_slice(&1000u32.to_be_bytes());
        raw.extend_from_slice(&42u32.to_be_bytes());
        // payload [5, 6] plus two padding bytes, last one holds the count
        raw.extend_from_slice(&[5, 6, 0, 2]);

        let packet = RtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.payload.as_ref(), &[5, 6]);
    }

    #[tokio::test]
    async fn start_returns_os_assigned_port() {
        let endpoint = RtpEndpoint::new(RtpEndpointConfig {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            ..RtpEndpointConfig::default()
        });
        let port = endpoint.start().await.unwrap();
        assert_ne!(port, 0);
        assert_eq!(endpoint.local_port().await, port);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn packet_stream_ends_after_stop() {
        let endpoint = RtpEndpoint::new(RtpEndpointConfig {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            ..RtpEndpointConfig::default()
        });
        endpoint.start().await.unwrap();
        let mut stream = endpoint.take_packet_stream().await.unwrap();
        endpoint.stop().await;
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn inbound_packet_reaches_stream_and_remote_is_learned() {
        let endpoint = RtpEndpoint::new(RtpEndpointConfig {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            ..RtpEndpointConfig::default()
        });
        let port = endpoint.start().await.unwrap();
        let mut stream = endpoint.take_packet_stream().await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = RtpPacket::new(sample_header(), Bytes::from_static(&[0xFF; 160]));
        sender
            .send_to(&packet.to_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        let received = stream.recv().await.unwrap();
        assert_eq!(received.payload.len(), 160);
        assert_eq!(received.header.sequence, 4212);

        let learned = endpoint.remote().await.unwrap();
        assert_eq!(learned, sender.local_addr().unwrap());
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn send_audio_produces_paced_20ms_frames() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote = receiver.local_addr().unwrap();

        let endpoint = RtpEndpoint::new(RtpEndpointConfig {
            local_host: "127.0.0.1".to_string(),
            local_port: 0,
            remote: Some(remote),
            input_sample_rate: 24_000,
            ..RtpEndpointConfig::default()
        });
        endpoint.start().await.unwrap();

        // 100 ms of 24 kHz PCM16 -> 800 μ-law bytes -> 5 frames.
        let pcm = samples_to_bytes(&vec![0i16; 2400]);
        let started = std::time::Instant::now();
        endpoint.send_audio(&pcm).await;
        let elapsed = started.elapsed();

        let mut buf = [0u8; 2048];
        let mut sequences = Vec::new();
        for _ in 0..5 {
            let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
            let packet = RtpPacket::parse(&buf[..len]).unwrap();
            assert_eq!(packet.payload.len(), FRAME_BYTES);
            assert_eq!(packet.header.payload_type, 0);
            sequences.push(packet.header.sequence);
        }

        for pair in sequences.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
        // Four inter-frame gaps of 20 ms.
        assert!(elapsed >= Duration::from_millis(75), "pacing too fast: {:?}", elapsed);
        endpoint.stop().await;
    }

    #[tokio::test]
    async fn port_allocator_stays_even_and_wraps() {
        let allocator = RtpPortAllocator::new(20_000, 20_006);
        assert_eq!(allocator.allocate().await, 20_000);
        assert_eq!(allocator.allocate().await, 20_002);
        assert_eq!(allocator.allocate().await, 20_004);
        assert_eq!(allocator.allocate().await, 20_000);
    }
}
