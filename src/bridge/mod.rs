//! Bridge between a SIP RTP stream and one Realtime model session.
//!
//! Two cooperative pumps run for the lifetime of a call: the inbound pump
//! turns trunk RTP into `input_audio_buffer.append` frames, the outbound
//! pump turns model audio/transcript deltas into peer audio and transcript
//! entries. Either pump ending signals the other through a shared stop
//! token; teardown hooks then run unconditionally, in order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::realtime::client::{RealtimeConnector, RealtimeSink};
use crate::realtime::events::{
    parse_server_event, ClientEvent, ServerEvent, SessionConfig, TranscriptEntry,
    MODEL_SAMPLE_RATE,
};
use crate::realtime::{build_realtime_ws_url, RealtimeError};
use crate::sip::codec::AudioCodec;
use crate::sip::resample::{resample, samples_to_bytes};
use crate::sip::rtp::RtpPacket;
use crate::sip::RtpEndpoint;

/// Window after a stop request during which in-flight model audio still
/// drains to the peer.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Outcome of one bridged call.
#[derive(Debug, Clone, Default)]
pub struct VoiceBridgeStats {
    pub duration_seconds: f64,
    pub inbound_audio_bytes: usize,
    pub outbound_audio_bytes: usize,
    pub transcripts: Vec<TranscriptEntry>,
    pub error: Option<String>,
}

impl VoiceBridgeStats {
    pub fn transcript_count(&self) -> usize {
        self.transcripts.len()
    }
}

/// Callbacks fired while a voice session tears down. Implementations must
/// not assume any of them succeeds: failures are logged and swallowed so
/// resource release always completes.
#[async_trait]
pub trait VoiceBridgeHooks: Send + Sync {
    /// Hang up the SIP dialog.
    async fn close_dialog(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop the RTP endpoint and drop per-call media state.
    async fn clear_voice_state(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Hand the final transcripts to the workflow layer. Only invoked when
    /// at least one transcript exists.
    async fn resume_workflow(&self, _transcripts: &[TranscriptEntry]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// No-op hooks for tests and detached sessions.
pub struct NoopHooks;

#[async_trait]
impl VoiceBridgeHooks for NoopHooks {}

/// Receives model audio for the trunk side.
#[async_trait]
pub trait PeerAudioSink: Send + Sync {
    async fn send_audio(&self, pcm: Bytes);
}

#[async_trait]
impl PeerAudioSink for RtpEndpoint {
    async fn send_audio(&self, pcm: Bytes) {
        // The inherent paced sender, not this trait method.
        RtpEndpoint::send_audio(self, pcm.as_ref()).await;
    }
}

/// Liveness probe supplied by the call owner. Failures keep the bridge
/// running: a broken flag read must not kill a live call.
pub type SessionChecker = Arc<dyn Fn() -> Result<bool, String> + Send + Sync>;

/// In-memory aggregate over all bridged sessions.
#[derive(Default)]
pub struct VoiceBridgeMetrics {
    inner: Mutex<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    total_sessions: u64,
    total_errors: u64,
    total_duration: f64,
    total_inbound_audio_bytes: u64,
    total_outbound_audio_bytes: u64,
    last_error: Option<String>,
}

impl VoiceBridgeMetrics {
    pub async fn record(&self, stats: &VoiceBridgeStats) {
        let mut inner = self.inner.lock().await;
        inner.total_sessions += 1;
        inner.total_duration += stats.duration_seconds;
        inner.total_inbound_audio_bytes += stats.inbound_audio_bytes as u64;
        inner.total_outbound_audio_bytes += stats.outbound_audio_bytes as u64;
        if let Some(error) = &stats.error {
            inner.total_errors += 1;
            inner.last_error = Some(error.clone());
        }
    }

    pub async fn snapshot(&self) -> Value {
        let inner = self.inner.lock().await;
        let average = if inner.total_sessions > 0 {
            inner.total_duration / inner.total_sessions as f64
        } else {
            0.0
        };
        json!({
            "total_sessions": inner.total_sessions,
            "total_errors": inner.total_errors,
            "total_duration": inner.total_duration,
            "total_inbound_audio_bytes": inner.total_inbound_audio_bytes,
            "total_outbound_audio_bytes": inner.total_outbound_audio_bytes,
            "last_error": inner.last_error,
            "average_duration": average,
        })
    }
}

/// Everything one bridged call needs.
pub struct VoiceBridgeRequest {
    pub client_secret: String,
    pub model: String,
    pub instructions: String,
    pub voice: Option<String>,
    pub api_base: String,
    /// Inbound RTP packets; the stream ending means the call side is done.
    pub rtp_stream: mpsc::Receiver<RtpPacket>,
    pub peer: Arc<dyn PeerAudioSink>,
    /// Ask the model to take the first turn before any caller audio.
    pub speak_first: bool,
}

/// Bridge between the SIP RTP stream and the Realtime session.
pub struct TelephonyVoiceBridge {
    hooks: Arc<dyn VoiceBridgeHooks>,
    metrics: Arc<VoiceBridgeMetrics>,
    connector: Arc<dyn RealtimeConnector>,
    session_checker: Option<SessionChecker>,
    input_codec: AudioCodec,
    target_sample_rate: u32,
    receive_timeout: Duration,
}

impl TelephonyVoiceBridge {
    pub fn new(
        hooks: Arc<dyn VoiceBridgeHooks>,
        metrics: Arc<VoiceBridgeMetrics>,
        connector: Arc<dyn RealtimeConnector>,
    ) -> Self {
        Self {
            hooks,
            metrics,
            connector,
            session_checker: None,
            input_codec: AudioCodec::Pcmu,
            target_sample_rate: MODEL_SAMPLE_RATE,
            receive_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_input_codec(mut self, codec: AudioCodec) -> Self {
        self.input_codec = codec;
        self
    }

    pub fn with_session_checker(mut self, checker: SessionChecker) -> Self {
        self.session_checker = Some(checker);
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout.max(Duration::from_millis(100));
        self
    }

    /// Run the bridge until the call ends, the model closes the session, or
    /// either side errors. Always records metrics and fires teardown hooks.
    pub async fn run(&self, request: VoiceBridgeRequest) -> VoiceBridgeStats {
        let url = build_realtime_ws_url(&request.model, &request.api_base);
        tracing::info!(
            "opening realtime voice session (model={}, voice={})",
            request.model,
            request.voice.as_deref().unwrap_or("<auto>")
        );

        let started = Instant::now();
        let stop = CancellationToken::new();
        let mut error: Option<String> = None;
        let mut inbound_audio_bytes = 0usize;
        let mut outbound_audio_bytes = 0usize;
        let mut transcripts: Vec<TranscriptEntry> = Vec::new();

        match self.connector.connect(&url, &request.client_secret).await {
            Ok((mut sink, source)) => {
                let session = SessionConfig::new(
                    &request.model,
                    &request.instructions,
                    request.voice.as_deref(),
                );
                let mut setup_ok = true;
                if let Err(e) = sink
                    .send_text(ClientEvent::SessionUpdate { session }.to_json())
                    .await
                {
                    error = Some(format!("session.update failed: {}", e));
                    setup_ok = false;
                }
                if setup_ok && request.speak_first {
                    if let Err(e) = sink.send_text(ClientEvent::ResponseCreate.to_json()).await {
                        tracing::warn!("speak-first response.create failed: {}", e);
                    }
                }

                if setup_ok {
                    let inbound = self.spawn_inbound_pump(request.rtp_stream, sink, stop.clone());
                    let outbound = self.outbound_pump(source, request.peer.clone(), stop.clone());

                    let (inbound_result, outbound_result) = tokio::join!(inbound, outbound);

                    let (out_bytes, out_transcripts, out_error) = outbound_result;
                    outbound_audio_bytes = out_bytes;
                    transcripts = out_transcripts;

                    match inbound_result {
                        Ok((in_bytes, in_error, mut returned_sink)) => {
                            inbound_audio_bytes = in_bytes;
                            error = error.or(out_error).or(in_error);
                            returned_sink.close().await;
                        }
                        Err(e) => {
                            tracing::error!("inbound pump task failed: {}", e);
                            error = error
                                .or(out_error)
                                .or(Some(format!("inbound pump failed: {}", e)));
                        }
                    }
                } else {
                    sink.close().await;
                }
            }
            Err(e) => {
                tracing::error!("realtime voice session failed to open: {}", e);
                error = Some(e.to_string());
            }
        }

        let stats = VoiceBridgeStats {
            duration_seconds: started.elapsed().as_secs_f64(),
            inbound_audio_bytes,
            outbound_audio_bytes,
            transcripts,
            error,
        };

        self.metrics.record(&stats).await;
        self.teardown(&stats).await;

        if stats.error.is_none() {
            tracing::info!(
                "voice session finished (duration={:.2}s, audio_in={}, audio_out={}, transcripts={})",
                stats.duration_seconds,
                stats.inbound_audio_bytes,
                stats.outbound_audio_bytes,
                stats.transcript_count(),
            );
        } else {
            tracing::warn!(
                "voice session finished with error after {:.2}s: {}",
                stats.duration_seconds,
                stats.error.as_deref().unwrap_or(""),
            );
        }

        stats
    }

    fn should_continue(&self, stop: &CancellationToken) -> bool {
        if stop.is_cancelled() {
            return false;
        }
        let Some(checker) = &self.session_checker else {
            return true;
        };
        match checker() {
            Ok(active) => active,
            Err(e) => {
                // Fail open: a broken activity flag must not drop the call.
                tracing::error!("voice session checker failed, continuing: {}", e);
                true
            }
        }
    }

    /// Inbound pump: RTP payload -> PCM16 -> 24 kHz -> base64 append. Sends
    /// one final commit when the call ends while audio was buffered.
    fn spawn_inbound_pump(
        &self,
        mut rtp_stream: mpsc::Receiver<RtpPacket>,
        mut sink: Box<dyn RealtimeSink>,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<(usize, Option<String>, Box<dyn RealtimeSink>)> {
        let input_codec = self.input_codec;
        let target_rate = self.target_sample_rate;
        let checker = self.session_checker.clone();

        tokio::spawn(async move {
            let mut inbound_bytes = 0usize;
            let mut appended = false;
            let mut error = None;

            loop {
                let packet = tokio::select! {
                    _ = stop.cancelled() => break,
                    packet = rtp_stream.recv() => packet,
                };
                let Some(packet) = packet else {
                    break;
                };

                let pcm = decode_packet(input_codec, target_rate, &packet);
                if pcm.is_empty() {
                    continue;
                }
                inbound_bytes += pcm.len();

                let frame = ClientEvent::InputAudioAppend {
                    audio: BASE64.encode(&pcm),
                };
                if let Err(e) = sink.send_text(frame.to_json()).await {
                    error = Some(format!("audio append failed: {}", e));
                    break;
                }
                appended = true;

                let active = match &checker {
                    Some(checker) => checker().unwrap_or_else(|e| {
                        tracing::error!("voice session checker failed, continuing: {}", e);
                        true
                    }),
                    None => true,
                };
                if !active {
                    break;
                }
            }

            // Server VAD commits turns on its own; an explicit commit is only
            // needed when the call ends while the caller was mid-utterance.
            if appended {
                if let Err(e) = sink.send_text(ClientEvent::InputAudioCommit.to_json()).await {
                    tracing::debug!("final input_audio_buffer.commit failed: {}", e);
                }
            }
            stop.cancel();
            (inbound_bytes, error, sink)
        })
    }

    /// Outbound pump: model events -> peer audio + transcript assembly.
    async fn outbound_pump(
        &self,
        mut source: Box<dyn crate::realtime::client::RealtimeSource>,
        peer: Arc<dyn PeerAudioSink>,
        stop: CancellationToken,
    ) -> (usize, Vec<TranscriptEntry>, Option<String>) {
        let mut outbound_bytes = 0usize;
        let mut transcripts: Vec<TranscriptEntry> = Vec::new();
        let mut buffers: HashMap<String, Vec<String>> = HashMap::new();
        let mut error: Option<String> = None;

        loop {
            let timeout = if stop.is_cancelled() {
                DRAIN_TIMEOUT
            } else {
                self.receive_timeout
            };

            let raw = match source.recv_text(timeout).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    if !self.should_continue(&stop) {
                        break;
                    }
                    continue;
                }
                Err(RealtimeError::Closed) => break,
                Err(e) => {
                    tracing::error!("realtime websocket transport error: {}", e);
                    error = Some(format!("websocket transport error: {}", e));
                    break;
                }
            };

            let Some(event) = parse_server_event(&raw) else {
                if !self.should_continue(&stop) {
                    break;
                }
                continue;
            };

            match event {
                ServerEvent::SessionEnded => break,
                ServerEvent::Error { message } => {
                    error = Some(message);
                    break;
                }
                ServerEvent::SpeechStarted => {
                    tracing::debug!("caller speech detected, server VAD interrupts playback");
                }
                ServerEvent::SpeechStopped => {
                    tracing::debug!("caller speech ended");
                }
                ServerEvent::ResponseCancelled => {
                    tracing::debug!("model response cancelled after interruption");
                }
                ServerEvent::AudioDelta { chunks, .. } => {
                    for chunk in chunks {
                        let pcm = match BASE64.decode(chunk.as_bytes()) {
                            Ok(pcm) => pcm,
                            Err(_) => {
                                tracing::debug!("invalid base64 audio delta ignored");
                                continue;
                            }
                        };
                        if !pcm.is_empty() {
                            outbound_bytes += pcm.len();
                            peer.send_audio(Bytes::from(pcm)).await;
                        }
                    }
                }
                ServerEvent::TranscriptDelta { response_id, text } => {
                    if let Some(id) = response_id {
                        buffers.entry(id).or_default().push(text);
                    }
                }
                ServerEvent::ResponseCompleted {
                    response_id,
                    transcripts: completed,
                } => {
                    let combined = response_id
                        .and_then(|id| buffers.remove(&id))
                        .map(|parts| parts.concat().trim().to_string())
                        .filter(|text| !text.is_empty())
                        .map(|text| TranscriptEntry {
                            role: "assistant".to_string(),
                            text,
                        });

                    if !completed.is_empty() {
                        let duplicate = combined.as_ref().is_some_and(|entry| {
                            completed.iter().any(|c| c.text == entry.text)
                        });
                        transcripts.extend(completed);
                        if let Some(entry) = combined {
                            if !duplicate {
                                transcripts.push(entry);
                            }
                        }
                    } else if let Some(entry) = combined {
                        transcripts.push(entry);
                    }
                }
                ServerEvent::Unknown { kind } => {
                    tracing::debug!("unhandled realtime event kind: {}", kind);
                }
            }

            if !self.should_continue(&stop) {
                break;
            }
        }

        stop.cancel();
        (outbound_bytes, transcripts, error)
    }

    async fn teardown(&self, stats: &VoiceBridgeStats) {
        if let Err(e) = self.hooks.close_dialog().await {
            tracing::error!("close_dialog hook failed: {}", e);
        }
        if let Err(e) = self.hooks.clear_voice_state().await {
            tracing::error!("clear_voice_state hook failed: {}", e);
        }
        if !stats.transcripts.is_empty() {
            if let Err(e) = self.hooks.resume_workflow(&stats.transcripts).await {
                tracing::error!("resume_workflow hook failed: {}", e);
            }
        } else if stats.error.is_some() {
            tracing::debug!("no transcripts after error, workflow resume skipped");
        }
    }
}

/// Decode one RTP payload into PCM16 bytes at the model sample rate.
/// Passthrough codecs (G.729) forward the payload untouched.
fn decode_packet(codec: AudioCodec, target_rate: u32, packet: &RtpPacket) -> Vec<u8> {
    if packet.payload.is_empty() {
        return Vec::new();
    }
    match codec.g711_law() {
        Some(law) => {
            let samples = law.decode(&packet.payload);
            let upsampled = resample(&samples, codec.clock_rate(), target_rate);
            samples_to_bytes(&upsampled)
        }
        None => packet.payload.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::client::RealtimeSource;
    use crate::sip::rtp::RtpHeader;
    use serde_json::json;
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

    struct CollectingPeer {
        audio: StdMutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl PeerAudioSink for CollectingPeer {
        async fn send_audio(&self, pcm: Bytes) {
            self.audio.lock().unwrap().push(pcm);
        }
    }

    #[derive(Default)]
    struct OrderedHooks {
        calls: StdMutex<Vec<String>>,
        transcripts_seen: StdMutex<Vec<TranscriptEntry>>,
    }

    #[async_trait]
    impl VoiceBridgeHooks for OrderedHooks {
        async fn close_dialog(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("close_dialog".to_string());
            Ok(())
        }

        async fn clear_voice_state(&self) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push("clear_voice_state".to_string());
            Ok(())
        }

        async fn resume_workflow(&self, transcripts: &[TranscriptEntry]) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push("resume_workflow".to_string());
            self.transcripts_seen
                .lock()
                .unwrap()
                .extend(transcripts.iter().cloned());
            Ok(())
        }
    }

    struct Fixture {
        sent: Arc<StdMutex<Vec<Value>>>,
        frames_tx: mpsc::UnboundedSender<String>,
        rtp_tx: mpsc::Sender<RtpPacket>,
        hooks: Arc<OrderedHooks>,
        peer: Arc<CollectingPeer>,
        bridge: TelephonyVoiceBridge,
        request: Option<VoiceBridgeRequest>,
    }

    fn fixture() -> Fixture {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (rtp_tx, rtp_rx) = mpsc::channel(32);
        let hooks = Arc::new(OrderedHooks::default());
        let peer = Arc::new(CollectingPeer {
            audio: StdMutex::new(Vec::new()),
        });
        let connector = Arc::new(FakeConnector {
            sent: sent.clone(),
            frames: StdMutex::new(Some(frames_rx)),
        });
        let bridge = TelephonyVoiceBridge::new(
            hooks.clone(),
            Arc::new(VoiceBridgeMetrics::default()),
            connector,
        )
        .with_receive_timeout(Duration::from_millis(100));

        let request = VoiceBridgeRequest {
            client_secret: "ek_test".to_string(),
            model: "gpt-realtime".to_string(),
            instructions: "Sois bref.".to_string(),
            voice: Some("verse".to_string()),
            api_base: "https://api.example.com".to_string(),
            rtp_stream: rtp_rx,
            peer: peer.clone(),
            speak_first: false,
        };

        Fixture {
            sent,
            frames_tx,
            rtp_tx,
            hooks,
            peer,
            bridge,
            request: Some(request),
        }
    }

    fn ulaw_packet(sequence: u16) -> RtpPacket {
        RtpPacket::new(
            RtpHeader::new(0, sequence, sequence as u32 * 160, 7),
            Bytes::from(vec![0xFFu8; 160]),
        )
    }

    #[tokio::test]
    async fn happy_path_appends_commits_and_assembles_transcripts() {
        let mut fx = fixture();
        let request = fx.request.take().unwrap();

        // One second of model audio plus a transcript, then the peer hangs up.
        let audio = BASE64.encode(samples_to_bytes(&vec![100i16; 8000]));
        fx.frames_tx
            .send(
                json!({"type": "response.output_audio.delta", "response_id": "r1", "delta": audio})
                    .to_string(),
            )
            .unwrap();
        fx.frames_tx
            .send(
                json!({"type": "response.audio_transcript.delta", "response_id": "r1", "delta": "Bon"})
                    .to_string(),
            )
            .unwrap();
        fx.frames_tx
            .send(
                json!({"type": "response.audio_transcript.delta", "response_id": "r1", "delta": "jour"})
                    .to_string(),
            )
            .unwrap();
        fx.frames_tx
            .send(json!({"type": "response.completed", "response_id": "r1"}).to_string())
            .unwrap();

        let rtp_tx = fx.rtp_tx.clone();
        tokio::spawn(async move {
            for sequence in 0..3u16 {
                rtp_tx.send(ulaw_packet(sequence)).await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            drop(rtp_tx);
        });
        drop(fx.rtp_tx);

        let stats = fx.bridge.run(request).await;

        assert!(stats.error.is_none(), "unexpected error: {:?}", stats.error);
        // 160 μ-law bytes -> 480 samples at 24 kHz -> 960 bytes, per packet.
        assert_eq!(stats.inbound_audio_bytes, 3 * 960);
        assert_eq!(stats.outbound_audio_bytes, 16_000);
        assert_eq!(
            stats.transcripts,
            vec![TranscriptEntry {
                role: "assistant".to_string(),
                text: "Bonjour".to_string(),
            }]
        );

        let sent = fx.sent.lock().unwrap();
        assert_eq!(sent[0]["type"], "session.update");
        assert_eq!(sent[0]["session"]["audio"]["input"]["format"]["rate"], 24_000);
        let appends: Vec<&Value> = sent
            .iter()
            .filter(|f| f["type"] == "input_audio_buffer.append")
            .collect();
        assert_eq!(appends.len(), 3);
        assert_eq!(
            sent.last().unwrap()["type"],
            "input_audio_buffer.commit",
            "call end while appending must commit"
        );

        assert_eq!(fx.peer.audio.lock().unwrap().len(), 1);
        assert_eq!(
            fx.hooks.calls.lock().unwrap().as_slice(),
            ["close_dialog", "clear_voice_state", "resume_workflow"]
        );
        assert_eq!(fx.hooks.transcripts_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn model_error_frame_sets_stats_error_and_skips_resume() {
        let mut fx = fixture();
        let request = fx.request.take().unwrap();

        fx.frames_tx
            .send(json!({"type": "error", "error": {"message": "overloaded"}}).to_string())
            .unwrap();
        drop(fx.rtp_tx);

        let stats = fx.bridge.run(request).await;

        assert_eq!(stats.error.as_deref(), Some("overloaded"));
        assert!(stats.transcripts.is_empty());
        let calls = fx.hooks.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["close_dialog", "clear_voice_state"]);
    }

    #[tokio::test]
    async fn session_ended_closes_cleanly() {
        let mut fx = fixture();
        let request = fx.request.take().unwrap();

        fx.frames_tx
            .send(json!({"type": "session.ended"}).to_string())
            .unwrap();
        drop(fx.rtp_tx);

        let stats = fx.bridge.run(request).await;
        assert!(stats.error.is_none());
    }

    #[tokio::test]
    async fn malformed_audio_delta_is_not_fatal() {
        let mut fx = fixture();
        let request = fx.request.take().unwrap();

        fx.frames_tx
            .send(
                json!({"type": "response.output_audio.delta", "delta": "!!not-base64!!"})
                    .to_string(),
            )
            .unwrap();
        fx.frames_tx
            .send(json!({"type": "session.ended"}).to_string())
            .unwrap();
        drop(fx.rtp_tx);

        let stats = fx.bridge.run(request).await;
        assert!(stats.error.is_none());
        assert_eq!(stats.outbound_audio_bytes, 0);
        assert!(fx.peer.audio.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_checker_keeps_the_bridge_alive() {
        let mut fx = fixture();
        fx.bridge = fx
            .bridge
            .with_session_checker(Arc::new(|| Err("flag store down".to_string())));
        let request = fx.request.take().unwrap();

        let rtp_tx = fx.rtp_tx.clone();
        let frames_tx = fx.frames_tx.clone();
        tokio::spawn(async move {
            rtp_tx.send(ulaw_packet(1)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            frames_tx
                .send(json!({"type": "session.ended"}).to_string())
                .unwrap();
        });
        drop(fx.rtp_tx);

        let stats = fx.bridge.run(request).await;
        // The append went through despite the checker erroring on every poll.
        assert_eq!(stats.inbound_audio_bytes, 960);
    }

    #[tokio::test]
    async fn speak_first_sends_response_create() {
        let mut fx = fixture();
        let mut request = fx.request.take().unwrap();
        request.speak_first = true;

        fx.frames_tx
            .send(json!({"type": "session.ended"}).to_string())
            .unwrap();
        drop(fx.rtp_tx);

        fx.bridge.run(request).await;

        let sent = fx.sent.lock().unwrap();
        assert_eq!(sent[0]["type"], "session.update");
        assert_eq!(sent[1]["type"], "response.create");
    }

    #[tokio::test]
    async fn metrics_aggregate_sessions() {
        let metrics = VoiceBridgeMetrics::default();
        metrics
            .record(&VoiceBridgeStats {
                duration_seconds: 2.0,
                inbound_audio_bytes: 10,
                outbound_audio_bytes: 20,
                transcripts: vec![],
                error: None,
            })
            .await;
        metrics
            .record(&VoiceBridgeStats {
                duration_seconds: 4.0,
                inbound_audio_bytes: 1,
                outbound_audio_bytes: 2,
                transcripts: vec![],
                error: Some("boom".to_string()),
            })
            .await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot["total_sessions"], 2);
        assert_eq!(snapshot["total_errors"], 1);
        assert_eq!(snapshot["average_duration"], 3.0);
        assert_eq!(snapshot["last_error"], "boom");
    }
}
