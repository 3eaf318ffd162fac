//! Invite runtime.
//!
//! Owns the lifecycle of every inbound call: extract who was called,
//! resolve the workflow, allocate media, answer while the model session
//! warms up behind the ring, run the voice bridge, and release everything
//! on the way out. One [`SipCallSession`] exists per Call-ID.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bridge::{
    TelephonyVoiceBridge, VoiceBridgeHooks, VoiceBridgeMetrics, VoiceBridgeRequest,
};
use crate::gateway::Gateway;
use crate::realtime::client::{mint_client_secret, MintParams, MintTransport, RealtimeConnector};
use crate::realtime::TranscriptEntry;
use crate::registry::{SessionMetadata, SessionRegistry, VoiceSessionHandle};
use crate::sip::invite::{evaluate_offer, handle_incoming_invite, InviteOutcome, SipDialog};
use crate::sip::rtp::{RtpEndpoint, RtpEndpointConfig, RtpPortAllocator};
use crate::sip::AudioCodec;
use crate::store::{RequestContext, ThreadMetadata, ThreadStore};
use crate::workflow::{
    resolve_workflow_for_phone_number, TelephonyCallContext, VoiceDefaults, WorkflowStore,
};

/// Headers consulted for the called number, most specific first.
const CALLED_NUMBER_HEADERS: &[&str] = &[
    "x-original-to",
    "x-called-number",
    "p-called-party-id",
    "p-asserted-identity",
    "to",
    "from",
];

/// The slice of an inbound INVITE the runtime consumes.
#[derive(Debug, Clone, Default)]
pub struct InviteRequest {
    pub call_id: String,
    /// Raw headers, name/value, in arrival order.
    pub headers: Vec<(String, String)>,
    pub sdp: Vec<u8>,
}

impl InviteRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Media and provider knobs the runtime needs from configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_host: String,
    /// Local RTP port to request; 0 lets the OS pick.
    pub media_port: u16,
    pub preferred_codecs: Vec<AudioCodec>,
    pub model_api_base: String,
    pub model_api_key: String,
    pub receive_timeout: Duration,
}

/// Per-call mutable state.
#[derive(Default)]
pub struct CallContext {
    pub incoming_number: Option<String>,
    pub sip_account_id: Option<i64>,
    pub workflow: Option<TelephonyCallContext>,
    pub rtp: Option<Arc<RtpEndpoint>>,
    pub thread_id: Option<String>,
    pub realtime_session_id: Option<String>,
    pub voice_session_active: bool,
}

/// One live SIP call tracked by Call-ID.
pub struct SipCallSession {
    pub call_id: String,
    pub dialog: Arc<dyn SipDialog>,
    pub context: Mutex<CallContext>,
}

/// Strip a header value down to a dialable number: the user part of a
/// `sip:` URI if present, then digits plus `+#*`.
fn sanitize_phone_candidate(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }

    let lowered = text.to_ascii_lowercase();
    let candidate = match lowered.find("sip:") {
        Some(start) => {
            let after = &text[start + 4..];
            let end = after
                .find(|ch| matches!(ch, '@' | '>' | ';'))
                .unwrap_or(after.len());
            &after[..end]
        }
        None => text,
    };

    let digits: String = candidate
        .chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '+' | '#' | '*'))
        .collect();
    if !digits.is_empty() {
        return Some(digits);
    }
    if !candidate.is_empty() {
        return Some(candidate.to_string());
    }
    None
}

/// The username of a `To:` URI, lowercased.
fn extract_to_username(value: &str) -> Option<String> {
    let lowered = value.to_ascii_lowercase();
    let user_start = lowered
        .find("sips:")
        .map(|i| i + 5)
        .or_else(|| lowered.find("sip:").map(|i| i + 4))?;
    let after = &value[user_start..];
    let at = after.find('@')?;
    let user = after[..at].trim();
    if user.is_empty() {
        None
    } else {
        Some(user.to_ascii_lowercase())
    }
}

/// Orchestrates call admission and teardown.
pub struct InviteRuntime {
    config: RuntimeConfig,
    accounts: Arc<crate::sip::registration::SipAccountStore>,
    workflows: Arc<dyn WorkflowStore>,
    voice_defaults: VoiceDefaults,
    registry: Arc<SessionRegistry>,
    gateway: Arc<Gateway>,
    threads: Arc<dyn ThreadStore>,
    mint: Arc<dyn MintTransport>,
    connector: Arc<dyn RealtimeConnector>,
    metrics: Arc<VoiceBridgeMetrics>,
    /// Hands out per-call media ports when no fixed port is configured.
    rtp_ports: Option<Arc<RtpPortAllocator>>,
    sessions: Mutex<HashMap<String, Arc<SipCallSession>>>,
}

impl InviteRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        accounts: Arc<crate::sip::registration::SipAccountStore>,
        workflows: Arc<dyn WorkflowStore>,
        voice_defaults: VoiceDefaults,
        registry: Arc<SessionRegistry>,
        gateway: Arc<Gateway>,
        threads: Arc<dyn ThreadStore>,
        mint: Arc<dyn MintTransport>,
        connector: Arc<dyn RealtimeConnector>,
        metrics: Arc<VoiceBridgeMetrics>,
    ) -> Self {
        Self {
            config,
            accounts,
            workflows,
            voice_defaults,
            registry,
            gateway,
            threads,
            mint,
            connector,
            metrics,
            rtp_ports: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Use a port range instead of a single configured media port.
    pub fn with_rtp_port_allocator(mut self, allocator: Arc<RtpPortAllocator>) -> Self {
        self.rtp_ports = Some(allocator);
        self
    }

    pub async fn active_call_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn get_session(&self, call_id: &str) -> Option<Arc<SipCallSession>> {
        self.sessions.lock().await.get(call_id).cloned()
    }

    fn extract_incoming_number(&self, request: &InviteRequest) -> Option<String> {
        for header in CALLED_NUMBER_HEADERS {
            if let Some(value) = request.header(header) {
                if let Some(number) = sanitize_phone_candidate(value) {
                    return Some(number);
                }
            }
        }
        None
    }

    fn resolve_sip_account(&self, request: &InviteRequest) -> Option<i64> {
        let to_header = request.header("to")?;
        let username = extract_to_username(to_header)?;
        let account = self.accounts.find_active_by_username(&username)?;
        tracing::info!(
            "inbound call matches SIP account '{}' (id={}) via username '{}'",
            account.label,
            account.id,
            account.username
        );
        Some(account.id)
    }

    /// Handle one INVITE end to end. Returns when the call is over; the
    /// SIP layer spawns a task per invite.
    pub async fn handle_invite(&self, dialog: Arc<dyn SipDialog>, request: InviteRequest) {
        let call_id = request.call_id.clone();

        // A second INVITE reusing a live Call-ID is a protocol violation,
        // not a retransmission we can absorb.
        if self.sessions.lock().await.contains_key(&call_id) {
            tracing::warn!("INVITE reusing live Call-ID {}, answering 486", call_id);
            let _ = dialog.reply(486, "Busy Here", None).await;
            return;
        }

        let incoming_number = self.extract_incoming_number(&request);
        tracing::info!(
            "SIP call initialized (Call-ID={}, called number={})",
            call_id,
            incoming_number.as_deref().unwrap_or("<unknown>")
        );

        let Some(sip_account_id) = self.resolve_sip_account(&request) else {
            tracing::warn!("no active SIP account matches the To header for {}", call_id);
            let _ = dialog.reply(404, "Not Found", None).await;
            return;
        };

        let workflow = match resolve_workflow_for_phone_number(
            self.workflows.as_ref(),
            &self.voice_defaults,
            incoming_number.as_deref().unwrap_or(""),
            sip_account_id,
        )
        .await
        {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(
                    "no active telephony route for Call-ID={} ({}): {}",
                    call_id,
                    incoming_number.as_deref().unwrap_or("<unknown>"),
                    e
                );
                let _ = dialog.reply(404, "Not Found", None).await;
                return;
            }
        };

        // Evaluate the offer before touching media resources so codec
        // rejections never allocate a port.
        let media = match evaluate_offer(&request.sdp, &self.config.preferred_codecs) {
            InviteOutcome::Admitted(media) => media,
            InviteOutcome::Rejected { status, reason } => {
                let _ = dialog.reply(100, "Trying", None).await;
                let _ = dialog.reply(status, reason, None).await;
                return;
            }
        };

        let negotiated_codec = media.codec.codec;
        let remote = media.remote_rtp.as_ref().and_then(|(host, port)| {
            format!("{}:{}", host, port).parse().ok()
        });
        let local_port = match &self.rtp_ports {
            Some(allocator) => allocator.allocate().await,
            None => self.config.media_port,
        };
        let rtp = Arc::new(RtpEndpoint::new(RtpEndpointConfig {
            local_host: self.config.media_host.clone(),
            local_port,
            remote,
            payload_type: media.codec.payload_type,
            output_codec: media.codec.codec,
            ssrc: None,
            input_sample_rate: 24_000,
        }));
        let actual_media_port = match rtp.start().await {
            Ok(port) => port,
            Err(e) => {
                tracing::error!("RTP endpoint failed to start for {}: {}", call_id, e);
                let _ = dialog.reply(500, "Server Internal Error", None).await;
                return;
            }
        };
        tracing::info!(
            "RTP endpoint ready for Call-ID={} (port={})",
            call_id,
            actual_media_port
        );

        let session = Arc::new(SipCallSession {
            call_id: call_id.clone(),
            dialog: dialog.clone(),
            context: Mutex::new(CallContext {
                incoming_number: incoming_number.clone(),
                sip_account_id: Some(sip_account_id),
                workflow: Some(workflow.clone()),
                rtp: Some(rtp.clone()),
                ..CallContext::default()
            }),
        });
        self.sessions
            .lock()
            .await
            .insert(call_id.clone(), session.clone());

        // Answer and mint concurrently: the credential handshake hides
        // behind human-perceived ring time.
        let ring_timeout = Duration::from_secs_f64(workflow.ring_timeout_seconds.max(0.0));
        let invite_flow = handle_incoming_invite(
            dialog.as_ref(),
            &request.sdp,
            &self.config.media_host,
            actual_media_port,
            ring_timeout,
            &self.config.preferred_codecs,
        );
        let session_flow = self.open_voice_session(&call_id, &workflow);

        let (invite_result, session_result) = tokio::join!(invite_flow, session_flow);

        match invite_result {
            Ok(InviteOutcome::Admitted(_)) => {}
            Ok(InviteOutcome::Rejected { status, .. }) => {
                tracing::warn!("INVITE for {} rejected late with {}", call_id, status);
                self.release_call(&session, false).await;
                return;
            }
            Err(e) => {
                tracing::error!("INVITE processing failed for {}: {}", call_id, e);
                self.release_call(&session, false).await;
                return;
            }
        }

        let handle = match session_result {
            Ok(handle) => handle,
            Err(e) => {
                // The peer already heard 200 OK; hang up cleanly.
                tracing::error!("realtime session unavailable for {}: {}", call_id, e);
                let _ = dialog.hangup().await;
                self.release_call(&session, false).await;
                return;
            }
        };

        rtp.send_silence_packet().await;

        self.attach_thread(&session, &handle, &workflow).await;
        {
            let mut context = session.context.lock().await;
            context.realtime_session_id = Some(handle.session_id.clone());
            context.voice_session_active = true;
        }

        self.registry.add(handle.clone()).await;
        self.gateway.register_session(handle.clone()).await;

        self.run_bridge(&session, &handle, &workflow, rtp.clone(), negotiated_codec)
            .await;

        self.release_call(&session, true).await;
        self.registry.remove(Some(&handle.session_id), None).await;
        self.gateway.unregister_session(&handle.session_id).await;
    }

    /// Mint a credential and build the session handle. The synthetic
    /// `transfer_call` tool is always appended so the model can ask for a
    /// blind transfer.
    async fn open_voice_session(
        &self,
        call_id: &str,
        workflow: &TelephonyCallContext,
    ) -> Result<Arc<VoiceSessionHandle>, crate::realtime::RealtimeError> {
        let mut tools = workflow.voice_tools.clone();
        tools.push(transfer_call_tool());
        tracing::info!(
            "appending call transfer tool for Call-ID={} (total tools: {})",
            call_id,
            tools.len()
        );

        let minted = mint_client_secret(
            self.mint.as_ref(),
            &MintParams {
                api_base: self.config.model_api_base.clone(),
                api_key: self.config.model_api_key.clone(),
                model: workflow.voice_model.clone(),
                instructions: workflow.voice_instructions.clone(),
                voice: Some(workflow.voice_voice.clone()),
                realtime: Some(json!({})),
                tools: Some(tools.clone()),
            },
        )
        .await?;

        let handle = Arc::new(VoiceSessionHandle {
            session_id: Uuid::new_v4().simple().to_string(),
            client_secret: Some(minted.client_secret.clone()),
            payload: minted.payload,
            metadata: SessionMetadata {
                user_id: format!("sip:{}", call_id),
                model: workflow.voice_model.clone(),
                voice: Some(workflow.voice_voice.clone()),
                instructions: Some(workflow.voice_instructions.clone()),
                thread_id: None,
                provider_id: workflow.voice_provider_id.clone(),
                provider_slug: workflow.voice_provider_slug.clone(),
                realtime_config: Some(json!({})),
                tools: Some(tools),
            },
        });
        tracing::debug!("realtime session minted: {}", handle.summary());
        Ok(handle)
    }

    /// Create (or reuse) the chat thread for this call and persist the
    /// voice wait state so the UI can resume the conversation later.
    async fn attach_thread(
        &self,
        session: &Arc<SipCallSession>,
        handle: &Arc<VoiceSessionHandle>,
        workflow: &TelephonyCallContext,
    ) {
        let ctx = RequestContext::for_user(format!("sip:{}", session.call_id));

        let thread_id = Uuid::new_v4().to_string();
        let thread = ThreadMetadata {
            id: thread_id.clone(),
            created_at: chrono::Utc::now(),
            metadata: json!({
                "sip_caller_number": workflow.normalized_number,
                "sip_original_number": workflow.original_number,
                "sip_call_id": session.call_id,
            }),
            wait_state: Some(build_voice_wait_state(handle, workflow)),
        };

        if let Err(e) = self.threads.save_thread(&thread, &ctx).await {
            tracing::error!(
                "thread creation failed for Call-ID={}: {}",
                session.call_id,
                e
            );
            return;
        }
        tracing::info!(
            "thread created for SIP call (Call-ID={}, thread_id={})",
            session.call_id,
            thread_id
        );
        session.context.lock().await.thread_id = Some(thread_id);
    }

    async fn run_bridge(
        &self,
        session: &Arc<SipCallSession>,
        handle: &Arc<VoiceSessionHandle>,
        workflow: &TelephonyCallContext,
        rtp: Arc<RtpEndpoint>,
        codec: AudioCodec,
    ) {
        let Some(rtp_stream) = rtp.take_packet_stream().await else {
            tracing::error!(
                "RTP stream already consumed for Call-ID={}",
                session.call_id
            );
            return;
        };
        let Some(client_secret) = handle.client_secret.clone() else {
            tracing::error!("client secret missing for Call-ID={}", session.call_id);
            return;
        };

        let hooks = Arc::new(RuntimeHooks {
            threads: self.threads.clone(),
            session: session.clone(),
        });
        let checker_session = session.clone();
        let bridge = TelephonyVoiceBridge::new(hooks, self.metrics.clone(), self.connector.clone())
            .with_input_codec(codec)
            .with_receive_timeout(self.config.receive_timeout)
            .with_session_checker(Arc::new(move || {
                Ok(checker_session
                    .context
                    .try_lock()
                    .map(|context| context.voice_session_active)
                    .unwrap_or(true))
            }));

        tracing::info!(
            "starting realtime voice bridge (Call-ID={}, model={}, voice={})",
            session.call_id,
            workflow.voice_model,
            workflow.voice_voice
        );

        let stats = bridge
            .run(VoiceBridgeRequest {
                client_secret,
                model: workflow.voice_model.clone(),
                instructions: workflow.voice_instructions.clone(),
                voice: Some(workflow.voice_voice.clone()),
                api_base: self.config.model_api_base.clone(),
                rtp_stream,
                peer: rtp,
                speak_first: workflow.speak_first,
            })
            .await;

        tracing::info!(
            "realtime session over (Call-ID={}, duration={:.2}s, transcripts={})",
            session.call_id,
            stats.duration_seconds,
            stats.transcript_count()
        );
    }

    /// Peer sent BYE. Ending the RTP stream unwinds the bridge, which runs
    /// the teardown hooks. Idempotent: a second BYE finds no session.
    pub async fn handle_bye(&self, call_id: &str) {
        let session = self.sessions.lock().await.get(call_id).cloned();
        let Some(session) = session else {
            tracing::debug!("BYE for unknown Call-ID={}, ignoring", call_id);
            return;
        };
        tracing::info!("BYE received for Call-ID={}", call_id);
        let rtp = {
            let mut context = session.context.lock().await;
            context.voice_session_active = false;
            context.rtp.clone()
        };
        if let Some(rtp) = rtp {
            rtp.stop().await;
        }
    }

    /// Drop per-call state. `ended` distinguishes normal completion from
    /// admission failures.
    async fn release_call(&self, session: &Arc<SipCallSession>, ended: bool) {
        let rtp = {
            let mut context = session.context.lock().await;
            context.voice_session_active = false;
            context.rtp.take()
        };
        if let Some(rtp) = rtp {
            rtp.stop().await;
        }
        self.sessions.lock().await.remove(&session.call_id);
        let context = session.context.lock().await;
        tracing::info!(
            "SIP session released (Call-ID={}, number={}, ended={})",
            session.call_id,
            context.incoming_number.as_deref().unwrap_or("<unknown>"),
            ended
        );
    }
}

/// Bridge teardown hooks bound to one call.
struct RuntimeHooks {
    threads: Arc<dyn ThreadStore>,
    session: Arc<SipCallSession>,
}

#[async_trait::async_trait]
impl VoiceBridgeHooks for RuntimeHooks {
    async fn close_dialog(&self) -> anyhow::Result<()> {
        self.session.dialog.hangup().await?;
        Ok(())
    }

    async fn clear_voice_state(&self) -> anyhow::Result<()> {
        let rtp = {
            let mut context = self.session.context.lock().await;
            context.voice_session_active = false;
            context.rtp.take()
        };
        if let Some(rtp) = rtp {
            rtp.stop().await;
        }
        Ok(())
    }

    async fn resume_workflow(&self, transcripts: &[TranscriptEntry]) -> anyhow::Result<()> {
        let thread_id = self.session.context.lock().await.thread_id.clone();
        let Some(thread_id) = thread_id else {
            tracing::info!(
                "workflow resume not configured (Call-ID={}, transcripts={})",
                self.session.call_id,
                transcripts.len()
            );
            return Ok(());
        };

        let user_texts: Vec<&str> = transcripts
            .iter()
            .filter(|t| t.role == "user" && !t.text.trim().is_empty())
            .map(|t| t.text.trim())
            .collect();
        let combined = user_texts.join(" ");

        let item = json!({
            "type": "user_message",
            "thread_id": thread_id,
            "message": {
                "content": if combined.is_empty() {
                    Value::Array(Vec::new())
                } else {
                    json!([{"type": "input_text", "text": combined}])
                },
            },
            "metadata": {"source": "sip", "transcripts": transcripts},
        });

        let ctx = RequestContext::for_user(format!("sip:{}", self.session.call_id));
        self.threads.save_item(&thread_id, &item, &ctx).await?;
        tracing::info!(
            "workflow resumed (Call-ID={}, transcripts={})",
            self.session.call_id,
            transcripts.len()
        );
        Ok(())
    }
}

/// Function tool the model can call to request a blind transfer.
pub fn transfer_call_tool() -> Value {
    json!({
        "type": "function",
        "name": "transfer_call",
        "description": "Transfer the active call to another phone number. \
            Use when the caller asks for a specific service, department or \
            person.",
        "parameters": {
            "type": "object",
            "properties": {
                "phone_number": {
                    "type": "string",
                    "description": "Destination number, E.164 preferred (e.g. +33123456789)",
                },
                "announcement": {
                    "type": "string",
                    "description": "Optional message played to the caller before the transfer",
                },
            },
            "required": ["phone_number"],
        },
    })
}

/// Serialized wait state resumed by the chat UI after the call.
fn build_voice_wait_state(
    handle: &Arc<VoiceSessionHandle>,
    workflow: &TelephonyCallContext,
) -> Value {
    let mut session_payload = json!({
        "model": workflow.voice_model,
        "voice": workflow.voice_voice,
        "instructions": workflow.voice_instructions,
        "realtime": {
            "start_mode": "auto",
            "stop_mode": "manual",
            "tools": {},
        },
    });
    if !workflow.voice_tools.is_empty() {
        session_payload["tools"] = Value::Array(workflow.voice_tools.clone());
    }

    json!({
        "type": "voice",
        "voice_event": {
            "type": "realtime.event",
            "step": {
                "slug": "sip-voice-session",
                "title": "SIP call",
            },
            "event": {
                "type": "history",
                "session_id": handle.session_id,
                "client_secret": handle.client_secret,
                "tool_permissions": {},
                "session": session_payload,
            },
        },
        "voice_event_consumed": false,
    })
}
