//! Realtime provider client.
//!
//! Mints short-lived client secrets over REST and opens the authenticated
//! model WebSocket. The mint payload walks a retry ladder because providers
//! disagree on where `voice` and `realtime` belong: each parameter tries its
//! modes in order `omitted -> session -> top_level`, advancing only when an
//! `unknown_parameter` rejection names the current placement. The happy path
//! is therefore a single request that omits `voice` entirely; the voice is
//! applied afterwards through `session.update`.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::sanitize::{redact_secrets, strip_max_token_fields};
use super::RealtimeError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard cap on mint attempts: both ladders have at most three rungs.
const MAX_MINT_ATTEMPTS: usize = 9;

/// Where an optional parameter is placed in the mint payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamMode {
    TopLevel,
    Session,
    Omitted,
}

impl ParamMode {
    /// The `param` value the provider reports when it rejects this
    /// placement of `name`.
    fn rejected_param(self, name: &str) -> Option<String> {
        match self {
            ParamMode::TopLevel => Some(name.to_string()),
            ParamMode::Session => Some(format!("session.{}", name)),
            ParamMode::Omitted => None,
        }
    }
}

/// Inputs for one client-secret mint.
#[derive(Debug, Clone)]
pub struct MintParams {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub instructions: String,
    pub voice: Option<String>,
    pub realtime: Option<Value>,
    pub tools: Option<Vec<Value>>,
}

/// A successfully minted credential.
#[derive(Debug, Clone)]
pub struct MintedSecret {
    pub client_secret: String,
    pub expires_at: Option<i64>,
    /// Full (token-field-sanitized) provider payload, kept for the thread
    /// wait state.
    pub payload: Value,
    pub attempts: usize,
}

/// HTTP POST seam so the retry ladder is testable without a live provider.
#[async_trait]
pub trait MintTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<(u16, Value), RealtimeError>;
}

/// Production transport backed by `reqwest`. Connect timeout is bounded;
/// reads are not, since the provider may hold the request.
pub struct HttpMintTransport {
    client: reqwest::Client,
}

impl HttpMintTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client }
    }
}

impl Default for HttpMintTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MintTransport for HttpMintTransport {
    async fn post(
        &self,
        url: &str,
        api_key: &str,
        body: &Value,
    ) -> Result<(u16, Value), RealtimeError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .header("OpenAI-Beta", "realtime=v1")
            .json(body)
            .send()
            .await
            .map_err(|e| RealtimeError::UpstreamTransport(e.to_string()))?;

        let status = response.status().as_u16();
        let payload = match response.text().await {
            Ok(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
            Err(e) => return Err(RealtimeError::UpstreamTransport(e.to_string())),
        };
        Ok((status, payload))
    }
}

/// Resolve the client-secrets endpoint for an API base. A base whose path
/// already ends in a `v1` segment is reused as-is; otherwise
/// `/v1/realtime/client_secrets` is appended to whatever path is there.
pub fn client_secrets_url(api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');

    let (origin, path) = match base.find("://") {
        Some(scheme_end) => match base[scheme_end + 3..].find('/') {
            Some(slash) => {
                let split = scheme_end + 3 + slash;
                (&base[..split], &base[split..])
            }
            None => (base, ""),
        },
        None => (base, ""),
    };

    let ends_in_v1 = path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .is_some_and(|segment| segment.eq_ignore_ascii_case("v1"));

    if ends_in_v1 {
        format!("{}{}/realtime/client_secrets", origin, path)
    } else {
        format!("{}{}/v1/realtime/client_secrets", origin, path)
    }
}

/// Build the Realtime WebSocket URL for a model.
pub fn build_realtime_ws_url(model: &str, api_base: &str) -> String {
    let base = api_base.trim_end_matches('/');

    let mut ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws") {
        base.to_string()
    } else {
        format!("wss://{}", base.trim_start_matches('/'))
    };

    if !ws_base.ends_with("/v1") && !ws_base.contains("/v1/") {
        ws_base.push_str("/v1");
    }

    format!("{}/realtime?model={}", ws_base, url_encode(model))
}

/// Percent-encode everything outside the unreserved set.
fn url_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}

/// Pull the bearer value out of a mint response: `{"value": ...}` on the GA
/// API, `{"client_secret": {"value": ...}}` on the beta one.
pub fn extract_client_secret(payload: &Value) -> Option<String> {
    if let Some(value) = payload.get("value").and_then(Value::as_str) {
        let candidate = value.trim();
        if !candidate.is_empty() {
            return Some(candidate.to_string());
        }
    }
    let nested = payload.get("client_secret")?.get("value")?.as_str()?.trim();
    if nested.is_empty() {
        None
    } else {
        Some(nested.to_string())
    }
}

fn build_mint_payload(params: &MintParams, voice_mode: ParamMode, realtime_mode: ParamMode) -> Value {
    let mut session = json!({
        "type": "realtime",
        "instructions": params.instructions,
        "model": params.model,
    });
    if let Some(tools) = &params.tools {
        if !tools.is_empty() {
            session["tools"] = Value::Array(tools.clone());
        }
    }

    let mut payload = json!({ "session": session });

    if let Some(realtime) = &params.realtime {
        match realtime_mode {
            ParamMode::Session => payload["session"]["realtime"] = realtime.clone(),
            ParamMode::TopLevel => payload["realtime"] = realtime.clone(),
            ParamMode::Omitted => {}
        }
    }

    if let Some(voice) = params.voice.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        match voice_mode {
            ParamMode::Session => payload["session"]["voice"] = json!(voice),
            ParamMode::TopLevel => payload["voice"] = json!(voice),
            ParamMode::Omitted => {}
        }
    }

    payload
}

/// Does this error body reject the current placement of `name`?
fn rejects_param(error_payload: &Value, mode: ParamMode, name: &str) -> bool {
    let Some(expected) = mode.rejected_param(name) else {
        return false;
    };
    let Some(error) = error_payload.get("error") else {
        return false;
    };
    error.get("code").and_then(Value::as_str) == Some("unknown_parameter")
        && error.get("param").and_then(Value::as_str) == Some(expected.as_str())
}

/// Mint a client secret, walking the placement ladders on
/// `unknown_parameter` rejections.
///
/// Both ladders run `[omitted, session, top_level]`. With `voice` omitted
/// nothing can reject its placement, so a configured voice still costs one
/// request; only the `realtime` object's session placement has a live
/// retry rung (down to omitting it, matching the provider's GA surface).
pub async fn mint_client_secret(
    transport: &dyn MintTransport,
    params: &MintParams,
) -> Result<MintedSecret, RealtimeError> {
    let url = client_secrets_url(&params.api_base);

    let has_voice = params
        .voice
        .as_deref()
        .is_some_and(|v| !v.trim().is_empty());
    let voice_modes: Vec<ParamMode> = if has_voice {
        vec![ParamMode::Omitted, ParamMode::Session, ParamMode::TopLevel]
    } else {
        vec![ParamMode::Omitted]
    };
    let realtime_modes: Vec<ParamMode> = match &params.realtime {
        Some(value) if value.as_object().is_some_and(|map| !map.is_empty()) => {
            vec![ParamMode::Omitted, ParamMode::Session, ParamMode::TopLevel]
        }
        Some(_) => vec![ParamMode::Session, ParamMode::Omitted],
        None => vec![ParamMode::Omitted],
    };
    let mut voice_index = 0usize;
    let mut realtime_index = 0usize;

    let mut last_status = 0u16;
    let mut last_error = Value::Null;

    for attempt in 1..=MAX_MINT_ATTEMPTS {
        let voice_mode = voice_modes[voice_index];
        let realtime_mode = realtime_modes[realtime_index];
        let body = build_mint_payload(params, voice_mode, realtime_mode);
        let (sanitized_body, removed) = strip_max_token_fields(&body);
        if removed {
            tracing::debug!("token-limit fields removed from client secret request");
        }

        let (status, payload) = transport.post(&url, &params.api_key, &sanitized_body).await?;

        if status < 400 {
            let (payload, removed) = strip_max_token_fields(&payload);
            if removed {
                tracing::debug!("token-limit fields removed from client secret response");
            }
            let client_secret =
                extract_client_secret(&payload).ok_or(RealtimeError::MissingClientSecret)?;
            return Ok(MintedSecret {
                client_secret,
                expires_at: payload.get("expires_at").and_then(Value::as_i64),
                payload,
                attempts: attempt,
            });
        }

        tracing::error!(
            "realtime client secret request failed ({}, voice={:?}, realtime={:?}): {}",
            status,
            voice_mode,
            realtime_mode,
            redact_secrets(&payload)
        );
        last_status = status;
        last_error = payload.clone();

        if rejects_param(&payload, voice_mode, "voice") && voice_index < voice_modes.len() - 1 {
            voice_index += 1;
            tracing::info!(
                "retrying client secret request with voice mode {:?}",
                voice_modes[voice_index]
            );
            continue;
        }
        if rejects_param(&payload, realtime_mode, "realtime")
            && realtime_index < realtime_modes.len() - 1
        {
            realtime_index += 1;
            tracing::info!(
                "retrying client secret request with realtime mode {:?}",
                realtime_modes[realtime_index]
            );
            continue;
        }

        break;
    }

    Err(RealtimeError::UpstreamAuth {
        status: last_status,
        detail: redact_secrets(&last_error).to_string(),
    })
}

/// Write half of a Realtime connection.
#[async_trait]
pub trait RealtimeSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), RealtimeError>;
    async fn close(&mut self);
}

/// Read half of a Realtime connection. `Ok(None)` signals a poll timeout so
/// callers can check stop flags between frames; `Err(Closed)` a clean end.
#[async_trait]
pub trait RealtimeSource: Send {
    async fn recv_text(&mut self, timeout: Duration) -> Result<Option<String>, RealtimeError>;
}

/// Opens Realtime connections; the bridge takes this as a seam so tests can
/// run against channel-backed fakes.
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        client_secret: &str,
    ) -> Result<(Box<dyn RealtimeSink>, Box<dyn RealtimeSource>), RealtimeError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TungsteniteSink {
    inner: SplitSink<WsStream, Message>,
}

pub struct TungsteniteSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl RealtimeSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> Result<(), RealtimeError> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RealtimeError::UpstreamTransport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.send(Message::Close(None)).await {
            tracing::debug!("realtime close frame failed: {}", e);
        }
    }
}

#[async_trait]
impl RealtimeSource for TungsteniteSource {
    async fn recv_text(&mut self, timeout: Duration) -> Result<Option<String>, RealtimeError> {
        let frame = match tokio::time::timeout(timeout, self.inner.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(RealtimeError::Closed),
            Ok(Some(Err(e))) => return Err(RealtimeError::UpstreamTransport(e.to_string())),
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => Ok(Some(text.to_string())),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => Ok(Some(text)),
                Err(_) => {
                    tracing::debug!("non-UTF-8 realtime frame ignored");
                    Ok(None)
                }
            },
            Message::Close(_) => Err(RealtimeError::Closed),
            // Ping/pong handled by the library.
            _ => Ok(None),
        }
    }
}

/// Production connector: `wss` with `Authorization: Bearer <client_secret>`.
pub struct TungsteniteConnector;

#[async_trait]
impl RealtimeConnector for TungsteniteConnector {
    async fn connect(
        &self,
        url: &str,
        client_secret: &str,
    ) -> Result<(Box<dyn RealtimeSink>, Box<dyn RealtimeSource>), RealtimeError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| RealtimeError::UpstreamTransport(e.to_string()))?;
        let bearer = format!("Bearer {}", client_secret)
            .parse()
            .map_err(|_| RealtimeError::UpstreamTransport("invalid client secret".to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| RealtimeError::UpstreamTransport("realtime connect timeout".to_string()))?
            .map_err(|e| RealtimeError::UpstreamTransport(e.to_string()))?;

        let (sink, source) = stream.split();
        Ok((
            Box::new(TungsteniteSink { inner: sink }),
            Box::new(TungsteniteSource { inner: source }),
        ))
    }
}
