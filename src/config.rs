//! Gateway configuration.
//!
//! Everything comes from environment variables so the binary drops into the
//! same deployment surface as the rest of the stack. `.env` files are
//! loaded by `main` before this runs.

use std::time::Duration;

use crate::runtime::RuntimeConfig;
use crate::sip::registration::{SipAccount, SipRegistrarConfig};
use crate::sip::AudioCodec;
use crate::workflow::VoiceDefaults;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Local address the SIP endpoint binds.
    pub sip_bind_host: String,
    pub sip_bind_port: u16,

    /// Address advertised in SDP answers; empty means "use the SIP bind
    /// address" (detected when that is a wildcard).
    pub media_host: String,
    /// Fixed RTP port; 0 lets the OS assign one per call.
    pub media_port: u16,
    /// Even-port range handed out per call when `media_port` is 0 and the
    /// range is non-empty.
    pub rtp_port_start: u16,
    pub rtp_port_end: u16,

    /// Codecs accepted from SDP offers, preference order.
    pub preferred_codecs: Vec<AudioCodec>,

    /// HTTP listener for the browser gateway and metrics.
    pub http_bind: String,

    pub model_api_base: String,
    pub model_api_key: String,
    pub realtime_model: String,
    pub realtime_instructions: String,
    pub realtime_voice: String,

    /// Poll interval for the realtime receive loop.
    pub receive_timeout: Duration,

    /// Answer delay requested by default routes.
    pub ring_timeout_seconds: f64,
    pub speak_first: bool,

    pub sip_trunk_host: String,
    pub sip_trunk_port: u16,
    pub sip_username: String,
    pub sip_password: String,
    pub sip_domain: String,
    pub sip_account_label: String,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl GatewayConfig {
    pub fn from_env() -> Option<Self> {
        let sip_trunk_host = env_var("SIP_TRUNK_HOST")?;
        let sip_username = env_var("SIP_USERNAME")?;
        let sip_password = env_var("SIP_PASSWORD")?;
        let model_api_key = env_var("MODEL_API_KEY")?;

        let sip_domain = env_var("SIP_DOMAIN").unwrap_or_else(|| sip_trunk_host.clone());

        let preferred_codecs = env_var("PREFERRED_CODECS")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|name| AudioCodec::from_name(name.trim()))
                    .collect::<Vec<_>>()
            })
            .filter(|codecs| !codecs.is_empty())
            .unwrap_or_else(|| vec![AudioCodec::Pcmu, AudioCodec::G729]);

        Some(Self {
            sip_bind_host: env_var("SIP_BIND_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            sip_bind_port: env_parse("SIP_BIND_PORT", 5060),
            media_host: env_var("MEDIA_HOST").unwrap_or_default(),
            media_port: env_parse("MEDIA_PORT", 0),
            rtp_port_start: env_parse("RTP_PORT_START", 20_000),
            rtp_port_end: env_parse("RTP_PORT_END", 30_000),
            preferred_codecs,
            http_bind: env_var("HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8000".to_string()),
            model_api_base: env_var("MODEL_API_BASE")
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            model_api_key,
            realtime_model: env_var("REALTIME_MODEL").unwrap_or_else(|| "gpt-realtime".to_string()),
            realtime_instructions: env_var("REALTIME_INSTRUCTIONS")
                .unwrap_or_else(|| "Assistant vocal".to_string()),
            realtime_voice: env_var("REALTIME_VOICE").unwrap_or_else(|| "verse".to_string()),
            receive_timeout: Duration::from_millis(env_parse("RECEIVE_TIMEOUT_MS", 500u64)),
            ring_timeout_seconds: env_parse("RING_TIMEOUT_SECONDS", 0.0f64),
            speak_first: env_parse("SPEAK_FIRST", false),
            sip_trunk_host,
            sip_trunk_port: env_parse("SIP_TRUNK_PORT", 5060),
            sip_username,
            sip_password,
            sip_domain,
            sip_account_label: env_var("SIP_ACCOUNT_LABEL")
                .unwrap_or_else(|| "default".to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sip_trunk_host.is_empty() {
            return Err("SIP trunk host is required".to_string());
        }
        if self.sip_username.is_empty() {
            return Err("SIP username is required".to_string());
        }
        if self.sip_password.is_empty() {
            return Err("SIP password is required".to_string());
        }
        if self.model_api_key.is_empty() {
            return Err("model API key is required".to_string());
        }
        if self.rtp_port_start >= self.rtp_port_end {
            return Err("RTP port range is invalid".to_string());
        }
        if self.preferred_codecs.is_empty() {
            return Err("at least one preferred codec is required".to_string());
        }
        Ok(())
    }

    pub fn sip_accounts(&self) -> Vec<SipAccount> {
        vec![SipAccount {
            id: 1,
            label: self.sip_account_label.clone(),
            username: self.sip_username.clone(),
            password: self.sip_password.clone(),
            domain: self.sip_domain.clone(),
            trunk_host: self.sip_trunk_host.clone(),
            trunk_port: self.sip_trunk_port,
            is_active: true,
        }]
    }

    pub fn registrar_config(&self) -> SipRegistrarConfig {
        SipRegistrarConfig {
            bind_host: self.sip_bind_host.clone(),
            bind_port: self.sip_bind_port,
        }
    }

    pub fn runtime_config(&self, media_host: String) -> RuntimeConfig {
        RuntimeConfig {
            media_host,
            media_port: self.media_port,
            preferred_codecs: self.preferred_codecs.clone(),
            model_api_base: self.model_api_base.clone(),
            model_api_key: self.model_api_key.clone(),
            receive_timeout: self.receive_timeout,
        }
    }

    pub fn voice_defaults(&self) -> VoiceDefaults {
        VoiceDefaults {
            model: self.realtime_model.clone(),
            instructions: self.realtime_instructions.clone(),
            voice: self.realtime_voice.clone(),
            ..VoiceDefaults::default()
        }
    }
}
