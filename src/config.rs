//! Environment configuration.
//!
//! Loaded once at startup via `dotenvy` + `std::env`. Missing required values
//! are a fatal `ConfigInvalid` error; everything else falls back to the
//! defaults named in the external interface contract.

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct Config {
    /// Local HTTP port the server binds to. Default 3333.
    pub local_port: u16,
    /// Outbound caller id, E.164.
    pub phone_from_number: String,
    /// Default callee, E.164 (may be overridden per-call by the tool adapter).
    pub user_number: String,
    /// Telephony provider credentials.
    pub telephony: TelephonyConfig,
    /// TTS voice name. Default "onyx".
    pub tts_voice: String,
    pub tts_api_key: String,
    /// Base URL of the OpenAI-compatible TTS HTTP backend.
    pub tts_api_base_url: String,
    /// TTS model name.
    pub tts_model: String,
    /// STT provider API key.
    pub stt_api_key: String,
    /// Base URL of the ngrok agent's local admin API.
    pub ngrok_agent_api_base: String,
    /// Default listen timeout in milliseconds. Default 180_000.
    pub transcript_timeout_ms: u64,
    /// VAD silence window in milliseconds. Default 800.
    pub stt_silence_ms: u64,
    /// Ed25519 public key (hex) for the JSON provider's webhook signatures.
    /// Absence downgrades verification to a logged warning.
    pub webhook_public_key: Option<String>,
    /// Shared secret for the form-urlencoded provider's HMAC signatures.
    pub webhook_shared_secret: Option<String>,
    /// Allow the ephemeral-tunnel compatibility carve-outs (unsafe token
    /// fallback, signature-mismatch tolerance). Off by default.
    pub allow_ephemeral_tunnel_fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelephonyProviderKind {
    /// JSON/REST, event-driven webhook delivery, Ed25519-signed callbacks.
    Telnyx,
    /// Form-urlencoded webhooks, TwiML response documents, HMAC-signed
    /// callbacks.
    Twilio,
}

#[derive(Debug, Clone)]
pub struct TelephonyConfig {
    pub provider: TelephonyProviderKind,
    /// Telnyx only.
    pub connection_id: String,
    /// Telnyx bearer token, or Twilio auth token.
    pub api_key: String,
    /// Telnyx only.
    pub api_base_url: String,
    /// Twilio only.
    pub account_sid: String,
}

impl Config {
    /// Load configuration from the process environment, reading a `.env`
    /// file first if present.
    pub fn load() -> Result<Self, CoreError> {
        dotenvy::dotenv().ok();

        let local_port = env_or("LOCAL_PORT", "3333")
            .parse::<u16>()
            .map_err(|e| CoreError::ConfigInvalid(format!("LOCAL_PORT: {e}")))?;

        let transcript_timeout_ms = env_or("TRANSCRIPT_TIMEOUT_MS", "180000")
            .parse::<u64>()
            .map_err(|e| CoreError::ConfigInvalid(format!("TRANSCRIPT_TIMEOUT_MS: {e}")))?;

        let stt_silence_ms = env_or("STT_SILENCE_MS", "800")
            .parse::<u64>()
            .map_err(|e| CoreError::ConfigInvalid(format!("STT_SILENCE_MS: {e}")))?;

        let provider = match env_or("TELEPHONY_PROVIDER", "telnyx").as_str() {
            "twilio" => TelephonyProviderKind::Twilio,
            "telnyx" => TelephonyProviderKind::Telnyx,
            other => {
                return Err(CoreError::ConfigInvalid(format!(
                    "unknown TELEPHONY_PROVIDER {other}, expected telnyx or twilio"
                )))
            }
        };

        let telephony = match provider {
            TelephonyProviderKind::Telnyx => TelephonyConfig {
                provider,
                connection_id: require_env("TELEPHONY_CONNECTION_ID")?,
                api_key: require_env("TELEPHONY_API_KEY")?,
                api_base_url: env_or("TELEPHONY_API_BASE_URL", "https://api.telnyx.com/v2"),
                account_sid: String::new(),
            },
            TelephonyProviderKind::Twilio => TelephonyConfig {
                provider,
                connection_id: String::new(),
                api_key: require_env("TWILIO_AUTH_TOKEN")?,
                api_base_url: String::new(),
                account_sid: require_env("TWILIO_ACCOUNT_SID")?,
            },
        };

        Ok(Self {
            local_port,
            phone_from_number: require_env("PHONE_FROM_NUMBER")?,
            user_number: require_env("USER_NUMBER")?,
            telephony,
            tts_voice: env_or("TTS_VOICE", "onyx"),
            tts_api_key: require_env("TTS_API_KEY")?,
            tts_api_base_url: env_or("TTS_API_BASE_URL", "https://api.openai.com/v1"),
            tts_model: env_or("TTS_MODEL", "tts-1"),
            stt_api_key: require_env("STT_API_KEY")?,
            ngrok_agent_api_base: env_or("NGROK_AGENT_API_BASE", "http://127.0.0.1:4040"),
            transcript_timeout_ms,
            stt_silence_ms,
            webhook_public_key: std::env::var("WEBHOOK_PUBLIC_KEY").ok(),
            webhook_shared_secret: std::env::var("WEBHOOK_SHARED_SECRET").ok(),
            allow_ephemeral_tunnel_fallback: env_or("ALLOW_EPHEMERAL_TUNNEL_FALLBACK", "false")
                == "true",
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn require_env(key: &str) -> Result<String, CoreError> {
    std::env::var(key).map_err(|_| CoreError::ConfigInvalid(format!("missing required env var {key}")))
}
