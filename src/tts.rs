//! TTS Capability.
//!
//! Synthesizes an utterance as 24 kHz mono PCM16. Streaming is preferred for
//! first-audio latency; the core falls back to the non-streaming path when a
//! backend doesn't support it.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum TtsError {
    #[error("synthesis request failed: {0}")]
    RequestFailed(String),
    #[error("synthesis backend returned {status}: {body}")]
    BackendError { status: u16, body: String },
}

/// One chunk of a streamed synthesis, already 24 kHz mono PCM16 bytes.
pub type TtsChunk = Result<Bytes, TtsError>;

#[async_trait]
pub trait TtsCapability: Send + Sync {
    /// Synthesize the full utterance and return it in one buffer.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Bytes, TtsError>;

    /// Synthesize as a stream of chunks, consumed as they arrive. Returns
    /// `None` if this backend has no streaming path; callers fall back to
    /// [`TtsCapability::synthesize`].
    async fn synthesize_stream(
        &self,
        text: &str,
        voice: &str,
    ) -> Option<mpsc::Receiver<TtsChunk>>;
}

/// OpenAI-compatible TTS HTTP backend (`POST /v1/audio/speech`). Requests
/// raw 24 kHz mono PCM16 (`response_format: "pcm"`) so the core can
/// resample and µ-law-encode without an intermediate container format.
pub struct HttpTtsCapability {
    client: Client,
    api_base_url: String,
    api_key: String,
    model: String,
}

impl HttpTtsCapability {
    pub fn new(api_base_url: String, api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_base_url,
            api_key,
            model,
        }
    }

    fn request_body(&self, text: &str, voice: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice,
            "response_format": "pcm",
        })
    }
}

#[async_trait]
impl TtsCapability for HttpTtsCapability {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Bytes, TtsError> {
        let response = self
            .client
            .post(format!("{}/audio/speech", self.api_base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text, voice))
            .send()
            .await
            .map_err(|e| TtsError::RequestFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError::BackendError { status, body });
        }

        response
            .bytes()
            .await
            .map_err(|e| TtsError::RequestFailed(e.to_string()))
    }

    async fn synthesize_stream(
        &self,
        text: &str,
        voice: &str,
    ) -> Option<mpsc::Receiver<TtsChunk>> {
        let response = self
            .client
            .post(format!("{}/audio/speech", self.api_base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text, voice))
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(item) = stream.next().await {
                let result = item.map_err(|e| TtsError::RequestFailed(e.to_string()));
                if tx.send(result).await.is_err() {
                    break;
                }
            }
        });
        Some(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_uses_pcm_response_format() {
        let tts = HttpTtsCapability::new(
            "https://api.example.com/v1".into(),
            "key".into(),
            "tts-1".into(),
        );
        let body = tts.request_body("hello", "onyx");
        assert_eq!(body["response_format"], "pcm");
        assert_eq!(body["voice"], "onyx");
        assert_eq!(body["input"], "hello");
    }
}
