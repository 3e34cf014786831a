//! Telnyx-style provider: JSON/REST, event-driven webhook delivery,
//! Ed25519-signed callbacks.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use reqwest::Client;
use serde_json::json;

use super::{PlaceCallRequest, TelephonyCapability};
use crate::error::CoreError;

pub struct TelnyxProvider {
    client: Client,
    api_base_url: String,
    api_key: String,
    connection_id: String,
}

impl TelnyxProvider {
    pub fn new(api_base_url: String, api_key: String, connection_id: String) -> Self {
        Self {
            client: Client::new(),
            api_base_url,
            api_key,
            connection_id,
        }
    }
}

#[async_trait]
impl TelephonyCapability for TelnyxProvider {
    async fn place_call(&self, req: PlaceCallRequest) -> Result<String, CoreError> {
        let body = json!({
            "connection_id": self.connection_id,
            "to": req.to,
            "from": req.from,
            "webhook_url": req.webhook_url,
            "webhook_url_method": "POST",
            "answering_machine_detection": "detect",
            "timeout_secs": 60,
        });

        let response = self
            .client
            .post(format!("{}/calls", self.api_base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::ProviderError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::ProviderError(format!(
                "call placement failed: {status} {body}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderError(e.to_string()))?;

        body.pointer("/data/call_control_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| CoreError::ProviderError("response missing call_control_id".into()))
    }

    async fn start_streaming(
        &self,
        provider_call_id: &str,
        websocket_url: &str,
    ) -> Result<(), CoreError> {
        let body = json!({
            "stream_url": websocket_url,
            "stream_track": "both_tracks",
            "stream_bidirectional_mode": "rtp",
            "stream_bidirectional_codec": "PCMU",
        });

        let response = self
            .client
            .post(format!(
                "{}/calls/{}/actions/streaming_start",
                self.api_base_url, provider_call_id
            ))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::ProviderError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::ProviderError(format!(
                "streaming_start failed: {status} {body}"
            )));
        }

        Ok(())
    }

    async fn hangup(&self, provider_call_id: &str) {
        let result = self
            .client
            .post(format!(
                "{}/calls/{}/actions/hangup",
                self.api_base_url, provider_call_id
            ))
            .bearer_auth(&self.api_key)
            .send()
            .await;

        match result {
            Ok(r) if !r.status().is_success() => {
                tracing::warn!(provider_call_id, status = %r.status(), "hangup returned non-2xx");
            }
            Err(e) => {
                tracing::warn!(provider_call_id, error = %e, "hangup request failed");
            }
            _ => {}
        }
    }

    fn signals_streaming_ready_via_webhook(&self) -> bool {
        true
    }
}

/// Verify an Ed25519 signature over `timestamp || body` using the
/// configured public key (hex-encoded).
pub fn verify_signature(public_key_hex: &str, timestamp: &str, body: &[u8], signature_b64: &str) -> bool {
    let key_bytes = match hex::decode(public_key_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let key_array: [u8; 32] = match key_bytes.try_into() {
        Ok(a) => a,
        Err(_) => return false,
    };
    let verifying_key = match VerifyingKey::from_bytes(&key_array) {
        Ok(k) => k,
        Err(_) => return false,
    };

    let sig_bytes = match base64::Engine::decode(&base64::engine::general_purpose::STANDARD, signature_b64) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig_array: [u8; 64] = match sig_bytes.try_into() {
        Ok(a) => a,
        Err(_) => return false,
    };
    let signature = Signature::from_bytes(&sig_array);

    let mut signed_payload = Vec::with_capacity(timestamp.len() + 1 + body.len());
    signed_payload.extend_from_slice(timestamp.as_bytes());
    signed_payload.push(b'|');
    signed_payload.extend_from_slice(body);

    verifying_key.verify(&signed_payload, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn signature_round_trips() {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying_key = signing_key.verifying_key();
        let public_key_hex = hex::encode(verifying_key.to_bytes());

        let timestamp = "1700000000";
        let body = br#"{"event_type":"call.answered"}"#;

        let mut payload = Vec::new();
        payload.extend_from_slice(timestamp.as_bytes());
        payload.push(b'|');
        payload.extend_from_slice(body);

        let signature = signing_key.sign(&payload);
        let signature_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, signature.to_bytes());

        assert!(verify_signature(&public_key_hex, timestamp, body, &signature_b64));
    }

    #[test]
    fn signature_rejects_tampered_body() {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying_key = signing_key.verifying_key();
        let public_key_hex = hex::encode(verifying_key.to_bytes());

        let timestamp = "1700000000";
        let body = br#"{"event_type":"call.answered"}"#;
        let mut payload = Vec::new();
        payload.extend_from_slice(timestamp.as_bytes());
        payload.push(b'|');
        payload.extend_from_slice(body);
        let signature = signing_key.sign(&payload);
        let signature_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, signature.to_bytes());

        let tampered_body = br#"{"event_type":"call.hangup"}"#;
        assert!(!verify_signature(&public_key_hex, timestamp, tampered_body, &signature_b64));
    }
}
