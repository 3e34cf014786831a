//! Twilio-style provider: form-urlencoded webhooks, TwiML response
//! documents, HMAC-signed callbacks.

use async_trait::async_trait;
use reqwest::Client;

use super::{PlaceCallRequest, TelephonyCapability};
use crate::error::CoreError;

pub struct TwilioProvider {
    client: Client,
    account_sid: String,
    auth_token: String,
}

impl TwilioProvider {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        Self {
            client: Client::new(),
            account_sid,
            auth_token,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }
}

#[async_trait]
impl TelephonyCapability for TwilioProvider {
    async fn place_call(&self, req: PlaceCallRequest) -> Result<String, CoreError> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls.json",
            self.account_sid
        );

        let params = [
            ("To", req.to.as_str()),
            ("From", req.from.as_str()),
            ("Url", req.webhook_url.as_str()),
            ("Method", "POST"),
            ("MachineDetection", "Enable"),
            ("Timeout", "60"),
        ];

        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| CoreError::ProviderError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::ProviderError(format!(
                "Twilio call creation failed: {status} {body}"
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CoreError::ProviderError(e.to_string()))?;

        body.get("sid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| CoreError::ProviderError("Twilio response missing sid".into()))
    }

    async fn start_streaming(
        &self,
        _provider_call_id: &str,
        _websocket_url: &str,
    ) -> Result<(), CoreError> {
        // No-op: Twilio connects media when it fetches the TwiML document
        // returned from the webhook response.
        Ok(())
    }

    async fn hangup(&self, provider_call_id: &str) {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Calls/{}.json",
            self.account_sid, provider_call_id
        );
        let result = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await;

        if let Err(e) = result {
            tracing::warn!(provider_call_id, error = %e, "Twilio hangup request failed");
        }
    }

    fn stream_connect_document(&self, websocket_url: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><Response><Connect><Stream url="{websocket_url}" /></Connect></Response>"#
        )
    }
}

/// HMAC-SHA1 signature verification over the canonical URL plus sorted
/// form parameters, Twilio's `X-Twilio-Signature` scheme.
pub fn verify_signature(
    auth_token: &str,
    full_url: &str,
    params: &[(String, String)],
    signature_header: &str,
) -> bool {
    use hmac::{Hmac, Mac};
    use sha1::Sha1;

    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut data = String::from(full_url);
    for (k, v) in &sorted {
        data.push_str(k);
        data.push_str(v);
    }

    let mut mac = match Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(data.as_bytes());
    let expected = mac.finalize().into_bytes();
    let expected_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, expected);

    constant_time_eq(expected_b64.as_bytes(), signature_header.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // Twilio's documented example: auth token "12345", URL
        // "https://mycompany.com/myapp.php?foo=1&bar=2", params Digits=1234.
        let auth_token = "12345";
        let url = "https://mycompany.com/myapp.php?foo=1&bar=2";
        let params = vec![("Digits".to_string(), "1234".to_string())];

        let mut data = String::from(url);
        data.push_str("Digits");
        data.push_str("1234");

        use hmac::{Hmac, Mac};
        use sha1::Sha1;
        let mut mac = Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()).unwrap();
        mac.update(data.as_bytes());
        let expected = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            mac.finalize().into_bytes(),
        );

        assert!(verify_signature(auth_token, url, &params, &expected));
    }

    #[test]
    fn signature_rejects_tampered_params() {
        let auth_token = "12345";
        let url = "https://mycompany.com/myapp.php?foo=1&bar=2";
        let params = vec![("Digits".to_string(), "9999".to_string())];
        assert!(!verify_signature(auth_token, url, &params, "bogus=="));
    }

    #[test]
    fn connect_document_embeds_websocket_url() {
        let provider = TwilioProvider::new("AC1".into(), "tok".into());
        let doc = provider.stream_connect_document("wss://example.com/media-stream?token=abc");
        assert!(doc.contains("wss://example.com/media-stream?token=abc"));
        assert!(doc.starts_with("<?xml"));
    }
}
