//! Webhook Intake — `POST /twiml`.
//!
//! Accepts provider events as either JSON (event-driven provider, Ed25519
//! signed) or form-urlencoded (document-driven provider, HMAC signed).
//! The JSON path answers 200 immediately and dispatches in the background;
//! the form path's response body IS the provider's next instruction, so it
//! is necessarily synchronous.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::state::AppState;
use crate::telephony::{telnyx, twilio};

/// Free-tier ngrok hosts rewrite/compress headers in ways that break
/// signature canonicalization. The compatibility carve-out in §4.5 is
/// scoped to exactly these hosts, and only when explicitly opted in.
fn is_ephemeral_tunnel_host(host: &str) -> bool {
    host.ends_with(".ngrok-free.app") || host.ends_with(".ngrok.io")
}

pub async fn twiml_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("application/json") {
        handle_json(state, headers, body).await
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        handle_form(state, headers, body).await
    } else {
        (StatusCode::BAD_REQUEST, "unsupported content type").into_response()
    }
}

#[derive(Debug, Deserialize)]
struct JsonEnvelope {
    event_type: String,
    payload: serde_json::Value,
}

async fn handle_json(state: AppState, headers: HeaderMap, body: Bytes) -> Response {
    let host = host_header(&headers);
    let ephemeral = is_ephemeral_tunnel_host(&host);

    match &state.config.webhook_public_key {
        None => {
            tracing::warn!("webhook signature verification disabled: no public key configured");
        }
        Some(public_key) => {
            let timestamp = headers
                .get("telnyx-timestamp")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let signature = headers
                .get("telnyx-signature-ed25519")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            let valid = telnyx::verify_signature(public_key, timestamp, &body, signature);
            if !valid {
                if ephemeral && state.config.allow_ephemeral_tunnel_fallback {
                    tracing::warn!(
                        host,
                        "webhook signature mismatch on ephemeral tunnel host, processing anyway"
                    );
                } else {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
            }
        }
    }

    // Respond 200 before processing: events never fail the provider's
    // webhook delivery because of something that happens in our handling.
    let envelope: Option<JsonEnvelope> = serde_json::from_slice(&body).ok();
    if let Some(envelope) = envelope {
        tokio::spawn(async move {
            dispatch_json_event(state, envelope).await;
        });
    } else {
        tracing::warn!("failed to parse JSON webhook body");
    }

    StatusCode::OK.into_response()
}

async fn dispatch_json_event(state: AppState, envelope: JsonEnvelope) {
    let core = &state.core;

    match envelope.event_type.as_str() {
        "call.initiated" => {
            tracing::info!("call.initiated");
        }
        "call.answered" => {
            let Some(provider_call_id) = envelope
                .payload
                .get("call_control_id")
                .and_then(|v| v.as_str())
            else {
                return;
            };
            let Some(call) = core.registry.get_by_provider_call_id(provider_call_id) else {
                return;
            };
            let Some(base_url) = core.public_base_url() else {
                return;
            };
            let media_url = format!(
                "wss://{}/media-stream?token={}",
                strip_scheme(&base_url),
                call.ws_token
            );
            if let Err(e) = core.telephony.start_streaming(provider_call_id, &media_url).await {
                tracing::warn!(error = %e, provider_call_id, "start_streaming failed");
            }
        }
        "streaming.started" => {
            let Some(provider_call_id) = envelope
                .payload
                .get("call_control_id")
                .and_then(|v| v.as_str())
            else {
                return;
            };
            if let Some(call) = core.registry.get_by_provider_call_id(provider_call_id) {
                call.streaming_ready
                    .store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }
        "call.hangup" => {
            let Some(provider_call_id) = envelope
                .payload
                .get("call_control_id")
                .and_then(|v| v.as_str())
            else {
                return;
            };
            if let Some(call) = core.registry.get_by_provider_call_id(provider_call_id) {
                call.set_hung_up();
                if let Some(sender) = call.media_socket.write().take() {
                    let _ = sender
                        .send(axum::extract::ws::Message::Close(None))
                        .await;
                }
            }
            core.registry.remove_provider_mapping(provider_call_id);
        }
        "call.machine.detection.ended" => {
            tracing::info!("call.machine.detection.ended");
        }
        "streaming.stopped" => {
            tracing::info!("streaming.stopped");
        }
        other => {
            tracing::debug!(event_type = other, "unhandled webhook event");
        }
    }
}

async fn handle_form(state: AppState, headers: HeaderMap, body: Bytes) -> Response {
    let host = host_header(&headers);
    let ephemeral = is_ephemeral_tunnel_host(&host);

    let params: Vec<(String, String)> = url::form_urlencoded::parse(&body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let full_url = format!("https://{host}/twiml");

    if let Some(shared_secret) = &state.config.webhook_shared_secret {
        let signature = headers
            .get("x-twilio-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let valid = twilio::verify_signature(shared_secret, &full_url, &params, signature);
        if !valid {
            if ephemeral && state.config.allow_ephemeral_tunnel_fallback {
                tracing::warn!(
                    host,
                    "form webhook signature mismatch on ephemeral tunnel host, processing anyway"
                );
            } else {
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    } else {
        tracing::warn!("form webhook signature verification disabled: no shared secret configured");
    }

    let get = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
    let Some(call_sid) = get("CallSid") else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let status = get("CallStatus").unwrap_or_default();

    let core = &state.core;
    let Some(call) = core.registry.get_by_provider_call_id(&call_sid) else {
        return StatusCode::OK.into_response();
    };

    if matches!(status.as_str(), "completed" | "busy" | "no-answer" | "failed") {
        call.set_hung_up();
        core.registry.remove_provider_mapping(&call_sid);
        return StatusCode::OK.into_response();
    }

    let media_url = format!(
        "wss://{}/media-stream?token={}",
        host,
        call.ws_token
    );
    let document = core.telephony.stream_connect_document(&media_url);
    (
        [(axum::http::header::CONTENT_TYPE, "text/xml")],
        document,
    )
        .into_response()
}

fn host_header(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn strip_scheme(url: &str) -> &str {
    url.trim_start_matches("https://").trim_start_matches("http://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_tunnel_hosts_are_recognized() {
        assert!(is_ephemeral_tunnel_host("abcd1234.ngrok-free.app"));
        assert!(is_ephemeral_tunnel_host("abcd1234.ngrok.io"));
        assert!(!is_ephemeral_tunnel_host("calls.example.com"));
    }

    #[test]
    fn strip_scheme_removes_https_prefix() {
        assert_eq!(strip_scheme("https://example.com"), "example.com");
        assert_eq!(strip_scheme("http://example.com"), "example.com");
    }
}
