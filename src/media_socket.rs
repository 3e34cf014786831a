//! Media Socket Endpoint — `GET /media-stream`.
//!
//! The telephony provider's websocket upgrade target. Demultiplexes
//! control frames (`start`/`stop`) from media frames, filters to the
//! inbound track only, and forwards that audio to the call's STT session.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::call::CallHandle;
use crate::state::AppState;

fn is_ephemeral_tunnel_host(host: &str) -> bool {
    host.ends_with(".ngrok-free.app") || host.ends_with(".ngrok.io")
}

pub async fn media_stream_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let call = match params.get("token") {
        Some(token) => match state.core.registry.get_by_ws_token(token) {
            Some(call) => Some(call),
            None => None,
        },
        None => None,
    };

    let call = match call {
        Some(call) => call,
        None => {
            if state.config.allow_ephemeral_tunnel_fallback && is_ephemeral_tunnel_host(host) {
                match state.core.registry.most_recently_created() {
                    Some(call) => {
                        tracing::warn!(
                            host,
                            "media socket attached via ephemeral-tunnel fallback, not token auth"
                        );
                        call
                    }
                    None => return StatusCode::UNAUTHORIZED.into_response(),
                }
            } else {
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
    };

    ws.on_upgrade(move |socket| handle_media_socket(socket, call))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
enum InboundFrame {
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    #[serde(rename = "media")]
    Media { media: MediaPayload },
    #[serde(rename = "stop")]
    Stop {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    track: String,
    payload: String,
}

async fn handle_media_socket(socket: WebSocket, call: CallHandle) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(64);
    *call.media_socket.write() = Some(tx);

    let egress = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_control_frame(&call, &text).await,
            Ok(Message::Binary(_)) => {
                // Outbound (agent) audio echoed back, or a frame whose
                // track we can't determine — never forwarded to STT.
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    call.set_hung_up();
    *call.media_socket.write() = None;
    egress.abort();
}

async fn handle_control_frame(call: &CallHandle, text: &str) {
    if !text.trim_start().starts_with('{') {
        return;
    }
    let Ok(frame) = serde_json::from_str::<InboundFrame>(text) else {
        return;
    };

    match frame {
        InboundFrame::Start { stream_sid } => {
            if let Some(sid) = stream_sid {
                let mut current = call.stream_sid.write();
                if current.is_none() {
                    *current = Some(sid);
                }
            }
        }
        InboundFrame::Stop {} => {
            call.set_hung_up();
        }
        InboundFrame::Media { media } => {
            if media.track == "inbound" || media.track == "inbound_track" {
                if let Ok(mulaw) =
                    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &media.payload)
                {
                    call.stt_session.send_audio(&mulaw).await;
                }
            }
        }
        InboundFrame::Other => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_frame_with_stream_sid() {
        let raw = r#"{"event":"start","streamSid":"ss-1"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        match frame {
            InboundFrame::Start { stream_sid } => assert_eq!(stream_sid.as_deref(), Some("ss-1")),
            _ => panic!("expected Start"),
        }
    }

    #[test]
    fn parses_media_frame_and_filters_inbound_track() {
        let raw = r#"{"event":"media","media":{"track":"inbound","payload":"AAA="}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        match frame {
            InboundFrame::Media { media } => assert_eq!(media.track, "inbound"),
            _ => panic!("expected Media"),
        }
    }

    #[test]
    fn unknown_event_falls_back_to_other() {
        let raw = r#"{"event":"mark","name":"foo"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, InboundFrame::Other));
    }
}
