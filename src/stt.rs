//! Streaming STT Session.
//!
//! A long-lived bidirectional connection to the speech-to-text provider.
//! Accepts µ-law audio frames and emits partial/final transcripts; VAD lives
//! server-side (configurable silence window) — the core never decides when
//! the user has stopped talking, it only waits for the provider's commit.
//!
//! Modeled on Deepgram's streaming listen API: `wss://.../v1/listen` with
//! `encoding=mulaw&sample_rate=8000`, endpointing for server-side VAD, and a
//! `Authorization: Token <key>` header.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex as SyncMutex;
use serde::Deserialize;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::CoreError;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramResult {
    channel: DeepgramChannel,
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DeepgramMessage {
    Results(DeepgramResult),
    #[serde(other)]
    Other,
}

pub struct SttSessionConfig {
    pub api_key: String,
    pub sample_rate_hz: u32,
    pub silence_ms: u64,
}

/// A single-shot waiter for the next VAD-committed final transcript.
type Waiter = oneshot::Sender<String>;

struct Shared {
    config: SttSessionConfig,
    write: Mutex<Option<WsSink>>,
    connected: AtomicBool,
    intentionally_closed: AtomicBool,
    waiter: SyncMutex<Option<Waiter>>,
    on_partial: SyncMutex<Option<Box<dyn Fn(String) + Send + Sync>>>,
}

/// Handle to a live streaming STT session. Cloning shares the underlying
/// connection.
#[derive(Clone)]
pub struct SttSession {
    shared: Arc<Shared>,
}

impl SttSession {
    pub fn new(config: SttSessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                write: Mutex::new(None),
                connected: AtomicBool::new(false),
                intentionally_closed: AtomicBool::new(false),
                waiter: SyncMutex::new(None),
                on_partial: SyncMutex::new(None),
            }),
        }
    }

    /// Register a callback invoked for each interim (non-final) transcript.
    pub fn on_partial(&self, cb: impl Fn(String) + Send + Sync + 'static) {
        *self.shared.on_partial.lock() = Some(Box::new(cb));
    }

    /// Open the bidirectional session. Spawns the receive loop, which owns
    /// reconnect-with-backoff for the lifetime of the session.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let stream = dial(&self.shared.config)
            .await
            .map_err(|e| CoreError::SttConnectFailed(e.to_string()))?;

        let (write, read) = stream.split();
        *self.shared.write.lock().await = Some(write);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_receive_loop(shared, read).await;
        });

        Ok(())
    }

    /// Push µ-law audio. Silently dropped if not connected.
    pub async fn send_audio(&self, mulaw_bytes: &[u8]) {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return;
        }
        let mut guard = self.shared.write.lock().await;
        if let Some(sink) = guard.as_mut() {
            if sink
                .send(Message::Binary(mulaw_bytes.to_vec().into()))
                .await
                .is_err()
            {
                self.shared.connected.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Resolve with the next VAD-committed final transcript, or `Timeout`
    /// after `timeout_ms`. The waiter is single-shot: it is cleared whether
    /// it resolves or times out.
    pub async fn wait_for_transcript(&self, timeout_ms: u64) -> Result<String, CoreError> {
        let (tx, rx) = oneshot::channel();
        *self.shared.waiter.lock() = Some(tx);

        match timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(_)) => Err(CoreError::ListenTimeout),
            Err(_) => {
                self.shared.waiter.lock().take();
                Err(CoreError::ListenTimeout)
            }
        }
    }

    /// Idempotent close. Marks the session as intentionally closed so the
    /// receive loop does not attempt to reconnect.
    pub async fn close(&self) {
        self.shared.intentionally_closed.store(true, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.shared.write.lock().await.take() {
            let _ = sink.close().await;
        }
    }
}

async fn dial(config: &SttSessionConfig) -> Result<WsStream, Box<dyn std::error::Error>> {
    let url = format!(
        "wss://api.deepgram.com/v1/listen?encoding=mulaw&sample_rate={}&channels=1&punctuate=true&interim_results=true&endpointing={}&vad_events=true",
        config.sample_rate_hz, config.silence_ms
    );

    let request = Request::builder()
        .uri(&url)
        .header("Host", "api.deepgram.com")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Authorization", format!("Token {}", config.api_key))
        .body(())?;

    let (stream, _response) = connect_async(request).await?;
    Ok(stream)
}

async fn run_receive_loop(
    shared: Arc<Shared>,
    mut read: futures_util::stream::SplitStream<WsStream>,
) {
    let mut attempt: u32 = 0;

    loop {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    attempt = 0;
                    handle_message(&shared, &text);
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        shared.connected.store(false, Ordering::SeqCst);

        if shared.intentionally_closed.load(Ordering::SeqCst) {
            return;
        }

        if attempt >= RECONNECT_MAX_ATTEMPTS {
            tracing::warn!("STT session exhausted reconnect attempts");
            return;
        }

        let delay = RECONNECT_BASE_DELAY * 2u32.pow(attempt);
        attempt += 1;
        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "STT session dropped, reconnecting");
        tokio::time::sleep(delay).await;

        match dial(&shared.config).await {
            Ok(stream) => {
                let (write, new_read) = stream.split();
                *shared.write.lock().await = Some(write);
                shared.connected.store(true, Ordering::SeqCst);
                read = new_read;
            }
            Err(e) => {
                tracing::warn!(error = %e, "STT reconnect attempt failed");
            }
        }
    }
}

fn handle_message(shared: &Arc<Shared>, text: &str) {
    let parsed: DeepgramMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => return,
    };

    let DeepgramMessage::Results(result) = parsed else {
        return;
    };

    let transcript = result
        .channel
        .alternatives
        .first()
        .map(|a| a.transcript.clone())
        .unwrap_or_default();

    if transcript.is_empty() {
        return;
    }

    if result.is_final && result.speech_final {
        if let Some(waiter) = shared.waiter.lock().take() {
            let _ = waiter.send(transcript);
        }
    } else if let Some(cb) = shared.on_partial.lock().as_ref() {
        cb(transcript);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_results_message() {
        let raw = r#"{"type":"Results","is_final":true,"speech_final":true,"channel":{"alternatives":[{"transcript":"move on to task b"}]}}"#;
        let parsed: DeepgramMessage = serde_json::from_str(raw).unwrap();
        match parsed {
            DeepgramMessage::Results(r) => {
                assert!(r.is_final && r.speech_final);
                assert_eq!(r.channel.alternatives[0].transcript, "move on to task b");
            }
            _ => panic!("expected Results variant"),
        }
    }

    #[test]
    fn ignores_unknown_message_types() {
        let raw = r#"{"type":"Metadata","request_id":"abc"}"#;
        let parsed: DeepgramMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed, DeepgramMessage::Other));
    }

    #[tokio::test]
    async fn wait_for_transcript_times_out_when_nothing_arrives() {
        let session = SttSession::new(SttSessionConfig {
            api_key: "test".into(),
            sample_rate_hz: 8000,
            silence_ms: 800,
        });
        let result = session.wait_for_transcript(10).await;
        assert!(matches!(result, Err(CoreError::ListenTimeout)));
    }

    #[tokio::test]
    async fn handle_message_resolves_pending_waiter_on_final() {
        let shared = Arc::new(Shared {
            config: SttSessionConfig {
                api_key: "test".into(),
                sample_rate_hz: 8000,
                silence_ms: 800,
            },
            write: Mutex::new(None),
            connected: AtomicBool::new(true),
            intentionally_closed: AtomicBool::new(false),
            waiter: SyncMutex::new(None),
            on_partial: SyncMutex::new(None),
        });

        let (tx, rx) = oneshot::channel();
        *shared.waiter.lock() = Some(tx);

        let raw = r#"{"type":"Results","is_final":true,"speech_final":true,"channel":{"alternatives":[{"transcript":"yes please"}]}}"#;
        handle_message(&shared, raw);

        assert_eq!(rx.await.unwrap(), "yes please");
    }
}
