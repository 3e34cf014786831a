//! Call Session Core.
//!
//! Owns the per-call state machine, the speak/listen turn protocol, the
//! first-utterance pre-generation pipeline, and cleanup. This is the one
//! component that touches every other capability (telephony, TTS, STT,
//! registry) — everything else in the crate is a leaf this orchestrates.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use serde::Serialize;

use crate::call::{Call, CallHandle, CallRegistry, CallState, Speaker};
use crate::codec;
use crate::config::Config;
use crate::error::CoreError;
use crate::handle::CallId;
use crate::stt::{SttSession, SttSessionConfig};
use crate::telephony::{PlaceCallRequest, TelephonyCapability};
use crate::tts::TtsCapability;

const ATTACH_TIMEOUT: Duration = Duration::from_secs(15);
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const HANGUP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FRAME_BYTES: usize = 160; // 20ms of 8kHz mulaw
const FRAME_PACE: Duration = Duration::from_millis(18);
const SPEAK_TAIL: Duration = Duration::from_millis(200);
const ENDING_DRAIN: Duration = Duration::from_secs(2);
const STT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared capabilities the core dispatches to. One instance per process;
/// cloned cheaply into every handler and background task that needs to
/// reach a call.
#[derive(Clone)]
pub struct CallSessionCore {
    pub registry: CallRegistry,
    pub telephony: Arc<dyn TelephonyCapability>,
    pub tts: Arc<dyn TtsCapability>,
    pub config: Arc<Config>,
    /// Public base URL this process is reachable at (behind the tunnel),
    /// e.g. `https://abcd1234.ngrok-free.app`. Used to build the webhook
    /// and media-stream URLs handed to the provider.
    pub public_base_url: Arc<parking_lot::RwLock<Option<String>>>,
}

impl CallSessionCore {
    pub fn new(
        telephony: Arc<dyn TelephonyCapability>,
        tts: Arc<dyn TtsCapability>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry: CallRegistry::new(),
            telephony,
            tts,
            config,
            public_base_url: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    pub fn set_public_base_url(&self, url: String) {
        *self.public_base_url.write() = Some(url);
    }

    pub fn public_base_url(&self) -> Option<String> {
        self.public_base_url.read().clone()
    }

    fn stt_config(&self) -> SttSessionConfig {
        SttSessionConfig {
            api_key: self.config.stt_api_key.clone(),
            sample_rate_hz: 8000,
            silence_ms: self.config.stt_silence_ms,
        }
    }

    /// `initiate(text) -> { callId, userReply }`. Creates the call, drives
    /// `Creating -> Ready`, runs one speak+listen turn, returns the
    /// transcript.
    pub async fn initiate(
        &self,
        user_number: &str,
        text: &str,
    ) -> Result<(CallId, String), CoreError> {
        let base_url = self
            .public_base_url()
            .ok_or_else(|| CoreError::ProviderError("no public base URL configured".into()))?;

        let stt_session = SttSession::new(self.stt_config());
        tokio::time::timeout(STT_CONNECT_TIMEOUT, stt_session.connect())
            .await
            .map_err(|_| CoreError::SttConnectFailed("timed out".into()))?
            .map_err(|e| CoreError::SttConnectFailed(e.to_string()))?;

        let call = Arc::new(Call::new(
            user_number.to_string(),
            self.config.phone_from_number.clone(),
            stt_session,
        ));
        let call_id = call.call_id;
        self.registry.insert(call.clone());

        // First-utterance latency optimization: begin synthesizing the
        // initial message as soon as we enter Placing, in parallel with
        // placing the call and waiting for attach. See `pregenerate`.
        let pregen_tts = self.tts.clone();
        let pregen_voice = self.config.tts_voice.clone();
        let pregen_text = text.to_string();
        let pregen_handle: tokio::task::JoinHandle<Option<Vec<u8>>> = tokio::spawn(async move {
            pregenerate(&*pregen_tts, &pregen_voice, &pregen_text).await
        });

        *call.state.write() = CallState::Placing;
        let webhook_url = format!("{base_url}/twiml");
        let place_result = self
            .telephony
            .place_call(PlaceCallRequest {
                to: call.user_number.clone(),
                from: call.from_number.clone(),
                webhook_url,
            })
            .await;

        let provider_call_id = match place_result {
            Ok(id) => id,
            Err(e) => {
                self.cleanup(&call).await;
                return Err(e);
            }
        };
        self.registry
            .set_provider_call_id(call_id, provider_call_id);

        *call.state.write() = CallState::AwaitingAttach;
        if let Err(e) = self.await_attach(&call).await {
            self.cleanup(&call).await;
            return Err(e);
        }
        *call.state.write() = CallState::Ready;

        let _turn_guard = call.turn_lock.lock().await;

        let pregenerated = pregen_handle.await.ok().flatten();

        *call.state.write() = CallState::Speaking;
        let speak_result = match pregenerated {
            Some(mulaw) => self.emit_mulaw_buffer(&call, &mulaw).await,
            None => self.speak(&call, text).await,
        };
        if let Err(e) = speak_result {
            self.cleanup(&call).await;
            return Err(e);
        }
        if call.is_hung_up() {
            self.cleanup(&call).await;
            return Err(CoreError::UserHungUp);
        }

        *call.state.write() = CallState::Listening;
        let transcript = match self
            .listen(&call, self.config.transcript_timeout_ms)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.cleanup(&call).await;
                return Err(e);
            }
        };

        call.history.lock().await.push((Speaker::Agent, text.to_string()));
        call.history
            .lock()
            .await
            .push((Speaker::User, transcript.clone()));
        *call.state.write() = CallState::Ready;

        Ok((call_id, transcript))
    }

    /// `continue(callId, text) -> userReply`. Exactly one speak followed by
    /// one listen; serialized per-call by `turn_lock`.
    pub async fn continue_call(&self, call_id: CallId, text: &str) -> Result<String, CoreError> {
        let call = self.registry.get(call_id).ok_or(CoreError::NotFound(call_id))?;
        let _turn_guard = call.turn_lock.lock().await;

        if *call.state.read() != CallState::Ready {
            return Err(CoreError::InvalidState(call_id));
        }
        if call.is_hung_up() {
            self.cleanup(&call).await;
            return Err(CoreError::UserHungUp);
        }

        *call.state.write() = CallState::Speaking;
        if let Err(e) = self.speak(&call, text).await {
            self.cleanup(&call).await;
            return Err(e);
        }
        if call.is_hung_up() {
            self.cleanup(&call).await;
            return Err(CoreError::UserHungUp);
        }

        *call.state.write() = CallState::Listening;
        let transcript = match self
            .listen(&call, self.config.transcript_timeout_ms)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.cleanup(&call).await;
                return Err(e);
            }
        };

        call.history.lock().await.push((Speaker::Agent, text.to_string()));
        call.history
            .lock()
            .await
            .push((Speaker::User, transcript.clone()));
        *call.state.write() = CallState::Ready;

        Ok(transcript)
    }

    /// `end(callId, text) -> durationSeconds`. One speak, no listen, then
    /// the full cleanup path. Idempotent: a call already ended has already
    /// been removed from the registry, so a second call returns `NotFound`.
    pub async fn end_call(&self, call_id: CallId, text: &str) -> Result<u64, CoreError> {
        let call = self.registry.get(call_id).ok_or(CoreError::NotFound(call_id))?;
        let _turn_guard = call.turn_lock.lock().await;

        if *call.state.read() == CallState::Ended {
            return Err(CoreError::NotFound(call_id));
        }

        *call.state.write() = CallState::Ending;
        if !call.is_hung_up() {
            // Best-effort: a socket error during the farewell still leads
            // to the same cleanup path, so we ignore the result here.
            let _ = self.speak(&call, text).await;
        }

        tokio::time::sleep(ENDING_DRAIN).await;

        let duration = call.duration_seconds();
        self.cleanup(&call).await;
        *call.state.write() = CallState::Ended;

        Ok(duration)
    }

    /// Wait up to 15s for both the media socket to be attached and the
    /// provider to signal streaming readiness. Polls every 100ms.
    async fn await_attach(&self, call: &CallHandle) -> Result<(), CoreError> {
        let deadline = tokio::time::Instant::now() + ATTACH_TIMEOUT;
        loop {
            let socket_open = call.media_socket.read().is_some();
            let streaming_ready = call.stream_sid.read().is_some() || call.streaming_ready.load(std::sync::atomic::Ordering::SeqCst);
            if socket_open && streaming_ready {
                return Ok(());
            }
            if call.is_hung_up() {
                return Err(CoreError::UserHungUp);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::AttachTimeout);
            }
            tokio::time::sleep(ATTACH_POLL_INTERVAL).await;
        }
    }

    /// Speak a turn's utterance: stream TTS chunk-by-chunk when available,
    /// otherwise synthesize the full utterance up front. Either way the
    /// result is paced out over the media socket as 20ms µ-law frames.
    async fn speak(&self, call: &CallHandle, text: &str) -> Result<(), CoreError> {
        if let Some(mut chunks) = self.tts.synthesize_stream(text, &self.config.tts_voice).await {
            let mut resampler = StreamResampler::default();
            let mut mulaw_pending: Vec<u8> = Vec::new();

            while let Some(chunk) = chunks.recv().await {
                let pcm24k = chunk.map_err(|e| CoreError::ProviderError(e.to_string()))?;
                let pcm8k = resampler.push(&pcm24k);
                mulaw_pending.extend(codec::pcm16le_to_mulaw(&pcm8k));
                if self.emit_whole_frames(call, &mut mulaw_pending).await? {
                    return Ok(()); // hung up mid-stream
                }
            }

            if !mulaw_pending.is_empty() {
                self.emit_frame(call, &mulaw_pending).await?;
            }
        } else {
            let pcm24k = self
                .tts
                .synthesize(text, &self.config.tts_voice)
                .await
                .map_err(|e| CoreError::ProviderError(e.to_string()))?;
            let pcm8k = codec::decimate_24k_to_8k(&pcm24k);
            let mulaw = codec::pcm16le_to_mulaw(&pcm8k);
            self.emit_mulaw_buffer(call, &mulaw).await?;
            return Ok(());
        }

        tokio::time::sleep(SPEAK_TAIL).await;
        Ok(())
    }

    /// Flush a fully pre-generated (pre-resampled, pre-encoded) µ-law
    /// buffer — the first-utterance pre-generation path, and the
    /// non-streaming-TTS fallback.
    async fn emit_mulaw_buffer(&self, call: &CallHandle, mulaw: &[u8]) -> Result<(), CoreError> {
        for frame in mulaw.chunks(FRAME_BYTES) {
            if self.send_frame(call, frame).await.is_err() {
                call.set_hung_up();
                return Ok(());
            }
            tokio::time::sleep(FRAME_PACE).await;
        }
        tokio::time::sleep(SPEAK_TAIL).await;
        Ok(())
    }

    /// Pull whole 160-byte frames out of `pending` (in place) and emit
    /// them paced. Returns `Ok(true)` if the socket was found closed
    /// (caller should stop feeding more audio; the turn surfaces the
    /// hangup at the next `listen`).
    async fn emit_whole_frames(
        &self,
        call: &CallHandle,
        pending: &mut Vec<u8>,
    ) -> Result<bool, CoreError> {
        while pending.len() >= FRAME_BYTES {
            let frame: Vec<u8> = pending.drain(..FRAME_BYTES).collect();
            if self.send_frame(call, &frame).await.is_err() {
                call.set_hung_up();
                return Ok(true);
            }
            tokio::time::sleep(FRAME_PACE).await;
        }
        Ok(false)
    }

    async fn emit_frame(&self, call: &CallHandle, mulaw: &[u8]) -> Result<(), CoreError> {
        if self.send_frame(call, mulaw).await.is_err() {
            call.set_hung_up();
        }
        Ok(())
    }

    async fn send_frame(&self, call: &CallHandle, mulaw: &[u8]) -> Result<(), ()> {
        let sender = call.media_socket.read().clone();
        let Some(sender) = sender else {
            return Err(());
        };
        let stream_sid = call.stream_sid.read().clone();
        let payload = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, mulaw);
        let frame = OutboundMediaFrame {
            event: "media",
            media: OutboundMediaPayload { payload: &payload },
            stream_sid: stream_sid.as_deref(),
        };
        let text = serde_json::to_string(&frame).map_err(|_| ())?;
        sender.send(Message::Text(text.into())).await.map_err(|_| ())
    }

    /// Wait for the STT session's next committed transcript, racing
    /// against the call's hangup flag.
    async fn listen(&self, call: &CallHandle, timeout_ms: u64) -> Result<String, CoreError> {
        if call.is_hung_up() {
            return Err(CoreError::UserHungUp);
        }
        tokio::select! {
            result = call.stt_session.wait_for_transcript(timeout_ms) => result,
            _ = wait_for_hangup(call) => Err(CoreError::UserHungUp),
        }
    }

    /// Cleanup path: closes STT, closes the media socket, best-effort
    /// hangs up with the provider, and tears down every index entry.
    /// Idempotent — safe to call on a call that's already partially torn
    /// down.
    async fn cleanup(&self, call: &CallHandle) {
        call.stt_session.close().await;
        if let Some(sender) = call.media_socket.write().take() {
            let _ = sender.send(Message::Close(None)).await;
        }
        if let Some(provider_call_id) = call.provider_call_id.read().clone() {
            self.telephony.hangup(&provider_call_id).await;
        }
        self.registry.remove(call.call_id);
    }

    /// Graceful shutdown: end every active call with a canned farewell,
    /// then the caller closes the tunnel and HTTP server.
    pub async fn shutdown_all(&self, farewell: &str) {
        for call in self.registry.all_active() {
            let _ = self.end_call(call.call_id, farewell).await;
        }
    }
}

async fn wait_for_hangup(call: &CallHandle) {
    loop {
        if call.is_hung_up() {
            return;
        }
        tokio::select! {
            _ = call.hangup_notify.notified() => {
                if call.is_hung_up() {
                    return;
                }
            }
            _ = tokio::time::sleep(HANGUP_POLL_INTERVAL) => {}
        }
    }
}

/// Synthesize, resample, and µ-law-encode an utterance ahead of time, for
/// the first-utterance latency optimization. Returns `None` on any
/// synthesis failure — the caller falls back to synthesizing inline once
/// attach completes.
async fn pregenerate(tts: &dyn TtsCapability, voice: &str, text: &str) -> Option<Vec<u8>> {
    if let Some(mut chunks) = tts.synthesize_stream(text, voice).await {
        let mut resampler = StreamResampler::default();
        let mut mulaw = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            let pcm24k = chunk.ok()?;
            let pcm8k = resampler.push(&pcm24k);
            mulaw.extend(codec::pcm16le_to_mulaw(&pcm8k));
        }
        Some(mulaw)
    } else {
        let pcm24k = tts.synthesize(text, voice).await.ok()?;
        let pcm8k = codec::decimate_24k_to_8k(&pcm24k);
        Some(codec::pcm16le_to_mulaw(&pcm8k))
    }
}

/// Carries the sub-6-byte remainder of 24kHz PCM16 across chunk
/// boundaries, so a streaming TTS backend that doesn't align chunks to
/// sample boundaries still resamples correctly.
#[derive(Default)]
struct StreamResampler {
    carry: Vec<u8>,
}

impl StreamResampler {
    fn push(&mut self, pcm24k: &[u8]) -> Vec<u8> {
        self.carry.extend_from_slice(pcm24k);
        let usable_len = (self.carry.len() / 6) * 6;
        let usable: Vec<u8> = self.carry.drain(..usable_len).collect();
        codec::decimate_24k_to_8k(&usable)
    }
}

#[derive(Serialize)]
struct OutboundMediaFrame<'a> {
    event: &'static str,
    media: OutboundMediaPayload<'a>,
    #[serde(rename = "streamSid", skip_serializing_if = "Option::is_none")]
    stream_sid: Option<&'a str>,
}

#[derive(Serialize)]
struct OutboundMediaPayload<'a> {
    payload: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_resampler_carries_remainder_across_pushes() {
        // 24kHz PCM16: 4 samples (8 bytes) then 2 more samples (4 bytes) =
        // 6 total samples -> 2 kept (indices 0 and 3), 4 bytes out.
        let mut resampler = StreamResampler::default();
        let first = resampler.push(&[1, 0, 2, 0, 3, 0, 4, 0]);
        let second = resampler.push(&[5, 0, 6, 0]);
        assert_eq!(first.len() + second.len(), 4);
    }

    #[test]
    fn outbound_media_frame_serializes_stream_sid_as_camel_case() {
        let frame = OutboundMediaFrame {
            event: "media",
            media: OutboundMediaPayload { payload: "abc" },
            stream_sid: Some("ss-1"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"streamSid\":\"ss-1\""));
        assert!(json.contains("\"payload\":\"abc\""));
    }

    #[test]
    fn outbound_media_frame_omits_stream_sid_when_unknown() {
        let frame = OutboundMediaFrame {
            event: "media",
            media: OutboundMediaPayload { payload: "abc" },
            stream_sid: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("streamSid"));
    }
}
