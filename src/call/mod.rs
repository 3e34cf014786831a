//! Call data model and the registry of process-global indices.
//!
//! Grounded on the index-per-lookup-key pattern used throughout the pack
//! (three parallel maps, each guarded independently) rather than a single
//! actor, since the three keys are looked up from three unrelated call
//! sites (tool adapter, webhook intake, media socket upgrade) and none of
//! them needs to see the others' writes atomically.

pub mod core;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::Message;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::handle::{CallId, WsToken};
use crate::stt::SttSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Creating,
    Placing,
    AwaitingAttach,
    Ready,
    Speaking,
    Listening,
    Ending,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Agent,
    User,
}

/// Per-call state. Fields touched from more than one call site (webhook
/// intake, media socket handler, the turn loop) are independently
/// synchronized rather than guarded by one lock, since they're written from
/// unrelated event sources and a single call-wide lock would serialize
/// unrelated concerns.
pub struct Call {
    pub call_id: CallId,
    pub ws_token: WsToken,
    pub user_number: String,
    pub from_number: String,
    pub provider_call_id: RwLock<Option<String>>,
    pub media_socket: RwLock<Option<mpsc::Sender<Message>>>,
    pub stream_sid: RwLock<Option<String>>,
    pub streaming_ready: AtomicBool,
    pub stt_session: SttSession,
    pub start_time: Instant,
    pub hung_up: AtomicBool,
    /// Woken whenever `hung_up` transitions to true, so a pending `listen`
    /// doesn't have to poll.
    pub hangup_notify: Notify,
    pub history: Mutex<Vec<(Speaker, String)>>,
    pub state: RwLock<CallState>,
    /// Serializes turns: a continue/end operation holds this for its
    /// entire speak+listen so no two turns interleave on one call.
    pub turn_lock: Mutex<()>,
}

impl Call {
    pub fn new(user_number: String, from_number: String, stt_session: SttSession) -> Self {
        Self {
            call_id: CallId::new(),
            ws_token: WsToken::new(),
            user_number,
            from_number,
            provider_call_id: RwLock::new(None),
            media_socket: RwLock::new(None),
            stream_sid: RwLock::new(None),
            streaming_ready: AtomicBool::new(false),
            stt_session,
            start_time: Instant::now(),
            hung_up: AtomicBool::new(false),
            hangup_notify: Notify::new(),
            history: Mutex::new(Vec::new()),
            state: RwLock::new(CallState::Creating),
            turn_lock: Mutex::new(()),
        }
    }

    pub fn set_hung_up(&self) {
        // Monotonic: once true, stays true. Notify unconditionally is
        // harmless (idempotent wakeups), so no need to check first.
        self.hung_up.store(true, Ordering::SeqCst);
        self.hangup_notify.notify_waiters();
    }

    pub fn is_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::SeqCst)
    }

    pub fn duration_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

pub type CallHandle = Arc<Call>;

/// The three process-global indices, independently lock-protected.
#[derive(Clone)]
pub struct CallRegistry {
    by_call_id: Arc<RwLock<HashMap<CallId, CallHandle>>>,
    by_provider_call_id: Arc<RwLock<HashMap<String, CallId>>>,
    by_ws_token: Arc<RwLock<HashMap<String, CallId>>>,
    /// Most recently created call, for the ephemeral-tunnel fallback only.
    last_created: Arc<RwLock<Option<CallId>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            by_call_id: Arc::new(RwLock::new(HashMap::new())),
            by_provider_call_id: Arc::new(RwLock::new(HashMap::new())),
            by_ws_token: Arc::new(RwLock::new(HashMap::new())),
            last_created: Arc::new(RwLock::new(None)),
        }
    }

    /// Insert a freshly created call into the primary index before the
    /// outbound REST call is issued.
    pub fn insert(&self, call: CallHandle) {
        let call_id = call.call_id;
        self.by_ws_token
            .write()
            .insert(call.ws_token.to_string(), call_id);
        self.by_call_id.write().insert(call_id, call);
        *self.last_created.write() = Some(call_id);
    }

    pub fn get(&self, call_id: CallId) -> Option<CallHandle> {
        self.by_call_id.read().get(&call_id).cloned()
    }

    /// Register the provider's identifier, returned by `placeCall`.
    pub fn set_provider_call_id(&self, call_id: CallId, provider_call_id: String) {
        self.by_provider_call_id
            .write()
            .insert(provider_call_id.clone(), call_id);
        if let Some(call) = self.get(call_id) {
            *call.provider_call_id.write() = Some(provider_call_id);
        }
    }

    pub fn get_by_provider_call_id(&self, provider_call_id: &str) -> Option<CallHandle> {
        let call_id = *self.by_provider_call_id.read().get(provider_call_id)?;
        self.get(call_id)
    }

    /// Look up a call by its websocket upgrade token. Performs the lookup
    /// then re-verifies the candidate's token with a constant-time
    /// comparison, so a hashmap timing side-channel can at most reveal
    /// whether *some* valid token was guessed, never which one or how
    /// close the guess was — and 128-bit random tokens make guessing
    /// infeasible regardless.
    pub fn get_by_ws_token(&self, token_hex: &str) -> Option<CallHandle> {
        let call_id = *self.by_ws_token.read().get(token_hex)?;
        let call = self.get(call_id)?;
        if call.ws_token.matches_hex(token_hex) {
            Some(call)
        } else {
            None
        }
    }

    /// The ephemeral-tunnel compatibility fallback: attach to the most
    /// recently created active call when no token was presented or it
    /// didn't resolve. Unsafe as a default; callers gate this behind
    /// `Config::allow_ephemeral_tunnel_fallback`.
    pub fn most_recently_created(&self) -> Option<CallHandle> {
        let call_id = (*self.last_created.read())?;
        self.get(call_id)
    }

    /// Tear down every index entry for a call. Idempotent.
    pub fn remove(&self, call_id: CallId) {
        if let Some(call) = self.by_call_id.write().remove(&call_id) {
            self.by_ws_token.write().remove(&call.ws_token.to_string());
            if let Some(provider_call_id) = call.provider_call_id.read().clone() {
                self.by_provider_call_id.write().remove(&provider_call_id);
            }
        }
        let mut last = self.last_created.write();
        if *last == Some(call_id) {
            *last = None;
        }
    }

    /// Tear down just the provider-call-id mapping (used on terminal
    /// webhook events, before the call itself is removed).
    pub fn remove_provider_mapping(&self, provider_call_id: &str) {
        self.by_provider_call_id.write().remove(provider_call_id);
    }

    pub fn all_active(&self) -> Vec<CallHandle> {
        self.by_call_id.read().values().cloned().collect()
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::SttSessionConfig;

    fn test_call() -> CallHandle {
        Arc::new(Call::new(
            "+15550000000".into(),
            "+15551111111".into(),
            SttSession::new(SttSessionConfig {
                api_key: "test".into(),
                sample_rate_hz: 8000,
                silence_ms: 800,
            }),
        ))
    }

    #[test]
    fn insert_and_lookup_by_call_id() {
        let registry = CallRegistry::new();
        let call = test_call();
        let id = call.call_id;
        registry.insert(call);
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn provider_call_id_maps_to_one_call_and_clears_on_remove() {
        let registry = CallRegistry::new();
        let call = test_call();
        let id = call.call_id;
        registry.insert(call);
        registry.set_provider_call_id(id, "pc-1".into());

        assert_eq!(registry.get_by_provider_call_id("pc-1").unwrap().call_id, id);

        registry.remove(id);
        assert!(registry.get_by_provider_call_id("pc-1").is_none());
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn ws_token_lookup_requires_exact_token() {
        let registry = CallRegistry::new();
        let call = test_call();
        let token = call.ws_token;
        registry.insert(call);

        assert!(registry.get_by_ws_token(&token.to_string()).is_some());
        assert!(registry.get_by_ws_token(&WsToken::new().to_string()).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = CallRegistry::new();
        let call = test_call();
        let id = call.call_id;
        registry.insert(call);
        registry.remove(id);
        registry.remove(id); // must not panic
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn most_recently_created_tracks_latest_insert() {
        let registry = CallRegistry::new();
        let first = test_call();
        let second = test_call();
        let second_id = second.call_id;
        registry.insert(first);
        registry.insert(second);
        assert_eq!(registry.most_recently_created().unwrap().call_id, second_id);
    }
}
