//! Telephony Capability — provider abstraction over outbound-call REST
//! operations.
//!
//! Two concrete providers exist: [`telnyx`] (JSON/REST, event-driven webhook
//! delivery) and [`twilio`] (form-urlencoded, document-driven via TwiML). The
//! call session core never branches on provider identity; it only ever talks
//! to `dyn TelephonyCapability` plus the event dispatcher in `webhook`.

pub mod telnyx;
pub mod twilio;

use async_trait::async_trait;

use crate::error::CoreError;

/// Outbound call request. `answering_machine_detection` is always requested
/// and ring timeout is fixed at 60 seconds per the external interface.
#[derive(Debug, Clone)]
pub struct PlaceCallRequest {
    pub to: String,
    pub from: String,
    pub webhook_url: String,
}

#[async_trait]
pub trait TelephonyCapability: Send + Sync {
    /// Place an outbound call. Returns the provider's call identifier.
    async fn place_call(&self, req: PlaceCallRequest) -> Result<String, CoreError>;

    /// Ask the provider to start bidirectional media streaming to the given
    /// websocket URL. For document-driven providers this is a no-op — the
    /// connection is established instead by returning
    /// [`TelephonyCapability::stream_connect_document`] from the webhook
    /// response.
    async fn start_streaming(
        &self,
        provider_call_id: &str,
        websocket_url: &str,
    ) -> Result<(), CoreError>;

    /// Best-effort hangup. Errors are logged, never propagated.
    async fn hangup(&self, provider_call_id: &str);

    /// XML document instructing a document-driven provider to connect its
    /// media to the given websocket URL. Event-driven providers never call
    /// this; the default implementation panics to catch a wiring mistake.
    fn stream_connect_document(&self, websocket_url: &str) -> String {
        let _ = websocket_url;
        unimplemented!("this provider is event-driven; it does not use connect documents")
    }

    /// Whether this provider signals attach via a webhook event
    /// (`streaming.started`) rather than purely via the websocket `start`
    /// frame. Used by the core's attach wait.
    fn signals_streaming_ready_via_webhook(&self) -> bool {
        false
    }
}
