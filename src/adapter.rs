//! Tool Adapter — the three agent-facing entry points.
//!
//! A thin wrapper over [`CallSessionCore`]: no state of its own, no
//! protocol logic. Its only job is translating the core's return values
//! into the shapes the agent-facing tool surface expects.

use serde::Serialize;

use crate::call::core::CallSessionCore;
use crate::error::CoreError;
use crate::handle::CallId;

pub struct ToolAdapter {
    core: CallSessionCore,
    default_user_number: String,
}

#[derive(Debug, Serialize)]
pub struct InitiateResult {
    pub call_id: CallId,
    pub user_reply: String,
}

#[derive(Debug, Serialize)]
pub struct EndResult {
    pub duration_seconds: u64,
}

impl ToolAdapter {
    pub fn new(core: CallSessionCore, default_user_number: String) -> Self {
        Self {
            core,
            default_user_number,
        }
    }

    /// Start a call and speak the first message. Blocks until the user's
    /// reply transcript is available, fails the call, or times out.
    pub async fn initiate(&self, text: &str) -> Result<InitiateResult, CoreError> {
        let (call_id, user_reply) = self.core.initiate(&self.default_user_number, text).await?;
        Ok(InitiateResult {
            call_id,
            user_reply,
        })
    }

    /// Speak `text` on an existing call and return the next transcript.
    pub async fn continue_call(&self, call_id: CallId, text: &str) -> Result<String, CoreError> {
        self.core.continue_call(call_id, text).await
    }

    /// Speak a farewell and end the call.
    pub async fn end(&self, call_id: CallId, text: &str) -> Result<EndResult, CoreError> {
        let duration_seconds = self.core.end_call(call_id, text).await?;
        Ok(EndResult { duration_seconds })
    }
}
