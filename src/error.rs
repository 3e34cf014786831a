//! Error kinds for the call session core.
//!
//! Mirrors the error taxonomy a caller needs to distinguish: config failures
//! that are fatal at startup, provider/transport failures that terminate a
//! single call, and timeout/signature failures with a defined HTTP response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::handle::CallId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("telephony provider returned an error: {0}")]
    ProviderError(String),

    #[error("timed out waiting for media socket attach")]
    AttachTimeout,

    #[error("timed out waiting for a transcript")]
    ListenTimeout,

    #[error("the user hung up")]
    UserHungUp,

    #[error("failed to connect the streaming STT session: {0}")]
    SttConnectFailed(String),

    #[error("the streaming STT session disconnected and reconnect attempts were exhausted")]
    SttDisconnected,

    #[error("the public tunnel is down")]
    TunnelLost,

    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("no call found for id {0}")]
    NotFound(CallId),

    #[error("call {0} is not in a state that allows this operation")]
    InvalidState(CallId),
}

/// JSON error body returned to the agent-facing tool adapter / webhook caller.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(rename = "type")]
    error_type: &'static str,
}

impl CoreError {
    fn error_type(&self) -> &'static str {
        match self {
            CoreError::ConfigInvalid(_) => "ConfigInvalid",
            CoreError::ProviderError(_) => "ProviderError",
            CoreError::AttachTimeout => "AttachTimeout",
            CoreError::ListenTimeout => "ListenTimeout",
            CoreError::UserHungUp => "UserHungUp",
            CoreError::SttConnectFailed(_) => "STTConnectFailed",
            CoreError::SttDisconnected => "STTDisconnected",
            CoreError::TunnelLost => "TunnelLost",
            CoreError::SignatureInvalid => "SignatureInvalid",
            CoreError::NotFound(_) => "NotFound",
            CoreError::InvalidState(_) => "InvalidState",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CoreError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidState(_) => StatusCode::CONFLICT,
            CoreError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            error_type: self.error_type(),
        };
        (status, axum::Json(body)).into_response()
    }
}
