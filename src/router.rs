//! Route definitions and router construction.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::media_socket::media_stream_upgrade;
use crate::state::AppState;
use crate::webhook::twiml_webhook;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/twiml", post(twiml_webhook))
        .route("/media-stream", get(media_stream_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    #[serde(rename = "activeCalls")]
    active_calls: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        active_calls: state.core.registry.all_active().len(),
    })
}
