//! Call Session Core server.
//!
//! Bridges an AI agent to a real outbound phone call: places the call,
//! speaks synthesized turns, listens for spoken replies via a streaming STT
//! session, and returns the agent-facing transcript. This binary runs the
//! HTTP+WebSocket server described in the external interfaces: `/health`,
//! `/twiml` (provider webhook intake), and `/media-stream` (the provider's
//! media socket). The three-operation agent tool surface
//! (`call_session_core::adapter::ToolAdapter`) is a thin wrapper over
//! `CallSessionCore` that an external agent process reaches by depending on
//! the `call_session_core` library crate directly, not through this server.

use std::net::SocketAddr;
use std::sync::Arc;

use call_session_core::call::core::CallSessionCore;
use call_session_core::config::{Config, TelephonyProviderKind};
use call_session_core::router;
use call_session_core::state::AppContext;
use call_session_core::telephony::telnyx::TelnyxProvider;
use call_session_core::telephony::twilio::TwilioProvider;
use call_session_core::telephony::TelephonyCapability;
use call_session_core::tts::{HttpTtsCapability, TtsCapability};
use call_session_core::tunnel::TunnelManager;

const FAREWELL: &str = "Sorry, I need to go — talk again soon.";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_session_core=info,tower_http=info".into()),
        )
        .init();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    let config = Arc::new(config);

    tracing::info!(
        provider = ?config.telephony.provider,
        local_port = config.local_port,
        "starting call session core"
    );

    let telephony: Arc<dyn TelephonyCapability> = match config.telephony.provider {
        TelephonyProviderKind::Telnyx => Arc::new(TelnyxProvider::new(
            config.telephony.api_base_url.clone(),
            config.telephony.api_key.clone(),
            config.telephony.connection_id.clone(),
        )),
        TelephonyProviderKind::Twilio => Arc::new(TwilioProvider::new(
            config.telephony.account_sid.clone(),
            config.telephony.api_key.clone(),
        )),
    };

    let tts: Arc<dyn TtsCapability> = Arc::new(HttpTtsCapability::new(
        config.tts_api_base_url.clone(),
        config.tts_api_key.clone(),
        config.tts_model.clone(),
    ));

    let core = CallSessionCore::new(telephony, tts, config.clone());

    let tunnel = TunnelManager::new(config.ngrok_agent_api_base.clone(), config.local_port);
    let public_url = match tunnel.start().await {
        Ok(url) => url,
        Err(e) => {
            eprintln!("failed to acquire public tunnel: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(%public_url, "public tunnel ready");
    core.set_public_base_url(public_url);

    let context = Arc::new(AppContext {
        core: core.clone(),
        config: config.clone(),
    });
    let app = router::build_router(context);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.local_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "listening");

    let shutdown_core = core.clone();
    let shutdown_tunnel = tunnel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, ending active calls");
            shutdown_core.shutdown_all(FAREWELL).await;
            shutdown_tunnel.stop();
        })
        .await
        .expect("server error");
}
