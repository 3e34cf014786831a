//! Tunnel Manager.
//!
//! Exposes the local HTTP port at a public URL and keeps it alive. Talks to
//! the ngrok agent's local admin API (`http://127.0.0.1:4040/api/tunnels`) —
//! the agent process itself is started out-of-band (operationally, as a
//! sidecar); this manager only discovers and health-checks the tunnel it
//! creates through that API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Deserialize)]
struct NgrokTunnelList {
    tunnels: Vec<NgrokTunnel>,
}

#[derive(Debug, Deserialize)]
struct NgrokTunnel {
    public_url: String,
    proto: String,
}

struct Shared {
    client: Client,
    agent_api_base: String,
    local_port: u16,
    current_url: RwLock<Option<String>>,
    intentionally_closed: AtomicBool,
}

/// Handle to the public tunnel. Cheaply cloneable; the health-monitor loop
/// holds its own clone.
#[derive(Clone)]
pub struct TunnelManager {
    shared: Arc<Shared>,
}

impl TunnelManager {
    pub fn new(agent_api_base: impl Into<String>, local_port: u16) -> Self {
        Self {
            shared: Arc::new(Shared {
                client: Client::new(),
                agent_api_base: agent_api_base.into(),
                local_port,
                current_url: RwLock::new(None),
                intentionally_closed: AtomicBool::new(false),
            }),
        }
    }

    /// Discover the current public URL from the ngrok agent and start the
    /// health-monitor loop.
    pub async fn start(&self) -> Result<String, TunnelError> {
        let url = self.discover_url().await?;
        *self.shared.current_url.write() = Some(url.clone());

        let shared = self.shared.clone();
        tokio::spawn(async move {
            health_loop(shared).await;
        });

        Ok(url)
    }

    /// Current public URL, if the tunnel is up.
    pub fn current_url(&self) -> Option<String> {
        self.shared.current_url.read().clone()
    }

    /// Stop the tunnel. Sets an intentional-close flag so the health loop
    /// does not attempt to reconnect.
    pub fn stop(&self) {
        self.shared.intentionally_closed.store(true, Ordering::SeqCst);
        *self.shared.current_url.write() = None;
    }

    async fn discover_url(&self) -> Result<String, TunnelError> {
        let response = self
            .shared
            .client
            .get(format!("{}/api/tunnels", self.shared.agent_api_base))
            .send()
            .await
            .map_err(|e| TunnelError::AgentUnreachable(e.to_string()))?;

        let list: NgrokTunnelList = response
            .json()
            .await
            .map_err(|e| TunnelError::AgentUnreachable(e.to_string()))?;

        list.tunnels
            .into_iter()
            .find(|t| t.proto == "https")
            .map(|t| t.public_url)
            .ok_or(TunnelError::NoTunnelForPort(self.shared.local_port))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("ngrok agent API unreachable: {0}")]
    AgentUnreachable(String),
    #[error("no https tunnel found forwarding to port {0}")]
    NoTunnelForPort(u16),
}

async fn health_loop(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;

    loop {
        tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;

        if shared.intentionally_closed.load(Ordering::SeqCst) {
            return;
        }

        let probe = shared
            .client
            .get(format!("{}/api/tunnels", shared.agent_api_base))
            .send()
            .await
            .ok()
            .and_then(|r| r.error_for_status().ok());

        if probe.is_some() {
            attempt = 0;
            continue;
        }

        tracing::warn!("tunnel health probe failed, beginning reconnect");
        let previous_url = shared.current_url.read().clone();
        *shared.current_url.write() = None;

        while attempt < RECONNECT_MAX_ATTEMPTS {
            if shared.intentionally_closed.load(Ordering::SeqCst) {
                return;
            }

            let delay = RECONNECT_BASE_DELAY * 2u32.pow(attempt);
            attempt += 1;
            tokio::time::sleep(delay).await;

            let manager = TunnelManager {
                shared: shared.clone(),
            };
            match manager.discover_url().await {
                Ok(new_url) => {
                    if previous_url.as_deref() != Some(new_url.as_str()) {
                        tracing::warn!(
                            old = ?previous_url,
                            new = %new_url,
                            "tunnel URL changed on reconnect — webhook registration may be stale"
                        );
                    }
                    *shared.current_url.write() = Some(new_url);
                    attempt = 0;
                    break;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "tunnel reconnect attempt failed");
                }
            }
        }

        if shared.current_url.read().is_none() {
            tracing::error!("tunnel reconnect attempts exhausted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_clears_current_url_and_sets_intentional_close() {
        let manager = TunnelManager::new("http://127.0.0.1:4040", 3333);
        *manager.shared.current_url.write() = Some("https://example.ngrok-free.app".into());
        manager.stop();
        assert!(manager.current_url().is_none());
        assert!(manager.shared.intentionally_closed.load(Ordering::SeqCst));
    }
}
