//! Correlation identifiers.
//!
//! A `CallId` is the opaque, locally-generated primary key for a call. It is
//! minted once at call creation and used everywhere the call needs to be
//! addressed: indices, logs, the agent-facing tool contract.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque call identifier (UUIDv4 under the hood).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    /// Mint a new call id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Short form for logging (first 8 hex chars).
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for CallId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for CallId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Random 128-bit token minted at call creation, used to authenticate the
/// incoming media websocket upgrade. Not a `CallId`: it must never be
/// guessable from the call id, and it is compared constant-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WsToken([u8; 16]);

impl WsToken {
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Constant-time comparison against a hex string lifted off a query
    /// parameter. Returns `false` (never panics) on malformed hex.
    pub fn matches_hex(&self, candidate: &str) -> bool {
        let decoded = match hex::decode(candidate) {
            Ok(b) => b,
            Err(_) => return false,
        };
        if decoded.len() != self.0.len() {
            return false;
        }
        let mut diff: u8 = 0;
        for (a, b) in self.0.iter().zip(decoded.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }
}

impl Default for WsToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WsToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_round_trips_through_display_and_parse() {
        let id = CallId::new();
        let parsed: CallId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn call_id_short_is_eight_chars() {
        assert_eq!(CallId::new().short().len(), 8);
    }

    #[test]
    fn ws_token_matches_its_own_hex() {
        let token = WsToken::new();
        assert!(token.matches_hex(&token.to_string()));
    }

    #[test]
    fn ws_token_rejects_wrong_token() {
        let a = WsToken::new();
        let b = WsToken::new();
        assert!(!a.matches_hex(&b.to_string()));
    }

    #[test]
    fn ws_token_rejects_garbage() {
        let token = WsToken::new();
        assert!(!token.matches_hex("not-hex"));
    }
}
