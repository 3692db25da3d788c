//! HMAC-SHA256 challenge/response auth, reconnect tokens, and the secret
//! registry (C3).
//!
//! Constant-time comparison follows the pack's WebSocket bridge pattern
//! (manual XOR-accumulate over byte slices) rather than pulling in a new
//! `subtle`-style dependency for a single comparison.

use crate::config::AuthConfig;
use crate::domain_types::AgentId;
use crate::error::AuthError;
use crate::message::AuthToken;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::sync::RwLock;

type HmacSha256 = Hmac<Sha256>;

/// Constant-time byte comparison, avoiding early-exit timing side channels.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// A registered agent's secret, held only as HMAC key material — never
/// served back to clients after its one-time creation response.
#[derive(Clone)]
struct Secret(Vec<u8>);

/// A reconnect token issued on successful join, valid for at most one
/// successful reconnect.
#[derive(Clone)]
struct ReconnectEntry {
    agent_id: AgentId,
    expires_at: chrono::DateTime<Utc>,
}

/// The process-local registry of agent secrets and outstanding reconnect
/// tokens, restored from persistence at startup and never served back.
pub struct AuthRegistry {
    config: AuthConfig,
    secrets: DashMap<AgentId, Secret>,
    reconnect_tokens: DashMap<String, ReconnectEntry>,
    observer_platforms: RwLock<Vec<String>>,
}

impl AuthRegistry {
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        let observer_platforms = config.observer_platforms.clone();
        Self {
            config,
            secrets: DashMap::new(),
            reconnect_tokens: DashMap::new(),
            observer_platforms: RwLock::new(observer_platforms),
        }
    }

    /// Registers `agent_id` with `secret` (raw bytes, typically 32 random
    /// bytes). Called at startup to restore enrollments from persistence,
    /// and by the `/enroll` admin endpoint.
    pub fn enroll(&self, agent_id: AgentId, secret: Vec<u8>) {
        self.secrets.insert(agent_id, Secret(secret));
    }

    /// Generates a fresh 32-byte secret, hex-encoded, without enrolling it.
    /// Used by `/enroll` when the caller omits a secret.
    #[must_use]
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    #[must_use]
    pub fn is_observer_platform(&self, platform: &str) -> bool {
        self.observer_platforms.read().unwrap().iter().any(|p| p == platform)
    }

    /// Validates an `AuthToken` against the HMAC of `agentId:timestamp:nonce`
    /// under the agent's registered secret. Rejects unknown agents, stale
    /// timestamps, and signature mismatches without distinguishing which
    /// (callers must not leak which factor failed to the client).
    pub fn validate_token(&self, token: &AuthToken) -> Result<AgentId, AuthError> {
        let agent_id = AgentId::try_new(token.agent_id.clone())
            .map_err(|e| AuthError::Malformed(e.to_string()))?;

        let secret = self
            .secrets
            .get(&agent_id)
            .ok_or(AuthError::UnknownAgent)?
            .0
            .clone();

        let now = Utc::now().timestamp_millis();
        if (now - token.timestamp).abs() > self.config.max_token_age_secs * 1000 {
            return Err(AuthError::StaleToken);
        }

        let payload = format!("{}:{}:{}", token.agent_id, token.timestamp, token.nonce);
        let mut mac = HmacSha256::new_from_slice(&secret).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        let expected = mac.finalize().into_bytes();
        let expected_hex = hex::encode(expected);

        if !constant_time_eq(expected_hex.as_bytes(), token.signature.as_bytes()) {
            return Err(AuthError::BadSignature);
        }

        Ok(agent_id)
    }

    /// Issues a fresh reconnect token for `agent_id`, valid for
    /// `config.reconnect_ttl_secs`.
    #[must_use]
    pub fn issue_reconnect_token(&self, agent_id: AgentId) -> String {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let expires_at = Utc::now() + chrono::Duration::seconds(self.config.reconnect_ttl_secs);
        self.reconnect_tokens.insert(token.clone(), ReconnectEntry { agent_id, expires_at });
        token
    }

    /// Validates and consumes a reconnect token in constant time. On
    /// success the token is removed so it cannot be reused; on failure no
    /// hint leaks about whether the token existed, expired, or mismatched.
    pub fn consume_reconnect_token(&self, token: &str) -> Result<AgentId, AuthError> {
        let Some((_, entry)) = self.reconnect_tokens.remove(token) else {
            return Err(AuthError::InvalidReconnectToken);
        };
        if entry.expires_at < Utc::now() {
            return Err(AuthError::ExpiredReconnectToken);
        }
        Ok(entry.agent_id)
    }

    /// Removes reconnect tokens past their expiry, called from the Rail
    /// Core's tick loop.
    pub fn sweep_expired_reconnect_tokens(&self) {
        let now = Utc::now();
        self.reconnect_tokens.retain(|_, entry| entry.expires_at >= now);
    }
}
