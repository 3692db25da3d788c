//! The wire-level `Message` envelope (§3, §6) and its closed set of types.
//!
//! One JSON object per WebSocket frame conforms to this envelope. The
//! dispatcher in `rail_core.rs` is a total function over `MessageType`.

use crate::domain_types::{AgentId, AgentName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of frame types carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Join,
    Leave,
    Heartbeat,
    Coherence,
    Message,
    Broadcast,
    Sync,
    Migrate,
    Metadata,
    Trace,
    Search,
    Synthesize,
    Replay,
}

/// An `AuthToken` as supplied by a joining client in a `join` frame's
/// payload. Single-use: validated once against the HMAC of
/// `agentId:timestamp:nonce` under the agent's registered secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub timestamp: i64,
    pub nonce: String,
    pub signature: String,
}

/// The immutable message envelope that crosses the wire.
///
/// Constructed once by the listener (inbound) or the Rail Core (outbound)
/// and never mutated afterward — fields that need to change (e.g. adding a
/// signature) produce a new envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(rename = "agentId")]
    pub agent_id: Option<AgentId>,
    #[serde(rename = "agentName")]
    pub agent_name: Option<AgentName>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Message {
    /// Builds a new envelope stamped with the current time, a fresh id,
    /// and no signature (signatures are only meaningful on inbound `join`
    /// frames carrying an `AuthToken`).
    #[must_use]
    pub fn new(message_type: MessageType, agent_id: Option<AgentId>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            agent_id,
            agent_name: None,
            payload,
            timestamp: Utc::now().timestamp_millis(),
            signature: None,
        }
    }

    #[must_use]
    pub fn timestamp_as_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_through_json() {
        let msg = Message::new(
            MessageType::Heartbeat,
            Some(AgentId::try_new("agent-A".to_string()).unwrap()),
            serde_json::json!({}),
        );
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.message_type, MessageType::Heartbeat);
        assert_eq!(decoded.agent_id.unwrap().to_string(), "agent-A");
    }

    #[test]
    fn message_type_serializes_lowercase() {
        let encoded = serde_json::to_string(&MessageType::Broadcast).unwrap();
        assert_eq!(encoded, "\"broadcast\"");
    }
}
