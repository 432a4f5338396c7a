//! Call session configuration

use crate::types::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff for relay reconnection
///
/// Attempt `n` (zero based) waits `base_delay * 2^n`, capped at `max_delay`.
/// After `max_attempts` failed attempts the channel gives up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first reconnection attempt
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Upper bound for a single delay
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before reconnection attempt `attempt` (zero based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
            max_attempts: 6,
        }
    }
}

/// Signaling relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Relay URL used by the WebSocket transport
    pub relay_url: String,
    /// Reconnection policy
    pub reconnect: BackoffPolicy,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/ws".to_string(),
            reconnect: BackoffPolicy::default(),
        }
    }
}

/// How local candidates reach the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateMode {
    /// Gather everything, then send one descriptor that embeds all candidates
    NonTrickle,
    /// Send each candidate as soon as it is gathered
    Trickle,
}

impl Default for CandidateMode {
    fn default() -> Self {
        Self::NonTrickle
    }
}

/// Peer connection negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// STUN/TURN server URLs handed to the media engine
    pub ice_servers: Vec<String>,
    /// Candidate delivery strategy
    pub candidate_mode: CandidateMode,
    /// Label of the ancillary chat data channel
    pub chat_channel_label: String,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            candidate_mode: CandidateMode::NonTrickle,
            chat_channel_label: "chat".to_string(),
        }
    }
}

/// Peer-level recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Reconnect cycles allowed without reaching `Connected` before the call fails
    pub max_peer_reconnects: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_peer_reconnects: 3,
        }
    }
}

/// What happens to chat sent before the data channel opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingChatPolicy {
    /// Deliver immediately through the relay
    SendViaRelay,
    /// Hold locally and flush over the data channel once it opens
    QueueForChannel,
}

impl Default for PendingChatPolicy {
    fn default() -> Self {
        Self::SendViaRelay
    }
}

/// Chat configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Handling of chat sent before the channel opens
    pub pending_policy: PendingChatPolicy,
    /// Longest accepted chat line, in bytes
    pub max_message_len: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            pending_policy: PendingChatPolicy::SendViaRelay,
            max_message_len: 4096,
        }
    }
}

/// Call session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Relay settings
    pub signaling: SignalingConfig,
    /// Negotiation settings
    pub negotiation: NegotiationConfig,
    /// Requested local media
    pub media: MediaConstraints,
    /// Peer recovery settings
    pub recovery: RecoveryConfig,
    /// Chat settings
    pub chat: ChatConfig,
    /// Capacity of the `CallEvent` broadcast channel
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            negotiation: NegotiationConfig::default(),
            media: MediaConstraints::video_call(),
            recovery: RecoveryConfig::default(),
            chat: ChatConfig::default(),
            event_capacity: 256,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
