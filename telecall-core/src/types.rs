//! Call session types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a shared call room
///
/// Opaque to this crate. Rooms are created by the scheduling/invite side and
/// never change for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap a room identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of one connected client, used by the relay to route frames and
/// by the channel to drop self-echoes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a new random client ID
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::random()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Free-form label a participant joins with ("doctor", "patient", ...)
///
/// Carried to the peer for display only. It never decides who negotiates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyTag(String);

impl PartyTag {
    /// Wrap a tag
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartyTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Negotiation role assigned by the relay once a second participant arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// Opens negotiation with an offer
    Initiator,
    /// Waits for the offer and answers it
    Responder,
}

impl ParticipantRole {
    /// The role the other side holds
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// Session state owned by the orchestrator, one per room
///
/// ```text
///   Idle ──join──▶ AwaitingPeer ──peer_joined(initiate) / offer──▶ Negotiating
///                        ▲                                              │
///                        │                                      connected
///                  Reconnecting ◀──peer_left / failed── Connected ◀────┘
///
///   any state ──end_call / fatal──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Nothing joined yet
    Idle,
    /// In the room, no negotiation running
    AwaitingPeer,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Peer connection established
    Connected,
    /// Tearing down the previous attempt before waiting again
    Reconnecting,
    /// Terminal; all resources released
    Closed,
}

impl SessionState {
    /// Check whether the orchestrator may move from `self` to `to`
    ///
    /// `Closed` is reachable from every state; nothing leaves `Closed`.
    #[must_use]
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        if self == Closed {
            return false;
        }
        matches!(
            (self, to),
            (_, Closed)
                | (Idle, AwaitingPeer)
                | (AwaitingPeer, Negotiating)
                | (AwaitingPeer, Reconnecting)
                | (Negotiating, Connected)
                | (Negotiating, Reconnecting)
                | (Connected, Reconnecting)
                | (Reconnecting, AwaitingPeer)
        )
    }

    /// Whether a peer connection may be live in this state
    #[must_use]
    pub fn has_negotiation(self) -> bool {
        matches!(self, Self::Negotiating | Self::Connected)
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Media constraints for a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Enable audio
    pub audio: bool,
    /// Enable video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }

    /// No media at all; only the chat channel is negotiated
    pub fn data_only() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }

    /// Check if any media is requested
    pub fn wants_media(&self) -> bool {
        self.audio || self.video
    }

    /// Convert to media kinds
    pub fn to_media_kinds(&self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        if self.audio {
            kinds.push(MediaKind::Audio);
        }
        if self.video {
            kinds.push(MediaKind::Video);
        }
        kinds
    }

    /// Next weaker set of constraints to try after an acquisition failure
    ///
    /// video call → audio only → data only → none
    pub fn downgrade(&self) -> Option<Self> {
        if self.video {
            if self.audio {
                Some(Self::audio_only())
            } else {
                Some(Self::data_only())
            }
        } else if self.audio {
            Some(Self::data_only())
        } else {
            None
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::video_call()
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
}

/// Session description exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// ICE candidate string
    pub candidate: String,
    /// SDP media ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Negotiation payload relayed verbatim between the two peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NegotiationMessage {
    /// SDP offer
    Offer {
        /// SDP content
        sdp: String,
    },
    /// SDP answer
    Answer {
        /// SDP content
        sdp: String,
    },
    /// ICE candidate
    Candidate {
        /// Candidate
        #[serde(flatten)]
        candidate: IceCandidate,
    },
}

impl NegotiationMessage {
    /// Short name for logging
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }
}

impl From<SessionDescription> for NegotiationMessage {
    fn from(desc: SessionDescription) -> Self {
        match desc.kind {
            SdpKind::Offer => Self::Offer { sdp: desc.sdp },
            SdpKind::Answer => Self::Answer { sdp: desc.sdp },
        }
    }
}

impl From<IceCandidate> for NegotiationMessage {
    fn from(candidate: IceCandidate) -> Self {
        Self::Candidate { candidate }
    }
}

/// Peer connection state as reported by the underlying primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnectionState {
    /// Created, nothing happened yet
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost connectivity
    Disconnected,
    /// Connectivity failed
    Failed,
    /// Closed locally
    Closed,
}

/// Which side wrote a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatOrigin {
    /// Typed locally
    Local,
    /// Received from the peer
    Remote,
}

/// Path a chat message travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTransport {
    /// Peer-to-peer data channel
    DataChannel,
    /// Relay fallback before the data channel is open
    Relay,
}

/// Chat line shown in the call UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message text
    pub text: String,
    /// Negotiation role of the sender, when known
    pub sender_role: Option<ParticipantRole>,
    /// Local or remote
    pub origin: ChatOrigin,
    /// How it was delivered
    pub transport: ChatTransport,
    /// Timestamp when it was written
    pub timestamp: DateTime<Utc>,
}

/// Callback used by event sources (relay channel, peer connection) to hand
/// events to their owner
///
/// The session installs sinks that push into its single input queue, so a
/// sink must never block.
pub type EventSink<E> = std::sync::Arc<dyn Fn(E) + Send + Sync>;

/// Chat payload carried over the data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChatEnvelope {
    pub text: String,
    #[serde(default)]
    pub sender_role: Option<ParticipantRole>,
    pub timestamp: DateTime<Utc>,
}
