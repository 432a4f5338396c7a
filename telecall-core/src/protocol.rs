//! Relay wire protocol
//!
//! JSON text frames exchanged with the signaling relay. The relay brokers
//! room membership and forwards negotiation payloads between the two
//! participants of a room; it never looks inside a [`NegotiationMessage`].

use crate::types::{ClientId, MediaKind, NegotiationMessage, ParticipantRole, PartyTag, RoomId};
use serde::{Deserialize, Serialize};

/// Maximum frame size accepted from the relay (64KB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Recipient selector for relayed signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTarget {
    /// Every other occupant of the room
    All,
}

/// Frames sent from a client to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a room (or refresh membership when already present)
    Join {
        /// Room to join
        room_id: RoomId,
        /// Joining client
        client_id: ClientId,
        /// Display tag of the participant
        tag: PartyTag,
    },

    /// Leave a room
    Leave {
        /// Room to leave
        room_id: RoomId,
        /// Leaving client
        client_id: ClientId,
    },

    /// Forward a negotiation payload to the other occupants
    Signal {
        /// Room the signal belongs to
        room_id: RoomId,
        /// Sending client
        from: ClientId,
        /// Recipients
        target: SignalTarget,
        /// Opaque payload
        message: NegotiationMessage,
    },

    /// Chat line sent through the relay before the data channel is open
    Chat {
        /// Room
        room_id: RoomId,
        /// Sending client
        from: ClientId,
        /// Text
        text: String,
        /// Sender's negotiation role, when assigned
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_role: Option<ParticipantRole>,
    },

    /// Local track enabled/disabled notification
    ToggleMedia {
        /// Room
        room_id: RoomId,
        /// Sending client
        from: ClientId,
        /// Track kind
        kind: MediaKind,
        /// New enabled flag
        enabled: bool,
    },
}

impl ClientMessage {
    /// Get the room this frame addresses
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::Join { room_id, .. }
            | Self::Leave { room_id, .. }
            | Self::Signal { room_id, .. }
            | Self::Chat { room_id, .. }
            | Self::ToggleMedia { room_id, .. } => room_id,
        }
    }

    /// Short name for logging
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Signal { .. } => "signal",
            Self::Chat { .. } => "chat",
            Self::ToggleMedia { .. } => "toggle_media",
        }
    }
}

/// Frames sent from the relay to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// A second participant is present
    ///
    /// `role` is the role assigned to the *recipient*. The relay sends
    /// `should_initiate = true` to exactly one of the two occupants.
    PeerJoined {
        /// Room
        room_id: RoomId,
        /// Tag of the other participant
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_tag: Option<PartyTag>,
        /// Role assigned to the recipient
        role: ParticipantRole,
        /// Occupants after the arrival
        occupant_count: usize,
        /// Whether the recipient opens negotiation
        should_initiate: bool,
    },

    /// The other participant left
    PeerLeft {
        /// Room
        room_id: RoomId,
        /// Occupants after the departure
        occupant_count: usize,
    },

    /// Negotiation payload from the other participant
    Signal {
        /// Room
        room_id: RoomId,
        /// Original sender
        from: ClientId,
        /// Opaque payload
        message: NegotiationMessage,
    },

    /// Relayed chat line
    Chat {
        /// Room
        room_id: RoomId,
        /// Original sender
        from: ClientId,
        /// Text
        text: String,
        /// Sender's negotiation role
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_role: Option<ParticipantRole>,
    },

    /// The other participant toggled a track
    RemoteMediaToggle {
        /// Room
        room_id: RoomId,
        /// Original sender
        from: ClientId,
        /// Track kind
        kind: MediaKind,
        /// New enabled flag
        enabled: bool,
    },

    /// Room occupancy report; the first one after a `join` acknowledges it
    RoomStatus {
        /// Room
        room_id: RoomId,
        /// Current occupant count
        occupant_count: usize,
        /// Tags of the occupants, in arrival order
        #[serde(default)]
        occupants: Vec<PartyTag>,
    },

    /// Relay-side error report
    Error {
        /// Description
        message: String,
    },
}

impl RelayMessage {
    /// Sender of a relayed frame, if it carries one
    #[must_use]
    pub fn sender(&self) -> Option<&ClientId> {
        match self {
            Self::Signal { from, .. }
            | Self::Chat { from, .. }
            | Self::RemoteMediaToggle { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Room the frame belongs to, if any
    #[must_use]
    pub fn room_id(&self) -> Option<&RoomId> {
        match self {
            Self::PeerJoined { room_id, .. }
            | Self::PeerLeft { room_id, .. }
            | Self::Signal { room_id, .. }
            | Self::Chat { room_id, .. }
            | Self::RemoteMediaToggle { room_id, .. }
            | Self::RoomStatus { room_id, .. } => Some(room_id),
            Self::Error { .. } => None,
        }
    }

    /// Short name for logging
    #[must_use]
    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::PeerJoined { .. } => "peer_joined",
            Self::PeerLeft { .. } => "peer_left",
            Self::Signal { .. } => "signal",
            Self::Chat { .. } => "chat",
            Self::RemoteMediaToggle { .. } => "remote_media_toggle",
            Self::RoomStatus { .. } => "room_status",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::types::IceCandidate;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_client_signal_serialization() {
        let msg = ClientMessage::Signal {
            room_id: RoomId::new("R1"),
            from: ClientId::new("alice"),
            target: SignalTarget::All,
            message: NegotiationMessage::Offer {
                sdp: "v=0\r\n".to_string(),
            },
        };

        let serialized = serde_json::to_string(&msg).unwrap();
        assert!(serialized.contains("\"type\":\"signal\""));
        assert!(serialized.contains("\"target\":\"all\""));
        assert!(serialized.contains("\"kind\":\"offer\""));
        assert_eq!(msg.room_id().as_str(), "R1");
        assert_eq!(msg.frame_type(), "signal");
    }

    #[test]
    fn test_relay_peer_joined_parsing() {
        let raw = r#"{
            "type": "peer_joined",
            "room_id": "R1",
            "peer_tag": "patient",
            "role": "initiator",
            "occupant_count": 2,
            "should_initiate": true
        }"#;
        let msg: RelayMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(
            msg,
            RelayMessage::PeerJoined {
                room_id: RoomId::new("R1"),
                peer_tag: Some(PartyTag::new("patient")),
                role: ParticipantRole::Initiator,
                occupant_count: 2,
                should_initiate: true,
            }
        );
        assert!(msg.sender().is_none());
    }

    #[test]
    fn test_relay_candidate_signal_parsing() {
        let raw = r#"{
            "type": "signal",
            "room_id": "R1",
            "from": "bob",
            "message": {"kind": "candidate", "candidate": "candidate:2", "sdp_mline_index": 0}
        }"#;
        let msg: RelayMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.sender(), Some(&ClientId::new("bob")));
        match msg {
            RelayMessage::Signal {
                message: NegotiationMessage::Candidate { candidate },
                ..
            } => {
                assert_eq!(
                    candidate,
                    IceCandidate {
                        candidate: "candidate:2".to_string(),
                        sdp_mid: None,
                        sdp_mline_index: Some(0),
                    }
                );
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_room_status_defaults_occupants() {
        let msg: RelayMessage =
            serde_json::from_str(r#"{"type":"room_status","room_id":"R1","occupant_count":1}"#)
                .unwrap();
        assert_eq!(msg.frame_type(), "room_status");
        assert_eq!(msg.room_id(), Some(&RoomId::new("R1")));
    }
}
