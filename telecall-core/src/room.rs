//! Room membership tracking
//!
//! The relay is the source of truth for occupancy and for which side opens
//! negotiation. [`RoomMembership`] only mirrors what the relay reports and
//! turns it into edge-triggered [`RoomEvent`]s.

use crate::protocol::ClientMessage;
use crate::signaling::{ChannelEvent, FrameSender, SendError};
use crate::types::{ClientId, ParticipantRole, PartyTag, RoomId};
use thiserror::Error;

/// Room membership errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Already a member of a room
    #[error("Already joined room: {0}")]
    AlreadyJoined(RoomId),

    /// No room joined
    #[error("Not joined to any room")]
    NotJoined,

    /// Join frame could not be sent
    #[error("Send failed: {0}")]
    Send(#[from] SendError),
}

/// Membership transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The relay acknowledged a join
    Joined {
        /// Room
        room_id: RoomId,
        /// Nobody else was present
        is_first_occupant: bool,
        /// Occupants including this client
        occupant_count: usize,
    },
    /// A second participant is present
    PeerJoined {
        /// Room
        room_id: RoomId,
        /// Tag of the other participant
        peer_tag: Option<PartyTag>,
        /// Role the relay assigned to this client
        role: ParticipantRole,
        /// Occupants after the arrival
        occupant_count: usize,
        /// Whether this client opens negotiation
        should_initiate: bool,
        /// The peer was already present; the relay is asking for a fresh
        /// negotiation attempt
        renegotiate: bool,
    },
    /// The room dropped below two occupants
    PeerLeft {
        /// Room
        room_id: RoomId,
        /// Occupants after the departure
        occupant_count: usize,
    },
}

#[derive(Debug, Clone)]
struct Membership {
    room_id: RoomId,
    tag: PartyTag,
    acknowledged: bool,
    occupant_count: usize,
    peer_present: bool,
    role: Option<ParticipantRole>,
}

/// Tracks this client's membership in at most one room
#[derive(Debug)]
pub struct RoomMembership {
    client_id: ClientId,
    current: Option<Membership>,
}

impl RoomMembership {
    /// Create a tracker for `client_id`
    #[must_use]
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            current: None,
        }
    }

    /// Join `room_id` under `tag`
    ///
    /// # Errors
    ///
    /// Returns error if a room is already joined or the join frame cannot be
    /// sent. On a send failure no membership is recorded.
    #[tracing::instrument(skip(self, sender), fields(room_id = %room_id, tag = %tag))]
    pub fn join(
        &mut self,
        sender: &dyn FrameSender,
        room_id: RoomId,
        tag: PartyTag,
    ) -> Result<(), RoomError> {
        if let Some(current) = &self.current {
            return Err(RoomError::AlreadyJoined(current.room_id.clone()));
        }
        sender.send_frame(ClientMessage::Join {
            room_id: room_id.clone(),
            client_id: self.client_id.clone(),
            tag: tag.clone(),
        })?;
        tracing::debug!("Join sent");
        self.current = Some(Membership {
            room_id,
            tag,
            acknowledged: false,
            occupant_count: 0,
            peer_present: false,
            role: None,
        });
        Ok(())
    }

    /// Re-send the join for the current room after the relay connection was
    /// re-established
    ///
    /// # Errors
    ///
    /// Returns error if no room is joined or the frame cannot be sent
    pub fn rejoin(&mut self, sender: &dyn FrameSender) -> Result<(), RoomError> {
        let current = self.current.as_mut().ok_or(RoomError::NotJoined)?;
        sender.send_frame(ClientMessage::Join {
            room_id: current.room_id.clone(),
            client_id: self.client_id.clone(),
            tag: current.tag.clone(),
        })?;
        tracing::debug!(room_id = %current.room_id, "Rejoin sent");
        current.acknowledged = false;
        Ok(())
    }

    /// Leave the current room
    ///
    /// Returns `false` when there was nothing to leave. The leave frame is
    /// best effort: local membership is cleared even if it cannot be sent.
    pub fn leave(&mut self, sender: &dyn FrameSender) -> bool {
        let Some(current) = self.current.take() else {
            return false;
        };
        let frame = ClientMessage::Leave {
            room_id: current.room_id.clone(),
            client_id: self.client_id.clone(),
        };
        match sender.send_frame(frame) {
            Ok(()) => tracing::debug!(room_id = %current.room_id, "Leave sent"),
            Err(e) => {
                tracing::debug!(room_id = %current.room_id, error = %e, "Leave not delivered")
            }
        }
        true
    }

    /// Fold a channel event into membership state
    ///
    /// Returns a [`RoomEvent`] only on an actual transition. Events for other
    /// rooms, or arriving while no room is joined, are ignored.
    pub fn handle(&mut self, event: &ChannelEvent) -> Option<RoomEvent> {
        let current = self.current.as_mut()?;
        match event {
            ChannelEvent::RoomStatus {
                room_id,
                occupant_count,
                ..
            } if *room_id == current.room_id => {
                current.occupant_count = *occupant_count;
                if current.acknowledged {
                    return None;
                }
                current.acknowledged = true;
                Some(RoomEvent::Joined {
                    room_id: room_id.clone(),
                    is_first_occupant: *occupant_count <= 1,
                    occupant_count: *occupant_count,
                })
            }
            ChannelEvent::PeerJoined {
                room_id,
                peer_tag,
                role,
                occupant_count,
                should_initiate,
            } if *room_id == current.room_id => {
                let renegotiate = current.peer_present;
                current.peer_present = true;
                current.occupant_count = *occupant_count;
                current.role = Some(*role);
                Some(RoomEvent::PeerJoined {
                    room_id: room_id.clone(),
                    peer_tag: peer_tag.clone(),
                    role: *role,
                    occupant_count: *occupant_count,
                    should_initiate: *should_initiate,
                    renegotiate,
                })
            }
            ChannelEvent::PeerLeft {
                room_id,
                occupant_count,
            } if *room_id == current.room_id => {
                current.occupant_count = *occupant_count;
                if !current.peer_present || *occupant_count >= 2 {
                    return None;
                }
                current.peer_present = false;
                Some(RoomEvent::PeerLeft {
                    room_id: room_id.clone(),
                    occupant_count: *occupant_count,
                })
            }
            _ => None,
        }
    }

    /// Room currently joined
    #[must_use]
    pub fn room_id(&self) -> Option<&RoomId> {
        self.current.as_ref().map(|m| &m.room_id)
    }

    /// Whether a room is joined
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.current.is_some()
    }

    /// Whether the other participant is present
    #[must_use]
    pub fn peer_present(&self) -> bool {
        self.current.as_ref().is_some_and(|m| m.peer_present)
    }

    /// Role the relay last assigned
    #[must_use]
    pub fn role(&self) -> Option<ParticipantRole> {
        self.current.as_ref().and_then(|m| m.role)
    }

    /// Last occupant count reported by the relay
    #[must_use]
    pub fn occupant_count(&self) -> usize {
        self.current.as_ref().map_or(0, |m| m.occupant_count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingSender {
        frames: Mutex<Vec<ClientMessage>>,
        offline: bool,
    }

    impl FrameSender for RecordingSender {
        fn send_frame(&self, frame: ClientMessage) -> Result<(), SendError> {
            if self.offline {
                return Err(SendError::Disconnected);
            }
            self.frames.lock().push(frame);
            Ok(())
        }
    }

    fn status(count: usize) -> ChannelEvent {
        ChannelEvent::RoomStatus {
            room_id: RoomId::new("R1"),
            occupant_count: count,
            occupants: Vec::new(),
        }
    }

    fn peer_joined(role: ParticipantRole) -> ChannelEvent {
        ChannelEvent::PeerJoined {
            room_id: RoomId::new("R1"),
            peer_tag: Some(PartyTag::new("patient")),
            role,
            occupant_count: 2,
            should_initiate: role == ParticipantRole::Initiator,
        }
    }

    #[test]
    fn test_joined_emitted_once() {
        let sender = RecordingSender::default();
        let mut room = RoomMembership::new(ClientId::new("a"));
        room.join(&sender, RoomId::new("R1"), PartyTag::new("doctor"))
            .unwrap();

        assert_eq!(
            room.handle(&status(1)),
            Some(RoomEvent::Joined {
                room_id: RoomId::new("R1"),
                is_first_occupant: true,
                occupant_count: 1,
            })
        );
        assert_eq!(room.handle(&status(1)), None);
        assert_eq!(sender.frames.lock().len(), 1);
    }

    #[test]
    fn test_second_join_rejected() {
        let sender = RecordingSender::default();
        let mut room = RoomMembership::new(ClientId::new("a"));
        room.join(&sender, RoomId::new("R1"), PartyTag::new("doctor"))
            .unwrap();
        let result = room.join(&sender, RoomId::new("R2"), PartyTag::new("doctor"));
        assert_eq!(result, Err(RoomError::AlreadyJoined(RoomId::new("R1"))));
    }

    #[test]
    fn test_failed_join_records_nothing() {
        let sender = RecordingSender {
            offline: true,
            ..Default::default()
        };
        let mut room = RoomMembership::new(ClientId::new("a"));
        let result = room.join(&sender, RoomId::new("R1"), PartyTag::new("doctor"));
        assert_eq!(result, Err(RoomError::Send(SendError::Disconnected)));
        assert!(!room.is_joined());
    }

    #[test]
    fn test_peer_left_once_per_transition() {
        let sender = RecordingSender::default();
        let mut room = RoomMembership::new(ClientId::new("a"));
        room.join(&sender, RoomId::new("R1"), PartyTag::new("doctor"))
            .unwrap();
        room.handle(&status(1));

        let joined = room.handle(&peer_joined(ParticipantRole::Initiator));
        assert!(matches!(
            joined,
            Some(RoomEvent::PeerJoined {
                should_initiate: true,
                renegotiate: false,
                ..
            })
        ));
        assert!(room.peer_present());
        assert_eq!(room.role(), Some(ParticipantRole::Initiator));

        let left = ChannelEvent::PeerLeft {
            room_id: RoomId::new("R1"),
            occupant_count: 1,
        };
        assert!(matches!(room.handle(&left), Some(RoomEvent::PeerLeft { .. })));
        assert_eq!(room.handle(&left), None);
        assert!(!room.peer_present());
    }

    #[test]
    fn test_repeated_peer_joined_requests_renegotiation() {
        let sender = RecordingSender::default();
        let mut room = RoomMembership::new(ClientId::new("b"));
        room.join(&sender, RoomId::new("R1"), PartyTag::new("patient"))
            .unwrap();
        room.handle(&peer_joined(ParticipantRole::Responder));
        let again = room.handle(&peer_joined(ParticipantRole::Responder));
        assert!(matches!(
            again,
            Some(RoomEvent::PeerJoined {
                renegotiate: true,
                ..
            })
        ));
    }

    #[test]
    fn test_other_room_events_ignored() {
        let sender = RecordingSender::default();
        let mut room = RoomMembership::new(ClientId::new("a"));
        room.join(&sender, RoomId::new("R1"), PartyTag::new("doctor"))
            .unwrap();
        let event = ChannelEvent::RoomStatus {
            room_id: RoomId::new("R9"),
            occupant_count: 1,
            occupants: Vec::new(),
        };
        assert_eq!(room.handle(&event), None);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let sender = RecordingSender::default();
        let mut room = RoomMembership::new(ClientId::new("a"));
        assert!(!room.leave(&sender));

        room.join(&sender, RoomId::new("R1"), PartyTag::new("doctor"))
            .unwrap();
        assert!(room.leave(&sender));
        assert!(!room.leave(&sender));

        let frames = sender.frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].frame_type(), "leave");
    }

    #[test]
    fn test_leave_while_offline_clears_membership() {
        let online = RecordingSender::default();
        let offline = RecordingSender {
            offline: true,
            ..Default::default()
        };
        let mut room = RoomMembership::new(ClientId::new("a"));
        room.join(&online, RoomId::new("R1"), PartyTag::new("doctor"))
            .unwrap();
        assert!(room.leave(&offline));
        assert!(!room.is_joined());
    }

    #[test]
    fn test_rejoin_reacknowledges() {
        let sender = RecordingSender::default();
        let mut room = RoomMembership::new(ClientId::new("a"));
        assert_eq!(room.rejoin(&sender), Err(RoomError::NotJoined));

        room.join(&sender, RoomId::new("R1"), PartyTag::new("doctor"))
            .unwrap();
        room.handle(&status(1));
        room.rejoin(&sender).unwrap();
        assert!(matches!(
            room.handle(&status(2)),
            Some(RoomEvent::Joined {
                is_first_occupant: false,
                occupant_count: 2,
                ..
            })
        ));
        assert_eq!(sender.frames.lock().len(), 2);
    }
}
