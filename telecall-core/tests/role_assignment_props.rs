//! Property tests for relay role assignment and room membership tracking

use futures::FutureExt;
use proptest::prelude::*;
use telecall_core::signaling::FrameSender;
use telecall_core::testing::MemoryRelay;
use telecall_core::{
    ChannelEvent, ClientId, ClientMessage, ParticipantRole, PartyTag, RelayConnection,
    RelayMessage, RoomEvent, RoomId, RoomMembership, SendError, SignalingTransport,
};

#[derive(Debug, Clone)]
enum Op {
    Join(usize),
    Leave(usize),
    Drop(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..2usize).prop_map(Op::Join),
        1 => (0..2usize).prop_map(Op::Leave),
        1 => (0..2usize).prop_map(Op::Drop),
    ]
}

fn drain_pairings(conn: &mut dyn RelayConnection) -> Vec<(ParticipantRole, bool)> {
    let mut pairings = Vec::new();
    while let Some(Ok(Some(frame))) = conn.recv().now_or_never() {
        if let RelayMessage::PeerJoined {
            role,
            should_initiate,
            ..
        } = frame
        {
            pairings.push((role, should_initiate));
        }
    }
    pairings
}

proptest! {
    #[test]
    fn exactly_one_initiator_per_pairing(ops in prop::collection::vec(op(), 1..32)) {
        tokio_test::block_on(async move {
            let relay = MemoryRelay::new();
            let room = RoomId::new("R1");
            let clients = [ClientId::new("doctor"), ClientId::new("patient")];
            let mut conns: [Option<Box<dyn RelayConnection>>; 2] = [None, None];

            for op in ops {
                match op {
                    Op::Join(i) => {
                        if conns[i].is_none() {
                            conns[i] = Some(relay.connect().await.unwrap());
                        }
                        let conn = conns[i].as_mut().unwrap();
                        conn.send(ClientMessage::Join {
                            room_id: room.clone(),
                            client_id: clients[i].clone(),
                            tag: PartyTag::new(clients[i].as_str()),
                        })
                        .await
                        .unwrap();
                    }
                    Op::Leave(i) => {
                        if let Some(conn) = conns[i].as_mut() {
                            conn.send(ClientMessage::Leave {
                                room_id: room.clone(),
                                client_id: clients[i].clone(),
                            })
                            .await
                            .unwrap();
                        }
                    }
                    Op::Drop(i) => conns[i] = None,
                }

                let seen: Vec<Vec<(ParticipantRole, bool)>> = conns
                    .iter_mut()
                    .map(|c| c.as_mut().map(|c| drain_pairings(c.as_mut())).unwrap_or_default())
                    .collect();
                assert_eq!(seen[0].len(), seen[1].len());
                if let (Some(a), Some(b)) = (seen[0].last(), seen[1].last()) {
                    assert_eq!(a.0, b.0.opposite());
                    assert!(a.1 ^ b.1, "exactly one side must initiate");
                    assert_eq!(a.0 == ParticipantRole::Initiator, a.1);
                }
                assert!(relay.occupants(&room) <= 2);
            }
        });
    }
}

#[derive(Debug, Clone)]
enum Frame {
    Status { ours: bool, count: usize },
    Joined { ours: bool, role: ParticipantRole, count: usize },
    Left { ours: bool, count: usize },
    Lost,
    Rejoin,
}

fn role() -> impl Strategy<Value = ParticipantRole> {
    prop_oneof![
        Just(ParticipantRole::Initiator),
        Just(ParticipantRole::Responder)
    ]
}

fn frame() -> impl Strategy<Value = Frame> {
    prop_oneof![
        3 => (any::<bool>(), 0..4usize).prop_map(|(ours, count)| Frame::Status { ours, count }),
        3 => (any::<bool>(), role(), 1..4usize)
            .prop_map(|(ours, role, count)| Frame::Joined { ours, role, count }),
        3 => (any::<bool>(), 0..4usize).prop_map(|(ours, count)| Frame::Left { ours, count }),
        1 => Just(Frame::Lost),
        1 => Just(Frame::Rejoin),
    ]
}

struct AcceptAll;

impl FrameSender for AcceptAll {
    fn send_frame(&self, _frame: ClientMessage) -> Result<(), SendError> {
        Ok(())
    }
}

/// What the tracker should have concluded so far
#[derive(Debug, Default)]
struct Expected {
    acknowledged: bool,
    peer_present: bool,
    occupant_count: usize,
    role: Option<ParticipantRole>,
}

proptest! {
    #[test]
    fn membership_events_follow_relay_frames(frames in prop::collection::vec(frame(), 1..48)) {
        let ours = RoomId::new("R1");
        let other = RoomId::new("R2");
        let mut membership = RoomMembership::new(ClientId::new("doctor"));
        membership.join(&AcceptAll, ours.clone(), PartyTag::new("doctor")).unwrap();
        let mut expected = Expected::default();

        for frame in frames {
            let room = |own: bool| if own { ours.clone() } else { other.clone() };
            match frame {
                Frame::Status { ours: own, count } => {
                    let got = membership.handle(&ChannelEvent::RoomStatus {
                        room_id: room(own),
                        occupant_count: count,
                        occupants: Vec::new(),
                    });
                    let want = if !own {
                        None
                    } else {
                        expected.occupant_count = count;
                        if expected.acknowledged {
                            None
                        } else {
                            expected.acknowledged = true;
                            Some(RoomEvent::Joined {
                                room_id: ours.clone(),
                                is_first_occupant: count <= 1,
                                occupant_count: count,
                            })
                        }
                    };
                    prop_assert_eq!(got, want);
                }
                Frame::Joined { ours: own, role, count } => {
                    let got = membership.handle(&ChannelEvent::PeerJoined {
                        room_id: room(own),
                        peer_tag: Some(PartyTag::new("patient")),
                        role,
                        occupant_count: count,
                        should_initiate: role == ParticipantRole::Initiator,
                    });
                    let want = if !own {
                        None
                    } else {
                        let renegotiate = expected.peer_present;
                        expected.peer_present = true;
                        expected.occupant_count = count;
                        expected.role = Some(role);
                        Some(RoomEvent::PeerJoined {
                            room_id: ours.clone(),
                            peer_tag: Some(PartyTag::new("patient")),
                            role,
                            occupant_count: count,
                            should_initiate: role == ParticipantRole::Initiator,
                            renegotiate,
                        })
                    };
                    prop_assert_eq!(got, want);
                }
                Frame::Left { ours: own, count } => {
                    let got = membership.handle(&ChannelEvent::PeerLeft {
                        room_id: room(own),
                        occupant_count: count,
                    });
                    let want = if !own {
                        None
                    } else {
                        expected.occupant_count = count;
                        if expected.peer_present && count < 2 {
                            expected.peer_present = false;
                            Some(RoomEvent::PeerLeft {
                                room_id: ours.clone(),
                                occupant_count: count,
                            })
                        } else {
                            None
                        }
                    };
                    prop_assert_eq!(got, want);
                }
                Frame::Lost => {
                    prop_assert_eq!(membership.handle(&ChannelEvent::ChannelLost), None);
                }
                Frame::Rejoin => {
                    membership.rejoin(&AcceptAll).unwrap();
                    expected.acknowledged = false;
                }
            }

            prop_assert_eq!(membership.peer_present(), expected.peer_present);
            prop_assert_eq!(membership.occupant_count(), expected.occupant_count);
            prop_assert_eq!(membership.role(), expected.role);
            prop_assert_eq!(membership.room_id(), Some(&ours));
        }
    }
}
