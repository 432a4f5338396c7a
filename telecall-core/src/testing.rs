//! In-process test doubles
//!
//! - [`MemoryRelay`]: a relay implementing the room and role rules in memory
//! - [`MockNetwork`] / [`MockPeerFactory`]: linked fake peer connections
//! - [`ScriptedMediaSource`]: media source with configurable devices that
//!   remembers every track it handed out
//!
//! Compiled for unit tests and behind the `test-utils` feature.

use crate::media::{LocalMediaBundle, LocalTrack, MediaError, MediaSource, RemoteTrack};
use crate::peer::{PeerBackend, PeerError, PeerEvent, PeerFactory};
use crate::protocol::{ClientMessage, RelayMessage};
use crate::signaling::{RelayConnection, SignalingTransport};
use crate::transport::TransportError;
use crate::types::{
    ClientId, EventSink, IceCandidate, MediaConstraints, MediaKind, NegotiationMessage,
    ParticipantRole, PartyTag, PeerConnectionState, RoomId, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// Memory relay
// ============================================================================

#[derive(Debug, Clone)]
struct Occupant {
    client_id: ClientId,
    tag: PartyTag,
    conn: u64,
}

#[derive(Default)]
struct RelayState {
    rooms: HashMap<RoomId, Vec<Occupant>>,
    connections: HashMap<u64, (Option<ClientId>, mpsc::UnboundedSender<RelayMessage>)>,
    next_conn: u64,
    glare: bool,
    echo: bool,
    refuse: bool,
    frames: Vec<ClientMessage>,
    connects: usize,
}

impl RelayState {
    fn deliver(&self, conn: u64, frame: RelayMessage) {
        if let Some((_, tx)) = self.connections.get(&conn) {
            let _ = tx.send(frame);
        }
    }

    fn announce_pair(&self, room_id: &RoomId) {
        let Some(occupants) = self.rooms.get(room_id) else {
            return;
        };
        let (Some(first), Some(second)) = (occupants.first(), occupants.get(1)) else {
            return;
        };
        let count = occupants.len();
        self.deliver(
            first.conn,
            RelayMessage::PeerJoined {
                room_id: room_id.clone(),
                peer_tag: Some(second.tag.clone()),
                role: ParticipantRole::Initiator,
                occupant_count: count,
                should_initiate: true,
            },
        );
        self.deliver(
            second.conn,
            RelayMessage::PeerJoined {
                room_id: room_id.clone(),
                peer_tag: Some(first.tag.clone()),
                role: ParticipantRole::Responder,
                occupant_count: count,
                should_initiate: self.glare,
            },
        );
    }

    fn forward(&self, room_id: &RoomId, from: &ClientId, frame: RelayMessage) {
        let Some(occupants) = self.rooms.get(room_id) else {
            return;
        };
        for occupant in occupants {
            if occupant.client_id != *from || self.echo {
                self.deliver(occupant.conn, frame.clone());
            }
        }
    }

    fn remove_occupant(&mut self, room_id: &RoomId, predicate: impl Fn(&Occupant) -> bool) {
        let Some(occupants) = self.rooms.get_mut(room_id) else {
            return;
        };
        let before = occupants.len();
        occupants.retain(|o| !predicate(o));
        if occupants.len() == before {
            return;
        }
        let remaining: Vec<u64> = occupants.iter().map(|o| o.conn).collect();
        let count = remaining.len();
        if count == 0 {
            self.rooms.remove(room_id);
            return;
        }
        for conn in remaining {
            self.deliver(
                conn,
                RelayMessage::PeerLeft {
                    room_id: room_id.clone(),
                    occupant_count: count,
                },
            );
        }
    }

    fn handle(&mut self, conn: u64, frame: ClientMessage) {
        self.frames.push(frame.clone());
        match frame {
            ClientMessage::Join {
                room_id,
                client_id,
                tag,
            } => {
                if let Some((owner, _)) = self.connections.get_mut(&conn) {
                    *owner = Some(client_id.clone());
                }
                let occupants = self.rooms.entry(room_id.clone()).or_default();
                let full = occupants.len() >= 2;
                let existing = occupants.iter_mut().find(|o| o.client_id == client_id);
                let present = match existing {
                    Some(occupant) => {
                        occupant.conn = conn;
                        occupant.tag = tag;
                        true
                    }
                    None if full => {
                        self.deliver(
                            conn,
                            RelayMessage::Error {
                                message: format!("room {room_id} is full"),
                            },
                        );
                        return;
                    }
                    None => {
                        occupants.push(Occupant {
                            client_id,
                            tag,
                            conn,
                        });
                        false
                    }
                };
                let occupants = self.rooms.get(&room_id).cloned().unwrap_or_default();
                self.deliver(
                    conn,
                    RelayMessage::RoomStatus {
                        room_id: room_id.clone(),
                        occupant_count: occupants.len(),
                        occupants: occupants.iter().map(|o| o.tag.clone()).collect(),
                    },
                );
                if occupants.len() == 2 {
                    tracing::trace!(room_id = %room_id, refreshed = present, "Announcing pair");
                    self.announce_pair(&room_id);
                }
            }
            ClientMessage::Leave { room_id, client_id } => {
                self.remove_occupant(&room_id, |o| o.client_id == client_id);
            }
            ClientMessage::Signal {
                room_id,
                from,
                message,
                ..
            } => {
                let frame = RelayMessage::Signal {
                    room_id: room_id.clone(),
                    from: from.clone(),
                    message,
                };
                self.forward(&room_id, &from, frame);
            }
            ClientMessage::Chat {
                room_id,
                from,
                text,
                sender_role,
            } => {
                let frame = RelayMessage::Chat {
                    room_id: room_id.clone(),
                    from: from.clone(),
                    text,
                    sender_role,
                };
                self.forward(&room_id, &from, frame);
            }
            ClientMessage::ToggleMedia {
                room_id,
                from,
                kind,
                enabled,
            } => {
                let frame = RelayMessage::RemoteMediaToggle {
                    room_id: room_id.clone(),
                    from: from.clone(),
                    kind,
                    enabled,
                };
                self.forward(&room_id, &from, frame);
            }
        }
    }

    fn disconnect(&mut self, conn: u64) {
        if self.connections.remove(&conn).is_none() {
            return;
        }
        let rooms: Vec<RoomId> = self.rooms.keys().cloned().collect();
        for room_id in rooms {
            self.remove_occupant(&room_id, |o| o.conn == conn);
        }
    }
}

/// Relay living in process memory
///
/// Implements the two-party room rules: the earlier occupant of a full room
/// is told to initiate, the newcomer to respond. A join from a present
/// client refreshes its membership and re-announces the pair. Dropped
/// connections leave their rooms.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tell both occupants to initiate (simulates a duplicate-event relay bug)
    pub fn set_glare(&self, glare: bool) {
        self.state.lock().glare = glare;
    }

    /// Echo relayed frames back to their sender
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Refuse new connections
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Drop every connection of `client_id`, as if the network failed
    pub fn drop_client(&self, client_id: &ClientId) {
        let mut state = self.state.lock();
        let conns: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, (owner, _))| owner.as_ref() == Some(client_id))
            .map(|(conn, _)| *conn)
            .collect();
        for conn in conns {
            state.disconnect(conn);
        }
    }

    /// Deliver an arbitrary frame to `client_id`
    pub fn inject(&self, client_id: &ClientId, frame: RelayMessage) {
        let state = self.state.lock();
        for (owner, tx) in state.connections.values() {
            if owner.as_ref() == Some(client_id) {
                let _ = tx.send(frame.clone());
            }
        }
    }

    /// Every frame received so far, in order
    #[must_use]
    pub fn frames(&self) -> Vec<ClientMessage> {
        self.state.lock().frames.clone()
    }

    /// Negotiation payloads signalled by `client_id`, in order
    #[must_use]
    pub fn signals_from(&self, client_id: &ClientId) -> Vec<NegotiationMessage> {
        self.state
            .lock()
            .frames
            .iter()
            .filter_map(|f| match f {
                ClientMessage::Signal { from, message, .. } if from == client_id => {
                    Some(message.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Current occupants of `room_id`
    #[must_use]
    pub fn occupants(&self, room_id: &RoomId) -> usize {
        self.state.lock().rooms.get(room_id).map_or(0, Vec::len)
    }

    /// Successful connections accepted so far
    #[must_use]
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }
}

#[async_trait]
impl SignalingTransport for MemoryRelay {
    async fn connect(&self) -> Result<Box<dyn RelayConnection>, TransportError> {
        let mut state = self.state.lock();
        if state.refuse {
            return Err(TransportError::ConnectionError(
                "relay refused connection".to_string(),
            ));
        }
        let conn = state.next_conn;
        state.next_conn += 1;
        state.connects += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(conn, (None, tx));
        Ok(Box::new(MemoryConnection {
            conn,
            relay: self.state.clone(),
            inbound: rx,
        }))
    }
}

struct MemoryConnection {
    conn: u64,
    relay: Arc<Mutex<RelayState>>,
    inbound: mpsc::UnboundedReceiver<RelayMessage>,
}

#[async_trait]
impl RelayConnection for MemoryConnection {
    async fn send(&mut self, frame: ClientMessage) -> Result<(), TransportError> {
        let mut state = self.relay.lock();
        if !state.connections.contains_key(&self.conn) {
            return Err(TransportError::SendError("connection dropped".to_string()));
        }
        state.handle(self.conn, frame);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<RelayMessage>, TransportError> {
        Ok(self.inbound.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.relay.lock().disconnect(self.conn);
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.relay.lock().disconnect(self.conn);
    }
}

// ============================================================================
// Mock peers
// ============================================================================

#[derive(Default)]
struct NetworkState {
    peers: Vec<Arc<MockPeer>>,
    fail_connections: bool,
}

/// Fabric linking [`MockPeer`]s
///
/// Descriptions have the form `mock:<peer>:<kinds>:<chat>`. Two peers connect
/// once each has applied a local description and the other's remote one.
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
    link: Arc<Mutex<()>>,
}

impl MockNetwork {
    /// Peer created `index`-th on this network
    #[must_use]
    pub fn peer(&self, index: usize) -> Option<Arc<MockPeer>> {
        self.state.lock().peers.get(index).cloned()
    }

    /// All peers created so far
    #[must_use]
    pub fn peers(&self) -> Vec<Arc<MockPeer>> {
        self.state.lock().peers.clone()
    }

    /// Make connection attempts fail instead of connecting
    pub fn set_fail_connections(&self, fail: bool) {
        self.state.lock().fail_connections = fail;
    }

    /// Report a connectivity failure on every open connected peer
    pub fn fail_established(&self) {
        for peer in self.peers() {
            let connected = {
                let state = peer.state.lock();
                state.connected && !state.closed
            };
            if connected {
                (peer.sink)(PeerEvent::ConnectionState(PeerConnectionState::Failed));
            }
        }
    }

    fn register(&self, sink: EventSink<PeerEvent>) -> Arc<MockPeer> {
        let mut state = self.state.lock();
        let peer = Arc::new(MockPeer {
            id: state.peers.len() as u64,
            network: self.clone(),
            sink,
            state: Mutex::new(MockPeerState::default()),
        });
        state.peers.push(peer.clone());
        peer
    }

    fn try_link(&self, peer: &MockPeer) {
        let _link = self.link.lock();
        let remote_id = {
            let state = peer.state.lock();
            if !state.ready() {
                return;
            }
            match state.remote_peer {
                Some(id) => id,
                None => return,
            }
        };
        let Some(other) = self.peer(remote_id as usize) else {
            return;
        };
        {
            let state = other.state.lock();
            if !state.ready() || state.remote_peer != Some(peer.id) {
                return;
            }
        }
        let fail = self.state.lock().fail_connections;
        for side in [peer, other.as_ref()] {
            (side.sink)(PeerEvent::ConnectionState(PeerConnectionState::Connecting));
        }
        if fail {
            for side in [peer, other.as_ref()] {
                side.state.lock().failed = true;
                (side.sink)(PeerEvent::ConnectionState(PeerConnectionState::Failed));
            }
            return;
        }

        let (tracks_a, chat_a) = {
            let mut s = peer.state.lock();
            s.connected = true;
            (s.tracks.clone(), s.chat)
        };
        let (tracks_b, chat_b) = {
            let mut s = other.state.lock();
            s.connected = true;
            (s.tracks.clone(), s.chat)
        };
        let chat = chat_a || chat_b;
        for (side, remote_tracks) in [(peer, tracks_b), (other.as_ref(), tracks_a)] {
            for (id, kind) in remote_tracks {
                (side.sink)(PeerEvent::RemoteTrack(RemoteTrack { id, kind }));
            }
            (side.sink)(PeerEvent::ConnectionState(PeerConnectionState::Connected));
            if chat {
                side.state.lock().chat_open = true;
                (side.sink)(PeerEvent::ChannelOpen);
            }
        }
    }
}

#[derive(Default)]
struct MockPeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_peer: Option<u64>,
    tracks: Vec<(String, MediaKind)>,
    chat: bool,
    chat_open: bool,
    connected: bool,
    failed: bool,
    closed: bool,
    applied: Vec<IceCandidate>,
    operations: Vec<String>,
    sent_chat: Vec<String>,
}

impl MockPeerState {
    fn ready(&self) -> bool {
        self.local.is_some() && self.remote.is_some() && !self.connected && !self.closed
    }
}

/// Fake peer connection
pub struct MockPeer {
    id: u64,
    network: MockNetwork,
    sink: EventSink<PeerEvent>,
    state: Mutex<MockPeerState>,
}

impl MockPeer {
    /// Network-wide identifier
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote candidates applied, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Backend calls, in order
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        self.state.lock().operations.clone()
    }

    /// Chat lines sent on the data channel
    #[must_use]
    pub fn sent_chat(&self) -> Vec<String> {
        self.state.lock().sent_chat.clone()
    }

    /// Whether the connection was established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Whether `close` was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let state = self.state.lock();
        let kinds: Vec<String> = state.tracks.iter().map(|(_, k)| k.to_string()).collect();
        let sdp = format!("mock:{}:{}:{}", self.id, kinds.join(","), u8::from(state.chat));
        SessionDescription { kind, sdp }
    }

    fn log(&self, op: &str) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        state.operations.push(op.to_string());
        Ok(())
    }
}

fn parse_mock_sdp(sdp: &str) -> Result<(u64, bool), PeerError> {
    let mut parts = sdp.split(':');
    if parts.next() != Some("mock") {
        return Err(PeerError::InvalidDescription(sdp.to_string()));
    }
    let id = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| PeerError::InvalidDescription(sdp.to_string()))?;
    let chat = parts.nth(1) == Some("1");
    Ok((id, chat))
}

#[async_trait]
impl PeerBackend for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.log("create_offer")?;
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.log("create_answer")?;
        let has_offer = self
            .state
            .lock()
            .remote
            .as_ref()
            .is_some_and(|d| d.kind == SdpKind::Offer);
        if !has_offer {
            return Err(PeerError::Backend("no remote offer".to_string()));
        }
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.log("set_local")?;
        self.state.lock().local = Some(desc);
        (self.sink)(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:mock-{} 1 udp 1 127.0.0.1 9 typ host", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }));
        self.network.try_link(self);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.log("set_remote")?;
        let (remote_id, chat) = parse_mock_sdp(&desc.sdp)?;
        {
            let mut state = self.state.lock();
            state.remote_peer = Some(remote_id);
            state.chat |= chat;
            state.remote = Some(desc);
        }
        self.network.try_link(self);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.log("add_candidate")?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(PeerError::Backend("remote description not set".to_string()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn wait_for_gathering(&self) -> Result<(), PeerError> {
        self.log("wait_for_gathering")
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.log("add_track")?;
        self.state
            .lock()
            .tracks
            .push((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn create_chat_channel(&self, _label: &str) -> Result<(), PeerError> {
        self.log("create_chat_channel")?;
        self.state.lock().chat = true;
        Ok(())
    }

    async fn send_chat(&self, text: String) -> Result<(), PeerError> {
        let remote = {
            let mut state = self.state.lock();
            if !state.chat_open || state.closed {
                return Err(PeerError::ChannelNotOpen);
            }
            state.sent_chat.push(text.clone());
            state.remote_peer
        };
        if let Some(other) = remote.and_then(|id| self.network.peer(id as usize)) {
            let open = other.state.lock().chat_open;
            if open {
                (other.sink)(PeerEvent::ChannelMessage(text));
            }
        }
        Ok(())
    }

    async fn close_chat_channel(&self) -> Result<(), PeerError> {
        self.state.lock().chat_open = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.chat_open = false;
            state.operations.push("close".to_string());
        }
        (self.sink)(PeerEvent::ConnectionState(PeerConnectionState::Closed));
        Ok(())
    }
}

/// Factory producing [`MockPeer`]s on a shared [`MockNetwork`]
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    network: MockNetwork,
}

impl MockPeerFactory {
    /// Factory on `network`
    #[must_use]
    pub fn new(network: MockNetwork) -> Self {
        Self { network }
    }

    /// Underlying network
    #[must_use]
    pub fn network(&self) -> &MockNetwork {
        &self.network
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(&self, sink: EventSink<PeerEvent>) -> Result<Arc<dyn PeerBackend>, PeerError> {
        Ok(self.network.register(sink))
    }
}

// ============================================================================
// Scripted media
// ============================================================================

/// Media source with a fixed set of working devices
///
/// Every track it hands out is kept, so tests can check how often each was
/// stopped.
pub struct ScriptedMediaSource {
    available: MediaConstraints,
    issued: Mutex<Vec<Arc<LocalTrack>>>,
    acquisitions: Mutex<usize>,
}

impl ScriptedMediaSource {
    /// Source with `available` devices working
    #[must_use]
    pub fn new(available: MediaConstraints) -> Self {
        Self {
            available,
            issued: Mutex::new(Vec::new()),
            acquisitions: Mutex::new(0),
        }
    }

    /// Tracks handed out so far, in order
    #[must_use]
    pub fn issued_tracks(&self) -> Vec<Arc<LocalTrack>> {
        self.issued.lock().clone()
    }

    /// Successful acquisitions so far
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        *self.acquisitions.lock()
    }
}

impl Default for ScriptedMediaSource {
    fn default() -> Self {
        Self::new(MediaConstraints::video_call())
    }
}

#[async_trait]
impl MediaSource for ScriptedMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaBundle, MediaError> {
        if constraints.video && !self.available.video {
            return Err(MediaError::DeviceNotFound("camera".to_string()));
        }
        if constraints.audio && !self.available.audio {
            return Err(MediaError::DeviceNotFound("microphone".to_string()));
        }
        let tracks: Vec<Arc<LocalTrack>> = constraints
            .to_media_kinds()
            .into_iter()
            .map(|kind| Arc::new(LocalTrack::new(kind)))
            .collect();
        self.issued.lock().extend(tracks.iter().cloned());
        *self.acquisitions.lock() += 1;
        Ok(LocalMediaBundle::new(tracks))
    }
}
