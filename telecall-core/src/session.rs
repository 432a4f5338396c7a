//! Call session orchestration
//!
//! A [`CallSession`] is a single actor task owning everything about one call:
//! the signaling channel, room membership, the current [`Negotiator`] and the
//! local media bundle. Relay traffic, peer callbacks and UI commands are all
//! funnelled into one queue and handled strictly in order, so no state is
//! shared with the event sources.
//!
//! The UI talks to the actor through a cloneable [`CallHandle`]. State is
//! published as a [`SessionSnapshot`] on a `watch` channel, and discrete
//! [`CallEvent`]s on a `broadcast` channel. Dropping every handle ends the call.
//!
//! # Recovery
//!
//! A peer that leaves, restarts, or whose connection fails sends the session
//! through `Reconnecting`: the negotiator is torn down, local tracks are
//! stopped, fresh media is acquired and the session waits in `AwaitingPeer`
//! for the relay to pair it again. Connection failures count against
//! [`RecoveryConfig::max_peer_reconnects`](crate::config::RecoveryConfig);
//! departures do not.

use crate::cleanup::{CleanupLatch, CleanupReport, CleanupRunner};
use crate::config::{CallConfig, PendingChatPolicy};
use crate::media::{
    acquire_with_fallback, AcquiredMedia, LocalMediaBundle, MediaSource, RemoteMediaBundle,
};
use crate::negotiator::{NegotiationError, Negotiator, NegotiatorEvent};
use crate::peer::PeerFactory;
use crate::protocol::ClientMessage;
use crate::room::{RoomError, RoomEvent, RoomMembership};
use crate::signaling::{
    ChannelEvent, ChannelStatus, ConnectError, SendError, SignalingChannel, SignalingTransport,
};
use crate::types::{
    ChatEnvelope, ChatMessage, ChatOrigin, ChatTransport, ClientId, EventSink, IceCandidate,
    MediaConstraints, MediaKind, NegotiationMessage, ParticipantRole, PartyTag,
    PeerConnectionState, RoomId, SessionDescription, SessionState,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::Instrument;

/// Diagnostics kept in the snapshot
const MAX_DIAGNOSTICS: usize = 64;

/// Call session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// A room is already joined
    #[error("Already joined room: {0}")]
    AlreadyJoined(RoomId),

    /// Operation needs a joined room
    #[error("Not joined to any room")]
    NotJoined,

    /// The session has ended
    #[error("Call session closed")]
    Closed,

    /// Relay reconnection attempts exhausted
    #[error("Signaling channel lost")]
    ChannelLost,

    /// Peer recovery attempts exhausted
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// Internal invariant broken; ends the call
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Rejected command argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Negotiation step failed; handled by the recovery path
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Relay connection could not be opened
    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),

    /// Frame could not be sent
    #[error("Send failed: {0}")]
    Send(#[from] SendError),
}

impl From<RoomError> for SessionError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::AlreadyJoined(room) => Self::AlreadyJoined(room),
            RoomError::NotJoined => Self::NotJoined,
            RoomError::Send(e) => Self::Send(e),
        }
    }
}

/// Severity of a [`Diagnostic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    /// Informational
    Info,
    /// Recoverable anomaly
    Warning,
    /// Fatal condition
    Error,
}

/// Timestamped note surfaced to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// When it was recorded
    pub at: DateTime<Utc>,
    /// Severity
    pub level: DiagnosticLevel,
    /// Text
    pub message: String,
}

/// Everything the UI renders, published after every handled input
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Joined room
    pub room_id: Option<RoomId>,
    /// Session state
    pub state: SessionState,
    /// Role last assigned by the relay
    pub role: Option<ParticipantRole>,
    /// Relay channel status, once connected
    pub channel_status: Option<ChannelStatus>,
    /// Occupants last reported by the relay
    pub occupant_count: usize,
    /// Media actually acquired
    pub local_media: MediaConstraints,
    /// Local microphone sending
    pub local_audio_enabled: bool,
    /// Local camera sending
    pub local_video_enabled: bool,
    /// Remote tracks of the current connection
    pub remote_media: Option<RemoteMediaBundle>,
    /// Peer reported its microphone on
    pub remote_audio_enabled: bool,
    /// Peer reported its camera on
    pub remote_video_enabled: bool,
    /// Chat data channel open
    pub chat_channel_open: bool,
    /// Chat history, oldest first
    pub chat_messages: Vec<ChatMessage>,
    /// Recent diagnostics, oldest first
    pub diagnostics: VecDeque<Diagnostic>,
    /// Fatal error that ended the call
    pub last_error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            room_id: None,
            state: SessionState::Idle,
            role: None,
            channel_status: None,
            occupant_count: 0,
            local_media: MediaConstraints::data_only(),
            local_audio_enabled: false,
            local_video_enabled: false,
            remote_media: None,
            remote_audio_enabled: true,
            remote_video_enabled: true,
            chat_channel_open: false,
            chat_messages: Vec::new(),
            diagnostics: VecDeque::new(),
            last_error: None,
        }
    }
}

/// Discrete session events
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Session state changed
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// The relay assigned a negotiation role
    RoleAssigned(ParticipantRole),
    /// Remote tracks changed
    RemoteMediaAvailable(RemoteMediaBundle),
    /// Peer toggled a track
    RemoteMediaToggled {
        /// Track kind
        kind: MediaKind,
        /// New enabled flag
        enabled: bool,
    },
    /// Chat sent or received
    Chat(ChatMessage),
    /// Relay channel status changed
    ChannelStatus(ChannelStatus),
    /// Diagnostic recorded
    Diagnostic(Diagnostic),
    /// The call ended on a fatal error; resources are already released
    Failed(String),
}

/// Collaborators a session is built from
#[derive(Clone)]
pub struct CallDependencies {
    /// Relay transport
    pub transport: Arc<dyn SignalingTransport>,
    /// Peer connection factory
    pub peers: Arc<dyn PeerFactory>,
    /// Local media source
    pub media: Arc<dyn MediaSource>,
}

enum Command {
    Join {
        room_id: RoomId,
        tag: PartyTag,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    ToggleMedia {
        kind: MediaKind,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },
    SendChat {
        text: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
}

enum SessionInput {
    Command(Command),
    Channel(ChannelEvent),
    Negotiator { generation: u64, event: NegotiatorEvent },
}

/// Command surface of a running session
#[derive(Clone)]
pub struct CallHandle {
    client_id: ClientId,
    inbox: mpsc::UnboundedSender<SessionInput>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    /// Identity presented to the relay
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, SessionError>>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.inbox
            .send(SessionInput::Command(command(reply)))
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Connect to the relay, acquire media and join `room_id` as `tag`
    ///
    /// # Errors
    ///
    /// Returns error if a room is already joined, the session is closed, or
    /// the relay cannot be reached. A failed join leaves the session idle.
    pub async fn join_room(&self, room_id: RoomId, tag: PartyTag) -> Result<(), SessionError> {
        self.request(|reply| Command::Join {
            room_id,
            tag,
            reply,
        })
        .await
    }

    /// End the call and release every resource
    ///
    /// Safe from any state and safe to repeat.
    pub async fn end_call(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .inbox
            .send(SessionInput::Command(Command::EndCall { reply }))
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Flip the local camera; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns error if no room is joined or there is no camera track
    pub async fn toggle_local_video(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleMedia {
            kind: MediaKind::Video,
            reply,
        })
        .await
    }

    /// Flip the local microphone; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns error if no room is joined or there is no microphone track
    pub async fn toggle_local_audio(&self) -> Result<bool, SessionError> {
        self.request(|reply| Command::ToggleMedia {
            kind: MediaKind::Audio,
            reply,
        })
        .await
    }

    /// Send a chat line to the peer
    ///
    /// # Errors
    ///
    /// Returns error if no room is joined, the text is empty or too long, or
    /// the relay fallback cannot be reached
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), SessionError> {
        let text = text.into();
        self.request(|reply| Command::SendChat { text, reply }).await
    }

    /// Watch the session snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Receive discrete session events from now on
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the published snapshot shows `state`
    ///
    /// Short-lived states may be skipped by the snapshot; use
    /// [`CallHandle::events`] to observe every transition.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Closed`] if the session ends first
    pub async fn wait_for_state(&self, state: SessionState) -> Result<(), SessionError> {
        let mut snapshot = self.snapshot.clone();
        snapshot
            .wait_for(|s| s.state == state)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }
}

#[derive(Debug, Clone, Copy)]
struct MediaPreferences {
    audio: bool,
    video: bool,
}

impl MediaPreferences {
    fn get(self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    fn set(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio = enabled,
            MediaKind::Video => self.video = enabled,
        }
    }
}

/// Call session actor
pub struct CallSession {
    config: CallConfig,
    deps: CallDependencies,
    client_id: ClientId,
    inbox: mpsc::UnboundedReceiver<SessionInput>,
    feedback: mpsc::WeakUnboundedSender<SessionInput>,
    state: SessionState,
    channel: Option<SignalingChannel>,
    room: RoomMembership,
    negotiator: Option<Negotiator>,
    generation: u64,
    media: Option<Arc<LocalMediaBundle>>,
    preferences: MediaPreferences,
    early_candidates: Vec<IceCandidate>,
    queued_chat: VecDeque<ChatEnvelope>,
    peer_failures: u32,
    latch: CleanupLatch,
    view: SessionSnapshot,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallSession {
    /// Start a session with a random client identity
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn(config: CallConfig, deps: CallDependencies) -> CallHandle {
        Self::spawn_with_id(config, deps, ClientId::random())
    }

    /// Start a session presenting `client_id` to the relay
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn_with_id(
        config: CallConfig,
        deps: CallDependencies,
        client_id: ClientId,
    ) -> CallHandle {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let session = Self {
            room: RoomMembership::new(client_id.clone()),
            config,
            deps,
            client_id: client_id.clone(),
            inbox: inbox_rx,
            feedback: inbox_tx.downgrade(),
            state: SessionState::Idle,
            channel: None,
            negotiator: None,
            generation: 0,
            media: None,
            preferences: MediaPreferences {
                audio: true,
                video: true,
            },
            early_candidates: Vec::new(),
            queued_chat: VecDeque::new(),
            peer_failures: 0,
            latch: CleanupLatch::new(),
            view: SessionSnapshot::default(),
            snapshot: snapshot_tx,
            events: events_tx.clone(),
        };
        let span = tracing::info_span!("call_session", client_id = %client_id);
        tokio::spawn(session.run().instrument(span));

        CallHandle {
            client_id,
            inbox: inbox_tx,
            snapshot: snapshot_rx,
            events: events_tx,
        }
    }

    async fn run(mut self) {
        tracing::debug!("Call session started");
        while let Some(input) = self.inbox.recv().await {
            match input {
                SessionInput::Command(command) => self.on_command(command).await,
                SessionInput::Channel(event) => {
                    let result = self.on_channel_event(event).await;
                    self.settle(result).await;
                }
                SessionInput::Negotiator { generation, event } => {
                    let result = self.on_negotiator_event(generation, event).await;
                    self.settle(result).await;
                }
            }
            self.publish();
            if self.state == SessionState::Closed {
                break;
            }
        }
        if self.state != SessionState::Closed {
            tracing::info!("All call handles dropped, ending call");
            self.shutdown(None).await;
            self.publish();
        }
        tracing::debug!("Call session finished");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Join {
                room_id,
                tag,
                reply,
            } => {
                let result = self.join(room_id, tag).await;
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                if self.state != SessionState::Closed {
                    tracing::info!(state = ?self.state, "Ending call");
                }
                self.shutdown(None).await;
                let _ = reply.send(());
            }
            Command::ToggleMedia { kind, reply } => {
                let _ = reply.send(self.toggle_media(kind));
            }
            Command::SendChat { text, reply } => {
                let result = self.send_chat(text).await;
                let _ = reply.send(result);
            }
        }
    }

    #[tracing::instrument(skip(self), fields(room_id = %room_id, tag = %tag))]
    async fn join(&mut self, room_id: RoomId, tag: PartyTag) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Closed => return Err(SessionError::Closed),
            _ => {
                let current = self.room.room_id().cloned().unwrap_or(room_id);
                return Err(SessionError::AlreadyJoined(current));
            }
        }

        let channel = SignalingChannel::connect(
            self.deps.transport.clone(),
            self.client_id.clone(),
            self.config.signaling.reconnect.clone(),
            self.channel_sink(),
        )
        .await?;
        self.set_channel_status(channel.status());

        let acquired = acquire_with_fallback(self.deps.media.as_ref(), &self.config.media).await;
        self.install_media(acquired);

        if let Err(e) = self.room.join(&channel, room_id.clone(), tag) {
            tracing::warn!(error = %e, "Join failed, releasing resources");
            channel.disconnect().await;
            if let Some(media) = self.media.take() {
                media.stop_all();
            }
            self.set_channel_status(ChannelStatus::Closed);
            return Err(e.into());
        }

        self.channel = Some(channel);
        self.view.room_id = Some(room_id);
        self.transition(SessionState::AwaitingPeer)?;
        tracing::info!("Joined room, waiting for peer");
        Ok(())
    }

    fn toggle_media(&mut self, kind: MediaKind) -> Result<bool, SessionError> {
        match self.state {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Idle => return Err(SessionError::NotJoined),
            _ => {}
        }
        let media = self.media.as_ref().ok_or(SessionError::NotJoined)?;
        let enabled = media
            .toggle(kind)
            .ok_or_else(|| SessionError::InvalidInput(format!("no local {kind} track")))?;
        self.preferences.set(kind, enabled);
        match kind {
            MediaKind::Audio => self.view.local_audio_enabled = enabled,
            MediaKind::Video => self.view.local_video_enabled = enabled,
        }
        tracing::debug!(kind = %kind, enabled, "Local media toggled");

        if let (Some(channel), Some(room_id)) = (&self.channel, self.room.room_id()) {
            let frame = ClientMessage::ToggleMedia {
                room_id: room_id.clone(),
                from: self.client_id.clone(),
                kind,
                enabled,
            };
            if let Err(e) = channel.send_frame(frame) {
                tracing::debug!(error = %e, "Media toggle not relayed");
            }
        }
        Ok(enabled)
    }

    async fn send_chat(&mut self, text: String) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Idle => return Err(SessionError::NotJoined),
            _ => {}
        }
        if text.trim().is_empty() {
            return Err(SessionError::InvalidInput("empty chat message".to_string()));
        }
        if text.len() > self.config.chat.max_message_len {
            return Err(SessionError::InvalidInput(format!(
                "chat message exceeds {} bytes",
                self.config.chat.max_message_len
            )));
        }
        let envelope = ChatEnvelope {
            text,
            sender_role: self.room.role(),
            timestamp: Utc::now(),
        };

        if self.view.chat_channel_open {
            match self.send_over_channel(&envelope).await {
                Ok(()) => {
                    self.record_chat(envelope, ChatOrigin::Local, ChatTransport::DataChannel);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Chat channel send failed, using pending policy");
                }
            }
        }

        match self.config.chat.pending_policy {
            PendingChatPolicy::SendViaRelay => {
                let channel = self.channel.as_ref().ok_or(SessionError::NotJoined)?;
                let room_id = self.room.room_id().ok_or(SessionError::NotJoined)?;
                channel.send_frame(ClientMessage::Chat {
                    room_id: room_id.clone(),
                    from: self.client_id.clone(),
                    text: envelope.text.clone(),
                    sender_role: envelope.sender_role,
                })?;
                self.record_chat(envelope, ChatOrigin::Local, ChatTransport::Relay);
            }
            PendingChatPolicy::QueueForChannel => {
                tracing::debug!(queued = self.queued_chat.len() + 1, "Chat queued for data channel");
                self.queued_chat.push_back(envelope);
            }
        }
        Ok(())
    }

    async fn send_over_channel(&self, envelope: &ChatEnvelope) -> Result<(), SessionError> {
        let negotiator = self.negotiator.as_ref().ok_or(SessionError::NotJoined)?;
        let payload = serde_json::to_string(envelope)
            .map_err(|e| SessionError::InvalidInput(e.to_string()))?;
        negotiator.send_chat(payload).await?;
        Ok(())
    }

    async fn flush_queued_chat(&mut self) {
        while let Some(envelope) = self.queued_chat.pop_front() {
            if let Err(e) = self.send_over_channel(&envelope).await {
                tracing::warn!(error = %e, "Queued chat flush interrupted");
                self.queued_chat.push_front(envelope);
                return;
            }
            self.record_chat(envelope, ChatOrigin::Local, ChatTransport::DataChannel);
        }
    }

    // ------------------------------------------------------------------
    // Relay events
    // ------------------------------------------------------------------

    async fn on_channel_event(&mut self, event: ChannelEvent) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Closed | SessionState::Idle) {
            tracing::trace!(?event, "Ignoring channel event outside a call");
            return Ok(());
        }
        match event {
            ChannelEvent::Degraded { attempt, retry_in } => {
                self.set_channel_status(ChannelStatus::Degraded { attempt });
                self.diagnose(
                    DiagnosticLevel::Warning,
                    format!(
                        "relay connection lost, retry {} in {} ms",
                        attempt + 1,
                        retry_in.as_millis()
                    ),
                );
                Ok(())
            }
            ChannelEvent::Reconnected => {
                self.set_channel_status(ChannelStatus::Connected);
                self.diagnose(DiagnosticLevel::Info, "relay connection restored".to_string());
                if self.state == SessionState::Negotiating {
                    // signals sent while the relay was down are gone
                    self.recycle().await?;
                }
                if let Some(channel) = &self.channel {
                    if let Err(e) = self.room.rejoin(channel) {
                        tracing::warn!(error = %e, "Rejoin after relay reconnect failed");
                    }
                }
                Ok(())
            }
            ChannelEvent::ChannelLost => {
                self.set_channel_status(ChannelStatus::Lost);
                Err(SessionError::ChannelLost)
            }
            ChannelEvent::RelayError(message) => {
                tracing::warn!(message = %message, "Relay reported an error");
                self.diagnose(DiagnosticLevel::Warning, format!("relay error: {message}"));
                Ok(())
            }
            ChannelEvent::Chat {
                room_id,
                text,
                sender_role,
            } => {
                if self.is_current_room(&room_id) {
                    let envelope = ChatEnvelope {
                        text,
                        sender_role,
                        timestamp: Utc::now(),
                    };
                    self.record_chat(envelope, ChatOrigin::Remote, ChatTransport::Relay);
                }
                Ok(())
            }
            ChannelEvent::RemoteMediaToggle {
                room_id,
                kind,
                enabled,
            } => {
                if self.is_current_room(&room_id) {
                    match kind {
                        MediaKind::Audio => self.view.remote_audio_enabled = enabled,
                        MediaKind::Video => self.view.remote_video_enabled = enabled,
                    }
                    self.emit(CallEvent::RemoteMediaToggled { kind, enabled });
                }
                Ok(())
            }
            ChannelEvent::MessageReceived { room_id, message } => {
                if !self.is_current_room(&room_id) {
                    tracing::debug!(room_id = %room_id, "Signal for another room ignored");
                    return Ok(());
                }
                self.on_signal(message).await
            }
            ChannelEvent::RoomStatus {
                ref room_id,
                occupant_count,
                ..
            } => {
                if self.is_current_room(room_id) {
                    self.diagnose(
                        DiagnosticLevel::Info,
                        format!("room {room_id}: {occupant_count} occupant(s)"),
                    );
                }
                self.on_membership(&event).await
            }
            ChannelEvent::PeerJoined { .. } | ChannelEvent::PeerLeft { .. } => {
                self.on_membership(&event).await
            }
        }
    }

    async fn on_membership(&mut self, event: &ChannelEvent) -> Result<(), SessionError> {
        let Some(room_event) = self.room.handle(event) else {
            return Ok(());
        };
        self.view.occupant_count = self.room.occupant_count();
        match room_event {
            RoomEvent::Joined {
                is_first_occupant,
                occupant_count,
                ..
            } => {
                tracing::info!(is_first_occupant, occupant_count, "Room join acknowledged");
                Ok(())
            }
            RoomEvent::PeerJoined {
                role,
                should_initiate,
                renegotiate,
                ..
            } => {
                tracing::info!(role = ?role, should_initiate, renegotiate, "Peer present");
                self.view.role = Some(role);
                self.emit(CallEvent::RoleAssigned(role));
                if self.state.has_negotiation() {
                    // the relay only re-pairs after the peer restarted
                    self.recycle().await?;
                }
                if should_initiate && self.state == SessionState::AwaitingPeer {
                    self.start_offer().await?;
                }
                Ok(())
            }
            RoomEvent::PeerLeft { occupant_count, .. } => {
                tracing::info!(occupant_count, "Peer left");
                self.diagnose(DiagnosticLevel::Info, "peer left the room".to_string());
                if self.state.has_negotiation() {
                    self.recycle().await?;
                }
                Ok(())
            }
        }
    }

    async fn on_signal(&mut self, message: NegotiationMessage) -> Result<(), SessionError> {
        tracing::debug!(kind = message.kind_name(), state = ?self.state, "Signal received");
        match message {
            NegotiationMessage::Offer { sdp } => self.on_remote_offer(SessionDescription::offer(sdp)).await,
            NegotiationMessage::Answer { sdp } => {
                let Some(negotiator) = self.negotiator.as_mut() else {
                    self.diagnose(
                        DiagnosticLevel::Warning,
                        "answer received without a pending offer".to_string(),
                    );
                    return Ok(());
                };
                match negotiator.accept_answer(SessionDescription::answer(sdp)).await {
                    Ok(()) => Ok(()),
                    Err(NegotiationError::InvalidState(reason)) => {
                        tracing::warn!(reason = %reason, "Answer ignored");
                        self.diagnose(DiagnosticLevel::Warning, format!("answer ignored: {reason}"));
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            NegotiationMessage::Candidate { candidate } => {
                match self.negotiator.as_mut() {
                    Some(negotiator) => negotiator.add_remote_candidate(candidate).await,
                    None => {
                        tracing::trace!("Buffering candidate until negotiation starts");
                        self.early_candidates.push(candidate);
                    }
                }
                Ok(())
            }
        }
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) -> Result<(), SessionError> {
        match self.state {
            SessionState::AwaitingPeer => {}
            SessionState::Negotiating => {
                let pending = self
                    .negotiator
                    .as_ref()
                    .is_some_and(Negotiator::has_pending_offer);
                if pending {
                    if self.room.role() != Some(ParticipantRole::Responder) {
                        tracing::warn!("Protocol anomaly: offer collided with our own as initiator, keeping ours");
                        self.diagnose(
                            DiagnosticLevel::Warning,
                            "glare: ignored remote offer, keeping local offer as initiator"
                                .to_string(),
                        );
                        return Ok(());
                    }
                    tracing::info!("Glare: abandoning local offer as responder");
                    self.diagnose(
                        DiagnosticLevel::Info,
                        "glare: abandoned local offer, answering remote offer".to_string(),
                    );
                    self.abandon_negotiator().await;
                } else {
                    self.recycle().await?;
                }
            }
            SessionState::Connected => {
                tracing::info!("Offer while connected, peer restarted");
                self.recycle().await?;
            }
            SessionState::Idle | SessionState::Reconnecting | SessionState::Closed => {
                self.diagnose(
                    DiagnosticLevel::Warning,
                    format!("offer ignored in state {:?}", self.state),
                );
                return Ok(());
            }
        }

        self.fresh_negotiator().await?;
        self.transition(SessionState::Negotiating)?;
        self.negotiator_mut()?.accept_offer(offer).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Negotiator events
    // ------------------------------------------------------------------

    async fn on_negotiator_event(
        &mut self,
        generation: u64,
        event: NegotiatorEvent,
    ) -> Result<(), SessionError> {
        if generation != self.generation
            || self.negotiator.is_none()
            || self.state == SessionState::Closed
        {
            tracing::trace!(generation, current = self.generation, "Dropping stale negotiator event");
            return Ok(());
        }
        match event {
            NegotiatorEvent::LocalSignal(message) => {
                self.forward_signal(message);
                Ok(())
            }
            NegotiatorEvent::RemoteMediaAvailable(bundle) => {
                tracing::debug!(tracks = bundle.tracks().len(), "Remote media available");
                self.view.remote_media = Some(bundle.clone());
                self.emit(CallEvent::RemoteMediaAvailable(bundle));
                Ok(())
            }
            NegotiatorEvent::ChannelOpen => {
                tracing::debug!("Chat channel open");
                self.view.chat_channel_open = true;
                self.flush_queued_chat().await;
                Ok(())
            }
            NegotiatorEvent::ChannelMessage(payload) => {
                let envelope = serde_json::from_str::<ChatEnvelope>(&payload).unwrap_or_else(|_| {
                    ChatEnvelope {
                        text: payload,
                        sender_role: None,
                        timestamp: Utc::now(),
                    }
                });
                self.record_chat(envelope, ChatOrigin::Remote, ChatTransport::DataChannel);
                Ok(())
            }
            NegotiatorEvent::PeerConnectionState(state) => match state {
                PeerConnectionState::Connected if self.state == SessionState::Negotiating => {
                    self.transition(SessionState::Connected)?;
                    self.peer_failures = 0;
                    tracing::info!("Call connected");
                    Ok(())
                }
                PeerConnectionState::Failed => {
                    self.restart_after_failure("peer connection failed".to_string())
                        .await
                }
                PeerConnectionState::Disconnected => {
                    self.diagnose(
                        DiagnosticLevel::Warning,
                        "peer connection interrupted".to_string(),
                    );
                    Ok(())
                }
                _ => Ok(()),
            },
            NegotiatorEvent::Failed(reason) => self.restart_after_failure(reason).await,
        }
    }

    fn forward_signal(&mut self, message: NegotiationMessage) {
        let (Some(channel), Some(room_id)) = (&self.channel, self.room.room_id()) else {
            return;
        };
        let kind = message.kind_name();
        if let Err(e) = channel.send(room_id, message) {
            tracing::warn!(kind, error = %e, "Signal dropped");
            self.diagnose(
                DiagnosticLevel::Warning,
                format!("{kind} not delivered: {e}"),
            );
        }
    }

    // ------------------------------------------------------------------
    // Negotiation lifecycle
    // ------------------------------------------------------------------

    async fn start_offer(&mut self) -> Result<(), SessionError> {
        self.fresh_negotiator().await?;
        self.transition(SessionState::Negotiating)?;
        self.negotiator_mut()?.create_offer().await?;
        Ok(())
    }

    async fn fresh_negotiator(&mut self) -> Result<(), SessionError> {
        if self.negotiator.is_some() {
            return Err(SessionError::ContractViolation(
                "negotiator already live".to_string(),
            ));
        }
        self.generation += 1;
        let mut negotiator = Negotiator::new(
            self.generation,
            self.deps.peers.as_ref(),
            self.config.negotiation.clone(),
            self.negotiator_sink(self.generation),
        )
        .await?;
        if let Some(media) = &self.media {
            if let Err(e) = negotiator.attach_local_media(media.clone()).await {
                if let Err(close) = negotiator.close_peer().await {
                    tracing::debug!(error = %close, "Closing unattached peer failed");
                }
                return Err(e.into());
            }
        }
        for candidate in std::mem::take(&mut self.early_candidates) {
            negotiator.add_remote_candidate(candidate).await;
        }
        self.negotiator = Some(negotiator);
        Ok(())
    }

    fn negotiator_mut(&mut self) -> Result<&mut Negotiator, SessionError> {
        self.negotiator
            .as_mut()
            .ok_or_else(|| SessionError::ContractViolation("no live negotiator".to_string()))
    }

    /// Drop the current attempt but keep local media
    async fn abandon_negotiator(&mut self) {
        let Some(mut negotiator) = self.negotiator.take() else {
            return;
        };
        self.early_candidates = negotiator.take_pending_candidates();
        let mut runner = CleanupRunner::new();
        runner
            .step("close_chat_channel", negotiator.close_chat_channel())
            .await;
        runner.step("close_peer", negotiator.close_peer()).await;
        self.record_cleanup(runner.finish());
    }

    /// Stop local tracks and destroy the negotiator
    async fn release_negotiation(&mut self) {
        let mut runner = CleanupRunner::new();
        if let Some(media) = self.media.take() {
            runner.step_sync("stop_local_media", || {
                let released = media.stop_all();
                tracing::debug!(released, "Local tracks stopped");
                Ok::<(), Infallible>(())
            });
        }
        if let Some(mut negotiator) = self.negotiator.take() {
            runner
                .step("close_chat_channel", negotiator.close_chat_channel())
                .await;
            runner.step("close_peer", negotiator.close_peer()).await;
        }
        self.early_candidates.clear();
        self.view.chat_channel_open = false;
        self.view.remote_media = None;
        self.record_cleanup(runner.finish());
    }

    /// Tear the attempt down and wait for the peer again
    async fn recycle(&mut self) -> Result<(), SessionError> {
        self.transition(SessionState::Reconnecting)?;
        self.release_negotiation().await;
        let acquired = acquire_with_fallback(self.deps.media.as_ref(), &self.config.media).await;
        self.install_media(acquired);
        self.transition(SessionState::AwaitingPeer)
    }

    async fn restart_after_failure(&mut self, reason: String) -> Result<(), SessionError> {
        if matches!(
            self.state,
            SessionState::Idle | SessionState::Reconnecting | SessionState::Closed
        ) {
            return Ok(());
        }
        let mut reason = reason;
        loop {
            self.peer_failures += 1;
            let budget = self.config.recovery.max_peer_reconnects;
            tracing::warn!(attempt = self.peer_failures, budget, reason = %reason, "Peer failure");
            self.diagnose(
                DiagnosticLevel::Warning,
                format!("peer failure {}/{budget}: {reason}", self.peer_failures),
            );
            if self.peer_failures > budget {
                return Err(SessionError::CallFailed(reason));
            }

            self.recycle().await?;
            let initiator = self.room.role() == Some(ParticipantRole::Initiator);
            if !(self.room.peer_present() && initiator) {
                return Ok(());
            }
            match self.start_offer().await {
                Ok(()) => return Ok(()),
                Err(SessionError::Negotiation(e)) => reason = e.to_string(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Route a handler result: negotiation failures go through recovery,
    /// anything else is fatal
    async fn settle(&mut self, mut result: Result<(), SessionError>) {
        loop {
            match result {
                Ok(()) => return,
                Err(_) if self.state == SessionState::Closed => return,
                Err(SessionError::Negotiation(e)) => {
                    result = self.restart_after_failure(e.to_string()).await;
                }
                Err(e) => {
                    self.shutdown(Some(e)).await;
                    return;
                }
            }
        }
    }

    /// Release everything, in order: local media, chat channel, peer
    /// connection, signaling channel, room membership
    async fn shutdown(&mut self, error: Option<SessionError>) {
        if !self.latch.try_begin() {
            tracing::debug!("Cleanup already ran");
            return;
        }
        if let Some(e) = &error {
            tracing::error!(error = %e, state = ?self.state, "Fatal call error, releasing resources");
        }

        let mut runner = CleanupRunner::new();
        if let Some(media) = self.media.take() {
            runner.step_sync("stop_local_media", || {
                let released = media.stop_all();
                tracing::debug!(released, "Local tracks stopped");
                Ok::<(), Infallible>(())
            });
        }
        if let Some(mut negotiator) = self.negotiator.take() {
            runner
                .step("close_chat_channel", negotiator.close_chat_channel())
                .await;
            runner.step("close_peer", negotiator.close_peer()).await;
        }
        if let Some(channel) = self.channel.take() {
            runner
                .step("disconnect_signaling", async {
                    channel.disconnect().await;
                    Ok::<(), Infallible>(())
                })
                .await;
            let room = &mut self.room;
            runner.step_sync("leave_room", || {
                room.leave(&channel);
                Ok::<(), Infallible>(())
            });
        }
        self.record_cleanup(runner.finish());

        self.early_candidates.clear();
        self.queued_chat.clear();
        self.view.chat_channel_open = false;
        self.view.local_audio_enabled = false;
        self.view.local_video_enabled = false;
        if self.view.channel_status.is_some() {
            self.set_channel_status(ChannelStatus::Closed);
        }

        let failure = error.map(|e| e.to_string());
        if let Some(message) = &failure {
            self.diagnose(DiagnosticLevel::Error, message.clone());
            self.view.last_error = Some(message.clone());
        }
        if let Err(e) = self.transition(SessionState::Closed) {
            tracing::error!(error = %e, "Could not close session");
        }
        if let Some(message) = failure {
            self.emit(CallEvent::Failed(message));
        }
        tracing::info!("Call ended");
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn install_media(&mut self, acquired: AcquiredMedia) {
        for downgrade in acquired.downgrades {
            self.diagnose(DiagnosticLevel::Warning, downgrade);
        }
        let bundle = Arc::new(acquired.bundle);
        for track in bundle.tracks() {
            if !self.preferences.get(track.kind()) {
                track.set_enabled(false);
            }
        }
        self.view.local_media = bundle.constraints();
        self.view.local_audio_enabled = bundle.is_enabled(MediaKind::Audio);
        self.view.local_video_enabled = bundle.is_enabled(MediaKind::Video);
        self.media = Some(bundle);
    }

    fn transition(&mut self, to: SessionState) -> Result<(), SessionError> {
        let from = self.state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            tracing::error!(from = ?from, to = ?to, "Illegal session transition");
            return Err(SessionError::ContractViolation(format!(
                "illegal transition {from:?} -> {to:?}"
            )));
        }
        self.state = to;
        self.view.state = to;
        tracing::debug!(from = ?from, to = ?to, "Session state changed");
        self.emit(CallEvent::StateChanged { from, to });
        self.publish();
        Ok(())
    }

    fn is_current_room(&self, room_id: &RoomId) -> bool {
        self.room.room_id() == Some(room_id)
    }

    fn record_chat(&mut self, envelope: ChatEnvelope, origin: ChatOrigin, transport: ChatTransport) {
        let message = ChatMessage {
            text: envelope.text,
            sender_role: envelope.sender_role,
            origin,
            transport,
            timestamp: envelope.timestamp,
        };
        self.view.chat_messages.push(message.clone());
        self.emit(CallEvent::Chat(message));
    }

    fn record_cleanup(&mut self, report: CleanupReport) {
        for step in report.failures() {
            let error = step.error.as_deref().unwrap_or("unknown");
            self.diagnose(
                DiagnosticLevel::Warning,
                format!("cleanup step {} failed: {error}", step.name),
            );
        }
    }

    fn diagnose(&mut self, level: DiagnosticLevel, message: String) {
        let diagnostic = Diagnostic {
            at: Utc::now(),
            level,
            message,
        };
        if self.view.diagnostics.len() == MAX_DIAGNOSTICS {
            self.view.diagnostics.pop_front();
        }
        self.view.diagnostics.push_back(diagnostic.clone());
        self.emit(CallEvent::Diagnostic(diagnostic));
    }

    fn set_channel_status(&mut self, status: ChannelStatus) {
        if self.view.channel_status == Some(status) {
            return;
        }
        self.view.channel_status = Some(status);
        self.emit(CallEvent::ChannelStatus(status));
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.view.clone());
    }

    fn channel_sink(&self) -> EventSink<ChannelEvent> {
        let feedback = self.feedback.clone();
        Arc::new(move |event| {
            if let Some(inbox) = feedback.upgrade() {
                let _ = inbox.send(SessionInput::Channel(event));
            }
        })
    }

    fn negotiator_sink(&self, generation: u64) -> EventSink<NegotiatorEvent> {
        let feedback = self.feedback.clone();
        Arc::new(move |event| {
            if let Some(inbox) = feedback.upgrade() {
                let _ = inbox.send(SessionInput::Negotiator { generation, event });
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{MemoryRelay, MockNetwork, MockPeerFactory, ScriptedMediaSource};
    use crate::transport::TransportError;

    fn deps(relay: &MemoryRelay, media: MediaConstraints) -> CallDependencies {
        CallDependencies {
            transport: Arc::new(relay.clone()),
            peers: Arc::new(MockPeerFactory::new(MockNetwork::default())),
            media: Arc::new(ScriptedMediaSource::new(media)),
        }
    }

    #[tokio::test]
    async fn test_commands_before_join() {
        let relay = MemoryRelay::new();
        let handle = CallSession::spawn(CallConfig::default(), deps(&relay, MediaConstraints::video_call()));

        assert!(matches!(
            handle.toggle_local_video().await,
            Err(SessionError::NotJoined)
        ));
        assert!(matches!(
            handle.send_chat("hi").await,
            Err(SessionError::NotJoined)
        ));
        assert_eq!(handle.snapshot().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_join_then_join_again() {
        let relay = MemoryRelay::new();
        let handle = CallSession::spawn(CallConfig::default(), deps(&relay, MediaConstraints::video_call()));

        handle
            .join_room(RoomId::new("R1"), PartyTag::new("doctor"))
            .await
            .unwrap();
        assert_eq!(handle.snapshot().state, SessionState::AwaitingPeer);
        assert!(matches!(
            handle
                .join_room(RoomId::new("R2"), PartyTag::new("doctor"))
                .await,
            Err(SessionError::AlreadyJoined(room)) if room == RoomId::new("R1")
        ));
    }

    #[tokio::test]
    async fn test_failed_connect_stays_idle() {
        let relay = MemoryRelay::new();
        relay.set_refuse_connections(true);
        let handle = CallSession::spawn(CallConfig::default(), deps(&relay, MediaConstraints::video_call()));

        let result = handle
            .join_room(RoomId::new("R1"), PartyTag::new("doctor"))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Connect(ConnectError::Transport(
                TransportError::ConnectionError(_)
            )))
        ));
        assert_eq!(handle.snapshot().state, SessionState::Idle);

        relay.set_refuse_connections(false);
        handle
            .join_room(RoomId::new("R1"), PartyTag::new("doctor"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_camera_degrades_to_audio() {
        let relay = MemoryRelay::new();
        let handle = CallSession::spawn(CallConfig::default(), deps(&relay, MediaConstraints::audio_only()));

        handle
            .join_room(RoomId::new("R1"), PartyTag::new("patient"))
            .await
            .unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.local_media, MediaConstraints::audio_only());
        assert!(snapshot
            .diagnostics
            .iter()
            .any(|d| d.message.contains("audio-only")));
        assert!(matches!(
            handle.toggle_local_video().await,
            Err(SessionError::InvalidInput(_))
        ));
        assert!(!handle.toggle_local_audio().await.unwrap());
        assert!(!handle.snapshot().local_audio_enabled);
    }

    #[tokio::test]
    async fn test_chat_validation() {
        let relay = MemoryRelay::new();
        let mut config = CallConfig::default();
        config.chat.max_message_len = 8;
        let handle = CallSession::spawn(config, deps(&relay, MediaConstraints::video_call()));
        handle
            .join_room(RoomId::new("R1"), PartyTag::new("doctor"))
            .await
            .unwrap();

        assert!(matches!(
            handle.send_chat("   ").await,
            Err(SessionError::InvalidInput(_))
        ));
        assert!(matches!(
            handle.send_chat("far too long").await,
            Err(SessionError::InvalidInput(_))
        ));
        handle.send_chat("short").await.unwrap();
    }

    #[tokio::test]
    async fn test_end_call_before_join() {
        let relay = MemoryRelay::new();
        let handle = CallSession::spawn(CallConfig::default(), deps(&relay, MediaConstraints::video_call()));

        handle.end_call().await;
        handle.end_call().await;
        handle.wait_for_state(SessionState::Closed).await.unwrap();
        assert!(matches!(
            handle
                .join_room(RoomId::new("R1"), PartyTag::new("doctor"))
                .await,
            Err(SessionError::Closed)
        ));
        assert_eq!(relay.connects(), 0);
    }

    #[test]
    fn test_room_error_conversion() {
        let err: SessionError = RoomError::Send(SendError::Disconnected).into();
        assert!(matches!(err, SessionError::Send(SendError::Disconnected)));
        let err: SessionError = RoomError::NotJoined.into();
        assert!(matches!(err, SessionError::NotJoined));
    }
}
