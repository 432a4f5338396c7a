//! Session negotiation over one peer connection
//!
//! A [`Negotiator`] owns exactly one [`PeerBackend`] for one negotiation
//! attempt. It produces and consumes descriptions and candidates, publishes
//! local media, and reports everything that happens as [`NegotiatorEvent`]s.
//!
//! # Ordering
//!
//! - Remote candidates that arrive before the remote description are queued
//!   and applied, in arrival order, right after it lands.
//! - In trickle mode, local candidates gathered before the local description
//!   has been signalled are held back, so every candidate is signalled after
//!   the offer or answer it belongs to.

use crate::config::{CandidateMode, NegotiationConfig};
use crate::media::{LocalMediaBundle, MediaError, RemoteMediaBundle};
use crate::peer::{PeerBackend, PeerError, PeerEvent, PeerFactory};
use crate::types::{
    EventSink, IceCandidate, NegotiationMessage, PeerConnectionState, SdpKind, SessionDescription,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// A bundle is already attached to this negotiator
    #[error("Local media already attached")]
    AlreadyAttached,

    /// Operation not valid in the current negotiation state
    #[error("Invalid negotiation state: {0}")]
    InvalidState(String),

    /// Media bundle could not be attached
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Peer connection failure
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
}

/// Events emitted by a negotiator
#[derive(Debug, Clone, PartialEq)]
pub enum NegotiatorEvent {
    /// Forward this payload to the peer through the relay
    LocalSignal(NegotiationMessage),
    /// Remote tracks changed; carries everything received so far
    RemoteMediaAvailable(RemoteMediaBundle),
    /// Chat channel open
    ChannelOpen,
    /// Chat channel text
    ChannelMessage(String),
    /// Peer connection state changed
    PeerConnectionState(PeerConnectionState),
    /// Negotiation failed in the background
    Failed(String),
}

#[derive(Default)]
struct CandidateGate {
    released: bool,
    held: Vec<IceCandidate>,
}

impl CandidateGate {
    fn push(&mut self, candidate: IceCandidate, sink: &EventSink<NegotiatorEvent>) {
        if self.released {
            sink(NegotiatorEvent::LocalSignal(candidate.into()));
        } else {
            self.held.push(candidate);
        }
    }
}

/// One negotiation attempt
pub struct Negotiator {
    id: u64,
    peer: Arc<dyn PeerBackend>,
    config: NegotiationConfig,
    sink: EventSink<NegotiatorEvent>,
    gate: Arc<Mutex<CandidateGate>>,
    remote_media: Arc<Mutex<RemoteMediaBundle>>,
    media: Option<Arc<LocalMediaBundle>>,
    pending_remote: Vec<IceCandidate>,
    chat_created: bool,
    local_set: bool,
    remote_set: bool,
    offer_created: bool,
    answer_produced: bool,
    chat_closed: bool,
    peer_closed: bool,
}

impl Negotiator {
    /// Create a negotiator with a fresh peer connection
    ///
    /// # Errors
    ///
    /// Returns error if the peer connection cannot be created
    #[tracing::instrument(skip(factory, config, sink))]
    pub async fn new(
        id: u64,
        factory: &dyn PeerFactory,
        config: NegotiationConfig,
        sink: EventSink<NegotiatorEvent>,
    ) -> Result<Self, NegotiationError> {
        let gate = Arc::new(Mutex::new(CandidateGate::default()));
        let remote_media = Arc::new(Mutex::new(RemoteMediaBundle::default()));
        let peer_sink = Self::peer_sink(
            config.candidate_mode,
            sink.clone(),
            gate.clone(),
            remote_media.clone(),
        );
        let peer = factory.create(peer_sink).await?;
        tracing::debug!("Negotiator created");

        Ok(Self {
            id,
            peer,
            config,
            sink,
            gate,
            remote_media,
            media: None,
            pending_remote: Vec::new(),
            chat_created: false,
            local_set: false,
            remote_set: false,
            offer_created: false,
            answer_produced: false,
            chat_closed: false,
            peer_closed: false,
        })
    }

    fn peer_sink(
        mode: CandidateMode,
        sink: EventSink<NegotiatorEvent>,
        gate: Arc<Mutex<CandidateGate>>,
        remote_media: Arc<Mutex<RemoteMediaBundle>>,
    ) -> EventSink<PeerEvent> {
        Arc::new(move |event| match event {
            PeerEvent::LocalCandidate(candidate) => {
                // non-trickle descriptions already embed every candidate
                if mode == CandidateMode::Trickle {
                    gate.lock().push(candidate, &sink);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                let mut remote = remote_media.lock();
                if remote.push(track) {
                    sink(NegotiatorEvent::RemoteMediaAvailable(remote.clone()));
                }
            }
            PeerEvent::ChannelOpen => sink(NegotiatorEvent::ChannelOpen),
            PeerEvent::ChannelMessage(text) => sink(NegotiatorEvent::ChannelMessage(text)),
            PeerEvent::ChannelClosed => tracing::debug!("Chat channel closed"),
            PeerEvent::ConnectionState(state) => {
                sink(NegotiatorEvent::PeerConnectionState(state));
            }
        })
    }

    /// Identifier of this attempt
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Attach the local media bundle and publish its tracks
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError::AlreadyAttached`] if this negotiator has a
    /// bundle, or [`NegotiationError::Media`] if another negotiator holds
    /// `bundle`.
    pub async fn attach_local_media(
        &mut self,
        bundle: Arc<LocalMediaBundle>,
    ) -> Result<(), NegotiationError> {
        if self.media.is_some() {
            return Err(NegotiationError::AlreadyAttached);
        }
        self.ensure_open()?;
        bundle.claim(self.id)?;
        for track in bundle.tracks() {
            if let Err(e) = self.peer.add_track(track).await {
                bundle.release(self.id);
                return Err(e.into());
            }
        }
        tracing::debug!(negotiator = self.id, tracks = bundle.tracks().len(), "Local media attached");
        self.media = Some(bundle);
        Ok(())
    }

    /// Create an offer and apply it locally
    ///
    /// # Errors
    ///
    /// Returns error if a local description already exists or the peer fails
    #[tracing::instrument(skip(self), fields(negotiator = self.id))]
    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.local_set || self.offer_created {
            return Err(NegotiationError::InvalidState(
                "local description already set".to_string(),
            ));
        }
        if !self.chat_created {
            self.peer
                .create_chat_channel(&self.config.chat_channel_label)
                .await?;
            self.chat_created = true;
        }
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        self.local_set = true;
        self.offer_created = true;
        tracing::debug!("Local offer set");
        self.signal_local_description(offer).await
    }

    /// Apply a remote offer and produce the answer
    ///
    /// # Errors
    ///
    /// Returns error if an answer was already produced, a local offer is
    /// pending, or the peer fails
    #[tracing::instrument(skip(self, offer), fields(negotiator = self.id))]
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        if self.answer_produced {
            return Err(NegotiationError::InvalidState(
                "answer already produced".to_string(),
            ));
        }
        if self.local_set {
            return Err(NegotiationError::InvalidState(
                "local offer pending".to_string(),
            ));
        }
        if offer.kind != SdpKind::Offer {
            return Err(NegotiationError::InvalidState(
                "expected an offer".to_string(),
            ));
        }
        self.peer.set_remote_description(offer).await?;
        self.remote_set = true;
        self.flush_pending_candidates().await;

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        self.local_set = true;
        self.answer_produced = true;
        tracing::debug!("Local answer set");
        self.signal_local_description(answer).await
    }

    /// Apply the remote answer to our offer
    ///
    /// # Errors
    ///
    /// Returns error if no offer was created or an answer was already applied
    #[tracing::instrument(skip(self, answer), fields(negotiator = self.id))]
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if !self.offer_created {
            return Err(NegotiationError::InvalidState(
                "no offer was created".to_string(),
            ));
        }
        if self.remote_set {
            return Err(NegotiationError::InvalidState(
                "answer already applied".to_string(),
            ));
        }
        if answer.kind != SdpKind::Answer {
            return Err(NegotiationError::InvalidState(
                "expected an answer".to_string(),
            ));
        }
        self.peer.set_remote_description(answer).await?;
        self.remote_set = true;
        tracing::debug!("Remote answer applied");
        self.flush_pending_candidates().await;
        Ok(())
    }

    /// Apply a remote candidate, queueing it until the remote description is set
    ///
    /// Application is best effort; a candidate the engine rejects is logged.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.peer_closed {
            tracing::debug!("Ignoring candidate for closed negotiator");
            return;
        }
        if !self.remote_set {
            tracing::trace!(queued = self.pending_remote.len() + 1, "Queueing early remote candidate");
            self.pending_remote.push(candidate);
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.peer.add_ice_candidate(candidate).await {
            tracing::warn!(negotiator = self.id, error = %e, "Remote candidate rejected");
        }
    }

    async fn flush_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_remote);
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "Applying queued remote candidates");
        }
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn signal_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let desc = match self.config.candidate_mode {
            CandidateMode::NonTrickle => {
                self.peer.wait_for_gathering().await?;
                self.peer.local_description().await.unwrap_or(desc)
            }
            CandidateMode::Trickle => desc,
        };
        let mut gate = self.gate.lock();
        (self.sink)(NegotiatorEvent::LocalSignal(desc.clone().into()));
        gate.released = true;
        for candidate in gate.held.drain(..) {
            (self.sink)(NegotiatorEvent::LocalSignal(candidate.into()));
        }
        Ok(desc)
    }

    /// Send text over the chat channel
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not open
    pub async fn send_chat(&self, text: String) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.peer.send_chat(text).await?;
        Ok(())
    }

    /// Close the chat channel; repeated calls are no-ops
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails to close it
    pub async fn close_chat_channel(&mut self) -> Result<(), NegotiationError> {
        if self.chat_closed {
            return Ok(());
        }
        self.chat_closed = true;
        self.peer.close_chat_channel().await?;
        Ok(())
    }

    /// Close the peer connection and detach local media; repeated calls are
    /// no-ops
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails to close; media is detached anyway
    pub async fn close_peer(&mut self) -> Result<(), NegotiationError> {
        if self.peer_closed {
            return Ok(());
        }
        self.peer_closed = true;
        self.pending_remote.clear();
        if let Some(media) = self.media.take() {
            media.release(self.id);
        }
        self.peer.close().await?;
        tracing::debug!(negotiator = self.id, "Peer connection closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.peer_closed {
            return Err(PeerError::Closed.into());
        }
        Ok(())
    }

    /// Whether our offer is waiting for an answer
    #[must_use]
    pub fn has_pending_offer(&self) -> bool {
        self.offer_created && !self.remote_set
    }

    /// Whether an answer was produced
    #[must_use]
    pub fn answer_produced(&self) -> bool {
        self.answer_produced
    }

    /// Whether a local description is set
    #[must_use]
    pub fn has_local_description(&self) -> bool {
        self.local_set
    }

    /// Whether a remote description is set
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.remote_set
    }

    /// Remote candidates waiting for the remote description
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    /// Take the remote candidates still waiting for a remote description
    ///
    /// Used when this attempt is abandoned in favour of a fresh one that
    /// will receive the same peer's description.
    pub fn take_pending_candidates(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_remote)
    }

    /// Remote tracks received so far
    #[must_use]
    pub fn remote_media(&self) -> RemoteMediaBundle {
        self.remote_media.lock().clone()
    }

    /// Whether the peer connection was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.peer_closed
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("id", &self.id)
            .field("local_set", &self.local_set)
            .field("remote_set", &self.remote_set)
            .field("offer_created", &self.offer_created)
            .field("answer_produced", &self.answer_produced)
            .field("closed", &self.peer_closed)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::LocalTrack;
    use crate::testing::{MockNetwork, MockPeerFactory};
    use crate::types::MediaKind;
    use pretty_assertions::assert_eq;

    fn collecting_sink() -> (EventSink<NegotiatorEvent>, Arc<Mutex<Vec<NegotiatorEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink<NegotiatorEvent> = Arc::new(move |e| captured.lock().push(e));
        (sink, events)
    }

    fn signals(events: &Mutex<Vec<NegotiatorEvent>>) -> Vec<NegotiationMessage> {
        events
            .lock()
            .iter()
            .filter_map(|e| match e {
                NegotiatorEvent::LocalSignal(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn config(mode: CandidateMode) -> NegotiationConfig {
        NegotiationConfig {
            candidate_mode: mode,
            ..Default::default()
        }
    }

    async fn pair(
        mode: CandidateMode,
    ) -> (
        MockNetwork,
        Negotiator,
        Arc<Mutex<Vec<NegotiatorEvent>>>,
        Negotiator,
        Arc<Mutex<Vec<NegotiatorEvent>>>,
    ) {
        let network = MockNetwork::default();
        let factory = MockPeerFactory::new(network.clone());
        let (sink_a, events_a) = collecting_sink();
        let (sink_b, events_b) = collecting_sink();
        let a = Negotiator::new(1, &factory, config(mode), sink_a).await.unwrap();
        let b = Negotiator::new(2, &factory, config(mode), sink_b).await.unwrap();
        (network, a, events_a, b, events_b)
    }

    #[tokio::test]
    async fn test_offer_answer_connects() {
        let (_network, mut a, events_a, mut b, events_b) = pair(CandidateMode::NonTrickle).await;
        let bundle = Arc::new(LocalMediaBundle::new(vec![Arc::new(LocalTrack::new(
            MediaKind::Audio,
        ))]));
        a.attach_local_media(bundle.clone()).await.unwrap();

        let offer = a.create_offer().await.unwrap();
        assert!(a.has_pending_offer());
        let answer = b.accept_offer(offer.clone()).await.unwrap();
        a.accept_answer(answer.clone()).await.unwrap();

        assert_eq!(signals(&events_a), vec![NegotiationMessage::from(offer)]);
        assert_eq!(signals(&events_b), vec![NegotiationMessage::from(answer)]);
        assert!(events_a
            .lock()
            .contains(&NegotiatorEvent::PeerConnectionState(PeerConnectionState::Connected)));
        assert!(events_b.lock().contains(&NegotiatorEvent::ChannelOpen));
        assert!(b.remote_media().has(MediaKind::Audio));
    }

    #[tokio::test]
    async fn test_attach_twice_fails() {
        let (_network, mut a, _events, _b, _) = pair(CandidateMode::NonTrickle).await;
        let bundle = Arc::new(LocalMediaBundle::empty());
        a.attach_local_media(bundle.clone()).await.unwrap();
        let result = a.attach_local_media(bundle).await;
        assert_eq!(result, Err(NegotiationError::AlreadyAttached));
    }

    #[tokio::test]
    async fn test_bundle_cannot_attach_to_two_negotiators() {
        let (_network, mut a, _events_a, mut b, _events_b) = pair(CandidateMode::NonTrickle).await;
        let bundle = Arc::new(LocalMediaBundle::empty());
        a.attach_local_media(bundle.clone()).await.unwrap();
        let result = b.attach_local_media(bundle.clone()).await;
        assert_eq!(
            result,
            Err(NegotiationError::Media(MediaError::AlreadyAttached(1)))
        );

        a.close_peer().await.unwrap();
        b.attach_local_media(bundle.clone()).await.unwrap();
        assert_eq!(bundle.attached_to(), Some(2));
    }

    #[tokio::test]
    async fn test_second_offer_rejected() {
        let (_network, mut a, _events_a, _b, _events_b) = pair(CandidateMode::NonTrickle).await;
        a.create_offer().await.unwrap();
        let result = a.create_offer().await;
        assert!(matches!(result, Err(NegotiationError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_accept_offer_after_answer_rejected() {
        let (_network, mut a, _events_a, mut b, _events_b) = pair(CandidateMode::NonTrickle).await;
        let offer = a.create_offer().await.unwrap();
        b.accept_offer(offer.clone()).await.unwrap();
        let result = b.accept_offer(offer).await;
        assert_eq!(
            result,
            Err(NegotiationError::InvalidState(
                "answer already produced".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_answer_without_offer_rejected() {
        let (_network, _a, _events_a, mut b, _events_b) = pair(CandidateMode::NonTrickle).await;
        let result = b.accept_answer(SessionDescription::answer("mock:9::0")).await;
        assert!(matches!(result, Err(NegotiationError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_early_candidates_applied_after_offer_in_order() {
        let (network, mut a, _events_a, mut b, _events_b) = pair(CandidateMode::NonTrickle).await;
        let offer = a.create_offer().await.unwrap();

        let c1 = IceCandidate::new("candidate:C1");
        let c2 = IceCandidate::new("candidate:C2");
        b.add_remote_candidate(c1.clone()).await;
        b.add_remote_candidate(c2.clone()).await;
        assert_eq!(b.pending_candidates(), 2);

        let peer_b = network.peer(1).unwrap();
        assert!(peer_b.applied_candidates().is_empty());

        b.accept_offer(offer).await.unwrap();
        assert_eq!(b.pending_candidates(), 0);
        assert_eq!(peer_b.applied_candidates(), vec![c1, c2]);

        let ops = peer_b.operations();
        let remote_at = ops.iter().position(|op| op == "set_remote").unwrap();
        let first_candidate_at = ops.iter().position(|op| op == "add_candidate").unwrap();
        assert!(remote_at < first_candidate_at);
    }

    #[tokio::test]
    async fn test_trickle_candidates_follow_description() {
        let (_network, mut a, events_a, _b, _events_b) = pair(CandidateMode::Trickle).await;
        let offer = a.create_offer().await.unwrap();

        let sent = signals(&events_a);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], NegotiationMessage::from(offer));
        assert!(matches!(sent[1], NegotiationMessage::Candidate { .. }));
    }

    #[tokio::test]
    async fn test_non_trickle_suppresses_candidates() {
        let (_network, mut a, events_a, _b, _events_b) = pair(CandidateMode::NonTrickle).await;
        a.create_offer().await.unwrap();
        let sent = signals(&events_a);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind_name(), "offer");
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_media() {
        let (_network, mut a, _events_a, _b, _events_b) = pair(CandidateMode::NonTrickle).await;
        let bundle = Arc::new(LocalMediaBundle::empty());
        a.attach_local_media(bundle.clone()).await.unwrap();
        a.close_chat_channel().await.unwrap();
        a.close_chat_channel().await.unwrap();
        a.close_peer().await.unwrap();
        a.close_peer().await.unwrap();
        assert!(a.is_closed());
        assert_eq!(bundle.attached_to(), None);
        assert!(matches!(
            a.create_offer().await,
            Err(NegotiationError::Peer(PeerError::Closed))
        ));
    }
}
