//! Peer connection backend
//!
//! [`PeerBackend`] is the seam between the negotiator and the native
//! peer-connection primitive. [`WebRtcPeerFactory`] builds backends on top of
//! the `webrtc` crate; tests use the in-process mocks from `testing`.

use crate::media::{LocalTrack, RemoteTrack};
use crate::types::{
    EventSink, IceCandidate, MediaKind, PeerConnectionState, SdpKind, SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Engine reported an error
    #[error("Peer connection error: {0}")]
    Backend(String),

    /// Description could not be parsed or applied
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    /// Chat channel missing or not open yet
    #[error("Chat channel is not open")]
    ChannelNotOpen,

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Events raised by a peer backend
///
/// Delivered from engine callbacks on arbitrary tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local candidate was gathered
    LocalCandidate(IceCandidate),
    /// The peer started sending a track
    RemoteTrack(RemoteTrack),
    /// Chat channel is open in both directions
    ChannelOpen,
    /// Text received on the chat channel
    ChannelMessage(String),
    /// Chat channel closed
    ChannelClosed,
    /// Connection state changed
    ConnectionState(PeerConnectionState),
}

/// Native peer connection
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Create an offer without applying it
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote candidate; requires a remote description
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Wait until local candidate gathering has finished
    async fn wait_for_gathering(&self) -> Result<(), PeerError>;

    /// Current local description, including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Publish a local track
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Create the chat data channel (offering side only)
    async fn create_chat_channel(&self, label: &str) -> Result<(), PeerError>;

    /// Send text on the chat channel
    async fn send_chat(&self, text: String) -> Result<(), PeerError>;

    /// Close the chat channel
    async fn close_chat_channel(&self) -> Result<(), PeerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer backends
#[async_trait]
pub trait PeerFactory: Send + Sync {
    /// Create a backend that reports to `sink`
    async fn create(&self, sink: EventSink<PeerEvent>) -> Result<Arc<dyn PeerBackend>, PeerError>;
}

/// Factory for `webrtc`-crate peer connections
#[derive(Debug, Clone)]
pub struct WebRtcPeerFactory {
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    /// Factory using the given STUN/TURN URLs
    #[must_use]
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, sink: EventSink<PeerEvent>) -> Result<Arc<dyn PeerBackend>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Backend(format!("failed to register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::Backend(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| PeerError::Backend(format!("failed to create peer connection: {e}")))?;

        let peer = WebRtcPeer {
            pc: Arc::new(pc),
            chat: Arc::new(Mutex::new(None)),
            sink,
        };
        peer.install_handlers();
        tracing::debug!("WebRTC peer connection created");
        Ok(Arc::new(peer))
    }
}

/// Peer backend on a `webrtc` crate [`RTCPeerConnection`]
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    chat: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    sink: EventSink<PeerEvent>,
}

impl WebRtcPeer {
    fn install_handlers(&self) {
        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::debug!(state = %s, "Peer connection state changed");
                sink(PeerEvent::ConnectionState(map_state(s)));
                Box::pin(async {})
            }));

        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => sink(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })),
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                    }
                }
                Box::pin(async {})
            }));

        let sink = self.sink.clone();
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                _ => None,
            };
            if let Some(kind) = kind {
                tracing::info!(track_id = %track.id(), kind = %kind, "Remote track received");
                sink(PeerEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                }));
            }
            Box::pin(async {})
        }));

        let sink = self.sink.clone();
        let chat = self.chat.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                tracing::debug!(label = %dc.label(), "Remote data channel announced");
                install_channel_handlers(&dc, sink.clone());
                *chat.lock() = Some(dc);
                Box::pin(async {})
            }));
    }

    fn chat_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.chat.lock().clone()
    }
}

fn install_channel_handlers(dc: &Arc<RTCDataChannel>, sink: EventSink<PeerEvent>) {
    let on_open = sink.clone();
    dc.on_open(Box::new(move || {
        on_open(PeerEvent::ChannelOpen);
        Box::pin(async {})
    }));

    let on_message = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        match String::from_utf8(msg.data.to_vec()) {
            Ok(text) => on_message(PeerEvent::ChannelMessage(text)),
            Err(_) => tracing::warn!(len = msg.data.len(), "Dropping non-UTF-8 chat payload"),
        }
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        sink(PeerEvent::ChannelClosed);
        Box::pin(async {})
    }));
}

fn map_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    result.map_err(|e| PeerError::InvalidDescription(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Option<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Some(SessionDescription::answer(desc.sdp)),
        _ => None,
    }
}

fn backend(context: &'static str) -> impl FnOnce(webrtc::Error) -> PeerError {
    move |e| PeerError::Backend(format!("{context}: {e}"))
}

#[async_trait]
impl PeerBackend for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(backend("failed to create offer"))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(backend("failed to create answer"))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(backend("failed to set local description"))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(backend("failed to set remote description"))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(backend("failed to add candidate"))
    }

    async fn wait_for_gathering(&self) -> Result<(), PeerError> {
        let mut done = self.pc.gathering_complete_promise().await;
        let _ = done.recv().await;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.pc
            .add_track(track.rtc_track())
            .await
            .map_err(backend("failed to add track"))?;
        tracing::debug!(track_id = %track.id(), kind = %track.kind(), "Local track published");
        Ok(())
    }

    async fn create_chat_channel(&self, label: &str) -> Result<(), PeerError> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(backend("failed to create data channel"))?;
        install_channel_handlers(&dc, self.sink.clone());
        *self.chat.lock() = Some(dc);
        Ok(())
    }

    async fn send_chat(&self, text: String) -> Result<(), PeerError> {
        let dc = self.chat_channel().ok_or(PeerError::ChannelNotOpen)?;
        dc.send_text(text)
            .await
            .map_err(backend("failed to send on data channel"))?;
        Ok(())
    }

    async fn close_chat_channel(&self) -> Result<(), PeerError> {
        let dc = self.chat.lock().take();
        if let Some(dc) = dc {
            dc.close()
                .await
                .map_err(backend("failed to close data channel"))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(backend("failed to close peer connection"))
    }
}
