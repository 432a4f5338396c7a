//! Telecall - two-party call session orchestration over a signaling relay
//!
//! This library drives one participant of a two-party WebRTC room. It
//! features:
//!
//! - **Relay Signaling**: Persistent WebSocket channel with bounded
//!   exponential backoff and self-echo filtering
//! - **Relay-Assigned Roles**: The relay decides who offers; the client never
//!   guesses
//! - **Ordered Negotiation**: Early candidates are queued behind the
//!   description they belong to
//! - **Recovery**: Peer departures and failures recycle the session through a
//!   fresh negotiation with freshly acquired media
//! - **Deterministic Cleanup**: Every resource is released exactly once, even
//!   when individual steps fail
//!
//! # Examples
//!
//! ```rust,no_run
//! use telecall_core::{
//!     CallConfig, CallDependencies, CallSession, DeviceMediaSource, PartyTag, RoomId,
//!     SessionState, WebRtcPeerFactory, WebSocketTransport, TransportConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = CallConfig::default();
//! let deps = CallDependencies {
//!     transport: Arc::new(WebSocketTransport::new(TransportConfig {
//!         url: config.signaling.relay_url.clone(),
//!     })),
//!     peers: Arc::new(WebRtcPeerFactory::new(config.negotiation.ice_servers.clone())),
//!     media: Arc::new(DeviceMediaSource::default()),
//! };
//!
//! let call = CallSession::spawn(config, deps);
//! call.join_room(RoomId::new("R1"), PartyTag::new("doctor")).await?;
//! call.wait_for_state(SessionState::Connected).await?;
//! call.send_chat("Can you hear me?").await?;
//! call.end_call().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Session configuration
pub mod config;

/// Relay wire protocol
pub mod protocol;

/// Signaling channel to the relay
pub mod signaling;

/// WebSocket relay transport
pub mod transport;

/// Room membership tracking
pub mod room;

/// Local and remote media
pub mod media;

/// Peer connection primitive
pub mod peer;

/// Offer/answer negotiation
pub mod negotiator;

/// Fault-tolerant cleanup
pub mod cleanup;

/// Call session orchestrator
pub mod session;

/// Test doubles
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export main types at crate root
pub use cleanup::{CleanupLatch, CleanupReport, CleanupRunner};
pub use config::{
    BackoffPolicy, CallConfig, CandidateMode, ChatConfig, NegotiationConfig, PendingChatPolicy,
    RecoveryConfig, SignalingConfig,
};
pub use media::{
    acquire_with_fallback, DeviceMediaSource, LocalMediaBundle, LocalTrack, MediaError,
    MediaSource, RemoteMediaBundle, RemoteTrack,
};
pub use negotiator::{NegotiationError, Negotiator, NegotiatorEvent};
pub use peer::{PeerBackend, PeerError, PeerEvent, PeerFactory, WebRtcPeerFactory};
pub use protocol::{ClientMessage, RelayMessage};
pub use room::{RoomError, RoomEvent, RoomMembership};
pub use session::{
    CallDependencies, CallEvent, CallHandle, CallSession, Diagnostic, DiagnosticLevel,
    SessionError, SessionSnapshot,
};
pub use signaling::{
    ChannelEvent, ChannelStatus, ConnectError, RelayConnection, SendError, SignalingChannel,
    SignalingTransport,
};
pub use transport::{TransportConfig, TransportError, WebSocketTransport};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::CallConfig;
    pub use crate::session::{CallDependencies, CallEvent, CallHandle, CallSession, SessionSnapshot};
    pub use crate::types::{
        MediaConstraints, MediaKind, ParticipantRole, PartyTag, RoomId, SessionState,
    };
}
