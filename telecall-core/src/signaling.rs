//! Relay signaling channel
//!
//! Keeps one persistent connection to the signaling relay, turns relay frames
//! into [`ChannelEvent`]s and reconnects with exponential backoff when the
//! transport drops.

use crate::config::BackoffPolicy;
use crate::protocol::{ClientMessage, RelayMessage, SignalTarget};
use crate::transport::TransportError;
use crate::types::{
    ClientId, EventSink, MediaKind, NegotiationMessage, ParticipantRole, PartyTag, RoomId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Upper bound on flushing queued frames and closing the socket at shutdown
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Failure to establish the initial relay connection
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Transport could not connect
    #[error("Relay connection failed: {0}")]
    Transport(#[from] TransportError),
}

/// Failure to hand a frame to the relay
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Channel is reconnecting or lost; frames are not queued
    #[error("Signaling channel is disconnected")]
    Disconnected,

    /// Channel was shut down
    #[error("Signaling channel is closed")]
    Closed,
}

/// Signaling transport trait
///
/// Implement this for your specific relay transport (WebSocket, in-memory,
/// ...). Each call to `connect` must produce a brand new connection.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open a connection to the relay
    async fn connect(&self) -> Result<Box<dyn RelayConnection>, TransportError>;
}

/// One live connection to the relay
///
/// `recv` must be cancel safe: the channel polls it inside `select!` and may
/// drop the future when an outbound frame is ready.
#[async_trait]
pub trait RelayConnection: Send {
    /// Write one frame
    async fn send(&mut self, frame: ClientMessage) -> Result<(), TransportError>;

    /// Read the next frame; `Ok(None)` means the relay closed the connection
    async fn recv(&mut self) -> Result<Option<RelayMessage>, TransportError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Connection status of the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Frames can be sent
    Connected,
    /// Transport dropped; retrying
    Degraded {
        /// Zero-based attempt about to run
        attempt: u32,
    },
    /// Retries exhausted
    Lost,
    /// Shut down locally
    Closed,
}

/// Events delivered by the channel to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A second participant is present in the room
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
    },
    /// The other participant left
    PeerLeft {
        /// Room
        room_id: RoomId,
        /// Occupants after the departure
        occupant_count: usize,
    },
    /// Negotiation payload from the peer
    MessageReceived {
        /// Room
        room_id: RoomId,
        /// Payload
        message: NegotiationMessage,
    },
    /// Chat relayed through the signaling path
    Chat {
        /// Room
        room_id: RoomId,
        /// Text
        text: String,
        /// Sender role, if the sender knew it
        sender_role: Option<ParticipantRole>,
    },
    /// Peer toggled a track
    RemoteMediaToggle {
        /// Room
        room_id: RoomId,
        /// Track kind
        kind: MediaKind,
        /// New enabled flag
        enabled: bool,
    },
    /// Occupancy report
    RoomStatus {
        /// Room
        room_id: RoomId,
        /// Occupants
        occupant_count: usize,
        /// Tags of occupants
        occupants: Vec<PartyTag>,
    },
    /// Error frame from the relay
    RelayError(String),
    /// Transport dropped; a reconnection attempt is scheduled
    Degraded {
        /// Zero-based attempt
        attempt: u32,
        /// Delay before the attempt
        retry_in: Duration,
    },
    /// Transport re-established after a drop
    Reconnected,
    /// Reconnection attempts exhausted; the channel is dead
    ChannelLost,
}

impl From<RelayMessage> for ChannelEvent {
    fn from(frame: RelayMessage) -> Self {
        match frame {
            RelayMessage::PeerJoined {
                room_id,
                peer_tag,
                role,
                occupant_count,
                should_initiate,
            } => Self::PeerJoined {
                room_id,
                peer_tag,
                role,
                occupant_count,
                should_initiate,
            },
            RelayMessage::PeerLeft {
                room_id,
                occupant_count,
            } => Self::PeerLeft {
                room_id,
                occupant_count,
            },
            RelayMessage::Signal {
                room_id, message, ..
            } => Self::MessageReceived { room_id, message },
            RelayMessage::Chat {
                room_id,
                text,
                sender_role,
                ..
            } => Self::Chat {
                room_id,
                text,
                sender_role,
            },
            RelayMessage::RemoteMediaToggle {
                room_id,
                kind,
                enabled,
                ..
            } => Self::RemoteMediaToggle {
                room_id,
                kind,
                enabled,
            },
            RelayMessage::RoomStatus {
                room_id,
                occupant_count,
                occupants,
            } => Self::RoomStatus {
                room_id,
                occupant_count,
                occupants,
            },
            RelayMessage::Error { message } => Self::RelayError(message),
        }
    }
}

/// Persistent channel to the signaling relay
///
/// Owns a background driver task that multiplexes outbound frames and
/// inbound relay traffic over the current connection. While the transport is
/// down, [`SignalingChannel::send`] fails fast with [`SendError::Disconnected`]
/// instead of queueing. A frame whose write failed is resent first after the
/// connection comes back.
pub struct SignalingChannel {
    client_id: ClientId,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    status: watch::Receiver<ChannelStatus>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Connect to the relay and start the driver task
    ///
    /// # Errors
    ///
    /// Returns error if the first connection attempt fails. Later drops are
    /// handled by the backoff loop and reported through `sink`.
    #[tracing::instrument(skip(transport, policy, sink), fields(client_id = %client_id))]
    pub async fn connect(
        transport: Arc<dyn SignalingTransport>,
        client_id: ClientId,
        policy: BackoffPolicy,
        sink: EventSink<ChannelEvent>,
    ) -> Result<Self, ConnectError> {
        let connection = transport.connect().await?;
        tracing::info!("Signaling channel connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = ChannelDriver {
            transport,
            client_id: client_id.clone(),
            policy,
            sink,
            outbound: outbound_rx,
            status: status_tx,
            shutdown: shutdown_rx,
            pending: None,
        };
        let handle = tokio::spawn(driver.run(connection));

        Ok(Self {
            client_id,
            outbound: outbound_tx,
            status: status_rx,
            shutdown: shutdown_tx,
            driver: Mutex::new(Some(handle)),
        })
    }

    /// Identity this channel presents to the relay
    #[must_use]
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Current connection status
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// Watch connection status changes
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Forward a negotiation payload to the other occupants of `room_id`
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not connected
    #[tracing::instrument(skip(self, message), fields(room_id = %room_id, kind = message.kind_name()))]
    pub fn send(&self, room_id: &RoomId, message: NegotiationMessage) -> Result<(), SendError> {
        self.send_frame(ClientMessage::Signal {
            room_id: room_id.clone(),
            from: self.client_id.clone(),
            target: SignalTarget::All,
            message,
        })
    }

    /// Send a raw frame
    ///
    /// # Errors
    ///
    /// Returns error if the channel is not connected
    pub fn send_frame(&self, frame: ClientMessage) -> Result<(), SendError> {
        match self.status() {
            ChannelStatus::Connected => {}
            ChannelStatus::Degraded { .. } | ChannelStatus::Lost => {
                tracing::debug!(frame = frame.frame_type(), "Send rejected while disconnected");
                return Err(SendError::Disconnected);
            }
            ChannelStatus::Closed => return Err(SendError::Closed),
        }
        tracing::trace!(frame = frame.frame_type(), "Queueing frame for relay");
        self.outbound.send(frame).map_err(|_| SendError::Closed)
    }

    /// Shut the channel down and wait for the driver to finish
    ///
    /// Safe to call more than once.
    pub async fn disconnect(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Signaling driver task ended abnormally");
            }
            tracing::info!("Signaling channel disconnected");
        }
    }
}

/// Outbound half of the channel, as seen by the room tracker
pub trait FrameSender: Send + Sync {
    /// Send a raw frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be handed to the relay
    fn send_frame(&self, frame: ClientMessage) -> Result<(), SendError>;
}

impl FrameSender for SignalingChannel {
    fn send_frame(&self, frame: ClientMessage) -> Result<(), SendError> {
        SignalingChannel::send_frame(self, frame)
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

enum PumpOutcome {
    Shutdown,
    Dropped,
}

struct ChannelDriver {
    transport: Arc<dyn SignalingTransport>,
    client_id: ClientId,
    policy: BackoffPolicy,
    sink: EventSink<ChannelEvent>,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    status: watch::Sender<ChannelStatus>,
    shutdown: watch::Receiver<bool>,
    pending: Option<ClientMessage>,
}

impl ChannelDriver {
    async fn run(mut self, mut connection: Box<dyn RelayConnection>) {
        loop {
            match self.pump(connection.as_mut()).await {
                PumpOutcome::Shutdown => {
                    self.flush_and_close(connection).await;
                    let _ = self.status.send(ChannelStatus::Closed);
                    return;
                }
                PumpOutcome::Dropped => {
                    drop(connection);
                }
            }

            match self.reconnect().await {
                Some(fresh) => {
                    connection = fresh;
                    let _ = self.status.send(ChannelStatus::Connected);
                    tracing::info!("Signaling channel reconnected");
                    (self.sink)(ChannelEvent::Reconnected);
                }
                None if self.is_shutdown() => {
                    let _ = self.status.send(ChannelStatus::Closed);
                    return;
                }
                None => {
                    let _ = self.status.send(ChannelStatus::Lost);
                    tracing::error!(
                        attempts = self.policy.max_attempts,
                        "Signaling channel lost after exhausting reconnection attempts"
                    );
                    (self.sink)(ChannelEvent::ChannelLost);
                    return;
                }
            }
        }
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Write every frame accepted before shutdown, then close the socket
    async fn flush_and_close(&mut self, mut connection: Box<dyn RelayConnection>) {
        let outbound = &mut self.outbound;
        let flush = async {
            let mut flushed = 0usize;
            while let Ok(frame) = outbound.try_recv() {
                if let Err(e) = connection.send(frame).await {
                    tracing::warn!(error = %e, "Relay write failed while flushing");
                    break;
                }
                flushed += 1;
            }
            if flushed > 0 {
                tracing::debug!(flushed, "Flushed queued frames before close");
            }
            if let Err(e) = connection.close().await {
                tracing::debug!(error = %e, "Error closing relay connection");
            }
        };
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, flush)
            .await
            .is_err()
        {
            tracing::warn!("Relay did not drain in time, abandoning connection");
        }
    }

    async fn pump(&mut self, connection: &mut dyn RelayConnection) -> PumpOutcome {
        if let Some(frame) = self.pending.take() {
            tracing::debug!(frame = frame.frame_type(), "Resending frame after reconnect");
            if let Err(e) = connection.send(frame.clone()).await {
                tracing::warn!(error = %e, "Resend failed");
                self.pending = Some(frame);
                return PumpOutcome::Dropped;
            }
        }

        loop {
            if self.is_shutdown() {
                return PumpOutcome::Shutdown;
            }
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    return PumpOutcome::Shutdown;
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else {
                        return PumpOutcome::Shutdown;
                    };
                    tokio::select! {
                        written = connection.send(frame.clone()) => {
                            if let Err(e) = written {
                                tracing::warn!(error = %e, frame = frame.frame_type(), "Relay write failed");
                                self.pending = Some(frame);
                                return PumpOutcome::Dropped;
                            }
                        }
                        _ = self.shutdown.changed() => {
                            tracing::warn!(frame = frame.frame_type(), "Shutdown interrupted a stalled relay write");
                            return PumpOutcome::Shutdown;
                        }
                    }
                }
                incoming = connection.recv() => {
                    match incoming {
                        Ok(Some(frame)) => self.dispatch(frame),
                        Ok(None) => {
                            tracing::warn!("Relay closed the connection");
                            return PumpOutcome::Dropped;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Relay read failed");
                            return PumpOutcome::Dropped;
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: RelayMessage) {
        if frame.sender() == Some(&self.client_id) {
            tracing::debug!(frame = frame.frame_type(), "Dropping self-echoed frame");
            return;
        }
        tracing::trace!(frame = frame.frame_type(), "Relay frame received");
        (self.sink)(ChannelEvent::from(frame));
    }

    async fn reconnect(&mut self) -> Option<Box<dyn RelayConnection>> {
        for attempt in 0..self.policy.max_attempts {
            let delay = self.policy.delay_for(attempt);
            let _ = self.status.send(ChannelStatus::Degraded { attempt });
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis(),
                "Signaling transport dropped, scheduling reconnect"
            );
            (self.sink)(ChannelEvent::Degraded {
                attempt,
                retry_in: delay,
            });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => return None,
            }
            if self.is_shutdown() {
                return None;
            }

            let transport = self.transport.clone();
            tokio::select! {
                connected = transport.connect() => match connected {
                    Ok(connection) => return Some(connection),
                    Err(e) => {
                        tracing::warn!(attempt, error = %e, "Reconnection attempt failed");
                    }
                },
                _ = self.shutdown.changed() => return None,
            }
        }
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Scripted transport: each connect pops a script of inbound frames; an
    // exhausted script returns Ok(None) (relay closed).
    struct ScriptedTransport {
        connects: AtomicUsize,
        fail_after: usize,
        scripts: SyncMutex<VecDeque<Vec<RelayMessage>>>,
        sent: Arc<SyncMutex<Vec<ClientMessage>>>,
        hold_open: bool,
    }

    struct ScriptedConnection {
        inbound: VecDeque<RelayMessage>,
        sent: Arc<SyncMutex<Vec<ClientMessage>>>,
        hold_open: bool,
    }

    #[async_trait]
    impl RelayConnection for ScriptedConnection {
        async fn send(&mut self, frame: ClientMessage) -> Result<(), TransportError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<RelayMessage>, TransportError> {
            match self.inbound.pop_front() {
                Some(frame) => Ok(Some(frame)),
                None if self.hold_open => futures::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl SignalingTransport for ScriptedTransport {
        async fn connect(&self) -> Result<Box<dyn RelayConnection>, TransportError> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n >= self.fail_after {
                return Err(TransportError::ConnectionError("refused".to_string()));
            }
            let script = self.scripts.lock().pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedConnection {
                inbound: script.into(),
                sent: self.sent.clone(),
                hold_open: self.hold_open,
            }))
        }
    }

    fn collecting_sink() -> (EventSink<ChannelEvent>, Arc<SyncMutex<Vec<ChannelEvent>>>) {
        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: EventSink<ChannelEvent> = Arc::new(move |event| sink_events.lock().push(event));
        (sink, events)
    }

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_self_echo_is_filtered() {
        let me = ClientId::new("me");
        let transport = Arc::new(ScriptedTransport {
            connects: AtomicUsize::new(0),
            fail_after: usize::MAX,
            scripts: SyncMutex::new(VecDeque::from(vec![vec![
                RelayMessage::Signal {
                    room_id: RoomId::new("R1"),
                    from: me.clone(),
                    message: NegotiationMessage::Offer {
                        sdp: "mine".to_string(),
                    },
                },
                RelayMessage::Signal {
                    room_id: RoomId::new("R1"),
                    from: ClientId::new("peer"),
                    message: NegotiationMessage::Offer {
                        sdp: "theirs".to_string(),
                    },
                },
            ]])),
            sent: Arc::new(SyncMutex::new(Vec::new())),
            hold_open: true,
        });
        let (sink, events) = collecting_sink();
        let channel = SignalingChannel::connect(transport, me, fast_policy(1), sink)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = events.lock().clone();
        assert_eq!(
            events,
            vec![ChannelEvent::MessageReceived {
                room_id: RoomId::new("R1"),
                message: NegotiationMessage::Offer {
                    sdp: "theirs".to_string()
                },
            }]
        );
        channel.disconnect().await;
        assert_eq!(channel.status(), ChannelStatus::Closed);
    }

    #[tokio::test]
    async fn test_channel_lost_after_exhausting_attempts() {
        let transport = Arc::new(ScriptedTransport {
            connects: AtomicUsize::new(0),
            fail_after: 1,
            scripts: SyncMutex::new(VecDeque::new()),
            sent: Arc::new(SyncMutex::new(Vec::new())),
            hold_open: false,
        });
        let (sink, events) = collecting_sink();
        let channel = SignalingChannel::connect(
            transport.clone(),
            ClientId::new("me"),
            fast_policy(3),
            sink,
        )
        .await
        .unwrap();

        let mut status = channel.watch_status();
        while !matches!(*status.borrow(), ChannelStatus::Lost) {
            status.changed().await.unwrap();
        }

        let events = events.lock().clone();
        let degraded: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Degraded { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(degraded, vec![0, 1, 2]);
        assert_eq!(events.last(), Some(&ChannelEvent::ChannelLost));
        // initial connect + three retries, no more
        assert_eq!(transport.connects.load(Ordering::SeqCst), 4);

        let result = channel.send(
            &RoomId::new("R1"),
            NegotiationMessage::Answer {
                sdp: "x".to_string(),
            },
        );
        assert_eq!(result, Err(SendError::Disconnected));
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let transport = Arc::new(ScriptedTransport {
            connects: AtomicUsize::new(0),
            fail_after: usize::MAX,
            scripts: SyncMutex::new(VecDeque::new()),
            sent: Arc::new(SyncMutex::new(Vec::new())),
            hold_open: false,
        });
        let (sink, events) = collecting_sink();
        let channel = SignalingChannel::connect(
            transport.clone(),
            ClientId::new("me"),
            fast_policy(3),
            sink,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        channel.disconnect().await;

        let events = events.lock().clone();
        assert!(events.contains(&ChannelEvent::Reconnected));
        assert!(!events.contains(&ChannelEvent::ChannelLost));
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_closed() {
        let transport = Arc::new(ScriptedTransport {
            connects: AtomicUsize::new(0),
            fail_after: usize::MAX,
            scripts: SyncMutex::new(VecDeque::new()),
            sent: Arc::new(SyncMutex::new(Vec::new())),
            hold_open: true,
        });
        let (sink, _events) = collecting_sink();
        let channel =
            SignalingChannel::connect(transport.clone(), ClientId::new("me"), fast_policy(1), sink)
                .await
                .unwrap();

        channel
            .send(
                &RoomId::new("R1"),
                NegotiationMessage::Offer {
                    sdp: "o".to_string(),
                },
            )
            .unwrap();
        channel.disconnect().await;
        channel.disconnect().await;

        assert_eq!(transport.sent.lock().len(), 1);
        let result = channel.send_frame(ClientMessage::Leave {
            room_id: RoomId::new("R1"),
            client_id: ClientId::new("me"),
        });
        assert_eq!(result, Err(SendError::Closed));
    }

    #[tokio::test]
    async fn test_frames_accepted_before_disconnect_reach_relay() {
        let relay = crate::testing::MemoryRelay::new();
        let (sink, _events) = collecting_sink();
        let channel = SignalingChannel::connect(
            Arc::new(relay.clone()),
            ClientId::new("me"),
            fast_policy(1),
            sink,
        )
        .await
        .unwrap();

        channel
            .send_frame(ClientMessage::Chat {
                room_id: RoomId::new("R1"),
                from: ClientId::new("me"),
                text: "last words".to_string(),
                sender_role: None,
            })
            .unwrap();
        channel.disconnect().await;

        let frames = relay.frames();
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ClientMessage::Chat { text, .. } if text == "last words"));
        assert_eq!(channel.status(), ChannelStatus::Closed);
    }

    // First connect succeeds and is dropped by the relay at once; every later
    // connect never resolves.
    struct BlackholeTransport {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl SignalingTransport for BlackholeTransport {
        async fn connect(&self) -> Result<Box<dyn RelayConnection>, TransportError> {
            if self.connects.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(Box::new(ScriptedConnection {
                    inbound: VecDeque::new(),
                    sent: Arc::new(SyncMutex::new(Vec::new())),
                    hold_open: false,
                }));
            }
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_interrupts_hanging_reconnect() {
        let transport = Arc::new(BlackholeTransport {
            connects: AtomicUsize::new(0),
        });
        let (sink, _events) = collecting_sink();
        let channel = SignalingChannel::connect(
            transport.clone(),
            ClientId::new("me"),
            fast_policy(3),
            sink,
        )
        .await
        .unwrap();

        let mut status = channel.watch_status();
        while !matches!(*status.borrow(), ChannelStatus::Degraded { .. }) {
            status.changed().await.unwrap();
        }
        while transport.connects.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tokio::time::timeout(Duration::from_secs(1), channel.disconnect())
            .await
            .expect("disconnect must not wait for a hanging connect");
        assert_eq!(channel.status(), ChannelStatus::Closed);
    }
}
