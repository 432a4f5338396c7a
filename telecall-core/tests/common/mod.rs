//! Shared fixtures for session integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use telecall_core::testing::{MemoryRelay, MockNetwork, MockPeerFactory, ScriptedMediaSource};
use telecall_core::{
    CallConfig, CallDependencies, CallEvent, CallHandle, CallSession, ClientId, PartyTag, RoomId,
    SessionSnapshot,
};
use tokio::sync::broadcast;

/// One participant: its handle plus the media source it draws tracks from
pub struct Party {
    pub id: ClientId,
    pub handle: CallHandle,
    pub media: Arc<ScriptedMediaSource>,
}

impl Party {
    pub fn new(relay: &MemoryRelay, network: &MockNetwork, name: &str, config: CallConfig) -> Self {
        let media = Arc::new(ScriptedMediaSource::default());
        let id = ClientId::new(name);
        let deps = CallDependencies {
            transport: Arc::new(relay.clone()),
            peers: Arc::new(MockPeerFactory::new(network.clone())),
            media: media.clone(),
        };
        let handle = CallSession::spawn_with_id(config, deps, id.clone());
        Self { id, handle, media }
    }

    /// Join `room` and wait until the relay acknowledged the join
    pub async fn join(&self, room: &str, tag: &str) {
        self.handle
            .join_room(RoomId::new(room), PartyTag::new(tag))
            .await
            .unwrap();
        wait_snapshot(&self.handle, |s| s.occupant_count >= 1).await;
    }

    /// Every track this party ever acquired has been stopped exactly once
    pub fn all_tracks_stopped_once(&self) -> bool {
        self.media
            .issued_tracks()
            .iter()
            .all(|t| t.is_stopped() && t.stop_calls() == 1)
    }
}

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

pub async fn wait_snapshot(
    handle: &CallHandle,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx = handle.subscribe();
    let snapshot = within(rx.wait_for(|s| pred(s)))
        .await
        .expect("session ended")
        .clone();
    snapshot
}

pub async fn expect_event(
    rx: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    within(async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
}

/// A (first occupant) and B join `R1` and both reach `Connected`
pub async fn connected_pair(
    relay: &MemoryRelay,
    network: &MockNetwork,
    config_a: CallConfig,
    config_b: CallConfig,
) -> (Party, Party) {
    let a = Party::new(relay, network, "doctor-a", config_a);
    let b = Party::new(relay, network, "patient-b", config_b);
    a.join("R1", "doctor").await;
    b.join("R1", "patient").await;
    within(a.handle.wait_for_state(telecall_core::SessionState::Connected))
        .await
        .unwrap();
    within(b.handle.wait_for_state(telecall_core::SessionState::Connected))
        .await
        .unwrap();
    (a, b)
}
