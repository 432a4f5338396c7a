//! Local and remote media for a call
//!
//! A [`LocalMediaBundle`] owns the local tracks. The session is the only code
//! that creates or releases bundles; everything else may only flip the
//! enabled flag of an existing track.
//!
//! Acquisition goes through [`acquire_with_fallback`], which walks the
//! degrade ladder (video call, then audio only, then data only) instead of
//! failing the call when a device is missing.

use crate::types::{MediaConstraints, MediaKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Stream identifier shared by all local tracks of a bundle
const LOCAL_STREAM_ID: &str = "telecall";

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device present but could not be opened
    #[error("Acquisition failed: {0}")]
    AcquisitionFailed(String),

    /// Bundle is already attached to a live negotiator
    #[error("Media bundle already attached to negotiator {0}")]
    AlreadyAttached(u64),
}

/// One local audio or video track
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    stop_calls: AtomicU32,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Create a track of `kind` with the engine's default codec for it
    #[must_use]
    pub fn new(kind: MediaKind) -> Self {
        let id = format!("{kind}-{}", Uuid::new_v4());
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        tracing::debug!(track_id = %id, codec = %codec.mime_type, "Local track created");
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            LOCAL_STREAM_ID.to_string(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            stop_calls: AtomicU32::new(0),
            rtc,
        }
    }

    /// Track identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Whether the track currently sends media
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.is_stopped()
    }

    /// Enable or disable the track; a stopped track stays disabled
    ///
    /// Returns the resulting enabled state.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.enabled.store(enabled, Ordering::Release);
        enabled
    }

    /// Whether the track was released
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Release the track
    ///
    /// Returns `true` only for the call that actually released it.
    pub fn stop(&self) -> bool {
        self.stop_calls.fetch_add(1, Ordering::AcqRel);
        let released = self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if released {
            self.enabled.store(false, Ordering::Release);
            tracing::debug!(track_id = %self.id, kind = %self.kind, "Local track stopped");
        } else {
            tracing::warn!(track_id = %self.id, "Stop requested for an already stopped track");
        }
        released
    }

    /// Number of times `stop` was invoked on this track
    #[must_use]
    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::Acquire)
    }

    /// Engine-side track handle
    #[must_use]
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Local tracks of one acquisition
///
/// Attached to at most one negotiator at a time; see [`LocalMediaBundle::claim`].
#[derive(Debug, Default)]
pub struct LocalMediaBundle {
    tracks: Vec<Arc<LocalTrack>>,
    attached_to: Mutex<Option<u64>>,
}

impl LocalMediaBundle {
    /// Bundle holding `tracks`
    #[must_use]
    pub fn new(tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self {
            tracks,
            attached_to: Mutex::new(None),
        }
    }

    /// Bundle without tracks (data-only call)
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// First track of `kind`
    #[must_use]
    pub fn track(&self, kind: MediaKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Whether the bundle carries a track of `kind`
    #[must_use]
    pub fn has(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some()
    }

    /// Whether the bundle carries no tracks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Constraints this bundle actually satisfies
    #[must_use]
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: self.has(MediaKind::Audio),
            video: self.has(MediaKind::Video),
        }
    }

    /// Whether every track of `kind` sends media
    #[must_use]
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some_and(|t| t.is_enabled())
    }

    /// Flip the enabled flag of every track of `kind`
    ///
    /// Returns the new state, or `None` if the bundle has no such track.
    pub fn toggle(&self, kind: MediaKind) -> Option<bool> {
        let target = !self.is_enabled(kind);
        let mut result = None;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            result = Some(track.set_enabled(target));
        }
        result
    }

    /// Release every track; returns how many were actually released
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Whether all tracks were released
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(|t| t.is_stopped())
    }

    /// Mark the bundle as attached to negotiator `owner`
    ///
    /// # Errors
    ///
    /// Returns error if another negotiator already holds it
    pub fn claim(&self, owner: u64) -> Result<(), MediaError> {
        let mut attached = self.attached_to.lock();
        match *attached {
            Some(current) => Err(MediaError::AlreadyAttached(current)),
            None => {
                *attached = Some(owner);
                Ok(())
            }
        }
    }

    /// Detach from `owner`; a no-op if `owner` does not hold the bundle
    pub fn release(&self, owner: u64) {
        let mut attached = self.attached_to.lock();
        if *attached == Some(owner) {
            *attached = None;
        }
    }

    /// Negotiator currently holding the bundle
    #[must_use]
    pub fn attached_to(&self) -> Option<u64> {
        *self.attached_to.lock()
    }
}

/// Track received from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub kind: MediaKind,
}

/// Remote tracks surfaced to the UI; never owned or mutated by the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMediaBundle {
    tracks: Vec<RemoteTrack>,
}

impl RemoteMediaBundle {
    /// Add a track, ignoring duplicates by id
    ///
    /// Returns whether the track was new.
    pub fn push(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// All tracks
    #[must_use]
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    /// Whether a track of `kind` arrived
    #[must_use]
    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    /// Whether no track arrived
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Source of local media
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open tracks satisfying `constraints`
    ///
    /// # Errors
    ///
    /// Returns error if any requested device is unavailable
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaBundle, MediaError>;
}

/// Media source backed by the engine's sample tracks
///
/// `available` describes which capture devices exist on this host.
#[derive(Debug, Clone)]
pub struct DeviceMediaSource {
    available: MediaConstraints,
}

impl DeviceMediaSource {
    /// Source with the given devices present
    #[must_use]
    pub fn new(available: MediaConstraints) -> Self {
        Self { available }
    }
}

impl Default for DeviceMediaSource {
    fn default() -> Self {
        Self::new(MediaConstraints::video_call())
    }
}

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaBundle, MediaError> {
        if constraints.audio && !self.available.audio {
            return Err(MediaError::DeviceNotFound("microphone".to_string()));
        }
        if constraints.video && !self.available.video {
            return Err(MediaError::DeviceNotFound("camera".to_string()));
        }
        let tracks = constraints
            .to_media_kinds()
            .into_iter()
            .map(|kind| Arc::new(LocalTrack::new(kind)))
            .collect();
        Ok(LocalMediaBundle::new(tracks))
    }
}

/// Result of walking the degrade ladder
#[derive(Debug)]
pub struct AcquiredMedia {
    /// Acquired tracks; empty for a data-only call
    pub bundle: LocalMediaBundle,
    /// One human readable entry per downgrade step taken
    pub downgrades: Vec<String>,
}

/// Acquire media, downgrading on failure
///
/// Tries `requested`, then each weaker set from
/// [`MediaConstraints::downgrade`]. A data-only result is always possible, so
/// this never fails.
#[tracing::instrument(skip(source))]
pub async fn acquire_with_fallback(
    source: &dyn MediaSource,
    requested: &MediaConstraints,
) -> AcquiredMedia {
    let mut downgrades = Vec::new();
    let mut current = requested.clone();
    loop {
        if !current.wants_media() {
            tracing::info!("Continuing as data-only call");
            return AcquiredMedia {
                bundle: LocalMediaBundle::empty(),
                downgrades,
            };
        }
        match source.acquire(&current).await {
            Ok(bundle) => {
                tracing::info!(audio = current.audio, video = current.video, "Local media acquired");
                return AcquiredMedia { bundle, downgrades };
            }
            Err(e) => {
                let next = current.downgrade().unwrap_or_else(MediaConstraints::data_only);
                tracing::warn!(error = %e, audio = next.audio, video = next.video, "Media acquisition failed, downgrading");
                downgrades.push(format!(
                    "media downgraded to {} after: {e}",
                    describe(&next)
                ));
                current = next;
            }
        }
    }
}

fn describe(constraints: &MediaConstraints) -> &'static str {
    match (constraints.audio, constraints.video) {
        (true, true) => "audio+video",
        (true, false) => "audio-only",
        (false, true) => "video-only",
        (false, false) => "data-only",
    }
}
