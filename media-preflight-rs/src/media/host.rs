//! Host capability boundary.
//!
//! Everything the core needs from the platform (enumeration, consent,
//! capture, playback and hot-plug notifications) goes through these traits
//! so a fake host can stand in for tests.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use super::device::{CaptureKind, DeviceDescriptor};

/// Failures reported by a host backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("not allowed")]
    NotAllowed,

    #[error("device not found")]
    NotFound,

    #[error("no device satisfies the exact constraint")]
    Overconstrained,

    #[error("device busy: {0}")]
    Busy(String),

    /// Playback cannot be bound to an explicit output on this host
    #[error("output routing unsupported")]
    RoutingUnsupported,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Consent as the host reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPermission {
    Granted,
    Denied,
    /// The host would show a prompt if asked
    Prompt,
}

/// How a capture device is picked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceConstraint {
    /// Whatever the host considers the default for the kind
    Default,

    /// Exactly this device id, or fail
    Exact(String),
}

impl DeviceConstraint {
    pub fn from_selection(id: Option<&str>) -> Self {
        match id {
            Some(id) if !id.is_empty() => DeviceConstraint::Exact(id.to_string()),
            _ => DeviceConstraint::Default,
        }
    }

    pub fn exact_id(&self) -> Option<&str> {
        match self {
            DeviceConstraint::Default => None,
            DeviceConstraint::Exact(id) => Some(id),
        }
    }
}

/// Hot-plug notification from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    DeviceAdded { device_id: String },
    DeviceRemoved { device_id: String },
    DeviceStateChanged { device_id: String },
    DefaultDeviceChanged,
    /// Something changed; the host does not say what
    Changed,
}

/// A mono PCM clip played through an output endpoint.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Read access to the most recent samples of a live audio track.
pub trait AudioTap: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Copy the newest mono samples into the tail of `out` (oldest first).
    /// Returns how many samples were written; 0 once the track has stopped.
    fn read_latest(&self, out: &mut [f32]) -> usize;
}

/// One live audio or video line opened by the host.
pub trait MediaTrack: Send + Sync {
    /// Unique per opened track
    fn id(&self) -> &str;

    fn kind(&self) -> CaptureKind;

    /// The device actually opened (resolved even for default constraints)
    fn device_id(&self) -> &str;

    fn label(&self) -> &str;

    fn is_live(&self) -> bool;

    /// Release the hardware. Idempotent.
    fn stop(&self);

    /// Sample access for audio tracks; `None` for video.
    fn audio_tap(&self) -> Option<Arc<dyn AudioTap>>;
}

/// The platform's media-capture and audio-playback primitives.
#[async_trait]
pub trait MediaHost: Send + Sync {
    /// List every capture and playback endpoint.
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, HostError>;

    /// Current consent for a kind, without prompting.
    async fn query_permission(&self, kind: CaptureKind) -> Result<HostPermission, HostError>;

    /// Ask the user for consent. Never returns `Prompt`.
    async fn request_permission(&self, kind: CaptureKind) -> Result<HostPermission, HostError>;

    /// Open a live track of `kind` satisfying `constraint`.
    async fn open_track(
        &self,
        kind: CaptureKind,
        constraint: &DeviceConstraint,
    ) -> Result<Arc<dyn MediaTrack>, HostError>;

    /// Whether playback can be bound to an explicit output id.
    fn supports_output_routing(&self) -> bool;

    /// Play a clip to completion, on `output_id` or the default output.
    async fn play_clip(&self, clip: &AudioClip, output_id: Option<&str>) -> Result<(), HostError>;

    /// Subscribe to hot-plug notifications.
    fn topology_events(&self) -> broadcast::Receiver<TopologyEvent>;
}

/// Read-only view of a track owned by the stream session.
///
/// Handles can inspect and tap a track but never stop it.
#[derive(Clone)]
pub struct TrackHandle {
    track: Arc<dyn MediaTrack>,
}

impl TrackHandle {
    pub(crate) fn new(track: Arc<dyn MediaTrack>) -> Self {
        Self { track }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn kind(&self) -> CaptureKind {
        self.track.kind()
    }

    pub fn device_id(&self) -> &str {
        self.track.device_id()
    }

    pub fn label(&self) -> &str {
        self.track.label()
    }

    pub fn is_live(&self) -> bool {
        self.track.is_live()
    }

    pub fn audio_tap(&self) -> Option<Arc<dyn AudioTap>> {
        self.track.audio_tap()
    }
}

impl std::fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("device_id", &self.device_id())
            .field("live", &self.is_live())
            .finish()
    }
}
