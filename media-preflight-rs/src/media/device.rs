//! Media device data models.
//!
//! Defines the core data structures for representing capture and playback
//! endpoints, the user's selection, permission state and the error taxonomy
//! shared by every component.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::host::HostError;

/// Kind of endpoint a device exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Video capture (webcam, capture card)
    Camera,

    /// Audio capture
    Microphone,

    /// Audio playback
    Speaker,
}

impl DeviceKind {
    /// The capture kind for this device, if it produces live tracks.
    pub fn capture_kind(self) -> Option<CaptureKind> {
        match self {
            DeviceKind::Camera => Some(CaptureKind::Video),
            DeviceKind::Microphone => Some(CaptureKind::Audio),
            DeviceKind::Speaker => None,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Camera => write!(f, "camera"),
            DeviceKind::Microphone => write!(f, "microphone"),
            DeviceKind::Speaker => write!(f, "speaker"),
        }
    }
}

/// Kind of live track a capture device produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureKind {
    Video,
    Audio,
}

impl CaptureKind {
    /// Both capture kinds, in the order they are requested (camera first).
    pub const ALL: [CaptureKind; 2] = [CaptureKind::Video, CaptureKind::Audio];

    /// The device kind that backs tracks of this capture kind.
    pub fn device_kind(self) -> DeviceKind {
        match self {
            CaptureKind::Video => DeviceKind::Camera,
            CaptureKind::Audio => DeviceKind::Microphone,
        }
    }
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureKind::Video => write!(f, "video"),
            CaptureKind::Audio => write!(f, "audio"),
        }
    }
}

/// An immutable snapshot of one endpoint reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Opaque host identifier, unique within a kind
    pub id: String,

    /// What the endpoint does
    pub kind: DeviceKind,

    /// Human-readable name (empty until the kind is authorized)
    pub label: String,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, kind: DeviceKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
        }
    }

    /// Label for display, falling back to a synthetic name when the host hides it.
    pub fn display_name(&self) -> String {
        if self.label.is_empty() {
            format!("{} {}", self.kind, self.id)
        } else {
            self.label.clone()
        }
    }
}

/// All known endpoints, one ordered list per kind.
///
/// Rebuilt wholesale on every refresh; never patched in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCatalog {
    pub cameras: Vec<DeviceDescriptor>,
    pub microphones: Vec<DeviceDescriptor>,
    pub speakers: Vec<DeviceDescriptor>,
}

impl DeviceCatalog {
    /// Classify a flat host listing by kind, preserving host order.
    pub fn from_devices(devices: impl IntoIterator<Item = DeviceDescriptor>) -> Self {
        let mut catalog = Self::default();
        for device in devices {
            match device.kind {
                DeviceKind::Camera => catalog.cameras.push(device),
                DeviceKind::Microphone => catalog.microphones.push(device),
                DeviceKind::Speaker => catalog.speakers.push(device),
            }
        }
        catalog
    }

    /// Devices of one kind.
    pub fn devices(&self, kind: DeviceKind) -> &[DeviceDescriptor] {
        match kind {
            DeviceKind::Camera => &self.cameras,
            DeviceKind::Microphone => &self.microphones,
            DeviceKind::Speaker => &self.speakers,
        }
    }

    /// Look up a device by kind and id.
    pub fn find(&self, kind: DeviceKind, id: &str) -> Option<&DeviceDescriptor> {
        self.devices(kind).iter().find(|d| d.id == id)
    }

    pub fn contains(&self, kind: DeviceKind, id: &str) -> bool {
        self.find(kind, id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty() && self.microphones.is_empty() && self.speakers.is_empty()
    }
}

/// The user's chosen endpoints. `None` means "system default" for capture
/// kinds and "no explicit routing" for playback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub camera_id: Option<String>,
    pub microphone_id: Option<String>,
    pub speaker_id: Option<String>,
}

impl Selection {
    /// The selected id for a kind.
    pub fn get(&self, kind: DeviceKind) -> Option<&str> {
        match kind {
            DeviceKind::Camera => self.camera_id.as_deref(),
            DeviceKind::Microphone => self.microphone_id.as_deref(),
            DeviceKind::Speaker => self.speaker_id.as_deref(),
        }
    }

    /// Replace the selected id for a kind. Empty strings are stored as default.
    pub fn set(&mut self, kind: DeviceKind, id: Option<String>) {
        let id = id.filter(|id| !id.is_empty());
        match kind {
            DeviceKind::Camera => self.camera_id = id,
            DeviceKind::Microphone => self.microphone_id = id,
            DeviceKind::Speaker => self.speaker_id = id,
        }
    }

    /// The selected id for a capture kind.
    pub fn capture_id(&self, kind: CaptureKind) -> Option<&str> {
        self.get(kind.device_kind())
    }
}

/// Consent state for one capture kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PermissionState {
    /// Never asked in this session
    #[default]
    Unknown,

    /// A host prompt is showing
    Prompting,

    Granted,

    Denied,
}

/// Why an acquisition from `Idle` ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    PermissionDenied,
    DeviceUnavailable,
    ConstraintError,
}

/// Media service error types.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MediaError {
    #[error("Failed to enumerate devices: {0}")]
    EnumerationError(String),

    #[error("Access to {kind} was denied")]
    AccessDenied { kind: CaptureKind },

    #[error("Device unavailable ({kind}): {reason}")]
    DeviceUnavailable {
        kind: DeviceKind,
        device_id: Option<String>,
        reason: String,
    },

    #[error("No {kind} device satisfies id {device_id}")]
    ConstraintError { kind: CaptureKind, device_id: String },

    #[error("Output routing is not supported, played on the default output")]
    RoutingUnsupported,

    #[error("Host error: {0}")]
    Host(String),
}

impl MediaError {
    /// Categorise a host failure raised while working with `kind`.
    pub fn from_host(kind: DeviceKind, device_id: Option<&str>, err: HostError) -> Self {
        match err {
            HostError::NotAllowed => match kind.capture_kind() {
                Some(kind) => MediaError::AccessDenied { kind },
                None => MediaError::DeviceUnavailable {
                    kind,
                    device_id: device_id.map(str::to_string),
                    reason: "not allowed".to_string(),
                },
            },
            HostError::NotFound | HostError::Busy(_) => {
                MediaError::DeviceUnavailable {
                    kind,
                    device_id: device_id.map(str::to_string),
                    reason: err.to_string(),
                }
            }
            HostError::Overconstrained => match (kind.capture_kind(), device_id) {
                (Some(capture), Some(id)) => MediaError::ConstraintError {
                    kind: capture,
                    device_id: id.to_string(),
                },
                _ => MediaError::DeviceUnavailable {
                    kind,
                    device_id: device_id.map(str::to_string),
                    reason: err.to_string(),
                },
            },
            HostError::RoutingUnsupported => MediaError::RoutingUnsupported,
            HostError::Unsupported(msg) | HostError::Other(msg) => MediaError::Host(msg),
        }
    }

    /// The state-machine failure reason this error corresponds to.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            MediaError::AccessDenied { .. } => FailureReason::PermissionDenied,
            MediaError::ConstraintError { .. } => FailureReason::ConstraintError,
            _ => FailureReason::DeviceUnavailable,
        }
    }

    /// False only for failures that must not be retried automatically.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, MediaError::AccessDenied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_classifies_by_kind_in_host_order() {
        let catalog = DeviceCatalog::from_devices(vec![
            DeviceDescriptor::new("m1", DeviceKind::Microphone, "Mic"),
            DeviceDescriptor::new("c1", DeviceKind::Camera, ""),
            DeviceDescriptor::new("c2", DeviceKind::Camera, ""),
            DeviceDescriptor::new("s1", DeviceKind::Speaker, "Speakers"),
        ]);

        let cameras: Vec<_> = catalog.cameras.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(cameras, ["c1", "c2"]);
        assert_eq!(catalog.microphones.len(), 1);
        assert_eq!(catalog.speakers.len(), 1);
        assert!(catalog.contains(DeviceKind::Camera, "c2"));
        assert!(!catalog.contains(DeviceKind::Microphone, "c2"));
    }

    #[test]
    fn selection_treats_empty_id_as_default() {
        let mut selection = Selection::default();
        selection.set(DeviceKind::Camera, Some("cam-A".into()));
        assert_eq!(selection.get(DeviceKind::Camera), Some("cam-A"));

        selection.set(DeviceKind::Camera, Some(String::new()));
        assert_eq!(selection.get(DeviceKind::Camera), None);
    }

    #[test]
    fn display_name_falls_back_when_label_hidden() {
        let device = DeviceDescriptor::new("abc", DeviceKind::Camera, "");
        assert_eq!(device.display_name(), "camera abc");
    }

    #[test]
    fn host_errors_map_onto_taxonomy() {
        let err = MediaError::from_host(DeviceKind::Camera, Some("c9"), HostError::Overconstrained);
        assert_eq!(
            err,
            MediaError::ConstraintError {
                kind: CaptureKind::Video,
                device_id: "c9".into()
            }
        );
        assert_eq!(err.failure_reason(), FailureReason::ConstraintError);

        let err = MediaError::from_host(DeviceKind::Microphone, None, HostError::NotAllowed);
        assert_eq!(err, MediaError::AccessDenied { kind: CaptureKind::Audio });
        assert!(!err.is_recoverable());

        let err = MediaError::from_host(DeviceKind::Microphone, None, HostError::Overconstrained);
        assert_eq!(err.failure_reason(), FailureReason::DeviceUnavailable);
    }
}
