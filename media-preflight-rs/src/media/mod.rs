//! Media session core.
//!
//! This module provides device enumeration, permission tracking, the
//! capture stream state machine, input level metering, output routing and
//! hot-plug reconciliation.

pub mod analysis;
pub mod device;
pub mod enumerator;
pub mod host;
pub mod meter;
pub mod notifications;
pub mod output;
pub mod permissions;
pub mod session;

pub use device::{
    CaptureKind, DeviceCatalog, DeviceDescriptor, DeviceKind, FailureReason, MediaError,
    PermissionState, Selection,
};
pub use enumerator::DeviceEnumerator;
pub use host::{
    AudioClip, AudioTap, DeviceConstraint, HostError, HostPermission, MediaHost, MediaTrack,
    TopologyEvent, TrackHandle,
};
pub use meter::{LevelMeter, LevelReading, TrackEndedHook};
pub use notifications::{reconcile, ClearedSelection, DeviceWatcher, TopologyListener};
pub use output::{OutputRouter, PlaybackOutcome};
pub use permissions::PermissionGate;
pub use session::{SessionState, StreamRequest, StreamSession, StreamSnapshot};
