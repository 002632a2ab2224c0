//! Media Preflight - Library
//!
//! The session core of a pre-call device check: pick a camera, microphone
//! and speaker, grant access, preview the live stream, watch the input level
//! and play a test tone, before joining a call.
//!
//! ## Features
//!
//! - Device catalog of cameras, microphones and speakers
//! - Per-kind permission tracking with label refresh on grant
//! - Stream session that switches devices open-then-close
//! - Input level meter with synchronous detach
//! - Test tone routed to the selected output, with default-output fallback
//! - Hot-plug reconciliation of stale selections
//!
//! Platform access goes through [`media::MediaHost`]; [`testing::FakeHost`]
//! is an in-process host for tests.

pub mod app;
pub mod config;
pub mod logging;
pub mod media;
pub mod platform;
pub mod testing;

pub use app::{MediaEvent, MediaSessionManager};
pub use config::{ConfigError, PreflightConfig};
pub use media::{
    CaptureKind, DeviceCatalog, DeviceDescriptor, DeviceKind, LevelReading, MediaError,
    PermissionState, PlaybackOutcome, Selection, SessionState,
};
