//! Test doubles for the host boundary.

pub mod fake_host;

pub use fake_host::{FakeHost, FakeTrack, PlayedClip};
