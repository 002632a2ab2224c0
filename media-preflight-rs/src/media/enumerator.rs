//! Device enumeration through the host.
//!
//! Queries the host for every endpoint and classifies it by kind.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::device::{DeviceCatalog, DeviceDescriptor, DeviceKind, MediaError};
use super::host::MediaHost;

/// Builds catalogs from host listings.
pub struct DeviceEnumerator {
    host: Arc<dyn MediaHost>,
}

impl DeviceEnumerator {
    pub fn new(host: Arc<dyn MediaHost>) -> Self {
        Self { host }
    }

    /// Query the host and build a fresh catalog.
    ///
    /// On failure the caller keeps whatever catalog it already had.
    pub async fn refresh(&self) -> Result<DeviceCatalog, MediaError> {
        let devices = self.host.enumerate_devices().await.map_err(|e| {
            warn!(error = %e, "device enumeration refused");
            MediaError::EnumerationError(e.to_string())
        })?;

        let catalog = DeviceCatalog::from_devices(dedup_within_kind(devices));
        debug!(
            cameras = catalog.cameras.len(),
            microphones = catalog.microphones.len(),
            speakers = catalog.speakers.len(),
            "device catalog refreshed"
        );
        Ok(catalog)
    }
}

/// Some hosts report the same endpoint twice (e.g. a "default" alias entry).
/// Ids are unique within a kind, so the first occurrence wins.
fn dedup_within_kind(devices: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut seen: HashMap<DeviceKind, Vec<String>> = HashMap::new();
    devices
        .into_iter()
        .filter(|d| {
            let ids = seen.entry(d.kind).or_default();
            if ids.contains(&d.id) {
                false
            } else {
                ids.push(d.id.clone());
                true
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::host::HostError;
    use crate::testing::FakeHost;

    #[tokio::test]
    async fn refresh_classifies_devices() {
        let host = Arc::new(
            FakeHost::new()
                .with_device("c1", DeviceKind::Camera, "Front")
                .with_device("m1", DeviceKind::Microphone, "Headset")
                .with_device("s1", DeviceKind::Speaker, "Speakers")
                .granted(),
        );
        let enumerator = DeviceEnumerator::new(host);

        let catalog = enumerator.refresh().await.unwrap();
        assert_eq!(catalog.cameras[0].label, "Front");
        assert_eq!(catalog.microphones[0].id, "m1");
        assert_eq!(catalog.speakers[0].kind, DeviceKind::Speaker);
    }

    #[tokio::test]
    async fn refusal_is_reported_as_enumeration_error() {
        let host = Arc::new(FakeHost::new());
        host.fail_enumeration(Some(HostError::Other("blocked".into())));
        let enumerator = DeviceEnumerator::new(host);

        let err = enumerator.refresh().await.unwrap_err();
        assert!(matches!(err, MediaError::EnumerationError(_)));
    }

    #[tokio::test]
    async fn same_id_in_different_kinds_is_kept() {
        let host = Arc::new(
            FakeHost::new()
                .with_device("default", DeviceKind::Microphone, "")
                .with_device("default", DeviceKind::Speaker, "")
                .with_device("default", DeviceKind::Speaker, ""),
        );
        let catalog = DeviceEnumerator::new(host).refresh().await.unwrap();
        assert_eq!(catalog.microphones.len(), 1);
        assert_eq!(catalog.speakers.len(), 1);
    }
}
