//! Device topology change handling.
//!
//! The watcher task listens to the host's hot-plug notifications and hands
//! each burst of events to a [`TopologyListener`], which refreshes the
//! catalog and reconciles the selection with [`reconcile`].

use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::device::{DeviceCatalog, DeviceKind, Selection};
use super::host::TopologyEvent;

/// A selected id that vanished from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearedSelection {
    pub kind: DeviceKind,
    pub device_id: String,
}

/// Clear every selected id that is not present in `catalog`.
///
/// Returns the reconciled selection and what was cleared, in kind order.
pub fn reconcile(selection: &Selection, catalog: &DeviceCatalog) -> (Selection, Vec<ClearedSelection>) {
    let mut next = selection.clone();
    let mut cleared = Vec::new();

    for kind in [DeviceKind::Camera, DeviceKind::Microphone, DeviceKind::Speaker] {
        let Some(id) = selection.get(kind) else {
            continue;
        };
        if !catalog.contains(kind, id) {
            cleared.push(ClearedSelection {
                kind,
                device_id: id.to_string(),
            });
            next.set(kind, None);
        }
    }

    (next, cleared)
}

/// Receives coalesced topology changes.
#[async_trait]
pub trait TopologyListener: Send + Sync {
    /// `events` is never empty.
    async fn topology_changed(&self, events: Vec<TopologyEvent>);
}

/// Handle to a running watcher task. Dropping it stops the task.
pub struct DeviceWatcher {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    /// Spawn a watcher on the current tokio runtime.
    ///
    /// The listener is held weakly; the task ends once it is gone.
    pub fn spawn(
        events: broadcast::Receiver<TopologyEvent>,
        listener: Weak<dyn TopologyListener>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(events, listener, cancel.clone()));
        debug!("device watcher started");
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop watching and wait for an in-progress reconciliation to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut events: broadcast::Receiver<TopologyEvent>,
    listener: Weak<dyn TopologyListener>,
    cancel: CancellationToken,
) {
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = events.recv() => received,
        };

        let mut batch = match first {
            Ok(event) => vec![event],
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "topology notifications dropped, forcing refresh");
                vec![TopologyEvent::Changed]
            }
            Err(RecvError::Closed) => break,
        };

        // Coalesce whatever else is already queued into one refresh
        loop {
            match events.try_recv() {
                Ok(event) => batch.push(event),
                Err(TryRecvError::Lagged(_)) => batch.push(TopologyEvent::Changed),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        let Some(listener) = listener.upgrade() else {
            break;
        };
        debug!(events = batch.len(), "topology changed");
        listener.topology_changed(batch).await;
    }
    debug!("device watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::device::DeviceDescriptor;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn catalog(devices: &[(&str, DeviceKind)]) -> DeviceCatalog {
        DeviceCatalog::from_devices(
            devices
                .iter()
                .map(|(id, kind)| DeviceDescriptor::new(*id, *kind, "")),
        )
    }

    #[test]
    fn vanished_camera_is_cleared_to_default() {
        let selection = Selection {
            camera_id: Some("cam-A".into()),
            ..Selection::default()
        };
        let (next, cleared) = reconcile(&selection, &catalog(&[("cam-B", DeviceKind::Camera)]));

        assert_eq!(next.camera_id, None);
        assert_eq!(
            cleared,
            vec![ClearedSelection {
                kind: DeviceKind::Camera,
                device_id: "cam-A".into()
            }]
        );
    }

    #[test]
    fn present_and_default_selections_are_kept() {
        let selection = Selection {
            camera_id: None,
            microphone_id: Some("m1".into()),
            speaker_id: Some("s1".into()),
        };
        let (next, cleared) = reconcile(
            &selection,
            &catalog(&[("m1", DeviceKind::Microphone), ("s1", DeviceKind::Speaker)]),
        );
        assert_eq!(next, selection);
        assert!(cleared.is_empty());
    }

    #[test]
    fn id_of_another_kind_does_not_count() {
        let selection = Selection {
            speaker_id: Some("shared".into()),
            ..Selection::default()
        };
        let (next, cleared) = reconcile(&selection, &catalog(&[("shared", DeviceKind::Microphone)]));
        assert_eq!(next.speaker_id, None);
        assert_eq!(cleared.len(), 1);
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<Vec<TopologyEvent>>>);

    #[async_trait]
    impl TopologyListener for Collect {
        async fn topology_changed(&self, events: Vec<TopologyEvent>) {
            self.0.lock().unwrap().push(events);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_events_are_coalesced() {
        let (tx, rx) = broadcast::channel(16);
        let collect = Arc::new(Collect::default());
        let listener: Arc<dyn TopologyListener> = collect.clone();

        tx.send(TopologyEvent::DeviceAdded { device_id: "a".into() }).unwrap();
        tx.send(TopologyEvent::DeviceRemoved { device_id: "b".into() }).unwrap();
        let watcher = DeviceWatcher::spawn(rx, Arc::downgrade(&listener));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let batches = collect.0.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        watcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_delivery() {
        let (tx, rx) = broadcast::channel(16);
        let collect = Arc::new(Collect::default());
        let listener: Arc<dyn TopologyListener> = collect.clone();

        let watcher = DeviceWatcher::spawn(rx, Arc::downgrade(&listener));
        assert!(watcher.is_running());
        watcher.shutdown().await;

        let _ = tx.send(TopologyEvent::Changed);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(collect.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ends_when_listener_is_dropped() {
        let (tx, rx) = broadcast::channel(16);
        let listener: Arc<dyn TopologyListener> = Arc::new(Collect::default());
        let watcher = DeviceWatcher::spawn(rx, Arc::downgrade(&listener));

        drop(listener);
        tx.send(TopologyEvent::Changed).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!watcher.is_running());
    }
}
