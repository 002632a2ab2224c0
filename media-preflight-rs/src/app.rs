//! Media session manager.
//!
//! Ties the catalog, permission gate, stream session, level meter, output
//! router and device watcher together behind the operations a pre-call
//! check screen needs, and reports every state change as a [`MediaEvent`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PreflightConfig};
use crate::media::device::{
    CaptureKind, DeviceCatalog, DeviceKind, MediaError, PermissionState, Selection,
};
use crate::media::enumerator::DeviceEnumerator;
use crate::media::host::{DeviceConstraint, MediaHost, TopologyEvent};
use crate::media::meter::{LevelMeter, LevelReading};
use crate::media::notifications::{reconcile, DeviceWatcher, TopologyListener};
use crate::media::output::{OutputRouter, PlaybackOutcome};
use crate::media::permissions::PermissionGate;
use crate::media::session::{SessionState, StreamRequest, StreamSession, StreamSnapshot};

const EVENT_CAPACITY: usize = 64;

/// Something the UI should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    CatalogUpdated(DeviceCatalog),

    PermissionChanged {
        kind: CaptureKind,
        state: PermissionState,
    },

    SessionChanged(SessionState),

    /// A selected device vanished; the kind is back to default
    SelectionCleared { kind: DeviceKind, device_id: String },

    /// An exact device id could not be satisfied and the default device was used
    FellBackToDefault { kind: CaptureKind, requested: String },

    Failure(MediaError),
}

/// Main entry point for the pre-call check.
pub struct MediaSessionManager {
    config: PreflightConfig,
    enumerator: DeviceEnumerator,
    permissions: PermissionGate,
    session: Arc<StreamSession>,
    meter: Arc<LevelMeter>,
    output: OutputRouter,
    host: Arc<dyn MediaHost>,
    catalog: watch::Sender<DeviceCatalog>,
    selection: Mutex<Selection>,
    events: broadcast::Sender<MediaEvent>,
    watcher: Mutex<Option<DeviceWatcher>>,
}

impl MediaSessionManager {
    /// Create a manager over `host`. Fails if `config` does not validate.
    pub fn new(host: Arc<dyn MediaHost>, config: PreflightConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let meter = Arc::new(LevelMeter::new(config.meter.clone()));
        let session =
            Arc::new(StreamSession::new(host.clone()).with_audio_listener(meter.clone()));
        let (catalog, _) = watch::channel(DeviceCatalog::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        // The meter notices an unplugged microphone first; let the session drop it
        meter.on_track_ended({
            let session = Arc::downgrade(&session);
            let events = events.clone();
            move |track_id| {
                let Some(session) = session.upgrade() else {
                    return;
                };
                debug!(track = track_id, "audio track ended, releasing it");
                let events = events.clone();
                tokio::spawn(async move {
                    if session.release_ended().await {
                        let _ = events.send(MediaEvent::SessionChanged(session.state()));
                    }
                });
            }
        });

        Ok(Self {
            enumerator: DeviceEnumerator::new(host.clone()),
            permissions: PermissionGate::new(host.clone()),
            output: OutputRouter::new(host.clone(), &config.tone),
            session,
            meter,
            host,
            catalog,
            selection: Mutex::new(Selection::default()),
            events,
            watcher: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &PreflightConfig {
        &self.config
    }

    fn lock_selection(&self) -> MutexGuard<'_, Selection> {
        self.selection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: MediaEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Subscribe to state change notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    /// Most recent successfully enumerated catalog.
    pub fn catalog(&self) -> DeviceCatalog {
        self.catalog.borrow().clone()
    }

    pub fn subscribe_catalog(&self) -> watch::Receiver<DeviceCatalog> {
        self.catalog.subscribe()
    }

    pub fn selection(&self) -> Selection {
        self.lock_selection().clone()
    }

    pub fn permission(&self, kind: CaptureKind) -> PermissionState {
        self.permissions.state(kind)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.session.snapshot()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<StreamSnapshot> {
        self.session.subscribe()
    }

    /// Stream of input levels for the current audio track.
    pub fn level_readings(&self) -> watch::Receiver<LevelReading> {
        self.meter.subscribe()
    }

    pub fn meter(&self) -> &LevelMeter {
        &self.meter
    }

    // ---- Catalog ----

    /// Re-enumerate devices and reconcile the selection against the result.
    ///
    /// On failure the previous catalog is kept.
    pub async fn refresh_catalog(&self) -> Result<DeviceCatalog, MediaError> {
        let catalog = match self.enumerator.refresh().await {
            Ok(catalog) => catalog,
            Err(e) => {
                self.emit(MediaEvent::Failure(e.clone()));
                return Err(e);
            }
        };
        self.catalog.send_replace(catalog.clone());

        let cleared = {
            let mut selection = self.lock_selection();
            let (mut next, cleared) = reconcile(&selection, &catalog);
            if self.config.session.auto_select_first {
                auto_select(&mut next, &catalog);
            }
            *selection = next;
            cleared
        };

        self.emit(MediaEvent::CatalogUpdated(catalog.clone()));
        for entry in cleared {
            info!(kind = %entry.kind, device = %entry.device_id, "selected device vanished, using default");
            self.emit(MediaEvent::SelectionCleared {
                kind: entry.kind,
                device_id: entry.device_id,
            });
        }
        Ok(catalog)
    }

    /// Refresh, then let go of tracks whose device is gone.
    async fn refresh_and_release(&self) -> Result<DeviceCatalog, MediaError> {
        let catalog = self.refresh_catalog().await?;

        let snapshot = self.session.snapshot();
        for kind in CaptureKind::ALL {
            let Some(track) = snapshot.track(kind) else {
                continue;
            };
            let vanished = !catalog.contains(kind.device_kind(), track.device_id());
            if !track.is_live() || (vanished && self.config.session.release_vanished_tracks) {
                info!(%kind, device = track.device_id(), "releasing track of vanished device");
                self.session.stop_kind(kind).await;
                self.emit(MediaEvent::SessionChanged(self.session.state()));
            }
        }
        Ok(catalog)
    }

    /// React to a burst of hot-plug notifications.
    pub async fn handle_topology_change(&self, events: &[TopologyEvent]) -> Result<(), MediaError> {
        debug!(?events, "handling topology change");
        self.refresh_and_release().await.map(|_| ())
    }

    /// Start following host hot-plug notifications. Replaces a previous watcher.
    pub fn watch_devices(self: &Arc<Self>) {
        let this: Arc<dyn TopologyListener> = self.clone();
        let watcher = DeviceWatcher::spawn(self.host.topology_events(), Arc::downgrade(&this));
        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
    }

    pub async fn stop_watching(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(watcher) = watcher {
            watcher.shutdown().await;
        }
    }

    // ---- Permissions ----

    /// Publish a permission change; true if the kind just became `Granted`.
    fn permission_transition(&self, kind: CaptureKind, before: PermissionState) -> bool {
        let after = self.permissions.state(kind);
        if after != before {
            self.emit(MediaEvent::PermissionChanged { kind, state: after });
        }
        after == PermissionState::Granted && before != PermissionState::Granted
    }

    async fn refresh_after_grant(&self) {
        if let Err(e) = self.refresh_catalog().await {
            warn!(error = %e, "refresh after permission grant failed");
        }
    }

    /// Ask for consent to capture `kind`, refreshing labels once granted.
    pub async fn request_access(&self, kind: CaptureKind) -> Result<PermissionState, MediaError> {
        let before = self.permissions.state(kind);
        let result = self.permissions.request_access(kind).await;
        if self.permission_transition(kind, before) {
            self.refresh_after_grant().await;
        }
        if let Err(e) = &result {
            self.emit(MediaEvent::Failure(e.clone()));
        }
        result
    }

    /// Ask for the camera, then the microphone, then refresh once.
    ///
    /// A refused camera does not stop the microphone from being asked.
    pub async fn request_all_access(
        &self,
    ) -> Vec<(CaptureKind, Result<PermissionState, MediaError>)> {
        let mut results = Vec::with_capacity(CaptureKind::ALL.len());
        let mut granted = false;

        for kind in CaptureKind::ALL {
            let before = self.permissions.state(kind);
            let result = self.permissions.request_access(kind).await;
            granted |= self.permission_transition(kind, before);
            if let Err(e) = &result {
                self.emit(MediaEvent::Failure(e.clone()));
            }
            results.push((kind, result));
        }

        if granted {
            self.refresh_after_grant().await;
        }
        results
    }

    /// Pick up consent the host already has on record, without prompting.
    pub async fn sync_permissions(&self) -> HashMap<CaptureKind, PermissionState> {
        let before: Vec<_> = CaptureKind::ALL
            .iter()
            .map(|&kind| (kind, self.permissions.state(kind)))
            .collect();
        let states = self.permissions.sync_with_host().await;

        let mut granted = false;
        for (kind, before) in before {
            granted |= self.permission_transition(kind, before);
        }
        if granted {
            self.refresh_after_grant().await;
        }
        states
    }

    // ---- Stream ----

    /// Acquire camera and microphone for `selection`.
    ///
    /// Once acquired, the capture ids become the current selection; the
    /// speaker id is ignored. A failed request leaves the selection alone.
    pub async fn request_stream(&self, selection: &Selection) -> Result<StreamSnapshot, MediaError> {
        self.acquire(StreamRequest::from_selection(selection), selection.clone())
            .await
    }

    /// Acquire a single kind with the current selection, leaving the other kind alone.
    pub async fn start_kind(&self, kind: CaptureKind) -> Result<StreamSnapshot, MediaError> {
        let selection = self.selection();
        let constraint = DeviceConstraint::from_selection(selection.capture_id(kind));
        self.acquire(StreamRequest::only(kind, constraint), selection)
            .await
    }

    /// Change the selected device for `kind`; `None` goes back to default.
    ///
    /// For a capture kind while tracks are held, the stream is re-requested
    /// and the new snapshot returned; the selection only changes if that
    /// succeeds.
    pub async fn select_device(
        &self,
        kind: DeviceKind,
        device_id: Option<&str>,
    ) -> Result<Option<StreamSnapshot>, MediaError> {
        let device_id = device_id.filter(|id| !id.is_empty());
        if let Some(id) = device_id {
            if !self.catalog.borrow().contains(kind, id) {
                let err = MediaError::DeviceUnavailable {
                    kind,
                    device_id: Some(id.to_string()),
                    reason: "not in the device catalog".to_string(),
                };
                self.emit(MediaEvent::Failure(err.clone()));
                return Err(err);
            }
        }

        let mut selection = self.selection();
        selection.set(kind, device_id.map(str::to_string));
        debug!(%kind, device = ?device_id, "device selected");

        let snapshot = self.session.snapshot();
        let changed = match kind.capture_kind() {
            Some(changed) if snapshot.video.is_some() || snapshot.audio.is_some() => changed,
            _ => {
                self.lock_selection().set(kind, device_id.map(str::to_string));
                return Ok(None);
            }
        };

        let mut request = StreamRequest::default();
        for capture in CaptureKind::ALL {
            if capture == changed || snapshot.track(capture).is_some() {
                request.set(
                    capture,
                    Some(DeviceConstraint::from_selection(selection.capture_id(capture))),
                );
            }
        }
        self.acquire(request, selection).await.map(Some)
    }

    /// Run `request` through the session; on success the capture ids of
    /// `staged` (minus any that fell back to default) become the selection.
    async fn acquire(
        &self,
        mut request: StreamRequest,
        mut staged: Selection,
    ) -> Result<StreamSnapshot, MediaError> {
        let mut fallbacks = Vec::new();
        loop {
            let before: Vec<_> = CaptureKind::ALL
                .iter()
                .map(|&kind| (kind, self.permissions.state(kind)))
                .collect();

            match self.session.request(&request).await {
                Ok(snapshot) => {
                    let mut granted = false;
                    for (kind, before) in before {
                        if snapshot.track(kind).is_some() {
                            self.permissions.observe(kind, true);
                            granted |= self.permission_transition(kind, before);
                        }
                    }
                    {
                        let mut selection = self.lock_selection();
                        for kind in CaptureKind::ALL {
                            if request.get(kind).is_some() {
                                let id = staged.capture_id(kind).map(str::to_string);
                                selection.set(kind.device_kind(), id);
                            }
                        }
                    }
                    for (kind, requested) in fallbacks {
                        self.emit(MediaEvent::FellBackToDefault { kind, requested });
                    }
                    self.emit(MediaEvent::SessionChanged(snapshot.state));
                    if granted {
                        self.refresh_after_grant().await;
                    }
                    return Ok(snapshot);
                }
                Err(MediaError::ConstraintError { kind, device_id })
                    if self.config.session.fallback_to_default
                        && matches!(request.get(kind), Some(DeviceConstraint::Exact(_))) =>
                {
                    warn!(%kind, device = %device_id, "device not available, falling back to default");
                    staged.set(kind.device_kind(), None);
                    fallbacks.push((kind, device_id));
                    request.set(kind, Some(DeviceConstraint::Default));
                }
                Err(err) => {
                    match &err {
                        MediaError::AccessDenied { kind } => {
                            let previous = before
                                .iter()
                                .find(|(k, _)| k == kind)
                                .map(|(_, s)| *s)
                                .unwrap_or_default();
                            self.permissions.observe(*kind, false);
                            self.permission_transition(*kind, previous);
                        }
                        MediaError::DeviceUnavailable { .. } => {
                            if let Err(e) = self.refresh_and_release().await {
                                debug!(error = %e, "refresh after unavailable device failed");
                            }
                        }
                        _ => {}
                    }
                    self.emit(MediaEvent::SessionChanged(self.session.state()));
                    self.emit(MediaEvent::Failure(err.clone()));
                    return Err(err);
                }
            }
        }
    }

    /// Stop the track of one kind. No track of that kind is a no-op.
    pub async fn stop_kind(&self, kind: CaptureKind) {
        self.session.stop_kind(kind).await;
        self.emit(MediaEvent::SessionChanged(self.session.state()));
    }

    /// Stop every track and the meter. Idempotent.
    pub async fn teardown_all(&self) {
        self.session.teardown_all().await;
        self.meter.detach();
        self.emit(MediaEvent::SessionChanged(self.session.state()));
    }

    // ---- Output ----

    /// Play the test tone on `output_id`, or the default output for `None`.
    pub async fn play_test_signal(
        &self,
        output_id: Option<&str>,
    ) -> Result<PlaybackOutcome, MediaError> {
        let result = self.output.play_test_signal(output_id).await;
        if let Err(e) = &result {
            self.emit(MediaEvent::Failure(e.clone()));
        }
        result
    }

    /// Play the test tone on the selected speaker.
    pub async fn play_on_selected_output(&self) -> Result<PlaybackOutcome, MediaError> {
        let output = self.lock_selection().speaker_id.clone();
        self.play_test_signal(output.as_deref()).await
    }
}

#[async_trait]
impl TopologyListener for MediaSessionManager {
    async fn topology_changed(&self, events: Vec<TopologyEvent>) {
        if let Err(e) = self.handle_topology_change(&events).await {
            warn!(error = %e, "refresh after topology change failed");
        }
    }
}

impl Drop for MediaSessionManager {
    fn drop(&mut self) {
        // Dropping the watcher cancels its task
        self.watcher
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.meter.detach();
    }
}

fn auto_select(selection: &mut Selection, catalog: &DeviceCatalog) {
    for kind in [DeviceKind::Camera, DeviceKind::Microphone, DeviceKind::Speaker] {
        if selection.get(kind).is_none() {
            if let Some(first) = catalog.devices(kind).first() {
                debug!(%kind, device = %first.id, "auto-selecting first device");
                selection.set(kind, Some(first.id.clone()));
            }
        }
    }
}
