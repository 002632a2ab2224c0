//! The stream session state machine.
//!
//! Owns the single combined stream (at most one live video track and one
//! live audio track). Acquisitions are serialized: a request arriving while
//! another is in flight waits for it to settle, then runs against the
//! settled state. Switching devices opens the new track before stopping the
//! old one, and only kinds whose target actually changed are reacquired.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::device::{CaptureKind, FailureReason, MediaError, Selection};
use super::host::{DeviceConstraint, MediaHost, MediaTrack, TrackHandle};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Acquiring,
    Active,
    Failed(FailureReason),
}

/// Told about audio track changes so a consumer can attach or detach in time.
///
/// `audio_track_stopping` runs strictly before the track is stopped.
pub trait AudioTrackListener: Send + Sync {
    fn audio_track_started(&self, track: &TrackHandle);
    fn audio_track_stopping(&self, track_id: &str);
}

/// What to acquire per capture kind. `None` leaves that kind alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    pub video: Option<DeviceConstraint>,
    pub audio: Option<DeviceConstraint>,
}

impl StreamRequest {
    /// Both kinds: exact ids where selected, default constraints otherwise.
    pub fn from_selection(selection: &Selection) -> Self {
        Self {
            video: Some(DeviceConstraint::from_selection(selection.camera_id.as_deref())),
            audio: Some(DeviceConstraint::from_selection(
                selection.microphone_id.as_deref(),
            )),
        }
    }

    /// Only one kind.
    pub fn only(kind: CaptureKind, constraint: DeviceConstraint) -> Self {
        let mut request = Self::default();
        request.set(kind, Some(constraint));
        request
    }

    pub fn get(&self, kind: CaptureKind) -> Option<&DeviceConstraint> {
        match kind {
            CaptureKind::Video => self.video.as_ref(),
            CaptureKind::Audio => self.audio.as_ref(),
        }
    }

    pub fn set(&mut self, kind: CaptureKind, constraint: Option<DeviceConstraint>) {
        match kind {
            CaptureKind::Video => self.video = constraint,
            CaptureKind::Audio => self.audio = constraint,
        }
    }
}

/// Published view of the session.
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub state: SessionState,
    pub video: Option<TrackHandle>,
    pub audio: Option<TrackHandle>,
}

impl StreamSnapshot {
    pub fn track(&self, kind: CaptureKind) -> Option<&TrackHandle> {
        match kind {
            CaptureKind::Video => self.video.as_ref(),
            CaptureKind::Audio => self.audio.as_ref(),
        }
    }
}

/// A track owned by the session, tagged with the constraint it was opened against.
///
/// Dropping a still-live track stops it, so an abandoned acquisition never
/// leaves hardware running.
struct SessionTrack {
    track: Arc<dyn MediaTrack>,
    constraint: DeviceConstraint,
}

impl SessionTrack {
    fn satisfies(&self, constraint: &DeviceConstraint) -> bool {
        self.track.is_live()
            && match constraint {
                DeviceConstraint::Default => self.constraint == DeviceConstraint::Default,
                DeviceConstraint::Exact(id) => self.track.device_id() == id,
            }
    }

    fn handle(&self) -> TrackHandle {
        TrackHandle::new(self.track.clone())
    }
}

impl Drop for SessionTrack {
    fn drop(&mut self) {
        if self.track.is_live() {
            self.track.stop();
        }
    }
}

#[derive(Default)]
struct SessionInner {
    video: Option<SessionTrack>,
    audio: Option<SessionTrack>,
}

impl SessionInner {
    fn slot(&self, kind: CaptureKind) -> &Option<SessionTrack> {
        match kind {
            CaptureKind::Video => &self.video,
            CaptureKind::Audio => &self.audio,
        }
    }

    fn slot_mut(&mut self, kind: CaptureKind) -> &mut Option<SessionTrack> {
        match kind {
            CaptureKind::Video => &mut self.video,
            CaptureKind::Audio => &mut self.audio,
        }
    }

    fn has_tracks(&self) -> bool {
        self.video.is_some() || self.audio.is_some()
    }
}

/// Restores the pre-acquisition state if an acquisition future is dropped mid-flight.
struct AcquireGuard<'a> {
    published: &'a watch::Sender<StreamSnapshot>,
    restore: SessionState,
    armed: bool,
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let restore = self.restore;
            self.published.send_modify(|s| s.state = restore);
        }
    }
}

/// Owner of the live combined stream.
pub struct StreamSession {
    host: Arc<dyn MediaHost>,
    inner: Mutex<SessionInner>,
    published: watch::Sender<StreamSnapshot>,
    listener: Option<Arc<dyn AudioTrackListener>>,
}

impl StreamSession {
    pub fn new(host: Arc<dyn MediaHost>) -> Self {
        let (published, _) = watch::channel(StreamSnapshot {
            state: SessionState::Idle,
            video: None,
            audio: None,
        });
        Self {
            host,
            inner: Mutex::new(SessionInner::default()),
            published,
            listener: None,
        }
    }

    /// Builder: notify `listener` around audio track changes.
    pub fn with_audio_listener(mut self, listener: Arc<dyn AudioTrackListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn state(&self) -> SessionState {
        self.published.borrow().state
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamSnapshot> {
        self.published.subscribe()
    }

    fn publish(&self, inner: &SessionInner, state: SessionState) {
        debug!(?state, "session state");
        self.published.send_replace(StreamSnapshot {
            state,
            video: inner.video.as_ref().map(SessionTrack::handle),
            audio: inner.audio.as_ref().map(SessionTrack::handle),
        });
    }

    /// Stop a track the session is letting go of, detaching audio consumers first.
    fn release(&self, track: SessionTrack) {
        if track.track.kind() == CaptureKind::Audio {
            if let Some(listener) = &self.listener {
                listener.audio_track_stopping(track.track.id());
            }
        }
        info!(
            kind = %track.track.kind(),
            device = track.track.device_id(),
            track = track.track.id(),
            "stopping track"
        );
        track.track.stop();
    }

    /// Release tracks the host ended underneath us (device unplugged).
    fn prune_ended(&self, inner: &mut SessionInner) -> bool {
        let mut pruned = false;
        for kind in CaptureKind::ALL {
            let ended = inner
                .slot(kind)
                .as_ref()
                .is_some_and(|t| !t.track.is_live());
            if ended {
                if let Some(track) = inner.slot_mut(kind).take() {
                    warn!(%kind, device = track.track.device_id(), "track ended by host");
                    self.release(track);
                    pruned = true;
                }
            }
        }
        pruned
    }

    /// Drop tracks the host ended on its own and republish.
    ///
    /// Returns true if anything was released.
    pub async fn release_ended(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if !self.prune_ended(&mut inner) {
            return false;
        }
        let state = if inner.has_tracks() {
            SessionState::Active
        } else {
            SessionState::Idle
        };
        self.publish(&inner, state);
        true
    }

    /// Acquire tracks for `request`, reusing any current track that already satisfies it.
    ///
    /// On failure the previous tracks stay untouched; with no previous tracks
    /// the session ends in `Failed`.
    pub async fn request(&self, request: &StreamRequest) -> Result<StreamSnapshot, MediaError> {
        let mut inner = self.inner.lock().await;
        self.prune_ended(&mut inner);

        let previous = self.state();
        let mut guard = AcquireGuard {
            published: &self.published,
            restore: previous,
            armed: true,
        };
        self.publish(&inner, SessionState::Acquiring);

        // Opened tracks stay here until commit; dropping them stops them
        let mut pending: Vec<(CaptureKind, SessionTrack)> = Vec::new();
        for kind in CaptureKind::ALL {
            let Some(constraint) = request.get(kind) else {
                continue;
            };
            if inner
                .slot(kind)
                .as_ref()
                .is_some_and(|t| t.satisfies(constraint))
            {
                debug!(%kind, "current track satisfies request, keeping it");
                continue;
            }

            match self.host.open_track(kind, constraint).await {
                Ok(track) => {
                    info!(
                        %kind,
                        device = track.device_id(),
                        track = track.id(),
                        "track opened"
                    );
                    pending.push((
                        kind,
                        SessionTrack {
                            track,
                            constraint: constraint.clone(),
                        },
                    ));
                }
                Err(e) => {
                    let err =
                        MediaError::from_host(kind.device_kind(), constraint.exact_id(), e);
                    warn!(%kind, error = %err, "acquisition failed");
                    drop(pending);

                    guard.armed = false;
                    let state = if inner.has_tracks() {
                        SessionState::Active
                    } else {
                        SessionState::Failed(err.failure_reason())
                    };
                    self.publish(&inner, state);
                    return Err(err);
                }
            }
        }

        // Open-then-close: the replacement is live before the old track stops
        for (kind, track) in pending {
            let started = (kind == CaptureKind::Audio).then(|| track.handle());
            if let Some(old) = inner.slot_mut(kind).replace(track) {
                self.release(old);
            }
            if let (Some(listener), Some(handle)) = (&self.listener, started) {
                listener.audio_track_started(&handle);
            }
        }

        guard.armed = false;
        let state = if inner.has_tracks() {
            SessionState::Active
        } else {
            SessionState::Idle
        };
        self.publish(&inner, state);
        Ok(self.snapshot())
    }

    /// Stop and drop the track of one kind. A kind with no track is a no-op.
    pub async fn stop_kind(&self, kind: CaptureKind) {
        let mut inner = self.inner.lock().await;
        self.prune_ended(&mut inner);

        let state = self.state();
        if let Some(track) = inner.slot_mut(kind).take() {
            self.release(track);
        }

        let state = match state {
            SessionState::Active if !inner.has_tracks() => SessionState::Idle,
            other => other,
        };
        self.publish(&inner, state);
    }

    /// Stop every track regardless of state. Idempotent.
    pub async fn teardown_all(&self) {
        let mut inner = self.inner.lock().await;
        for kind in CaptureKind::ALL {
            if let Some(track) = inner.slot_mut(kind).take() {
                self.release(track);
            }
        }
        self.publish(&inner, SessionState::Idle);
    }

}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let inner = std::mem::take(self.inner.get_mut());
        for track in [inner.video, inner.audio].into_iter().flatten() {
            self.release(track);
        }
    }
}
