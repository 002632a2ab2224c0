//! Scriptable in-process host.
//!
//! Models a browser-like media host: labels stay hidden until a kind is
//! authorized, exact constraints fail when the device is missing, and every
//! opened track is tracked so tests can count live hardware handles.

use std::collections::{HashMap, HashSet};
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::media::device::{CaptureKind, DeviceDescriptor, DeviceKind};
use crate::media::host::{
    AudioClip, AudioTap, DeviceConstraint, HostError, HostPermission, MediaHost, MediaTrack,
    TopologyEvent,
};

const FAKE_SAMPLE_RATE: u32 = 48_000;
const FAKE_TONE_HZ: f32 = 1_000.0;

/// One clip played through the fake output.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedClip {
    pub output_id: Option<String>,
    pub samples: usize,
}

struct FakeState {
    devices: Vec<DeviceDescriptor>,
    permissions: HashMap<CaptureKind, HostPermission>,
    prompt_answers: HashMap<CaptureKind, HostPermission>,
    reprompt_blocked: HashSet<CaptureKind>,
    enumeration_error: Option<HostError>,
    open_failures: HashMap<CaptureKind, HostError>,
    open_delay: Option<Duration>,
    routing_supported: bool,
    output_failures: HashMap<String, HostError>,
    played: Vec<PlayedClip>,
    tracks: Vec<Arc<FakeTrack>>,
    open_log: Vec<(CaptureKind, DeviceConstraint)>,
    input_amplitude: f32,
}

/// Host double used by unit and integration tests.
pub struct FakeHost {
    state: Mutex<FakeState>,
    topology: broadcast::Sender<TopologyEvent>,
    next_track: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeHost {
    /// A host with no devices, every kind at `Prompt` and prompts answered `Granted`.
    pub fn new() -> Self {
        let (topology, _) = broadcast::channel(32);
        let mut permissions = HashMap::new();
        let mut prompt_answers = HashMap::new();
        for kind in CaptureKind::ALL {
            permissions.insert(kind, HostPermission::Prompt);
            prompt_answers.insert(kind, HostPermission::Granted);
        }

        Self {
            state: Mutex::new(FakeState {
                devices: Vec::new(),
                permissions,
                prompt_answers,
                reprompt_blocked: HashSet::new(),
                enumeration_error: None,
                open_failures: HashMap::new(),
                open_delay: None,
                routing_supported: true,
                output_failures: HashMap::new(),
                played: Vec::new(),
                tracks: Vec::new(),
                open_log: Vec::new(),
                input_amplitude: 0.5,
            }),
            topology,
            next_track: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Builder: add a device with a label the host reveals once authorized.
    pub fn with_device(self, id: &str, kind: DeviceKind, label: &str) -> Self {
        self.add_device(id, kind, label);
        self
    }

    /// Builder: every capture kind already granted.
    pub fn granted(self) -> Self {
        for kind in CaptureKind::ALL {
            self.set_permission(kind, HostPermission::Granted);
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_device(&self, id: &str, kind: DeviceKind, label: &str) {
        self.lock()
            .devices
            .push(DeviceDescriptor::new(id, kind, label));
    }

    /// Unplug a device: it leaves the listing and any track on it ends.
    pub fn remove_device(&self, id: &str) {
        let mut state = self.lock();
        state.devices.retain(|d| d.id != id);
        for track in state.tracks.iter().filter(|t| t.device_id == id) {
            track.end();
        }
    }

    /// Broadcast a hot-plug notification.
    pub fn emit(&self, event: TopologyEvent) {
        let _ = self.topology.send(event);
    }

    pub fn set_permission(&self, kind: CaptureKind, permission: HostPermission) {
        self.lock().permissions.insert(kind, permission);
    }

    /// What the user answers the next time `kind` is prompted.
    pub fn set_prompt_answer(&self, kind: CaptureKind, answer: HostPermission) {
        self.lock().prompt_answers.insert(kind, answer);
    }

    /// Permanently denied: the host refuses to prompt again.
    pub fn block_reprompt(&self, kind: CaptureKind) {
        let mut state = self.lock();
        state.permissions.insert(kind, HostPermission::Denied);
        state.reprompt_blocked.insert(kind);
    }

    pub fn fail_enumeration(&self, error: Option<HostError>) {
        self.lock().enumeration_error = error;
    }

    /// Make every `open_track` for `kind` fail until cleared with `None`.
    pub fn fail_open(&self, kind: CaptureKind, error: Option<HostError>) {
        let mut state = self.lock();
        match error {
            Some(error) => state.open_failures.insert(kind, error),
            None => state.open_failures.remove(&kind),
        };
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.lock().open_delay = delay;
    }

    pub fn set_routing_supported(&self, supported: bool) {
        self.lock().routing_supported = supported;
    }

    /// Binding playback to this output id fails with `error`.
    pub fn fail_output(&self, output_id: &str, error: HostError) {
        self.lock()
            .output_failures
            .insert(output_id.to_string(), error);
    }

    /// Peak amplitude of the sine every fake microphone produces.
    pub fn set_input_amplitude(&self, amplitude: f32) {
        self.lock().input_amplitude = amplitude;
        let state = self.lock();
        for track in &state.tracks {
            track.set_amplitude(amplitude);
        }
    }

    pub fn played(&self) -> Vec<PlayedClip> {
        self.lock().played.clone()
    }

    /// Every track ever opened, oldest first.
    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.lock().tracks.clone()
    }

    pub fn live_tracks(&self, kind: CaptureKind) -> usize {
        self.lock()
            .tracks
            .iter()
            .filter(|t| t.kind == kind && t.is_live())
            .count()
    }

    pub fn open_count(&self, kind: CaptureKind) -> usize {
        self.lock()
            .open_log
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub fn open_log(&self) -> Vec<(CaptureKind, DeviceConstraint)> {
        self.lock().open_log.clone()
    }

    /// Highest number of `open_track` calls that were ever pending at once.
    pub fn max_concurrent_opens(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Reads through an audio tap after its track was stopped, across all tracks.
    pub fn reads_after_stop(&self) -> u64 {
        self.lock().tracks.iter().map(|t| t.reads_after_stop()).sum()
    }

    fn resolve(
        state: &FakeState,
        kind: CaptureKind,
        constraint: &DeviceConstraint,
    ) -> Result<DeviceDescriptor, HostError> {
        let device_kind = kind.device_kind();
        let mut candidates = state.devices.iter().filter(|d| d.kind == device_kind);
        match constraint {
            DeviceConstraint::Default => candidates.next().cloned().ok_or(HostError::NotFound),
            DeviceConstraint::Exact(id) => candidates
                .find(|d| &d.id == id)
                .cloned()
                .ok_or(HostError::Overconstrained),
        }
    }

    fn label_visible(state: &FakeState, kind: DeviceKind) -> bool {
        let gate = match kind {
            DeviceKind::Camera => CaptureKind::Video,
            DeviceKind::Microphone | DeviceKind::Speaker => CaptureKind::Audio,
        };
        state.permissions.get(&gate) == Some(&HostPermission::Granted)
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a FakeHost);

impl<'a> InFlight<'a> {
    fn enter(host: &'a FakeHost) -> Self {
        let now = host.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        host.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(host)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaHost for FakeHost {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, HostError> {
        let state = self.lock();
        if let Some(err) = &state.enumeration_error {
            return Err(err.clone());
        }
        Ok(state
            .devices
            .iter()
            .map(|d| {
                let mut d = d.clone();
                if !Self::label_visible(&state, d.kind) {
                    d.label.clear();
                }
                d
            })
            .collect())
    }

    async fn query_permission(&self, kind: CaptureKind) -> Result<HostPermission, HostError> {
        Ok(self
            .lock()
            .permissions
            .get(&kind)
            .copied()
            .unwrap_or(HostPermission::Prompt))
    }

    async fn request_permission(&self, kind: CaptureKind) -> Result<HostPermission, HostError> {
        let mut state = self.lock();
        let current = state
            .permissions
            .get(&kind)
            .copied()
            .unwrap_or(HostPermission::Prompt);
        if current == HostPermission::Granted {
            return Ok(HostPermission::Granted);
        }
        if state.reprompt_blocked.contains(&kind) {
            return Ok(HostPermission::Denied);
        }
        let answer = state
            .prompt_answers
            .get(&kind)
            .copied()
            .unwrap_or(HostPermission::Granted);
        state.permissions.insert(kind, answer);
        Ok(answer)
    }

    async fn open_track(
        &self,
        kind: CaptureKind,
        constraint: &DeviceConstraint,
    ) -> Result<Arc<dyn MediaTrack>, HostError> {
        let _in_flight = InFlight::enter(self);
        let delay = {
            let mut state = self.lock();
            state.open_log.push((kind, constraint.clone()));
            state.open_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(err) = state.open_failures.get(&kind) {
            return Err(err.clone());
        }
        match state.permissions.get(&kind).copied() {
            Some(HostPermission::Denied) => return Err(HostError::NotAllowed),
            Some(HostPermission::Prompt) | None => {
                let answer = state
                    .prompt_answers
                    .get(&kind)
                    .copied()
                    .unwrap_or(HostPermission::Granted);
                state.permissions.insert(kind, answer);
                if answer != HostPermission::Granted {
                    return Err(HostError::NotAllowed);
                }
            }
            Some(HostPermission::Granted) => {}
        }

        let device = Self::resolve(&state, kind, constraint)?;
        let id = format!("track-{}", self.next_track.fetch_add(1, Ordering::SeqCst));
        let track = Arc::new(FakeTrack::new(
            id,
            kind,
            device.id,
            device.label,
            state.input_amplitude,
        ));
        state.tracks.push(track.clone());
        Ok(track)
    }

    fn supports_output_routing(&self) -> bool {
        self.lock().routing_supported
    }

    async fn play_clip(&self, clip: &AudioClip, output_id: Option<&str>) -> Result<(), HostError> {
        let mut state = self.lock();
        if let Some(id) = output_id {
            if !state.routing_supported {
                return Err(HostError::RoutingUnsupported);
            }
            if let Some(err) = state.output_failures.get(id) {
                return Err(err.clone());
            }
            if !state.devices.iter().any(|d| d.id == id) {
                return Err(HostError::NotFound);
            }
        }
        state.played.push(PlayedClip {
            output_id: output_id.map(str::to_string),
            samples: clip.samples.len(),
        });
        Ok(())
    }

    fn topology_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }
}

struct TrackShared {
    live: AtomicBool,
    amplitude: Mutex<f32>,
    reads: AtomicU64,
    reads_after_stop: AtomicU64,
    stop_calls: AtomicU64,
}

/// Track produced by [`FakeHost`].
pub struct FakeTrack {
    id: String,
    kind: CaptureKind,
    device_id: String,
    label: String,
    shared: Arc<TrackShared>,
}

impl FakeTrack {
    fn new(id: String, kind: CaptureKind, device_id: String, label: String, amplitude: f32) -> Self {
        Self {
            id,
            kind,
            device_id,
            label,
            shared: Arc::new(TrackShared {
                live: AtomicBool::new(true),
                amplitude: Mutex::new(amplitude),
                reads: AtomicU64::new(0),
                reads_after_stop: AtomicU64::new(0),
                stop_calls: AtomicU64::new(0),
            }),
        }
    }

    /// The device went away underneath the track.
    fn end(&self) {
        self.shared.live.store(false, Ordering::SeqCst);
    }

    fn set_amplitude(&self, amplitude: f32) {
        *self
            .shared
            .amplitude
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = amplitude;
    }

    /// How often `stop` was called on this track.
    pub fn stop_calls(&self) -> u64 {
        self.shared.stop_calls.load(Ordering::SeqCst)
    }

    /// Successful tap reads while live.
    pub fn reads(&self) -> u64 {
        self.shared.reads.load(Ordering::SeqCst)
    }

    pub fn reads_after_stop(&self) -> u64 {
        self.shared.reads_after_stop.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> CaptureKind {
        self.kind
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.shared.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.live.store(false, Ordering::SeqCst);
    }

    fn audio_tap(&self) -> Option<Arc<dyn AudioTap>> {
        match self.kind {
            CaptureKind::Audio => Some(Arc::new(FakeTap {
                shared: self.shared.clone(),
            })),
            CaptureKind::Video => None,
        }
    }
}

struct FakeTap {
    shared: Arc<TrackShared>,
}

impl AudioTap for FakeTap {
    fn sample_rate(&self) -> u32 {
        FAKE_SAMPLE_RATE
    }

    fn read_latest(&self, out: &mut [f32]) -> usize {
        if !self.shared.live.load(Ordering::SeqCst) {
            self.shared.reads_after_stop.fetch_add(1, Ordering::SeqCst);
            return 0;
        }
        self.shared.reads.fetch_add(1, Ordering::SeqCst);
        let amplitude = *self
            .shared
            .amplitude
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let step = TAU * FAKE_TONE_HZ / FAKE_SAMPLE_RATE as f32;
        for (i, sample) in out.iter_mut().enumerate() {
            *sample = amplitude * (step * i as f32).sin();
        }
        out.len()
    }
}
