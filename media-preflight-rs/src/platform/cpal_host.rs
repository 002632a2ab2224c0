//! Desktop audio host built on cpal.
//!
//! Microphones and speakers only: desktop audio has no consent prompt, so
//! audio access always reads as granted, and video requests fail as not
//! found. Every input stream is owned by its own thread because cpal streams
//! are not `Send` on every backend.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::media::device::{CaptureKind, DeviceDescriptor, DeviceKind};
use crate::media::host::{
    AudioClip, AudioTap, DeviceConstraint, HostError, HostPermission, MediaHost, MediaTrack,
    TopologyEvent,
};

/// About one second of mono input at 48kHz
const RING_CAPACITY: usize = 48_000;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// [`MediaHost`] over the default cpal host.
pub struct CpalHost {
    topology: broadcast::Sender<TopologyEvent>,
    _watch: TopologySource,
}

impl CpalHost {
    pub fn new() -> Self {
        let (topology, _) = broadcast::channel(32);
        let watch = TopologySource::start(topology.clone());
        Self {
            topology,
            _watch: watch,
        }
    }
}

impl Default for CpalHost {
    fn default() -> Self {
        Self::new()
    }
}

fn list_devices() -> Result<Vec<DeviceDescriptor>, HostError> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let inputs = host
        .input_devices()
        .map_err(|e| HostError::Other(e.to_string()))?;
    for device in inputs {
        if let Ok(name) = device.name() {
            devices.push(DeviceDescriptor::new(name.clone(), DeviceKind::Microphone, name));
        }
    }

    let outputs = host
        .output_devices()
        .map_err(|e| HostError::Other(e.to_string()))?;
    for device in outputs {
        if let Ok(name) = device.name() {
            devices.push(DeviceDescriptor::new(name.clone(), DeviceKind::Speaker, name));
        }
    }
    Ok(devices)
}

fn find_input(constraint: &DeviceConstraint) -> Result<Device, HostError> {
    let host = cpal::default_host();
    match constraint {
        DeviceConstraint::Default => host.default_input_device().ok_or(HostError::NotFound),
        DeviceConstraint::Exact(id) => host
            .input_devices()
            .map_err(|e| HostError::Other(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(id.as_str()))
            .ok_or(HostError::Overconstrained),
    }
}

fn find_output(output_id: Option<&str>) -> Result<Device, HostError> {
    let host = cpal::default_host();
    match output_id {
        None => host.default_output_device().ok_or(HostError::NotFound),
        Some(id) => host
            .output_devices()
            .map_err(|e| HostError::Other(e.to_string()))?
            .find(|d| d.name().ok().as_deref() == Some(id))
            .ok_or(HostError::NotFound),
    }
}

#[async_trait]
impl MediaHost for CpalHost {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, HostError> {
        tokio::task::spawn_blocking(list_devices)
            .await
            .map_err(|e| HostError::Other(e.to_string()))?
    }

    async fn query_permission(&self, kind: CaptureKind) -> Result<HostPermission, HostError> {
        match kind {
            CaptureKind::Audio => Ok(HostPermission::Granted),
            CaptureKind::Video => Err(HostError::Unsupported("camera capture".to_string())),
        }
    }

    async fn request_permission(&self, kind: CaptureKind) -> Result<HostPermission, HostError> {
        self.query_permission(kind).await
    }

    async fn open_track(
        &self,
        kind: CaptureKind,
        constraint: &DeviceConstraint,
    ) -> Result<Arc<dyn MediaTrack>, HostError> {
        if kind == CaptureKind::Video {
            return Err(HostError::NotFound);
        }

        let constraint = constraint.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let ring = Arc::new(Ring::default());
        let live = Arc::new(AtomicBool::new(true));

        let thread = std::thread::Builder::new()
            .name("capture-stream".to_string())
            .spawn({
                let ring = ring.clone();
                let live = live.clone();
                move || capture_thread(constraint, ring, live, ready_tx, stop_rx)
            })
            .map_err(|e| HostError::Other(e.to_string()))?;

        let opened = ready_rx
            .await
            .map_err(|_| HostError::Other("capture thread exited".to_string()))??;

        let track = CpalTrack {
            id: Uuid::new_v4().to_string(),
            device_id: opened.name.clone(),
            label: opened.name,
            live,
            stop: Mutex::new(Some((stop_tx, thread))),
            tap: Arc::new(RingTap {
                ring,
                sample_rate: opened.sample_rate,
            }),
        };
        info!(device = %track.device_id, track = %track.id, "capture stream started");
        Ok(Arc::new(track))
    }

    fn supports_output_routing(&self) -> bool {
        true
    }

    async fn play_clip(&self, clip: &AudioClip, output_id: Option<&str>) -> Result<(), HostError> {
        let clip = clip.clone();
        let output_id = output_id.map(str::to_string);
        tokio::task::spawn_blocking(move || play_blocking(&clip, output_id.as_deref()))
            .await
            .map_err(|e| HostError::Other(e.to_string()))?
    }

    fn topology_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.topology.subscribe()
    }
}

struct Opened {
    name: String,
    sample_rate: u32,
}

fn capture_thread(
    constraint: DeviceConstraint,
    ring: Arc<Ring>,
    live: Arc<AtomicBool>,
    ready: oneshot::Sender<Result<Opened, HostError>>,
    stop: mpsc::Receiver<()>,
) {
    let started = find_input(&constraint).and_then(|device| {
        let name = device.name().map_err(|e| HostError::Other(e.to_string()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| HostError::Busy(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let stream = match format {
            SampleFormat::F32 => build_input::<f32>(&device, &config, &ring, &live),
            SampleFormat::I16 => build_input::<i16>(&device, &config, &ring, &live),
            SampleFormat::U16 => build_input::<u16>(&device, &config, &ring, &live),
            other => Err(HostError::Unsupported(format!("sample format {other:?}"))),
        }?;
        stream.play().map_err(|e| HostError::Busy(e.to_string()))?;
        Ok((stream, Opened { name, sample_rate }))
    });

    match started {
        Ok((stream, opened)) => {
            if ready.send(Ok(opened)).is_err() {
                return;
            }
            // Returns once stop is sent or the track is dropped
            let _ = stop.recv();
            live.store(false, Ordering::SeqCst);
            drop(stream);
            debug!("capture stream closed");
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    ring: &Arc<Ring>,
    live: &Arc<AtomicBool>,
) -> Result<Stream, HostError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let ring = ring.clone();
    let live = live.clone();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                ring.push_frames(data, channels);
            },
            move |err| {
                warn!(error = %err, "capture stream error");
                live.store(false, Ordering::SeqCst);
            },
            None,
        )
        .map_err(|e| HostError::Busy(e.to_string()))
}

fn play_blocking(clip: &AudioClip, output_id: Option<&str>) -> Result<(), HostError> {
    let device = find_output(output_id)?;
    let supported = device
        .default_output_config()
        .map_err(|e| HostError::Busy(e.to_string()))?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(HostError::Unsupported(format!(
            "output sample format {:?}",
            supported.sample_format()
        )));
    }
    let config: StreamConfig = supported.into();
    let channels = config.channels.max(1) as usize;
    let step = clip.sample_rate as f64 / config.sample_rate.0 as f64;
    let samples = clip.samples.clone();
    let mut position = 0.0f64;

    let stream = device
        .build_output_stream(
            &config,
            move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in out.chunks_mut(channels) {
                    let value = samples.get(position as usize).copied().unwrap_or(0.0);
                    frame.iter_mut().for_each(|s| *s = value);
                    position += step;
                }
            },
            |err| warn!(error = %err, "playback stream error"),
            None,
        )
        .map_err(|e| HostError::Busy(e.to_string()))?;
    stream.play().map_err(|e| HostError::Busy(e.to_string()))?;

    let tail = Duration::from_millis(100);
    std::thread::sleep(Duration::from_secs_f32(clip.duration_secs()) + tail);
    Ok(())
}

/// Bounded buffer of the most recent mono samples.
#[derive(Default)]
struct Ring {
    samples: Mutex<VecDeque<f32>>,
}

impl Ring {
    fn lock(&self) -> MutexGuard<'_, VecDeque<f32>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_frames<T>(&self, data: &[T], channels: usize)
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let mut samples = self.lock();
        for frame in data.chunks(channels) {
            let sum: f32 = frame
                .iter()
                .map(|&s| s.to_sample::<f32>())
                .sum();
            samples.push_back(sum / frame.len() as f32);
        }
        let excess = samples.len().saturating_sub(RING_CAPACITY);
        samples.drain(..excess);
    }
}

struct RingTap {
    ring: Arc<Ring>,
    sample_rate: u32,
}

impl AudioTap for RingTap {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_latest(&self, out: &mut [f32]) -> usize {
        let samples = self.ring.lock();
        let n = samples.len().min(out.len());
        let start = out.len() - n;
        for (dst, src) in out[start..].iter_mut().zip(samples.range(samples.len() - n..)) {
            *dst = *src;
        }
        n
    }
}

struct CpalTrack {
    id: String,
    device_id: String,
    label: String,
    live: Arc<AtomicBool>,
    stop: Mutex<Option<(mpsc::Sender<()>, JoinHandle<()>)>>,
    tap: Arc<RingTap>,
}

/// Hides the ring once the track stops.
struct LiveTap {
    inner: Arc<RingTap>,
    live: Arc<AtomicBool>,
}

impl AudioTap for LiveTap {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn read_latest(&self, out: &mut [f32]) -> usize {
        if !self.live.load(Ordering::SeqCst) {
            return 0;
        }
        self.inner.read_latest(out)
    }
}

impl MediaTrack for CpalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> CaptureKind {
        CaptureKind::Audio
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
        let pending = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((stop, thread)) = pending {
            let _ = stop.send(());
            join_off_runtime(thread);
            debug!(track = %self.id, "capture track stopped");
        }
    }

    fn audio_tap(&self) -> Option<Arc<dyn AudioTap>> {
        Some(Arc::new(LiveTap {
            inner: self.tap.clone(),
            live: self.live.clone(),
        }))
    }
}

impl Drop for CpalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for a capture thread to close its stream without stalling async callers.
///
/// Inside a runtime the join moves to the blocking pool.
fn join_off_runtime(thread: JoinHandle<()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || {
                if thread.join().is_err() {
                    warn!("capture thread panicked");
                }
            });
        }
        Err(_) => {
            if thread.join().is_err() {
                warn!("capture thread panicked");
            }
        }
    }
}

/// Source of topology events for the lifetime of the host.
struct TopologySource {
    #[cfg(windows)]
    _native: Option<super::notifier::EndpointNotifier>,
    _poller: Option<Poller>,
}

impl TopologySource {
    fn start(sender: broadcast::Sender<TopologyEvent>) -> Self {
        #[cfg(windows)]
        match super::notifier::EndpointNotifier::register(sender.clone()) {
            Ok(notifier) => {
                return Self {
                    _native: Some(notifier),
                    _poller: None,
                }
            }
            Err(e) => warn!(error = %e, "endpoint notifications unavailable, polling instead"),
        }

        Self {
            #[cfg(windows)]
            _native: None,
            _poller: Some(Poller::start(sender)),
        }
    }
}

/// Diffs the device list on an interval.
struct Poller {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Poller {
    fn start(sender: broadcast::Sender<TopologyEvent>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread = std::thread::Builder::new()
            .name("device-poller".to_string())
            .spawn({
                let running = running.clone();
                move || {
                    let mut known = device_ids();
                    while running.load(Ordering::SeqCst) {
                        std::thread::park_timeout(POLL_INTERVAL);
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        let current = device_ids();
                        for id in current.difference(&known) {
                            let _ = sender.send(TopologyEvent::DeviceAdded {
                                device_id: id.clone(),
                            });
                        }
                        for id in known.difference(&current) {
                            let _ = sender.send(TopologyEvent::DeviceRemoved {
                                device_id: id.clone(),
                            });
                        }
                        known = current;
                    }
                }
            })
            .map_err(|e| warn!(error = %e, "device poller not started"))
            .ok();

        Self { running, thread }
    }
}

fn device_ids() -> HashSet<String> {
    list_devices()
        .map(|devices| devices.into_iter().map(|d| d.id).collect())
        .unwrap_or_default()
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn joining_capture_thread_does_not_block_runtime() {
        let (done_tx, done_rx) = oneshot::channel();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            let _ = done_tx.send(());
        });

        let started = Instant::now();
        join_off_runtime(thread);
        assert!(started.elapsed() < Duration::from_millis(150));

        done_rx.await.unwrap();
    }

    #[test]
    fn joining_outside_runtime_waits_for_thread() {
        let finished = Arc::new(AtomicBool::new(false));
        let thread = std::thread::spawn({
            let finished = finished.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                finished.store(true, Ordering::SeqCst);
            }
        });

        join_off_runtime(thread);
        assert!(finished.load(Ordering::SeqCst));
    }

    #[test]
    fn ring_downmixes_and_keeps_newest_samples() {
        let ring = Ring::default();
        ring.push_frames(&[0.2f32, 0.4, -1.0, 1.0], 2);

        let tap = RingTap {
            ring: Arc::new(ring),
            sample_rate: 48_000,
        };
        let mut out = [9.0f32; 4];
        assert_eq!(tap.read_latest(&mut out), 2);
        assert!((out[2] - 0.3).abs() < 1e-6);
        assert_eq!(out[3], 0.0);
        assert_eq!(out[0], 9.0);
    }
}
