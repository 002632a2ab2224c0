//! Input level metering.
//!
//! A meter samples the attached audio track on a steady cadence and
//! publishes a normalized reading. Detaching is synchronous: once
//! [`LevelMeter::detach`] returns, no tick is running and none will run.
//! A track the host ends on its own is never read again: the meter stops
//! ticking and tells its owner through the track-ended hook.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::analysis::SpectrumAnalyzer;
use super::host::TrackHandle;
use super::session::AudioTrackListener;
use crate::config::MeterConfig;

/// One published input level.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LevelReading {
    /// Normalized level (0.0 to 1.0)
    pub level: f32,

    /// Monotonic tick counter across attachments; 0 before the first tick
    pub sequence: u64,
}

impl LevelReading {
    /// Level as percentage for a UI bar.
    pub fn percent(&self) -> f32 {
        self.level * 100.0
    }
}

struct Attachment {
    track_id: String,
    cancel: CancellationToken,
    /// Held for the duration of every tick body
    gate: Arc<Mutex<()>>,
    task: JoinHandle<()>,
}

/// Called with the track id when an attached track ends without being detached.
pub type TrackEndedHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Level meter following the session's current audio track.
pub struct LevelMeter {
    config: MeterConfig,
    readings: Arc<watch::Sender<LevelReading>>,
    sequence: Arc<AtomicU64>,
    attachment: Mutex<Option<Attachment>>,
    on_ended: Mutex<Option<TrackEndedHook>>,
}

impl LevelMeter {
    pub fn new(config: MeterConfig) -> Self {
        let (readings, _) = watch::channel(LevelReading::default());
        Self {
            config,
            readings: Arc::new(readings),
            sequence: Arc::new(AtomicU64::new(0)),
            attachment: Mutex::new(None),
            on_ended: Mutex::new(None),
        }
    }

    /// Run `hook` from the tick task when the metered track ends underneath it.
    ///
    /// The hook must not block; it fires once per attachment.
    pub fn on_track_ended(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        let hook: TrackEndedHook = Arc::new(hook);
        *self.on_ended.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    fn lock_attachment(&self) -> MutexGuard<'_, Option<Attachment>> {
        self.attachment.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to readings.
    pub fn subscribe(&self) -> watch::Receiver<LevelReading> {
        self.readings.subscribe()
    }

    /// Latest published reading.
    pub fn current(&self) -> LevelReading {
        *self.readings.borrow()
    }

    /// Id of the track currently being metered.
    pub fn attached_track(&self) -> Option<String> {
        self.lock_attachment().as_ref().map(|a| a.track_id.clone())
    }

    /// Start metering `track`, replacing any previous attachment.
    ///
    /// Returns false (and stays detached) for tracks without audio.
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, track: &TrackHandle) -> bool {
        self.detach();

        let Some(tap) = track.audio_tap() else {
            debug!(track = track.id(), "not an audio track, meter stays detached");
            return false;
        };

        let cancel = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));
        let mut analyzer = SpectrumAnalyzer::new(&self.config);
        let interval = self.config.tick_interval();
        let readings = self.readings.clone();
        let sequence = self.sequence.clone();
        let on_ended = self
            .on_ended
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let gate = gate.clone();
            let track = track.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut buffer = vec![0.0f32; analyzer.fft_size()];
                let mut ended = false;

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }

                    let _tick = gate.lock().unwrap_or_else(|e| e.into_inner());
                    if cancel.is_cancelled() {
                        break;
                    }
                    if !track.is_live() {
                        ended = true;
                        readings.send_replace(LevelReading {
                            level: 0.0,
                            sequence: sequence.load(Ordering::SeqCst),
                        });
                        break;
                    }

                    let written = tap.read_latest(&mut buffer).min(buffer.len());
                    let level = if written == 0 {
                        0.0
                    } else {
                        analyzer.process(&buffer[buffer.len() - written..])
                    };
                    let reading = LevelReading {
                        level,
                        sequence: sequence.fetch_add(1, Ordering::SeqCst) + 1,
                    };
                    trace!(level, "level tick");
                    readings.send_replace(reading);
                }

                if ended {
                    debug!(track = track.id(), "metered track ended, ticks stopped");
                    if let Some(hook) = on_ended {
                        hook(track.id());
                    }
                }
            }
        });

        debug!(track = track.id(), "level meter attached");
        *self.lock_attachment() = Some(Attachment {
            track_id: track.id().to_string(),
            cancel,
            gate,
            task,
        });
        true
    }

    /// Stop ticking. Idempotent.
    ///
    /// Publishes a zero reading so subscribers do not freeze on the last level.
    pub fn detach(&self) {
        let Some(attachment) = self.lock_attachment().take() else {
            return;
        };

        attachment.cancel.cancel();
        // Wait out a tick that is already past its cancellation check
        drop(attachment.gate.lock().unwrap_or_else(|e| e.into_inner()));
        attachment.task.abort();

        self.readings.send_replace(LevelReading {
            level: 0.0,
            sequence: self.sequence.load(Ordering::SeqCst),
        });
        debug!(track = %attachment.track_id, "level meter detached");
    }
}

impl AudioTrackListener for LevelMeter {
    fn audio_track_started(&self, track: &TrackHandle) {
        self.attach(track);
    }

    fn audio_track_stopping(&self, track_id: &str) {
        if self.attached_track().as_deref() == Some(track_id) {
            self.detach();
        }
    }
}

impl Drop for LevelMeter {
    fn drop(&mut self) {
        self.detach();
    }
}
