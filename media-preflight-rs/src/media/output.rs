//! Speaker test playback.
//!
//! Plays a short tone, bound to the chosen output when the host can route
//! playback. Routing problems never stop the tone: it falls back to the
//! default output and the outcome says why.

use std::f32::consts::TAU;
use std::sync::Arc;

use tracing::{info, warn};

use super::device::{DeviceKind, MediaError};
use super::host::{AudioClip, MediaHost};
use crate::config::ToneConfig;

/// Where the test signal ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackOutcome {
    /// Played on the requested output
    Routed { output_id: String },

    /// No explicit output was requested
    DefaultOutput,

    /// An explicit output was requested but the tone played on the default
    FellBackToDefault { requested: String, reason: MediaError },
}

impl PlaybackOutcome {
    /// The non-fatal condition to show the user, if any.
    pub fn warning(&self) -> Option<&MediaError> {
        match self {
            PlaybackOutcome::FellBackToDefault { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// Synthesize a sine tone with linear fade in/out.
pub fn test_tone(config: &ToneConfig) -> AudioClip {
    let rate = config.sample_rate as f32;
    let len = (config.duration_ms as f32 / 1000.0 * rate).round() as usize;
    let fade = ((config.fade_ms as f32 / 1000.0 * rate).round() as usize).min(len / 2);
    let step = TAU * config.frequency_hz / rate;

    let samples: Vec<f32> = (0..len)
        .map(|i| {
            let envelope = if fade == 0 {
                1.0
            } else if i < fade {
                i as f32 / fade as f32
            } else if i >= len - fade {
                (len - 1 - i) as f32 / fade as f32
            } else {
                1.0
            };
            config.amplitude * envelope * (step * i as f32).sin()
        })
        .collect();

    AudioClip {
        samples: samples.into(),
        sample_rate: config.sample_rate,
    }
}

/// Binds the test signal to a playback endpoint.
pub struct OutputRouter {
    host: Arc<dyn MediaHost>,
    clip: AudioClip,
}

impl OutputRouter {
    pub fn new(host: Arc<dyn MediaHost>, tone: &ToneConfig) -> Self {
        Self {
            host,
            clip: test_tone(tone),
        }
    }

    pub fn clip(&self) -> &AudioClip {
        &self.clip
    }

    /// Play the test signal on `output_id`, or the default output for `None`/"default".
    pub async fn play_test_signal(
        &self,
        output_id: Option<&str>,
    ) -> Result<PlaybackOutcome, MediaError> {
        let requested = output_id.filter(|id| !id.is_empty() && *id != "default");

        let Some(id) = requested else {
            self.play_default().await?;
            return Ok(PlaybackOutcome::DefaultOutput);
        };

        if !self.host.supports_output_routing() {
            warn!(output = id, "output routing unsupported, using default output");
            self.play_default().await?;
            return Ok(PlaybackOutcome::FellBackToDefault {
                requested: id.to_string(),
                reason: MediaError::RoutingUnsupported,
            });
        }

        match self.host.play_clip(&self.clip, Some(id)).await {
            Ok(()) => {
                info!(output = id, "test signal played");
                Ok(PlaybackOutcome::Routed {
                    output_id: id.to_string(),
                })
            }
            Err(e) => {
                let reason = MediaError::from_host(DeviceKind::Speaker, Some(id), e);
                warn!(output = id, error = %reason, "binding output failed, using default output");
                self.play_default().await?;
                Ok(PlaybackOutcome::FellBackToDefault {
                    requested: id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn play_default(&self) -> Result<(), MediaError> {
        self.host
            .play_clip(&self.clip, None)
            .await
            .map_err(|e| MediaError::from_host(DeviceKind::Speaker, None, e))?;
        info!("test signal played on default output");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::host::HostError;
    use crate::testing::{FakeHost, PlayedClip};

    fn host() -> Arc<FakeHost> {
        Arc::new(
            FakeHost::new()
                .with_device("s1", DeviceKind::Speaker, "Speakers")
                .with_device("s2", DeviceKind::Speaker, "Headphones"),
        )
    }

    #[test]
    fn tone_has_configured_length_and_fades() {
        let config = ToneConfig::default();
        let clip = test_tone(&config);
        assert_eq!(clip.samples.len(), 48_000);
        assert_eq!(clip.samples[0], 0.0);
        assert!(clip.samples[clip.samples.len() - 1].abs() < 1e-6);
        assert!(clip.samples.iter().all(|s| s.abs() <= config.amplitude));
        assert!((clip.duration_secs() - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn routes_to_explicit_output() {
        let host = host();
        let router = OutputRouter::new(host.clone(), &ToneConfig::default());

        let outcome = router.play_test_signal(Some("s2")).await.unwrap();
        assert_eq!(outcome, PlaybackOutcome::Routed { output_id: "s2".into() });
        assert_eq!(host.played()[0].output_id.as_deref(), Some("s2"));
        assert!(outcome.warning().is_none());
    }

    #[tokio::test]
    async fn no_output_plays_on_default() {
        let host = host();
        let router = OutputRouter::new(host.clone(), &ToneConfig::default());

        assert_eq!(
            router.play_test_signal(None).await.unwrap(),
            PlaybackOutcome::DefaultOutput
        );
        assert_eq!(
            router.play_test_signal(Some("default")).await.unwrap(),
            PlaybackOutcome::DefaultOutput
        );
        assert!(host.played().iter().all(|p| p.output_id.is_none()));
    }

    #[tokio::test]
    async fn unsupported_routing_reports_and_plays_default() {
        let host = host();
        host.set_routing_supported(false);
        let router = OutputRouter::new(host.clone(), &ToneConfig::default());

        let outcome = router.play_test_signal(Some("s2")).await.unwrap();
        assert_eq!(outcome.warning(), Some(&MediaError::RoutingUnsupported));
        assert_eq!(
            host.played(),
            vec![PlayedClip {
                output_id: None,
                samples: router.clip().samples.len()
            }]
        );
    }

    #[tokio::test]
    async fn vanished_output_falls_back_to_default() {
        let host = host();
        host.fail_output("s2", HostError::NotFound);
        let router = OutputRouter::new(host.clone(), &ToneConfig::default());

        let outcome = router.play_test_signal(Some("s2")).await.unwrap();
        assert!(matches!(
            outcome,
            PlaybackOutcome::FellBackToDefault {
                reason: MediaError::DeviceUnavailable { .. },
                ..
            }
        ));
        assert_eq!(host.played().len(), 1);
        assert_eq!(host.played()[0].output_id, None);
    }

    #[tokio::test]
    async fn only_routing_failures_report_routing_unsupported() {
        let host = host();
        host.fail_output("s2", HostError::Unsupported("output sample format I24".into()));
        let router = OutputRouter::new(host.clone(), &ToneConfig::default());

        let outcome = router.play_test_signal(Some("s2")).await.unwrap();
        let reason = outcome.warning().unwrap();
        assert_ne!(reason, &MediaError::RoutingUnsupported);
        assert!(matches!(reason, MediaError::Host(msg) if msg.contains("sample format")));

        host.fail_output("s1", HostError::RoutingUnsupported);
        let outcome = router.play_test_signal(Some("s1")).await.unwrap();
        assert_eq!(outcome.warning(), Some(&MediaError::RoutingUnsupported));
        assert!(host.played().iter().all(|p| p.output_id.is_none()));
    }
}
