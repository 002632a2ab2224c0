//! Frequency-domain input level analysis.
//!
//! Mirrors a browser analyser node: Blackman window, magnitude scaled by
//! 1/N, exponential smoothing between frames, then each bin's decibel value
//! mapped linearly from `[min_decibels, max_decibels]` onto `[0, 1]`.

use std::f32::consts::TAU;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use tracing::debug;

use crate::config::MeterConfig;

/// Reusable FFT state for one meter attachment.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    frame: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
}

impl SpectrumAnalyzer {
    /// Build an analyzer; `config` is expected to have passed validation.
    pub fn new(config: &MeterConfig) -> Self {
        let size = config.fft_size;
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        let spectrum = fft.make_output_vec();

        Self {
            fft,
            window: blackman(size),
            frame: vec![0.0; size],
            spectrum,
            smoothed: vec![0.0; size / 2],
            smoothing: config.smoothing,
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.window.len()
    }

    /// Number of frequency bins averaged into a reading.
    pub fn bin_count(&self) -> usize {
        self.smoothed.len()
    }

    /// Analyze the newest samples and return the mean normalized bin level.
    ///
    /// Fewer than `fft_size` samples are left-padded with silence; extra
    /// samples beyond the window are ignored (oldest first).
    pub fn process(&mut self, samples: &[f32]) -> f32 {
        let size = self.fft_size();
        let recent = &samples[samples.len().saturating_sub(size)..];
        let pad = size - recent.len();

        self.frame[..pad].iter_mut().for_each(|s| *s = 0.0);
        for ((dst, src), w) in self.frame[pad..]
            .iter_mut()
            .zip(recent)
            .zip(&self.window[pad..])
        {
            *dst = src * w;
        }

        if let Err(e) = self.fft.process(&mut self.frame, &mut self.spectrum) {
            debug!(error = %e, "fft failed");
            return 0.0;
        }

        let scale = 1.0 / size as f32;
        let range = self.max_decibels - self.min_decibels;
        let mut total = 0.0;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.spectrum) {
            let magnitude = bin.norm() * scale;
            *smoothed = self.smoothing * *smoothed + (1.0 - self.smoothing) * magnitude;
            if *smoothed > 0.0 {
                let db = 20.0 * smoothed.log10();
                total += ((db - self.min_decibels) / range).clamp(0.0, 1.0);
            }
        }

        (total / self.bin_count() as f32).clamp(0.0, 1.0)
    }
}

fn blackman(size: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..size)
        .map(|n| {
            let x = n as f32 / size as f32;
            A0 - A1 * (TAU * x).cos() + A2 * (2.0 * TAU * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (TAU * 1_000.0 * i as f32 / 48_000.0).sin())
            .collect()
    }

    fn settle(analyzer: &mut SpectrumAnalyzer, samples: &[f32]) -> f32 {
        let mut level = 0.0;
        for _ in 0..40 {
            level = analyzer.process(samples);
        }
        level
    }

    #[test]
    fn silence_reads_zero() {
        let mut analyzer = SpectrumAnalyzer::new(&MeterConfig::default());
        assert_eq!(analyzer.process(&[0.0; 256]), 0.0);
    }

    #[test]
    fn louder_input_reads_higher() {
        let config = MeterConfig::default();
        let quiet = settle(&mut SpectrumAnalyzer::new(&config), &sine(0.01, 256));
        let loud = settle(&mut SpectrumAnalyzer::new(&config), &sine(0.8, 256));

        assert!(quiet > 0.0);
        assert!(loud > quiet, "loud={loud} quiet={quiet}");
        assert!(loud <= 1.0);
    }

    #[test]
    fn smoothing_ramps_towards_steady_state() {
        let mut analyzer = SpectrumAnalyzer::new(&MeterConfig::default());
        let tone = sine(0.5, 256);
        let first = analyzer.process(&tone);
        let settled = settle(&mut analyzer, &tone);
        assert!(settled > first);
    }

    #[test]
    fn short_input_is_padded() {
        let mut analyzer = SpectrumAnalyzer::new(&MeterConfig::default());
        assert_eq!(analyzer.bin_count(), 128);
        let level = analyzer.process(&sine(0.5, 64));
        assert!(level > 0.0);
    }
}
