/// Energy normalizer module
///
/// Computes loudness statistics per window and applies adaptive gain, or
/// flags silence so callers can skip expensive downstream work entirely.

use crate::resampler::AudioSample;
use tracing::{debug, trace};

/// Normalizer configuration
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Peak below this is treated as silence and skipped
    pub min_signal_peak: f32,

    /// RMS level the gain aims for
    pub target_rms: f32,

    /// Absolute gain ceiling
    pub max_gain: f32,

    /// Scaled peak never exceeds this fraction of full scale
    pub max_output_peak: f32,

    /// Gains at or below this are not worth applying
    pub min_worthwhile_gain: f32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_signal_peak: 0.015,
            target_rms: 0.15,
            max_gain: 8.0,
            max_output_peak: 0.92,
            min_worthwhile_gain: 1.05,
        }
    }
}

/// Before/after loudness statistics for an applied gain.
#[derive(Debug, Clone, Copy)]
pub struct GainReport {
    pub gain: f32,
    pub rms_before: f32,
    pub rms_after: f32,
    pub peak_before: f32,
    pub peak_after: f32,
}

/// Result of a normalization pass.
#[derive(Debug, Clone, Copy)]
pub enum NormalizeOutcome {
    /// Peak below the minimum-signal threshold; skip downstream work
    Silence,

    /// Signal present but the computed gain was not worth applying
    Unchanged,

    /// Gain applied in place
    Applied(GainReport),
}

impl NormalizeOutcome {
    pub fn is_silence(&self) -> bool {
        matches!(self, NormalizeOutcome::Silence)
    }
}

/// Adaptive per-window gain with silence short-circuit.
pub struct EnergyNormalizer {
    config: NormalizerConfig,
}

impl EnergyNormalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        debug!(
            "Creating energy normalizer: target RMS {:.3}, max gain {:.1}",
            config.target_rms, config.max_gain
        );
        Self { config }
    }

    /// Normalize a window in place.
    pub fn normalize(&self, samples: &mut [AudioSample]) -> NormalizeOutcome {
        if samples.is_empty() {
            return NormalizeOutcome::Silence;
        }

        let (rms, peak) = amplitude_stats(samples);

        if peak < self.config.min_signal_peak {
            trace!("Silence window: peak {:.4} below threshold", peak);
            return NormalizeOutcome::Silence;
        }

        if rms <= 0.0 {
            return NormalizeOutcome::Silence;
        }

        let mut gain = self.config.target_rms / rms;
        gain = gain.min(self.config.max_gain);
        // Peak-limited: scaled peak must stay within max_output_peak
        gain = gain.min(self.config.max_output_peak / peak);

        if gain <= self.config.min_worthwhile_gain {
            trace!("Gain {:.3} near unity, skipping normalization", gain);
            return NormalizeOutcome::Unchanged;
        }

        for s in samples.iter_mut() {
            *s = (*s * gain).clamp(-1.0, 1.0);
        }

        let (rms_after, peak_after) = amplitude_stats(samples);
        trace!(
            "Applied gain {:.3}: RMS {:.4} -> {:.4}, peak {:.4} -> {:.4}",
            gain,
            rms,
            rms_after,
            peak,
            peak_after
        );

        NormalizeOutcome::Applied(GainReport {
            gain,
            rms_before: rms,
            rms_after,
            peak_before: peak,
            peak_after,
        })
    }
}

/// (RMS, peak) amplitude statistics of a sample buffer.
pub fn amplitude_stats(samples: &[AudioSample]) -> (f32, f32) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }

    let mut sum_sq = 0.0f64;
    let mut peak = 0.0f32;
    for &s in samples {
        sum_sq += (s as f64) * (s as f64);
        peak = peak.max(s.abs());
    }

    ((sum_sq / samples.len() as f64).sqrt() as f32, peak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn normalizer() -> EnergyNormalizer {
        EnergyNormalizer::new(NormalizerConfig::default())
    }

    #[test]
    fn test_amplitude_stats() {
        let (rms, peak) = amplitude_stats(&[0.3, -0.3, 0.3, -0.3]);
        assert_relative_eq!(rms, 0.3, epsilon = 0.001);
        assert_relative_eq!(peak, 0.3, epsilon = 0.001);

        let (rms, peak) = amplitude_stats(&[]);
        assert_eq!(rms, 0.0);
        assert_eq!(peak, 0.0);
    }

    #[test]
    fn test_silence_short_circuit() {
        let n = normalizer();
        let mut quiet = vec![0.001f32; 160];

        let outcome = n.normalize(&mut quiet);
        assert!(outcome.is_silence());
        assert!(quiet.iter().all(|&s| s == 0.001));
    }

    #[test]
    fn test_empty_window_is_silence() {
        let n = normalizer();
        assert!(n.normalize(&mut []).is_silence());
    }

    #[test]
    fn test_gain_boosts_quiet_speech() {
        let n = normalizer();
        let mut samples: Vec<f32> = (0..1600)
            .map(|i| 0.03 * (i as f32 * 0.05).sin())
            .collect();

        match n.normalize(&mut samples) {
            NormalizeOutcome::Applied(report) => {
                assert!(report.gain > 1.05);
                assert!(report.rms_after > report.rms_before);
            }
            other => panic!("Expected Applied, got {:?}", other),
        }
    }

    #[test]
    fn test_output_peak_never_exceeds_cap() {
        let config = NormalizerConfig::default();
        let cap = config.max_output_peak;
        let n = EnergyNormalizer::new(config);

        let mut samples: Vec<f32> = (0..1600)
            .map(|i| 0.05 * (i as f32 * 0.07).sin())
            .collect();

        if let NormalizeOutcome::Applied(report) = n.normalize(&mut samples) {
            assert!(report.peak_after <= cap + 0.001);
        }
        let (_, peak) = amplitude_stats(&samples);
        assert!(peak <= cap + 0.001);
    }

    #[test]
    fn test_near_unity_gain_skipped() {
        let n = EnergyNormalizer::new(NormalizerConfig {
            target_rms: 0.15,
            ..Default::default()
        });

        // Already near the target level
        let mut samples: Vec<f32> = (0..1600)
            .map(|i| 0.21 * (i as f32 * 0.05).sin())
            .collect();
        let before = samples.clone();

        match n.normalize(&mut samples) {
            NormalizeOutcome::Unchanged => assert_eq!(samples, before),
            other => panic!("Expected Unchanged, got {:?}", other),
        }
    }

    #[test]
    fn test_hard_clipping_bounds() {
        let n = EnergyNormalizer::new(NormalizerConfig {
            max_gain: 100.0,
            max_output_peak: 2.0, // deliberately above full scale
            ..Default::default()
        });

        let mut samples = vec![0.05f32, -0.05, 0.04, -0.04, 0.05, -0.05];
        n.normalize(&mut samples);

        assert!(samples.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }
}
