/// Resampler module
///
/// Converts raw multichannel capture buffers into mono samples at the
/// pipeline's fixed target rate. On any failure it produces an empty
/// buffer; downstream stages treat that as "no samples this tick".

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Pipeline target sample rate (16kHz)
pub const TARGET_SAMPLE_RATE: u32 = 16000;

/// Audio sample format (f32 normalized to -1.0 to 1.0)
pub type AudioSample = f32;

#[derive(Error, Debug)]
pub enum ResampleError {
    #[error("Invalid target rate: {0} Hz (must be > 0)")]
    InvalidTargetRate(u32),
}

/// Resampling quality
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleQuality {
    /// Fractional-cursor linear interpolation
    Linear,

    /// Windowed-sinc conversion via rubato
    Sinc,
}

/// Resampler configuration
#[derive(Debug, Clone)]
pub struct ResamplerConfig {
    /// Output sample rate for the whole pipeline
    pub target_rate: u32,

    /// Conversion quality
    pub quality: ResampleQuality,
}

impl Default for ResamplerConfig {
    fn default() -> Self {
        Self {
            target_rate: TARGET_SAMPLE_RATE,
            quality: ResampleQuality::Linear,
        }
    }
}

impl ResamplerConfig {
    pub fn validate(&self) -> Result<(), ResampleError> {
        if self.target_rate == 0 {
            return Err(ResampleError::InvalidTargetRate(self.target_rate));
        }
        Ok(())
    }
}

/// Converts arbitrary-rate interleaved multichannel buffers to mono
/// samples at the target rate.
pub struct Resampler {
    config: ResamplerConfig,
}

impl Resampler {
    pub fn new(config: ResamplerConfig) -> Result<Self, ResampleError> {
        config.validate()?;

        debug!(
            "Creating resampler: target {} Hz, quality {:?}",
            config.target_rate, config.quality
        );

        Ok(Self { config })
    }

    pub fn target_rate(&self) -> u32 {
        self.config.target_rate
    }

    /// Process one capture buffer.
    ///
    /// `frames` is interleaved with `channels` samples per frame at
    /// `source_rate`. Returns mono samples at the target rate; returns an
    /// empty buffer on any malformed input or converter failure.
    pub fn process(&self, frames: &[AudioSample], source_rate: u32, channels: u16) -> Vec<AudioSample> {
        if frames.is_empty() || source_rate == 0 || channels == 0 {
            trace!(
                "Dropping capture buffer: {} samples, {} Hz, {} channels",
                frames.len(),
                source_rate,
                channels
            );
            return Vec::new();
        }

        let mono = downmix(frames, channels);
        if mono.is_empty() {
            return Vec::new();
        }

        if source_rate == self.config.target_rate {
            return mono;
        }

        match self.config.quality {
            ResampleQuality::Linear => {
                resample_linear(&mono, source_rate, self.config.target_rate)
            }
            ResampleQuality::Sinc => match resample_sinc(&mono, source_rate, self.config.target_rate) {
                Ok(out) => out,
                Err(e) => {
                    warn!("Sinc resampler unavailable ({}), dropping buffer", e);
                    Vec::new()
                }
            },
        }
    }
}

/// Average all channels sample-wise into mono.
fn downmix(frames: &[AudioSample], channels: u16) -> Vec<AudioSample> {
    let channels = channels as usize;
    if channels == 1 {
        return frames.to_vec();
    }

    if frames.len() % channels != 0 {
        warn!(
            "Interleaved buffer length {} not divisible by {} channels, truncating",
            frames.len(),
            channels
        );
    }

    frames
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation rate conversion with a fractional read cursor.
fn resample_linear(mono: &[AudioSample], source_rate: u32, target_rate: u32) -> Vec<AudioSample> {
    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = (mono.len() as f64 / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);

    let mut cursor = 0.0f64;
    for _ in 0..out_len {
        let base = cursor as usize;
        if base + 1 < mono.len() {
            let frac = (cursor - base as f64) as f32;
            out.push(mono[base] * (1.0 - frac) + mono[base + 1] * frac);
        } else {
            out.push(mono[mono.len() - 1]);
        }
        cursor += ratio;
    }

    out
}

/// Windowed-sinc conversion via rubato.
fn resample_sinc(
    mono: &[AudioSample],
    source_rate: u32,
    target_rate: u32,
) -> Result<Vec<AudioSample>, String> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        target_rate as f64 / source_rate as f64,
        2.0,
        params,
        mono.len(),
        1, // mono
    )
    .map_err(|e| e.to_string())?;

    let input_waves = vec![mono.to_vec()];
    let output_waves = resampler
        .process(&input_waves, None)
        .map_err(|e| e.to_string())?;

    Ok(output_waves.into_iter().next().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use test_case::test_case;

    fn resampler() -> Resampler {
        Resampler::new(ResamplerConfig::default()).unwrap()
    }

    #[test]
    fn test_config_validation() {
        let config = ResamplerConfig {
            target_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(ResamplerConfig::default().validate().is_ok());
    }

    #[test_case(1 ; "mono")]
    #[test_case(2 ; "stereo")]
    #[test_case(4 ; "quad")]
    fn test_identity_at_equal_rates(channels: u16) {
        let rs = resampler();
        let frames: Vec<f32> = (0..(240 * channels as usize))
            .map(|i| (i as f32 * 0.01).sin() * 0.5)
            .collect();

        let out = rs.process(&frames, TARGET_SAMPLE_RATE, channels);
        assert_eq!(out.len(), frames.len() / channels as usize);

        if channels == 1 {
            assert_eq!(out, frames);
        }
    }

    #[test]
    fn test_downmix_averages_channels() {
        let rs = resampler();
        let frames = vec![0.5, 0.3, 0.2, 0.4];

        let out = rs.process(&frames, TARGET_SAMPLE_RATE, 2);
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[0], 0.4, epsilon = 0.001);
        assert_relative_eq!(out[1], 0.3, epsilon = 0.001);
    }

    #[test]
    fn test_empty_input_produces_empty_output() {
        let rs = resampler();
        assert!(rs.process(&[], 48000, 1).is_empty());
        assert!(rs.process(&[0.1, 0.2], 0, 1).is_empty());
        assert!(rs.process(&[0.1, 0.2], 48000, 0).is_empty());
    }

    #[test]
    fn test_linear_downsampling_length() {
        let rs = resampler();
        let frames = vec![0.1f32; 48000]; // 1 second at 48kHz

        let out = rs.process(&frames, 48000, 1);
        assert_eq!(out.len(), 16000);
    }

    #[test]
    fn test_linear_upsampling_length() {
        let rs = resampler();
        let frames = vec![0.1f32; 8000]; // 1 second at 8kHz

        let out = rs.process(&frames, 8000, 1);
        assert_eq!(out.len(), 16000);
    }

    #[test]
    fn test_linear_interpolation_values() {
        let rs = resampler();
        // Ramp at 32kHz halved to 16kHz should keep every other sample.
        let frames: Vec<f32> = (0..32).map(|i| i as f32 / 32.0).collect();

        let out = rs.process(&frames, 32000, 1);
        assert_eq!(out.len(), 16);
        assert_relative_eq!(out[0], 0.0, epsilon = 0.001);
        assert_relative_eq!(out[1], 2.0 / 32.0, epsilon = 0.001);
        assert_relative_eq!(out[8], 16.0 / 32.0, epsilon = 0.001);
    }

    #[test]
    fn test_sinc_downsampling() {
        let rs = Resampler::new(ResamplerConfig {
            quality: ResampleQuality::Sinc,
            ..Default::default()
        })
        .unwrap();

        let frames = vec![0.0f32; 48000];
        let out = rs.process(&frames, 48000, 1);

        // Rubato may produce a slightly different length
        assert!((out.len() as i32 - 16000).abs() < 500);
    }
}
