/// Sliding window buffer module
///
/// Turns the continuous resampled sample stream into fixed-length,
/// fixed-hop overlapping windows, each tagged with its absolute sample
/// offset since capture start. Emission cadence is constant regardless of
/// how irregular the capture buffer sizes are.

use crate::resampler::AudioSample;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum WindowerError {
    #[error("Invalid window configuration: {0}")]
    InvalidConfig(String),
}

/// One analysis window plus its absolute position in the stream.
#[derive(Debug, Clone)]
pub struct AudioWindowSegment {
    /// Mono samples at the pipeline sample rate, exactly `window_samples` long
    pub samples: Vec<AudioSample>,

    /// Absolute sample offset of the first sample since capture start
    pub start_offset: u64,
}

impl AudioWindowSegment {
    /// Window start expressed in seconds since capture start.
    pub fn start_secs(&self, sample_rate: u32) -> f64 {
        self.start_offset as f64 / sample_rate as f64
    }
}

/// Windower configuration
#[derive(Debug, Clone)]
pub struct WindowerConfig {
    /// Window length W
    pub window_duration: Duration,

    /// Hop H between consecutive window starts
    pub hop_duration: Duration,

    /// Pipeline sample rate
    pub sample_rate: u32,
}

impl Default for WindowerConfig {
    fn default() -> Self {
        Self {
            window_duration: Duration::from_millis(2000),
            hop_duration: Duration::from_millis(500),
            sample_rate: crate::resampler::TARGET_SAMPLE_RATE,
        }
    }
}

impl WindowerConfig {
    pub fn validate(&self) -> Result<(), WindowerError> {
        if self.sample_rate == 0 {
            return Err(WindowerError::InvalidConfig(
                "sample_rate must be > 0".to_string(),
            ));
        }

        if self.window_samples() == 0 {
            return Err(WindowerError::InvalidConfig(
                "window_duration too short for sample rate".to_string(),
            ));
        }

        if self.hop_samples() == 0 {
            return Err(WindowerError::InvalidConfig(
                "hop_duration too short for sample rate".to_string(),
            ));
        }

        Ok(())
    }

    pub fn window_samples(&self) -> usize {
        (self.window_duration.as_secs_f64() * self.sample_rate as f64) as usize
    }

    pub fn hop_samples(&self) -> usize {
        (self.hop_duration.as_secs_f64() * self.sample_rate as f64) as usize
    }
}

/// Sliding window buffer over the sample stream.
pub struct Windower {
    window_samples: usize,
    hop_samples: usize,
    buffer: Vec<AudioSample>,
    start_index: usize,
    /// Samples dropped from the buffer front so far (compaction accounting)
    processed_samples: u64,
}

impl Windower {
    pub fn new(config: &WindowerConfig) -> Result<Self, WindowerError> {
        config.validate()?;

        let window_samples = config.window_samples();
        let hop_samples = config.hop_samples();

        debug!(
            "Creating windower: window {} samples, hop {} samples",
            window_samples, hop_samples
        );

        Ok(Self {
            window_samples,
            hop_samples,
            buffer: Vec::new(),
            start_index: 0,
            processed_samples: 0,
        })
    }

    /// Append incoming samples and extract every complete window.
    pub fn append(&mut self, samples: &[AudioSample]) -> Vec<AudioWindowSegment> {
        if samples.is_empty() {
            return Vec::new();
        }

        self.buffer.extend_from_slice(samples);

        let mut windows = Vec::new();
        // start_index can sit past the buffer end when the hop is longer
        // than the window
        while self.buffer.len() >= self.start_index + self.window_samples {
            let window = AudioWindowSegment {
                samples: self.buffer[self.start_index..self.start_index + self.window_samples]
                    .to_vec(),
                start_offset: self.processed_samples + self.start_index as u64,
            };

            trace!(
                "Emitting window at offset {} ({} samples)",
                window.start_offset,
                window.samples.len()
            );

            windows.push(window);
            self.start_index += self.hop_samples;
        }

        // Compact once the consumed prefix dominates, folding the dropped
        // length into the absolute sample count.
        if self.start_index > self.buffer.len() / 2 {
            let drop = self.start_index.min(self.buffer.len());
            self.buffer.drain(0..drop);
            self.processed_samples += drop as u64;
            self.start_index -= drop;
        }

        windows
    }

    /// Clear all state (stream restart).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.start_index = 0;
        self.processed_samples = 0;
        debug!("Windower reset");
    }

    /// Samples currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.start_index.min(self.buffer.len())
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    pub fn hop_samples(&self) -> usize {
        self.hop_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn config(window: usize, hop: usize) -> WindowerConfig {
        // 1kHz rate makes samples == milliseconds for readable tests
        WindowerConfig {
            window_duration: Duration::from_millis(window as u64),
            hop_duration: Duration::from_millis(hop as u64),
            sample_rate: 1000,
        }
    }

    fn collect_offsets(windower: &mut Windower, stream: &[f32], chunk: usize) -> Vec<u64> {
        let mut offsets = Vec::new();
        for part in stream.chunks(chunk) {
            for w in windower.append(part) {
                assert_eq!(w.samples.len(), windower.window_samples());
                offsets.push(w.start_offset);
            }
        }
        offsets
    }

    #[test]
    fn test_config_validation() {
        assert!(config(100, 25).validate().is_ok());

        let mut bad = config(100, 25);
        bad.sample_rate = 0;
        assert!(bad.validate().is_err());

        let zero_hop = WindowerConfig {
            window_duration: Duration::from_millis(100),
            hop_duration: Duration::from_micros(1),
            sample_rate: 1000,
        };
        assert!(zero_hop.validate().is_err());
    }

    #[test]
    fn test_window_length_and_spacing() {
        let cfg = config(100, 30);
        let mut windower = Windower::new(&cfg).unwrap();

        let stream = vec![0.0f32; 1000];
        let offsets = collect_offsets(&mut windower, &stream, 1000);

        assert!(!offsets.is_empty());
        for pair in offsets.windows(2) {
            assert_eq!(pair[1] - pair[0], 30);
        }
        assert_eq!(offsets[0], 0);
    }

    #[test_case(1 ; "sample at a time")]
    #[test_case(7 ; "odd chunks")]
    #[test_case(100 ; "window sized chunks")]
    #[test_case(333 ; "large chunks")]
    fn test_chunking_invariance(chunk: usize) {
        let cfg = config(100, 25);
        let stream: Vec<f32> = (0..2000).map(|i| (i as f32 * 0.01).sin()).collect();

        let mut reference = Windower::new(&cfg).unwrap();
        let mut ref_windows = Vec::new();
        for w in reference.append(&stream) {
            ref_windows.push((w.start_offset, w.samples));
        }

        let mut chunked = Windower::new(&cfg).unwrap();
        let mut got_windows = Vec::new();
        for part in stream.chunks(chunk) {
            for w in chunked.append(part) {
                got_windows.push((w.start_offset, w.samples));
            }
        }

        assert_eq!(got_windows, ref_windows);
    }

    #[test]
    fn test_compaction_preserves_offsets() {
        let cfg = config(10, 10);
        let mut windower = Windower::new(&cfg).unwrap();

        // Enough appends to force many compactions
        let mut offsets = Vec::new();
        for _ in 0..100 {
            for w in windower.append(&[0.0f32; 10]) {
                offsets.push(w.start_offset);
            }
        }

        assert_eq!(offsets.len(), 100);
        for (i, off) in offsets.iter().enumerate() {
            assert_eq!(*off, (i * 10) as u64);
        }
        // Memory stays bounded
        assert!(windower.buffered() < 100);
    }

    #[test]
    fn test_overlapping_content() {
        let cfg = config(4, 2);
        let mut windower = Windower::new(&cfg).unwrap();

        let stream: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let windows = windower.append(&stream);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].samples, vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(windows[1].samples, vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(windows[2].samples, vec![4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_hop_longer_than_window() {
        // Sparse sampling: consume 100 of every 300 samples
        let cfg = config(100, 300);
        assert!(cfg.validate().is_ok());
        let mut windower = Windower::new(&cfg).unwrap();

        let stream: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let offsets = collect_offsets(&mut windower, &stream, 7);

        assert_eq!(offsets, vec![0, 300, 600, 900]);
    }

    #[test]
    fn test_hop_longer_than_window_content() {
        let cfg = config(2, 5);
        let mut windower = Windower::new(&cfg).unwrap();

        let stream: Vec<f32> = (0..12).map(|i| i as f32).collect();
        let windows = windower.append(&stream);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].samples, vec![0.0, 1.0]);
        assert_eq!(windows[1].samples, vec![5.0, 6.0]);
        assert_eq!(windows[2].samples, vec![10.0, 11.0]);
    }

    #[test]
    fn test_reset_clears_state() {
        let cfg = config(100, 25);
        let mut windower = Windower::new(&cfg).unwrap();

        windower.append(&vec![0.0f32; 250]);
        windower.reset();

        let windows = windower.append(&vec![0.0f32; 100]);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start_offset, 0);
    }

    #[test]
    fn test_start_secs() {
        let segment = AudioWindowSegment {
            samples: vec![0.0; 10],
            start_offset: 8000,
        };
        assert!((segment.start_secs(16000) - 0.5).abs() < 1e-9);
    }
}
