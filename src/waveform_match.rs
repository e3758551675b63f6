/// Waveform correlation matcher module
///
/// Template-based detection directly on raw samples, for sessions without
/// a text-recognition engine. Each variation's reference recording is
/// reduced once to a fixed-length, zero-mean/unit-variance template;
/// at runtime a strided window scan over a circular sample buffer scores
/// normalized dot-product similarity against every template, gated by an
/// adaptive noise floor.

use crate::keywords::{KeywordId, VariationId};
use crate::normalizer::amplitude_stats;
use crate::resampler::AudioSample;
use cache_padded::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("Failed to read reference recording: {0}")]
    WavError(#[from] hound::Error),

    #[error("Reference recording is empty or all silence")]
    EmptySample,

    #[error("Invalid expected duration: {0} s")]
    InvalidDuration(f32),

    #[error("Reference recording has no amplitude variance")]
    FlatSignal,
}

/// Template precomputation parameters.
#[derive(Debug, Clone)]
pub struct TemplateConfig {
    /// Pipeline sample rate templates are resampled to
    pub sample_rate: u32,

    /// Leading/trailing samples below this fraction of peak are trimmed
    pub edge_trim_ratio: f32,

    /// Minimum-RMS gate as a fraction of the template's own RMS
    pub min_rms_ratio: f32,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::resampler::TARGET_SAMPLE_RATE,
            edge_trim_ratio: 0.05,
            min_rms_ratio: 0.3,
        }
    }
}

/// A fixed-length acoustic fingerprint of one recorded variation.
#[derive(Debug, Clone)]
pub struct Template {
    pub keyword_id: KeywordId,
    pub variation_id: VariationId,

    /// Zero-mean, unit-variance samples at the pipeline rate
    pub samples: Vec<AudioSample>,

    /// Windows with RMS below this are rejected before scoring
    pub min_rms: f32,
}

impl Template {
    /// Build a template from a reference recording: decode, downmix, trim
    /// near-silent edges, stretch to the expected duration, z-normalize.
    pub fn from_wav(
        path: &Path,
        duration_secs: f32,
        keyword_id: KeywordId,
        variation_id: VariationId,
        config: &TemplateConfig,
    ) -> Result<Self, TemplateError> {
        if duration_secs <= 0.0 {
            return Err(TemplateError::InvalidDuration(duration_secs));
        }

        let mono = decode_wav_mono(path)?;
        let trimmed = trim_silence_edges(&mono, config.edge_trim_ratio);
        if trimmed.is_empty() {
            return Err(TemplateError::EmptySample);
        }

        let target_len = (duration_secs * config.sample_rate as f32) as usize;
        if target_len == 0 {
            return Err(TemplateError::InvalidDuration(duration_secs));
        }
        let stretched = stretch_linear(trimmed, target_len);

        let (rms, _) = amplitude_stats(&stretched);
        let min_rms = rms * config.min_rms_ratio;

        let samples = z_normalize(&stretched).ok_or(TemplateError::FlatSignal)?;

        debug!(
            "Built template {}/{}: {} samples, min RMS {:.4}",
            keyword_id,
            variation_id,
            samples.len(),
            min_rms
        );

        Ok(Self {
            keyword_id,
            variation_id,
            samples,
            min_rms,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Decode a WAV file to mono f32 in [-1, 1].
fn decode_wav_mono(path: &Path) -> Result<Vec<AudioSample>, TemplateError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    if interleaved.is_empty() {
        return Err(TemplateError::EmptySample);
    }

    let channels = spec.channels as usize;
    if channels == 1 {
        return Ok(interleaved);
    }

    Ok(interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect())
}

/// Drop leading/trailing runs below `ratio` of the peak amplitude.
fn trim_silence_edges(samples: &[AudioSample], ratio: f32) -> &[AudioSample] {
    let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return &[];
    }
    let threshold = peak * ratio;

    let start = samples.iter().position(|s| s.abs() > threshold);
    let end = samples.iter().rposition(|s| s.abs() > threshold);

    match (start, end) {
        (Some(s), Some(e)) if s <= e => &samples[s..=e],
        _ => &[],
    }
}

/// Linearly stretch or compress a buffer to exactly `target_len` samples.
fn stretch_linear(samples: &[AudioSample], target_len: usize) -> Vec<AudioSample> {
    if samples.is_empty() || target_len == 0 {
        return Vec::new();
    }
    if samples.len() == 1 {
        return vec![samples[0]; target_len];
    }

    let step = (samples.len() - 1) as f64 / (target_len - 1).max(1) as f64;
    (0..target_len)
        .map(|i| {
            let pos = i as f64 * step;
            let base = pos as usize;
            if base + 1 < samples.len() {
                let frac = (pos - base as f64) as f32;
                samples[base] * (1.0 - frac) + samples[base + 1] * frac
            } else {
                samples[samples.len() - 1]
            }
        })
        .collect()
}

/// Zero-mean/unit-variance normalization; None for flat signals.
fn z_normalize(samples: &[AudioSample]) -> Option<Vec<AudioSample>> {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n;
    let var = samples
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n;

    if var < 1e-12 {
        return None;
    }

    let std = var.sqrt();
    Some(
        samples
            .iter()
            .map(|&s| ((s as f64 - mean) / std) as f32)
            .collect(),
    )
}

/// Waveform matcher runtime parameters. All thresholds are tunable, not
/// protocol constants.
#[derive(Debug, Clone)]
pub struct WaveformConfig {
    pub sample_rate: u32,

    /// Absolute similarity a candidate must clear
    pub similarity_threshold: f32,

    /// Required lead over the runner-up keyword's score
    pub margin_threshold: f32,

    /// Hard floor on the activity threshold
    pub min_signal_level: f32,

    /// Noise-floor EMA coefficient when the level rises
    pub noise_floor_rise: f32,

    /// Noise-floor EMA coefficient when the level falls
    pub noise_floor_fall: f32,

    pub noise_floor_min: f32,
    pub noise_floor_max: f32,

    /// Activity threshold = max(min_signal_level, noise_floor * boost)
    pub noise_floor_boost: f32,

    /// Scan stride = template_len / stride_divisor
    pub stride_divisor: usize,

    /// Scan region = template_len * retention_multiplier
    pub retention_multiplier: f32,

    /// Extra circular-buffer capacity beyond the longest template, seconds
    pub search_padding_secs: f32,

    /// On acceptance the noise floor is pulled up toward the current
    /// level by this factor
    pub accept_depress_factor: f32,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::resampler::TARGET_SAMPLE_RATE,
            similarity_threshold: 0.68,
            margin_threshold: 0.10,
            min_signal_level: 0.01,
            noise_floor_rise: 0.05,
            noise_floor_fall: 0.2,
            noise_floor_min: 0.005,
            noise_floor_max: 0.2,
            noise_floor_boost: 2.5,
            stride_divisor: 8,
            retention_multiplier: 1.5,
            search_padding_secs: 0.5,
            accept_depress_factor: 0.5,
        }
    }
}

/// A template match on the live stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformMatch {
    pub keyword_id: KeywordId,
    pub variation_id: VariationId,
    pub similarity: f32,
}

/// Circular sample buffer bounded to the longest template plus padding.
/// Adapted ring: writes past capacity drop the oldest samples.
struct SampleRing {
    producer: CachePadded<Mutex<<HeapRb<AudioSample> as Split>::Prod>>,
    consumer: CachePadded<Mutex<<HeapRb<AudioSample> as Split>::Cons>>,
}

impl SampleRing {
    fn new(capacity: usize) -> Self {
        let rb = HeapRb::<AudioSample>::new(capacity.max(1));
        let (producer, consumer) = rb.split();
        Self {
            producer: CachePadded::new(Mutex::new(producer)),
            consumer: CachePadded::new(Mutex::new(consumer)),
        }
    }

    fn write(&self, samples: &[AudioSample]) {
        let mut producer = self.producer.lock();
        let vacant = producer.vacant_len();
        if samples.len() > vacant {
            let mut consumer = self.consumer.lock();
            consumer.skip(samples.len() - vacant);
        }
        producer.push_slice(samples);
    }

    fn snapshot(&self) -> Vec<AudioSample> {
        let consumer = self.consumer.lock();
        consumer.iter().copied().collect()
    }

    fn clear(&self) {
        let mut consumer = self.consumer.lock();
        let occupied = consumer.occupied_len();
        consumer.skip(occupied);
    }
}

/// Correlation matcher over the live sample stream.
pub struct WaveformMatcher {
    config: WaveformConfig,
    templates: Vec<Template>,
    ring: SampleRing,
    noise_floor: f32,
}

impl WaveformMatcher {
    pub fn new(templates: Vec<Template>, config: WaveformConfig) -> Self {
        let longest = templates.iter().map(Template::len).max().unwrap_or(0);
        let padding = (config.search_padding_secs * config.sample_rate as f32) as usize;
        let capacity =
            (longest as f32 * config.retention_multiplier) as usize + padding;

        info!(
            "Creating waveform matcher: {} templates, ring capacity {} samples",
            templates.len(),
            capacity
        );

        Self {
            noise_floor: config.noise_floor_min,
            ring: SampleRing::new(capacity.max(longest).max(1)),
            templates,
            config,
        }
    }

    /// Both gates a candidate must clear: absolute similarity and margin
    /// over the runner-up, so ambiguous ties are rejected.
    pub fn accept_candidate(best: f32, runner_up: f32, config: &WaveformConfig) -> bool {
        best >= config.similarity_threshold && best - runner_up >= config.margin_threshold
    }

    /// Feed one frame of mono pipeline-rate samples.
    pub fn process_frame(&mut self, samples: &[AudioSample]) -> Option<WaveformMatch> {
        if samples.is_empty() || self.templates.is_empty() {
            return None;
        }

        self.ring.write(samples);

        let (rms, _) = amplitude_stats(samples);
        self.update_noise_floor(rms);

        let threshold = self
            .config
            .min_signal_level
            .max(self.noise_floor * self.config.noise_floor_boost);

        if rms < threshold {
            trace!("Frame RMS {:.4} below threshold {:.4}", rms, threshold);
            return None;
        }

        let buffer = self.ring.snapshot();
        let (best, runner_up) = self.scan(&buffer);

        let best = best?;
        if !Self::accept_candidate(best.similarity, runner_up, &self.config) {
            trace!(
                "Candidate {} rejected: score {:.3}, runner-up {:.3}",
                best.keyword_id,
                best.similarity,
                runner_up
            );
            return None;
        }

        debug!(
            "Waveform match {}: score {:.3}, margin {:.3}",
            best.keyword_id,
            best.similarity,
            best.similarity - runner_up
        );

        // Treat the current level as partially noise and forget the
        // utterance so it cannot re-trigger.
        self.noise_floor = (self.noise_floor.max(rms * self.config.accept_depress_factor))
            .clamp(self.config.noise_floor_min, self.config.noise_floor_max);
        self.ring.clear();

        Some(best)
    }

    /// Best-scoring keyword candidate and the best score among all other
    /// keywords.
    fn scan(&self, buffer: &[AudioSample]) -> (Option<WaveformMatch>, f32) {
        let mut best: Option<WaveformMatch> = None;
        let mut keyword_scores: Vec<(KeywordId, f32)> = Vec::new();

        for template in &self.templates {
            let len = template.len();
            if buffer.len() < len {
                continue;
            }

            let stride = (len / self.config.stride_divisor).max(1);
            let region = (len as f32 * self.config.retention_multiplier) as usize;
            let scan_start = buffer.len().saturating_sub(region.max(len));

            let mut template_best = f32::MIN;
            let mut start = scan_start;
            while start + len <= buffer.len() {
                let window = &buffer[start..start + len];
                start += stride;

                let (window_rms, _) = amplitude_stats(window);
                if window_rms < template.min_rms {
                    continue;
                }

                let Some(normalized) = z_normalize(window) else {
                    continue;
                };

                let similarity = dot_similarity(&normalized, &template.samples);
                template_best = template_best.max(similarity);
            }

            if template_best == f32::MIN {
                continue;
            }

            match keyword_scores
                .iter_mut()
                .find(|(id, _)| id == &template.keyword_id)
            {
                Some((_, score)) => *score = score.max(template_best),
                None => keyword_scores.push((template.keyword_id.clone(), template_best)),
            }

            let better = best
                .as_ref()
                .map(|b| template_best > b.similarity)
                .unwrap_or(true);
            if better {
                best = Some(WaveformMatch {
                    keyword_id: template.keyword_id.clone(),
                    variation_id: template.variation_id.clone(),
                    similarity: template_best,
                });
            }
        }

        let runner_up = match &best {
            Some(b) => keyword_scores
                .iter()
                .filter(|(id, _)| id != &b.keyword_id)
                .map(|(_, score)| *score)
                .fold(0.0f32, f32::max),
            None => 0.0,
        };

        (best, runner_up)
    }

    /// Asymmetric EMA: slower to rise than to fall, clamped.
    fn update_noise_floor(&mut self, rms: f32) {
        let coeff = if rms > self.noise_floor {
            self.config.noise_floor_rise
        } else {
            self.config.noise_floor_fall
        };
        self.noise_floor = (self.noise_floor + (rms - self.noise_floor) * coeff)
            .clamp(self.config.noise_floor_min, self.config.noise_floor_max);
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Clear the sample buffer and noise-floor state (stream restart).
    pub fn reset(&mut self) {
        self.ring.clear();
        self.noise_floor = self.config.noise_floor_min;
        debug!("Waveform matcher reset");
    }
}

/// Normalized dot-product similarity of two z-normalized buffers.
fn dot_similarity(a: &[AudioSample], b: &[AudioSample]) -> f32 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let dot: f64 = a[..n]
        .iter()
        .zip(&b[..n])
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum();
    (dot / n as f64) as f32
}
