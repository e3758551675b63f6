/// Keyword-spotter library
///
/// Real-time detection of configured spoken phrases in a live audio
/// stream, with a transcription-based text backend and a correlation-based
/// waveform backend behind a shared pipeline.

pub mod arbiter;
pub mod clock;
pub mod engine;
pub mod keywords;
pub mod normalizer;
pub mod pipeline;
pub mod resampler;
pub mod scheduler;
pub mod text_match;
pub mod waveform_match;
pub mod windower;

#[cfg(feature = "capture")]
pub mod capture;

// Re-export main types
pub use arbiter::{ArbiterConfig, DetectionArbiter};
pub use clock::TimestampReconstructor;
pub use engine::{EngineError, NullEngine, RecognitionEngine, Transcription};
pub use keywords::{
    DetectionBackend, FileKeywordStore, Keyword, KeywordCache, KeywordId, KeywordStore,
    StoreError, Variation, VariationId, VariationPayload,
};
pub use normalizer::{EnergyNormalizer, NormalizeOutcome, NormalizerConfig};
pub use pipeline::{
    CaptureFrame, DetectionMatch, MatchConfidence, PipelineConfig, PipelineError, PipelineStats,
    SpotterPipeline,
};
pub use resampler::{AudioSample, ResampleQuality, Resampler, ResamplerConfig, TARGET_SAMPLE_RATE};
pub use scheduler::{InferenceScheduler, PendingWindow, SchedulerConfig, TranscriptionResult};
pub use waveform_match::{Template, TemplateConfig, WaveformConfig, WaveformMatcher};
pub use windower::{AudioWindowSegment, Windower, WindowerConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
