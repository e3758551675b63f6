/// Recognition engine boundary
///
/// The acoustic-to-text model is an external collaborator; this module
/// defines the seam the scheduler drives, plus a null engine used by tests
/// and by the default binary when no real engine is linked.

use crate::resampler::AudioSample;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine not ready")]
    NotReady,

    #[error("Decode failed: {0}")]
    DecodeError(String),
}

/// Recognized speech within one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    /// Raw recognized text
    pub text: String,

    /// Start of recognized speech within the window, seconds
    pub speech_start_secs: f64,

    /// End of recognized speech within the window, seconds
    pub speech_end_secs: f64,
}

/// External recognition engine.
///
/// `Ok(None)` means no speech in the window. Callers treat `Err` the same
/// as no speech: log and continue, engine failures are never fatal to the
/// pipeline.
#[async_trait]
pub trait RecognitionEngine: Send + Sync {
    async fn transcribe(
        &self,
        samples: &[AudioSample],
        sample_rate: u32,
        window_duration_hint: Duration,
        vad_enabled: bool,
    ) -> Result<Option<Transcription>, EngineError>;
}

/// Engine that recognizes nothing. Stands in when no real model is linked,
/// the way a mock SDK stands in for the real binding.
pub struct NullEngine;

#[async_trait]
impl RecognitionEngine for NullEngine {
    async fn transcribe(
        &self,
        _samples: &[AudioSample],
        _sample_rate: u32,
        _window_duration_hint: Duration,
        _vad_enabled: bool,
    ) -> Result<Option<Transcription>, EngineError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_engine_recognizes_nothing() {
        let engine = NullEngine;
        let result = engine
            .transcribe(&[0.1; 160], 16000, Duration::from_secs(2), true)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
