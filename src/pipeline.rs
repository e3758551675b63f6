/// Pipeline orchestration module
///
/// Owns all detection state explicitly (no globals) and confines every
/// mutable structure (buffers, cooldown map, keyword cache) to a single
/// serial processing worker. Capture callbacks only enqueue; the
/// recognition engine runs behind the inference scheduler with at most one
/// call in flight.

use crate::arbiter::{ArbiterConfig, DetectionArbiter};
use crate::clock::TimestampReconstructor;
use crate::engine::RecognitionEngine;
use crate::keywords::{
    DetectionBackend, KeywordCache, KeywordId, KeywordStore, StoreError, VariationId,
};
use crate::normalizer::{EnergyNormalizer, NormalizerConfig};
use crate::resampler::{AudioSample, ResampleError, Resampler, ResamplerConfig};
use crate::scheduler::{InferenceScheduler, PendingWindow, SchedulerConfig, TranscriptionResult};
use crate::text_match::{self, NormalizedPhrase};
use crate::waveform_match::{TemplateConfig, WaveformConfig, WaveformMatcher};
use crate::windower::{Windower, WindowerConfig, WindowerError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No enabled keywords with usable variations")]
    NoKeywords,

    #[error("Text backend configured but no recognition engine provided")]
    EngineMissing,

    #[error("Keyword store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Windower(#[from] WindowerError),

    #[error(transparent)]
    Resampler(#[from] ResampleError),

    #[error("Pipeline already running")]
    AlreadyRunning,

    #[error("Pipeline not running")]
    NotRunning,

    #[error("Audio device error: {0}")]
    Device(String),
}

/// One raw buffer from the capture source.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    /// Interleaved samples as delivered by the hardware
    pub samples: Vec<AudioSample>,

    pub source_rate: u32,
    pub channels: u16,

    /// Driver-provided capture timestamp, when available
    pub hardware_timestamp: Option<Instant>,
}

/// How confident the matcher was, per backend.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchConfidence {
    /// Text backend: matched token span inside the transcript
    TokenSpan {
        token_index: usize,
        token_count: usize,
    },

    /// Waveform backend: normalized correlation score
    Similarity(f32),
}

/// An accepted detection, forwarded once to the actuator/notifier boundary.
#[derive(Debug, Clone)]
pub struct DetectionMatch {
    pub keyword_id: KeywordId,
    pub keyword_name: String,
    pub variation_id: VariationId,

    /// Reconstructed wall-clock time the phrase was spoken
    pub timestamp: SystemTime,

    pub confidence: MatchConfidence,
}

/// Pipeline configuration aggregating all component configs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Exactly one matcher backend is active per session
    pub backend: DetectionBackend,

    pub resampler: ResamplerConfig,
    pub windower: WindowerConfig,
    pub normalizer: NormalizerConfig,
    pub scheduler: SchedulerConfig,
    pub waveform: WaveformConfig,
    pub template: TemplateConfig,
    pub arbiter: ArbiterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend: DetectionBackend::Text,
            resampler: ResamplerConfig::default(),
            windower: WindowerConfig::default(),
            normalizer: NormalizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            waveform: WaveformConfig::default(),
            template: TemplateConfig::default(),
            arbiter: ArbiterConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.resampler.validate()?;
        self.windower.validate()?;
        Ok(())
    }
}

/// Pipeline statistics snapshot.
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub windows_emitted: u64,
    pub silence_windows: u64,
    pub dropped_windows: u64,
    pub detections: u64,
    pub is_running: bool,
}

#[derive(Default)]
struct StatsInner {
    frames_received: AtomicU64,
    windows_emitted: AtomicU64,
    silence_windows: AtomicU64,
    dropped_windows: AtomicU64,
    detections: AtomicU64,
}

enum WorkerMessage {
    Frame(CaptureFrame),
    ReloadKeywords,
    Stop,
}

/// The keyword-spotting pipeline.
pub struct SpotterPipeline {
    config: PipelineConfig,
    store: Arc<dyn KeywordStore>,
    engine: Option<Arc<dyn RecognitionEngine>>,
    operational: Arc<AtomicBool>,
    stats: Arc<StatsInner>,
    msg_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<WorkerMessage>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SpotterPipeline {
    /// `engine` may be `None` for waveform-only sessions; starting the
    /// text backend without one fails.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn KeywordStore>,
        engine: Option<Arc<dyn RecognitionEngine>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        info!("Creating pipeline: {:?} backend", config.backend);

        Ok(Self {
            config,
            store,
            engine,
            operational: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(StatsInner::default()),
            msg_tx: parking_lot::Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
        })
    }

    /// Start the session. Fails when the store yields no matchable
    /// keywords or the text backend has no engine; these are the only
    /// caller-visible failures besides device errors at capture start.
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<DetectionMatch>, PipelineError> {
        if self.operational.load(Ordering::Acquire) {
            return Err(PipelineError::AlreadyRunning);
        }

        let engine = match (self.config.backend, &self.engine) {
            (DetectionBackend::Text, None) => return Err(PipelineError::EngineMissing),
            (DetectionBackend::Text, Some(engine)) => Some(Arc::clone(engine)),
            (DetectionBackend::Waveform, _) => None,
        };

        let keywords = self.store.load().await?;
        let cache = KeywordCache::build(&keywords, self.config.backend, &self.config.template);
        if cache.is_empty() {
            return Err(PipelineError::NoKeywords);
        }

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Store-change notifications become reload commands; all cache
        // mutation happens on the worker.
        let mut change_rx = self.store.subscribe();
        let reload_tx = msg_tx.clone();
        let reload_operational = Arc::clone(&self.operational);
        tokio::spawn(async move {
            while change_rx.changed().await.is_ok() {
                if !reload_operational.load(Ordering::Acquire) {
                    break;
                }
                if reload_tx.send(WorkerMessage::ReloadKeywords).is_err() {
                    break;
                }
            }
        });

        let worker = Worker::build(
            &self.config,
            cache,
            engine,
            Arc::clone(&self.store),
            Arc::clone(&self.operational),
            Arc::clone(&self.stats),
            event_tx,
        )?;

        self.operational.store(true, Ordering::Release);
        let handle = tokio::spawn(worker.run(msg_rx));

        *self.msg_tx.lock() = Some(msg_tx);
        *self.worker.lock().await = Some(handle);

        info!("Pipeline started");
        Ok(event_rx)
    }

    /// Hand a capture buffer to the processing worker. Never blocks;
    /// called from the capture callback context.
    pub fn push_frame(&self, frame: CaptureFrame) {
        if !self.operational.load(Ordering::Acquire) {
            return;
        }
        if let Some(tx) = self.msg_tx.lock().as_ref() {
            let _ = tx.send(WorkerMessage::Frame(frame));
        }
    }

    /// Ask the worker to rebuild the keyword cache from the store.
    pub fn reload_keywords(&self) {
        if let Some(tx) = self.msg_tx.lock().as_ref() {
            let _ = tx.send(WorkerMessage::ReloadKeywords);
        }
    }

    /// Stop the session. An inference already in flight finishes, but the
    /// operational flag discards its result.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        if !self.operational.load(Ordering::Acquire) {
            return Err(PipelineError::NotRunning);
        }

        self.operational.store(false, Ordering::Release);

        let tx = self.msg_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(WorkerMessage::Stop);
        }

        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }

        info!("Pipeline stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.operational.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            windows_emitted: self.stats.windows_emitted.load(Ordering::Relaxed),
            silence_windows: self.stats.silence_windows.load(Ordering::Relaxed),
            dropped_windows: self.stats.dropped_windows.load(Ordering::Relaxed),
            detections: self.stats.detections.load(Ordering::Relaxed),
            is_running: self.is_running(),
        }
    }
}

/// All mutable pipeline state, owned by the single processing worker.
struct Worker {
    backend: DetectionBackend,
    resampler: Resampler,
    windower: Windower,
    normalizer: EnergyNormalizer,
    clock: TimestampReconstructor,
    arbiter: DetectionArbiter,
    scheduler: Option<InferenceScheduler>,
    result_rx: Option<mpsc::UnboundedReceiver<TranscriptionResult>>,
    matcher: Option<WaveformMatcher>,
    cache: KeywordCache,
    phrase_sets: Vec<(KeywordId, Vec<NormalizedPhrase>)>,
    store: Arc<dyn KeywordStore>,
    backend_template_config: TemplateConfig,
    waveform_config: WaveformConfig,
    operational: Arc<AtomicBool>,
    stats: Arc<StatsInner>,
    event_tx: mpsc::UnboundedSender<DetectionMatch>,
    sample_cursor: u64,
}

impl Worker {
    fn build(
        config: &PipelineConfig,
        cache: KeywordCache,
        engine: Option<Arc<dyn RecognitionEngine>>,
        store: Arc<dyn KeywordStore>,
        operational: Arc<AtomicBool>,
        stats: Arc<StatsInner>,
        event_tx: mpsc::UnboundedSender<DetectionMatch>,
    ) -> Result<Self, PipelineError> {
        let sample_rate = config.resampler.target_rate;

        let (scheduler, result_rx, matcher) = match config.backend {
            DetectionBackend::Text => {
                let engine = engine.ok_or(PipelineError::EngineMissing)?;
                let (scheduler, result_rx) = InferenceScheduler::new(
                    engine,
                    sample_rate,
                    config.scheduler.clone(),
                    Arc::clone(&operational),
                );
                (Some(scheduler), Some(result_rx), None)
            }
            DetectionBackend::Waveform => {
                let templates = cache.templates().into_iter().cloned().collect();
                let matcher = WaveformMatcher::new(templates, config.waveform.clone());
                (None, None, Some(matcher))
            }
        };

        // The waveform backend shares one utterance across keywords, so it
        // also gets a global cooldown.
        let mut arbiter_config = config.arbiter.clone();
        if config.backend == DetectionBackend::Waveform {
            arbiter_config = arbiter_config.with_waveform_defaults();
        }

        let phrase_sets = cache.phrase_sets();

        Ok(Self {
            backend: config.backend,
            resampler: Resampler::new(config.resampler.clone())?,
            windower: Windower::new(&config.windower)?,
            normalizer: EnergyNormalizer::new(config.normalizer.clone()),
            clock: TimestampReconstructor::new(sample_rate),
            arbiter: DetectionArbiter::new(arbiter_config),
            scheduler,
            result_rx,
            matcher,
            cache,
            phrase_sets,
            store,
            backend_template_config: config.template.clone(),
            waveform_config: config.waveform.clone(),
            operational,
            stats,
            event_tx,
            sample_cursor: 0,
        })
    }

    async fn run(mut self, mut msg_rx: mpsc::UnboundedReceiver<WorkerMessage>) {
        debug!("Processing worker started");

        loop {
            // Take the receiver so `self` stays borrowable in the arms
            let mut result_rx = self.result_rx.take();

            let step = if let Some(rx) = result_rx.as_mut() {
                tokio::select! {
                    msg = msg_rx.recv() => Step::Message(msg),
                    result = rx.recv() => Step::Result(result),
                }
            } else {
                Step::Message(msg_rx.recv().await)
            };

            self.result_rx = result_rx;

            match step {
                Step::Message(None) | Step::Message(Some(WorkerMessage::Stop)) => break,
                Step::Message(Some(WorkerMessage::Frame(frame))) => self.handle_frame(frame),
                Step::Message(Some(WorkerMessage::ReloadKeywords)) => self.reload().await,
                Step::Result(Some(result)) => self.handle_transcription(result),
                // Scheduler side gone; keep serving messages
                Step::Result(None) => {}
            }
        }

        self.shutdown();
        debug!("Processing worker stopped");
    }

    fn handle_frame(&mut self, frame: CaptureFrame) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let mono = self
            .resampler
            .process(&frame.samples, frame.source_rate, frame.channels);
        if mono.is_empty() {
            // "No samples produced this tick", not an error
            return;
        }

        // Refresh the clock anchor at the frame boundary while the
        // hardware timestamp is still meaningful.
        let frame_start = self.sample_cursor;
        self.clock
            .wall_clock_for(frame_start, frame.hardware_timestamp);
        self.sample_cursor += mono.len() as u64;

        match self.backend {
            DetectionBackend::Text => self.feed_text_backend(&mono),
            DetectionBackend::Waveform => self.feed_waveform_backend(&mono),
        }
    }

    fn feed_text_backend(&mut self, mono: &[AudioSample]) {
        let windows = self.windower.append(mono);

        for mut window in windows {
            self.stats.windows_emitted.fetch_add(1, Ordering::Relaxed);

            if self.normalizer.normalize(&mut window.samples).is_silence() {
                self.stats.silence_windows.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let wall_start = self.clock.wall_clock_for(window.start_offset, None);

            if let Some(scheduler) = &self.scheduler {
                scheduler.submit(PendingWindow { window, wall_start });
                self.stats
                    .dropped_windows
                    .store(scheduler.dropped_windows(), Ordering::Relaxed);
            }
        }
    }

    fn feed_waveform_backend(&mut self, mono: &[AudioSample]) {
        let Some(matcher) = self.matcher.as_mut() else {
            return;
        };

        let Some(hit) = matcher.process_frame(mono) else {
            return;
        };

        if !self.arbiter.accept(&hit.keyword_id, Instant::now()) {
            return;
        }

        let timestamp = self.clock.wall_clock_for(self.sample_cursor, None);
        self.emit(DetectionMatch {
            keyword_name: self
                .cache
                .name_of(&hit.keyword_id)
                .unwrap_or_default()
                .to_string(),
            keyword_id: hit.keyword_id,
            variation_id: hit.variation_id,
            timestamp,
            confidence: MatchConfidence::Similarity(hit.similarity),
        });
    }

    fn handle_transcription(&mut self, result: TranscriptionResult) {
        if self.cache.is_empty() {
            return;
        }

        let matches = text_match::match_transcript(&self.phrase_sets, &result.text);
        if matches.is_empty() {
            return;
        }

        // Keyword order is evaluation order: the first match that clears
        // the cooldown wins this transcript.
        for m in matches {
            if !self.arbiter.accept(&m.keyword_id, Instant::now()) {
                continue;
            }

            let speech_start = result.speech_start_secs.clamp(0.0, result.window_duration_secs);
            let speech_end = result
                .speech_end_secs
                .clamp(speech_start, result.window_duration_secs);
            let offset = speech_start + m.position_fraction() * (speech_end - speech_start);
            let timestamp = result.wall_start + Duration::from_secs_f64(offset);

            self.emit(DetectionMatch {
                keyword_name: self
                    .cache
                    .name_of(&m.keyword_id)
                    .unwrap_or_default()
                    .to_string(),
                keyword_id: m.keyword_id,
                variation_id: m.variation_id,
                timestamp,
                confidence: MatchConfidence::TokenSpan {
                    token_index: m.token_index,
                    token_count: m.token_count,
                },
            });
            break;
        }
    }

    fn emit(&self, detection: DetectionMatch) {
        info!(
            "Detected keyword '{}' (variation {})",
            detection.keyword_name, detection.variation_id
        );
        self.stats.detections.fetch_add(1, Ordering::Relaxed);
        if self.event_tx.send(detection).is_err() {
            debug!("Detection receiver dropped");
        }
    }

    async fn reload(&mut self) {
        match self.store.load().await {
            Ok(keywords) => {
                let cache =
                    KeywordCache::build(&keywords, self.backend, &self.backend_template_config);
                if cache.is_empty() {
                    warn!("Keyword reload produced no matchable keywords");
                }
                self.phrase_sets = cache.phrase_sets();
                if self.matcher.is_some() {
                    let templates = cache.templates().into_iter().cloned().collect();
                    self.matcher = Some(WaveformMatcher::new(
                        templates,
                        self.waveform_config.clone(),
                    ));
                }
                self.cache = cache;
                info!("Keyword cache reloaded: {} keywords", self.cache.len());
            }
            Err(e) => warn!("Keyword reload failed, keeping previous cache: {}", e),
        }
    }

    fn shutdown(&mut self) {
        self.windower.reset();
        self.clock.reset();
        self.arbiter.reset();
        if let Some(scheduler) = &self.scheduler {
            scheduler.reset();
        }
        if let Some(matcher) = self.matcher.as_mut() {
            matcher.reset();
        }
        self.sample_cursor = 0;
    }
}

enum Step {
    Message(Option<WorkerMessage>),
    Result(Option<TranscriptionResult>),
}
