/// Inference scheduler module
///
/// Serializes window submission to the recognition engine. Recognition
/// latency usually exceeds the hop interval, so excess windows queue in a
/// bounded FIFO that sheds the oldest entry on overflow: memory and
/// staleness stay bounded, and the most recent speech stays responsive at
/// the cost of occasionally missing a stale window.

use crate::engine::RecognitionEngine;
use crate::windower::AudioWindowSegment;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A window awaiting a free inference slot, with its wall-clock anchor.
#[derive(Debug, Clone)]
pub struct PendingWindow {
    pub window: AudioWindowSegment,
    pub wall_start: SystemTime,
}

/// Recognition output re-attached to its window timing.
#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub text: String,

    /// Wall-clock time of the window's first sample
    pub wall_start: SystemTime,

    /// Recognized speech start within the window, seconds
    pub speech_start_secs: f64,

    /// Recognized speech end within the window, seconds
    pub speech_end_secs: f64,

    /// Total window duration, seconds
    pub window_duration_secs: f64,

    pub sample_count: usize,
}

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Pending FIFO capacity; insertion past this drops the oldest entry
    pub max_pending: usize,

    /// Ask the engine to gate on voice activity
    pub vad_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pending: 6,
            vad_enabled: true,
        }
    }
}

struct SchedulerState {
    busy: bool,
    pending: VecDeque<PendingWindow>,
    dropped_windows: u64,
}

/// At-most-one-in-flight dispatcher in front of the recognition engine.
pub struct InferenceScheduler {
    engine: Arc<dyn RecognitionEngine>,
    sample_rate: u32,
    config: SchedulerConfig,
    state: Arc<Mutex<SchedulerState>>,
    result_tx: mpsc::UnboundedSender<TranscriptionResult>,
    operational: Arc<AtomicBool>,
}

impl InferenceScheduler {
    /// Returns the scheduler and the channel its results arrive on.
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        sample_rate: u32,
        config: SchedulerConfig,
        operational: Arc<AtomicBool>,
    ) -> (Self, mpsc::UnboundedReceiver<TranscriptionResult>) {
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            engine,
            sample_rate,
            config,
            state: Arc::new(Mutex::new(SchedulerState {
                busy: false,
                pending: VecDeque::new(),
                dropped_windows: 0,
            })),
            result_tx,
            operational,
        };

        (scheduler, result_rx)
    }

    /// Submit a window for recognition.
    ///
    /// Dispatches immediately when idle; otherwise enqueues, evicting the
    /// oldest pending window if the FIFO is at capacity.
    pub fn submit(&self, pending: PendingWindow) {
        {
            let mut state = self.state.lock();

            if state.busy {
                if state.pending.len() >= self.config.max_pending {
                    state.pending.pop_front();
                    state.dropped_windows += 1;
                    warn!(
                        "Pending FIFO full, dropped oldest window ({} total drops)",
                        state.dropped_windows
                    );
                }
                state.pending.push_back(pending);
                trace!("Queued window, {} pending", state.pending.len());
                return;
            }

            state.busy = true;
        }

        self.spawn_worker(pending);
    }

    /// Run the engine on `first`, then drain the FIFO one window at a
    /// time. The busy flag only clears once the queue is empty, so at most
    /// one inference is ever in flight.
    fn spawn_worker(&self, first: PendingWindow) {
        let engine = Arc::clone(&self.engine);
        let state = Arc::clone(&self.state);
        let operational = Arc::clone(&self.operational);
        let result_tx = self.result_tx.clone();
        let sample_rate = self.sample_rate;
        let vad_enabled = self.config.vad_enabled;

        tokio::spawn(async move {
            let mut current = first;

            loop {
                let sample_count = current.window.samples.len();
                let window_duration_secs = sample_count as f64 / sample_rate as f64;
                let hint = Duration::from_secs_f64(window_duration_secs);

                let outcome = engine
                    .transcribe(&current.window.samples, sample_rate, hint, vad_enabled)
                    .await;

                match outcome {
                    Ok(Some(t)) => {
                        if operational.load(Ordering::Acquire) {
                            let result = TranscriptionResult {
                                text: t.text,
                                wall_start: current.wall_start,
                                speech_start_secs: t.speech_start_secs,
                                speech_end_secs: t.speech_end_secs,
                                window_duration_secs,
                                sample_count,
                            };
                            if result_tx.send(result).is_err() {
                                debug!("Result receiver dropped");
                            }
                        } else {
                            debug!("Discarding late result from stopped session");
                        }
                    }
                    Ok(None) => trace!("No speech in window"),
                    // Engine failure is "empty result, continue"
                    Err(e) => debug!("Engine failure treated as empty window: {}", e),
                }

                let next = {
                    let mut state = state.lock();
                    match state.pending.pop_front() {
                        Some(next) => next,
                        None => {
                            state.busy = false;
                            break;
                        }
                    }
                };
                current = next;
            }
        });
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Windows shed on FIFO overflow so far.
    pub fn dropped_windows(&self) -> u64 {
        self.state.lock().dropped_windows
    }

    /// Clear queued windows (stream restart). An inference already in
    /// flight finishes on its own; the operational flag gates its result.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.dropped_windows = 0;
        debug!("Scheduler reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, Transcription};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    /// Engine that blocks until the test releases a permit, then echoes
    /// the window's first sample in its text.
    struct GatedEngine {
        gate: Semaphore,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl GatedEngine {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait]
    impl RecognitionEngine for GatedEngine {
        async fn transcribe(
            &self,
            samples: &[f32],
            _sample_rate: u32,
            _hint: Duration,
            _vad: bool,
        ) -> Result<Option<Transcription>, EngineError> {
            let count = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(count, Ordering::SeqCst);

            let permit = self.gate.acquire().await.map_err(|_| EngineError::NotReady)?;
            permit.forget();

            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            Ok(Some(Transcription {
                text: format!("window {}", samples[0] as i64),
                speech_start_secs: 0.1,
                speech_end_secs: 0.9,
            }))
        }
    }

    fn window(tag: i64) -> PendingWindow {
        PendingWindow {
            window: AudioWindowSegment {
                samples: vec![tag as f32; 16],
                start_offset: tag as u64 * 100,
            },
            wall_start: SystemTime::now(),
        }
    }

    fn scheduler(
        engine: Arc<GatedEngine>,
        max_pending: usize,
    ) -> (InferenceScheduler, mpsc::UnboundedReceiver<TranscriptionResult>) {
        InferenceScheduler::new(
            engine,
            16000,
            SchedulerConfig {
                max_pending,
                vad_enabled: true,
            },
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[tokio::test]
    async fn test_fifo_cap_evicts_oldest() {
        let engine = Arc::new(GatedEngine::new());
        let (sched, mut rx) = scheduler(Arc::clone(&engine), 6);

        // Window 1 occupies the inference slot
        sched.submit(window(1));
        tokio::task::yield_now().await;
        assert!(sched.is_busy());

        // Windows 2..=8: seven submissions against a cap of 6
        for tag in 2..=8 {
            sched.submit(window(tag));
        }

        assert_eq!(sched.pending_len(), 6);
        assert_eq!(sched.dropped_windows(), 1);

        // Drain everything: in-flight window 1 plus pending 3..=8
        engine.release(7);

        let mut texts = Vec::new();
        for _ in 0..7 {
            texts.push(rx.recv().await.unwrap().text);
        }

        // Window 2 (the oldest queued) was evicted, never a newer one
        assert_eq!(
            texts,
            vec![
                "window 1", "window 3", "window 4", "window 5", "window 6", "window 7",
                "window 8"
            ]
        );

        // The busy flag clears after the last result is sent
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sched.is_busy());
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight() {
        let engine = Arc::new(GatedEngine::new());
        let (sched, mut rx) = scheduler(Arc::clone(&engine), 16);

        for tag in 1..=10 {
            sched.submit(window(tag));
        }

        engine.release(10);
        for _ in 0..10 {
            rx.recv().await.unwrap();
        }

        assert_eq!(engine.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_results_preserve_submission_order() {
        let engine = Arc::new(GatedEngine::new());
        let (sched, mut rx) = scheduler(Arc::clone(&engine), 16);

        for tag in 1..=5 {
            sched.submit(window(tag));
        }
        engine.release(5);

        for tag in 1..=5 {
            let result = rx.recv().await.unwrap();
            assert_eq!(result.text, format!("window {}", tag));
        }
    }

    #[tokio::test]
    async fn test_late_results_discarded_after_stop() {
        let engine = Arc::new(GatedEngine::new());
        let operational = Arc::new(AtomicBool::new(true));
        let (sched, mut rx) = InferenceScheduler::new(
            Arc::clone(&engine) as Arc<dyn RecognitionEngine>,
            16000,
            SchedulerConfig::default(),
            Arc::clone(&operational),
        );

        sched.submit(window(1));
        tokio::task::yield_now().await;

        // Session stops while inference is in flight
        operational.store(false, Ordering::Release);
        engine.release(1);

        // The in-flight result must be silently dropped
        let res = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(res.is_err(), "late result should have been discarded");
    }

    #[tokio::test]
    async fn test_engine_failure_is_not_fatal() {
        struct FailingEngine;

        #[async_trait]
        impl RecognitionEngine for FailingEngine {
            async fn transcribe(
                &self,
                _samples: &[f32],
                _sample_rate: u32,
                _hint: Duration,
                _vad: bool,
            ) -> Result<Option<Transcription>, EngineError> {
                Err(EngineError::DecodeError("bad window".to_string()))
            }
        }

        let (sched, _rx) = InferenceScheduler::new(
            Arc::new(FailingEngine),
            16000,
            SchedulerConfig::default(),
            Arc::new(AtomicBool::new(true)),
        );

        sched.submit(window(1));
        sched.submit(window(2));

        // Allow the worker to drain
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sched.is_busy());
        assert_eq!(sched.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_reset_clears_pending() {
        let engine = Arc::new(GatedEngine::new());
        let (sched, _rx) = scheduler(Arc::clone(&engine), 6);

        sched.submit(window(1));
        tokio::task::yield_now().await;
        for tag in 2..=5 {
            sched.submit(window(tag));
        }
        assert_eq!(sched.pending_len(), 4);

        sched.reset();
        assert_eq!(sched.pending_len(), 0);
        assert_eq!(sched.dropped_windows(), 0);

        engine.release(1);
    }
}
