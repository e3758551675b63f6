/// Keyword-spotting service binary
///
/// Loads keywords from a JSON store and runs the detection pipeline over
/// either a WAV file (default, simulating irregular capture cadence) or
/// the live microphone when built with the `capture` feature.

use anyhow::{Context, Result};
use keyword_spotter::{
    ArbiterConfig, CaptureFrame, DetectionBackend, FileKeywordStore, NullEngine, PipelineConfig,
    RecognitionEngine, SpotterPipeline,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("keyword_spotter=debug".parse().unwrap()),
        )
        .init();

    info!("Starting keyword-spotting service v{}", keyword_spotter::VERSION);

    if let Err(e) = run().await {
        error!("Service failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let settings = Settings::from_env()?;

    let store = Arc::new(FileKeywordStore::new(&settings.keywords_path));

    // A real acoustic model plugs in through the RecognitionEngine trait;
    // the stock binary ships the null engine, so the text backend only
    // exercises the pipeline plumbing.
    let engine: Option<Arc<dyn RecognitionEngine>> = match settings.backend {
        DetectionBackend::Text => {
            warn!("Text backend running with the null engine (no model linked)");
            Some(Arc::new(NullEngine))
        }
        DetectionBackend::Waveform => None,
    };

    let config = PipelineConfig {
        backend: settings.backend,
        arbiter: ArbiterConfig {
            keyword_cooldown: settings.keyword_cooldown,
            global_cooldown: None,
        },
        ..Default::default()
    };

    let pipeline = Arc::new(
        SpotterPipeline::new(config, store, engine).context("failed to create pipeline")?,
    );

    let mut events = pipeline.start().await.context("failed to start pipeline")?;

    #[cfg(feature = "capture")]
    let _capture = if settings.audio_file.is_none() {
        info!("Capturing from default input device");
        Some(keyword_spotter::capture::CaptureSource::start(Arc::clone(
            &pipeline,
        ))?)
    } else {
        None
    };

    if let Some(path) = &settings.audio_file {
        let feeder = Arc::clone(&pipeline);
        let path = path.clone();
        tokio::spawn(async move {
            if let Err(e) = feed_wav_file(&feeder, &path).await {
                error!("Playback failed: {:#}", e);
            }
        });
    } else if cfg!(not(feature = "capture")) {
        anyhow::bail!("AUDIO_FILE not set and binary built without the `capture` feature");
    }

    info!("Listening for configured keywords...");

    // Event loop: forward each accepted detection to the log (a real
    // deployment sends these to the actuator/notifier)
    loop {
        match events.recv().await {
            Some(detection) => {
                info!(
                    "DETECTED '{}' variation={} confidence={:?} at {:?}",
                    detection.keyword_name,
                    detection.variation_id,
                    detection.confidence,
                    detection.timestamp
                );
            }
            None => {
                info!("Event channel closed, shutting down");
                break;
            }
        }
    }

    pipeline.stop().await.ok();
    Ok(())
}

struct Settings {
    keywords_path: String,
    backend: DetectionBackend,
    keyword_cooldown: Duration,
    audio_file: Option<String>,
}

impl Settings {
    fn from_env() -> Result<Self> {
        let keywords_path =
            std::env::var("KEYWORDS_PATH").context("KEYWORDS_PATH must point to a keyword JSON file")?;

        let backend = match std::env::var("BACKEND").as_deref() {
            Ok("waveform") => DetectionBackend::Waveform,
            Ok("text") | Err(_) => DetectionBackend::Text,
            Ok(other) => anyhow::bail!("unknown BACKEND '{}' (expected text|waveform)", other),
        };

        let keyword_cooldown = std::env::var("KEYWORD_COOLDOWN_SECS")
            .ok()
            .map(|v| v.parse::<f64>())
            .transpose()
            .context("KEYWORD_COOLDOWN_SECS must be a number")?
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(6));

        Ok(Self {
            keywords_path,
            backend,
            keyword_cooldown,
            audio_file: std::env::var("AUDIO_FILE").ok(),
        })
    }
}

/// Stream a WAV file through the pipeline in irregular chunks, pacing
/// roughly at real time the way a capture device would.
async fn feed_wav_file(pipeline: &SpotterPipeline, path: &str) -> Result<()> {
    let mut reader = hound::WavReader::open(path).with_context(|| format!("open {}", path))?;
    let spec = reader.spec();

    info!(
        "Playing {} ({} Hz, {} channels)",
        path, spec.sample_rate, spec.channels
    );

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    // Uneven chunk sizes exercise the windower's chunking invariance
    let chunk_sizes = [512usize, 1024, 384, 2048, 768];
    let mut offset = 0;
    let mut i = 0;

    while offset < samples.len() {
        let chunk = chunk_sizes[i % chunk_sizes.len()] * spec.channels as usize;
        let end = (offset + chunk).min(samples.len());

        pipeline.push_frame(CaptureFrame {
            samples: samples[offset..end].to_vec(),
            source_rate: spec.sample_rate,
            channels: spec.channels,
            hardware_timestamp: None,
        });

        let frames = (end - offset) / spec.channels as usize;
        tokio::time::sleep(Duration::from_secs_f64(
            frames as f64 / spec.sample_rate as f64,
        ))
        .await;

        offset = end;
        i += 1;
    }

    info!("Playback complete");
    Ok(())
}
