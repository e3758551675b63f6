/// Live audio capture glue (feature `capture`)
///
/// Opens the default cpal input device and forwards each hardware buffer
/// to the pipeline. The data callback only converts and enqueues; it
/// never blocks and never processes.

use crate::pipeline::{CaptureFrame, PipelineError, SpotterPipeline};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// A running capture stream. Dropping it stops capture.
pub struct CaptureSource {
    _stream: cpal::Stream,
    pub sample_rate: u32,
    pub channels: u16,
}

impl CaptureSource {
    /// Open the default input device and start feeding the pipeline.
    pub fn start(pipeline: Arc<SpotterPipeline>) -> Result<Self, PipelineError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| PipelineError::Device("no default input device".to_string()))?;

        let config = device
            .default_input_config()
            .map_err(|e| PipelineError::Device(e.to_string()))?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels();

        info!(
            "Capture: {} @ {} Hz, {} channels",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            sample_rate,
            channels
        );

        let stream = device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    pipeline.push_frame(CaptureFrame {
                        samples: data.to_vec(),
                        source_rate: sample_rate,
                        channels,
                        hardware_timestamp: Some(Instant::now()),
                    });
                },
                |e| error!("Capture stream error: {}", e),
                None,
            )
            .map_err(|e| PipelineError::Device(e.to_string()))?;

        stream
            .play()
            .map_err(|e| PipelineError::Device(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
            channels,
        })
    }
}
