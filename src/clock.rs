/// Timestamp reconstruction module
///
/// Maps sample offsets back to wall-clock time. Uses the hardware capture
/// timestamp when the driver provides one; otherwise anchors on the first
/// frame and extrapolates by sample counting.

use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, trace};

/// Reconstructs wall-clock time for asynchronous recognition results.
pub struct TimestampReconstructor {
    sample_rate: u32,
    anchor: Option<Anchor>,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    reference_sample: u64,
    reference_wall: SystemTime,
}

impl TimestampReconstructor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            anchor: None,
        }
    }

    /// Wall-clock time at which `sample_index` was captured.
    ///
    /// `hardware` is the monotonic timestamp the capture driver attached to
    /// the frame containing this sample, when available.
    pub fn wall_clock_for(&mut self, sample_index: u64, hardware: Option<Instant>) -> SystemTime {
        if let Some(hw) = hardware {
            // Age of the hardware timestamp against the monotonic clock,
            // projected onto the wall clock.
            let age = Instant::now().saturating_duration_since(hw);
            let wall = SystemTime::now() - age;

            // Keep the sample anchor in sync so a later fallback stays consistent
            self.anchor = Some(Anchor {
                reference_sample: sample_index,
                reference_wall: wall,
            });

            trace!("Hardware timestamp: {} samples, age {:?}", sample_index, age);
            return wall;
        }

        let anchor = *self.anchor.get_or_insert_with(|| {
            debug!("Anchoring sample clock at sample {}", sample_index);
            Anchor {
                reference_sample: sample_index,
                reference_wall: SystemTime::now(),
            }
        });

        let elapsed_samples = sample_index.saturating_sub(anchor.reference_sample);
        let elapsed = Duration::from_secs_f64(elapsed_samples as f64 / self.sample_rate as f64);

        if sample_index >= anchor.reference_sample {
            anchor.reference_wall + elapsed
        } else {
            let behind_samples = anchor.reference_sample - sample_index;
            let behind = Duration::from_secs_f64(behind_samples as f64 / self.sample_rate as f64);
            anchor.reference_wall - behind
        }
    }

    /// Clear the anchor (stream restart) so stale anchors never leak
    /// across sessions.
    pub fn reset(&mut self) {
        self.anchor = None;
        debug!("Timestamp reconstructor reset");
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_counting_extrapolation() {
        let mut clock = TimestampReconstructor::new(16000);

        let t0 = clock.wall_clock_for(0, None);
        let t1 = clock.wall_clock_for(16000, None);

        let delta = t1.duration_since(t0).unwrap();
        assert!((delta.as_secs_f64() - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_anchor_is_stable_across_calls() {
        let mut clock = TimestampReconstructor::new(16000);

        let t0 = clock.wall_clock_for(0, None);
        std::thread::sleep(Duration::from_millis(20));
        // Anchored at first use: real elapsed time must not shift the mapping
        let t0_again = clock.wall_clock_for(0, None);

        assert_eq!(t0, t0_again);
    }

    #[test]
    fn test_hardware_timestamp_preferred() {
        let mut clock = TimestampReconstructor::new(16000);

        let hw = Instant::now() - Duration::from_millis(500);
        let wall = clock.wall_clock_for(8000, Some(hw));

        let age = SystemTime::now().duration_since(wall).unwrap();
        assert!(age >= Duration::from_millis(450));
        assert!(age < Duration::from_millis(700));
    }

    #[test]
    fn test_hardware_timestamp_reanchors_fallback() {
        let mut clock = TimestampReconstructor::new(16000);

        let hw = Instant::now();
        let t_hw = clock.wall_clock_for(16000, Some(hw));
        // One second of samples later, no hardware timestamp
        let t_fallback = clock.wall_clock_for(32000, None);

        let delta = t_fallback.duration_since(t_hw).unwrap();
        assert!((delta.as_secs_f64() - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_reset_clears_anchor() {
        let mut clock = TimestampReconstructor::new(16000);

        let _ = clock.wall_clock_for(160000, None);
        clock.reset();

        // After reset the next call re-anchors at "now", not ten seconds in
        let t = clock.wall_clock_for(160000, None);
        let skew = SystemTime::now()
            .duration_since(t)
            .unwrap_or_else(|e| e.duration());
        assert!(skew < Duration::from_millis(100));
    }
}
