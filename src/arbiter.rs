/// Detection arbiter module
///
/// Turns raw matcher hits into at-most-one user-visible event per cooldown
/// window: a per-keyword cooldown always applies, and the waveform backend
/// adds a global cooldown shared across all keywords.

use crate::keywords::KeywordId;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Arbiter configuration
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// Minimum time between two accepted detections of the same keyword
    pub keyword_cooldown: Duration,

    /// Minimum time between any two accepted detections (waveform backend)
    pub global_cooldown: Option<Duration>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            keyword_cooldown: Duration::from_secs(6),
            global_cooldown: None,
        }
    }
}

impl ArbiterConfig {
    /// Default global cooldown for sessions where one utterance is scored
    /// against every keyword at once.
    pub const WAVEFORM_GLOBAL_COOLDOWN: Duration = Duration::from_millis(1600);

    /// Fill in the waveform-session global cooldown unless one was
    /// configured explicitly.
    pub fn with_waveform_defaults(mut self) -> Self {
        self.global_cooldown
            .get_or_insert(Self::WAVEFORM_GLOBAL_COOLDOWN);
        self
    }
}

/// Cooldown/debounce state.
///
/// Entries older than the cooldown interval count as absent; they are
/// pruned lazily on access.
pub struct DetectionArbiter {
    config: ArbiterConfig,
    last_trigger: HashMap<KeywordId, Instant>,
    last_any_trigger: Option<Instant>,
}

impl DetectionArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        Self {
            config,
            last_trigger: HashMap::new(),
            last_any_trigger: None,
        }
    }

    /// Decide whether a raw match for `keyword_id` at `now` becomes a
    /// detection. Accepting updates the cooldown timestamps.
    pub fn accept(&mut self, keyword_id: &KeywordId, now: Instant) -> bool {
        self.prune(now);

        if let Some(global) = self.config.global_cooldown {
            if let Some(last) = self.last_any_trigger {
                if now.duration_since(last) < global {
                    trace!("Suppressed by global cooldown: {}", keyword_id);
                    return false;
                }
            }
        }

        if let Some(last) = self.last_trigger.get(keyword_id) {
            if now.duration_since(*last) < self.config.keyword_cooldown {
                trace!("Suppressed by keyword cooldown: {}", keyword_id);
                return false;
            }
        }

        debug!("Detection accepted for keyword {}", keyword_id);
        self.last_trigger.insert(keyword_id.clone(), now);
        self.last_any_trigger = Some(now);
        true
    }

    fn prune(&mut self, now: Instant) {
        let cooldown = self.config.keyword_cooldown;
        self.last_trigger
            .retain(|_, last| now.duration_since(*last) < cooldown);
    }

    /// Clear all cooldown state (stream restart).
    pub fn reset(&mut self) {
        self.last_trigger.clear();
        self.last_any_trigger = None;
        debug!("Arbiter reset");
    }

    /// Keywords currently inside their cooldown window.
    pub fn active_cooldowns(&self) -> usize {
        self.last_trigger.len()
    }
}
