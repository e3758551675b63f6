/// Keyword configuration module
///
/// Data model for configured keywords and their variations, the external
/// store boundary, and the immutable in-memory cache the detection session
/// matches against. The cache is rebuilt wholesale on store change.

use crate::text_match::NormalizedPhrase;
use crate::waveform_match::{Template, TemplateConfig};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub type KeywordId = String;
pub type VariationId = String;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read keyword store: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Malformed keyword store: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// How a variation is recognized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariationPayload {
    /// Phrase matched against transcription output (text backend)
    Text { phrase: String },

    /// Reference recording matched by waveform correlation
    Waveform {
        /// Path to the recorded reference sample (WAV)
        sample_path: PathBuf,

        /// Expected spoken duration of the phrase in seconds
        duration_secs: f32,
    },
}

/// One way a keyword can be spoken.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variation {
    pub id: VariationId,

    #[serde(flatten)]
    pub payload: VariationPayload,
}

/// A configured keyword with its variations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Keyword {
    pub id: KeywordId,
    pub name: String,
    pub enabled: bool,
    pub variations: Vec<Variation>,
}

/// External keyword configuration store.
///
/// Created/edited/deleted elsewhere; the pipeline only loads and
/// subscribes to change notifications.
#[async_trait]
pub trait KeywordStore: Send + Sync {
    async fn load(&self) -> Result<Vec<Keyword>, StoreError>;

    /// Receiver bumped whenever the store content changes.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// JSON-file-backed keyword store.
pub struct FileKeywordStore {
    path: PathBuf,
    change_tx: watch::Sender<u64>,
}

impl FileKeywordStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let (change_tx, _) = watch::channel(0);
        Self {
            path: path.as_ref().to_path_buf(),
            change_tx,
        }
    }

    /// Signal that the backing file was rewritten.
    pub fn notify_changed(&self) {
        self.change_tx.send_modify(|gen| *gen += 1);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeywordStore for FileKeywordStore {
    async fn load(&self) -> Result<Vec<Keyword>, StoreError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let keywords: Vec<Keyword> = serde_json::from_slice(&bytes)?;
        debug!("Loaded {} keywords from {:?}", keywords.len(), self.path);
        Ok(keywords)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }
}

/// Which matcher backend a session runs. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionBackend {
    Text,
    Waveform,
}

/// One keyword prepared for the active backend.
#[derive(Debug, Clone)]
pub struct CachedKeyword {
    pub id: KeywordId,
    pub name: String,

    /// Normalized, de-duplicated phrases (text backend)
    pub phrases: Vec<NormalizedPhrase>,

    /// Precomputed acoustic templates (waveform backend)
    pub templates: Vec<Template>,
}

/// Immutable per-session cache of matchable keywords.
///
/// Only enabled keywords with at least one usable variation survive the
/// build; normalized phrase duplicates are dropped per keyword.
#[derive(Debug, Clone, Default)]
pub struct KeywordCache {
    pub keywords: Vec<CachedKeyword>,
}

impl KeywordCache {
    pub fn build(
        keywords: &[Keyword],
        backend: DetectionBackend,
        template_config: &TemplateConfig,
    ) -> Self {
        let mut cached = Vec::new();

        for keyword in keywords {
            if !keyword.enabled {
                debug!("Skipping disabled keyword '{}'", keyword.name);
                continue;
            }

            let mut phrases: Vec<NormalizedPhrase> = Vec::new();
            let mut templates: Vec<Template> = Vec::new();
            let mut seen_phrases: HashSet<String> = HashSet::new();

            for variation in &keyword.variations {
                match (&variation.payload, backend) {
                    (VariationPayload::Text { phrase }, DetectionBackend::Text) => {
                        match NormalizedPhrase::new(variation.id.clone(), phrase) {
                            Some(normalized) => {
                                if seen_phrases.insert(normalized.text.clone()) {
                                    phrases.push(normalized);
                                } else {
                                    debug!(
                                        "Dropping duplicate variation '{}' of keyword '{}'",
                                        phrase, keyword.name
                                    );
                                }
                            }
                            None => warn!(
                                "Variation {} of keyword '{}' is empty after normalization",
                                variation.id, keyword.name
                            ),
                        }
                    }
                    (
                        VariationPayload::Waveform {
                            sample_path,
                            duration_secs,
                        },
                        DetectionBackend::Waveform,
                    ) => {
                        match Template::from_wav(
                            sample_path,
                            *duration_secs,
                            keyword.id.clone(),
                            variation.id.clone(),
                            template_config,
                        ) {
                            Ok(template) => templates.push(template),
                            Err(e) => warn!(
                                "Skipping waveform variation {} of keyword '{}': {}",
                                variation.id, keyword.name, e
                            ),
                        }
                    }
                    // Variation type not handled by the active backend
                    _ => {}
                }
            }

            if phrases.is_empty() && templates.is_empty() {
                debug!(
                    "Keyword '{}' has no usable variations for {:?} backend",
                    keyword.name, backend
                );
                continue;
            }

            cached.push(CachedKeyword {
                id: keyword.id.clone(),
                name: keyword.name.clone(),
                phrases,
                templates,
            });
        }

        info!("Keyword cache built: {} matchable keywords", cached.len());
        KeywordCache { keywords: cached }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    /// Display name for a keyword id.
    pub fn name_of(&self, keyword_id: &KeywordId) -> Option<&str> {
        self.keywords
            .iter()
            .find(|k| &k.id == keyword_id)
            .map(|k| k.name.as_str())
    }

    /// Keyword-ordered phrase sets for the text matcher.
    pub fn phrase_sets(&self) -> Vec<(KeywordId, Vec<NormalizedPhrase>)> {
        self.keywords
            .iter()
            .map(|k| (k.id.clone(), k.phrases.clone()))
            .collect()
    }

    /// All templates across keywords, keyword order preserved.
    pub fn templates(&self) -> Vec<&Template> {
        self.keywords
            .iter()
            .flat_map(|k| k.templates.iter())
            .collect()
    }
}
