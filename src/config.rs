//! Loading and handling the resolver's configuration.
//!
//! [`ResolverConfig`] holds every tunable of the pipeline, the synchronizer and
//! the shipped adapters. Every field has a serde default, so a YAML file only
//! needs the values that differ (usually the API key and sheet id).
//!
//! # Examples
//!
//! ```no_run
//! use helpdesk_resolver::config::{ResolverConfig, load_config};
//!
//! let config: ResolverConfig = load_config("/path/to/config.yaml").unwrap();
//! println!("{:?}", config.retrieval.distance_threshold);
//! ```
//!
//! A minimal file:
//!
//! ```yaml
//! api_key: "gsk_..."
//! api_base: "https://api.groq.com/openai/v1"
//! model: "llama-3.1-8b-instant"
//! source:
//!   sheet_id: "1AbC..."
//!   api_key: "AIza..."
//! admins: ["123456789"]
//! ```

use std::{error::Error, fs, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::guard::{MismatchRule, default_rules};
use crate::retry::RetryPolicy;

/// Represents the application's configuration.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct ResolverConfig {
    /// Key for the OpenAI-compatible generation endpoint.
    pub api_key: String,

    /// Base URL of the OpenAI-compatible endpoint, including `/v1`.
    pub api_base: String,

    /// Chat model used for the fallback and paraphrase stages.
    pub model: String,

    /// User ids allowed to run admin commands.
    pub admins: Vec<String>,

    /// Start with resolution paused.
    pub start_paused: bool,

    /// Question-term → forbidden-answer-term rules. Symmetry is added on load.
    pub mismatch_rules: Vec<MismatchRule>,

    pub embedding: EmbeddingConfig,
    pub source: SourceConfig,
    pub retrieval: RetrievalConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub generative: GenerativeConfig,
    pub paraphrase: ParaphraseConfig,
    pub retry: RetryConfig,
    pub sync: SyncConfig,
    pub alerting: AlertConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            admins: Vec::new(),
            start_paused: false,
            mismatch_rules: default_rules(),
            embedding: EmbeddingConfig::default(),
            source: SourceConfig::default(),
            retrieval: RetrievalConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            generative: GenerativeConfig::default(),
            paraphrase: ParaphraseConfig::default(),
            retry: RetryConfig::default(),
            sync: SyncConfig::default(),
            alerting: AlertConfig::default(),
        }
    }
}

/// Sentence embedding models. Each category may use its own model; a
/// collection is always rebuilt whole with the model it is bound to.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub general_model: String,
    pub technical_model: String,
    /// hf-hub revision used for both models.
    pub revision: String,
    /// Per-model LRU capacity.
    pub cache_capacity: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            general_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            technical_model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            revision: "main".to_string(),
            cache_capacity: 4096,
        }
    }
}

/// Google Sheets values API.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct SourceConfig {
    pub sheet_id: String,
    pub api_base: String,
    /// OAuth bearer token; takes precedence over `api_key`.
    pub bearer_token: Option<String>,
    pub api_key: Option<String>,
    pub general_range: String,
    pub technical_range: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            sheet_id: String::new(),
            api_base: "https://sheets.googleapis.com".to_string(),
            bearer_token: None,
            api_key: None,
            general_range: "Support!A:B".to_string(),
            technical_range: "Technical!A:B".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// A vector hit is accepted only strictly below this cosine distance.
    pub distance_threshold: f32,
    /// Longer messages are ignored outright.
    pub max_query_chars: usize,
    /// Character budget for the knowledge text embedded in the fallback prompt.
    pub knowledge_prompt_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            distance_threshold: 0.65,
            max_query_chars: 1000,
            knowledge_prompt_chars: 12_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 2 * 60 * 60,
            capacity: 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_secs: u64,
    /// Idle windows are pruned once this many users are tracked.
    pub max_tracked_users: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
            max_tracked_users: 10_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct GenerativeConfig {
    pub enabled: bool,
    /// Simultaneous outbound calls.
    pub max_concurrent: usize,
    /// Hard timeout per call, clamped to 15–25 s.
    pub timeout_ms: u64,
    /// Overall budget for one `resolve` call.
    pub request_deadline_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Accepted answers must be longer than this many characters.
    pub min_answer_chars: usize,
    /// A response starting with any of these is an abstention.
    pub abstention_markers: Vec<String>,
    /// Template name under `<config_dir>/templates/`.
    pub template: String,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent: 3,
            timeout_ms: 20_000,
            request_deadline_ms: 28_000,
            max_tokens: 250,
            temperature: 0.7,
            min_answer_chars: 10,
            abstention_markers: vec![
                "Не нашёл точного решения".to_string(),
                "Не нашел точного решения".to_string(),
            ],
            template: "fallback".to_string(),
        }
    }
}

impl GenerativeConfig {
    pub const MIN_TIMEOUT_MS: u64 = 15_000;
    pub const MAX_TIMEOUT_MS: u64 = 25_000;

    /// Per-call timeout within the allowed range.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(
            self.timeout_ms
                .clamp(Self::MIN_TIMEOUT_MS, Self::MAX_TIMEOUT_MS),
        )
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct ParaphraseConfig {
    pub enabled: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_ms: u64,
    pub template: String,
}

impl Default for ParaphraseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_tokens: 300,
            temperature: 0.3,
            timeout_ms: 8_000,
            template: "paraphrase".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_delay_ms))
    }
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 10,
            interval_secs: 300,
        }
    }
}

/// Error-rate alerting over the most recent outcomes.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub window: usize,
    pub min_samples: usize,
    /// Fraction of errors in the window, 0.0–1.0.
    pub threshold: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window: 100,
            min_samples: 20,
            threshold: 0.25,
        }
    }
}

/// Loads the application's configuration from a YAML file.
///
/// # Examples
///
/// ```no_run
/// use helpdesk_resolver::config::load_config;
///
/// match load_config("/path/to/config.yaml") {
///     Ok(config) => println!("{:?}", config),
///     Err(err) => eprintln!("Error loading config: {}", err),
/// }
/// ```
pub fn load_config(file: &str) -> Result<ResolverConfig, Box<dyn Error>> {
    debug!("Loading config: {}", file);
    let content = fs::read_to_string(file)?;
    let config: ResolverConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
