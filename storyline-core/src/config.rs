//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Summarized entries left visible after the hidden range.
pub const DEFAULT_KEEP_VISIBLE_COUNT: usize = 4;

/// Summarized entries that must disappear before a rollback runs.
pub const DEFAULT_ROLLBACK_MIN_DELETED: usize = 2;

/// Attempts made by background runs.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Documents added between cooperative yields during an index build.
pub const DEFAULT_INDEX_BATCH_SIZE: usize = 500;

/// Character budget for a single chunk document.
pub const DEFAULT_CHUNK_MAX_CHARS: usize = 400;

/// Maximum hits returned by a search.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Settings passed through to the text generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Model to use; `None` lets the generator pick.
    pub model: Option<String>,

    /// Maximum tokens for a summary response.
    pub max_tokens: usize,

    /// Temperature for generation.
    pub temperature: Option<f32>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 2048,
            temperature: Some(0.3),
        }
    }
}

/// Configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Summarized entries that stay visible.
    pub keep_visible_count: usize,

    /// Whether summarized entries are hidden at all.
    pub hide_summarized: bool,

    /// Summarized entries that must be lost before a rollback runs.
    pub rollback_min_deleted: usize,

    /// Unsummarized entries that trigger a background run (0 disables).
    pub auto_summarize_after: usize,

    /// Attempts for background runs. User runs always make one attempt.
    pub retry_attempts: u32,

    /// Fixed delay between background attempts.
    pub retry_backoff: Duration,

    /// Limit for a single generation call.
    pub generation_timeout: Duration,

    /// Documents per batch when building an index.
    pub index_batch_size: usize,

    /// Character budget per chunk.
    pub chunk_max_chars: usize,

    /// Maximum hits per search.
    pub search_limit: usize,

    /// Settings for the text generator.
    pub generation: GenerationSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keep_visible_count: DEFAULT_KEEP_VISIBLE_COUNT,
            hide_summarized: true,
            rollback_min_deleted: DEFAULT_ROLLBACK_MIN_DELETED,
            auto_summarize_after: 0,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: Duration::from_secs(2),
            generation_timeout: Duration::from_secs(120),
            index_batch_size: DEFAULT_INDEX_BATCH_SIZE,
            chunk_max_chars: DEFAULT_CHUNK_MAX_CHARS,
            search_limit: DEFAULT_SEARCH_LIMIT,
            generation: GenerationSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many summarized entries stay visible.
    pub fn with_keep_visible_count(mut self, count: usize) -> Self {
        self.keep_visible_count = count;
        self
    }

    /// Enable or disable hiding of summarized entries.
    pub fn with_hide_summarized(mut self, hide: bool) -> Self {
        self.hide_summarized = hide;
        self
    }

    /// Set the rollback threshold. Values below 1 are treated as 1.
    pub fn with_rollback_min_deleted(mut self, count: usize) -> Self {
        self.rollback_min_deleted = count.max(1);
        self
    }

    /// Summarize in the background once this many entries are pending.
    pub fn with_auto_summarize_after(mut self, count: usize) -> Self {
        self.auto_summarize_after = count;
        self
    }

    /// Set attempts for background runs.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    /// Set the delay between background attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the limit for a single generation call.
    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    /// Set documents per index build batch.
    pub fn with_index_batch_size(mut self, size: usize) -> Self {
        self.index_batch_size = size.max(1);
        self
    }

    /// Set the chunk character budget.
    pub fn with_chunk_max_chars(mut self, chars: usize) -> Self {
        self.chunk_max_chars = chars.max(1);
        self
    }

    /// Set the maximum hits per search.
    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit.max(1);
        self
    }

    /// Set the model to use.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.generation.model = Some(model.into());
        self
    }

    /// Set max tokens for summary responses.
    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.generation.max_tokens = tokens;
        self
    }

    /// Set temperature for generation.
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.generation.temperature = Some(temp);
        self
    }
}
