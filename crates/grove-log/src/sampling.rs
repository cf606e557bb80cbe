//! Content sampling for materialized-view handlers.
//!
//! Views that index large text payloads usually persist only a sample of
//! what flows through them. The sampler decides which items to keep
//! (deterministically, so replays make the same decisions), truncates and
//! redacts the kept content, and fingerprints it for downstream dedup.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Redaction hook applied to sampled content before it is stored.
pub type Redactor = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Sampling configuration for view handlers.
#[derive(Clone)]
pub struct SamplingConfig {
    /// Master switch; a disabled sampler keeps nothing.
    pub enabled: bool,
    /// Fraction of items to keep, in `[0, 1]`.
    pub sample_rate: f64,
    /// Keep every item flagged as an error regardless of the rate.
    pub sample_all_errors: bool,
    /// Truncate prompt content to this many characters.
    pub max_prompt_chars: usize,
    /// Truncate completion content to this many characters.
    pub max_completion_chars: usize,
    /// Attach a content fingerprint to each sample.
    pub generate_fingerprint: bool,
    /// Optional redaction hook.
    pub redactor: Option<Redactor>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 0.01,
            sample_all_errors: true,
            max_prompt_chars: 4096,
            max_completion_chars: 4096,
            generate_fingerprint: true,
            redactor: None,
        }
    }
}

impl fmt::Debug for SamplingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingConfig")
            .field("enabled", &self.enabled)
            .field("sample_rate", &self.sample_rate)
            .field("sample_all_errors", &self.sample_all_errors)
            .field("max_prompt_chars", &self.max_prompt_chars)
            .field("max_completion_chars", &self.max_completion_chars)
            .field("generate_fingerprint", &self.generate_fingerprint)
            .field("redactor", &self.redactor.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// One kept sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSample {
    /// Deterministic content hash, when fingerprinting is on.
    pub fingerprint: Option<String>,
    /// Truncated, redacted prompt content.
    pub prompt: String,
    /// Truncated, redacted completion content.
    pub completion: String,
    /// True when the item was kept because it was an error.
    pub kept_as_error: bool,
}

/// Decides which content to keep and prepares kept samples.
pub struct ContentSampler {
    config: SamplingConfig,
    counter: AtomicU64,
}

impl ContentSampler {
    /// Build a sampler from its configuration.
    pub fn new(config: SamplingConfig) -> Self {
        Self { config, counter: AtomicU64::new(0) }
    }

    /// Whether the next item should be kept. Deterministic: every
    /// `round(1/rate)`-th item is kept, plus every error when configured.
    pub fn should_sample(&self, is_error: bool) -> bool {
        if !self.config.enabled {
            return false;
        }
        if is_error && self.config.sample_all_errors {
            return true;
        }
        if self.config.sample_rate <= 0.0 {
            return false;
        }
        if self.config.sample_rate >= 1.0 {
            self.counter.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let stride = (1.0 / self.config.sample_rate).round() as u64;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        n % stride.max(1) == 0
    }

    /// Prepare a sample, or `None` when the item is not kept.
    pub fn sample(&self, prompt: &str, completion: &str, is_error: bool) -> Option<ContentSample> {
        if !self.should_sample(is_error) {
            return None;
        }
        let prompt = self.prepare(prompt, self.config.max_prompt_chars);
        let completion = self.prepare(completion, self.config.max_completion_chars);
        let fingerprint = self.config.generate_fingerprint.then(|| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(prompt.as_bytes());
            hasher.update(&[0]);
            hasher.update(completion.as_bytes());
            hasher.finalize().to_hex().to_string()
        });
        Some(ContentSample {
            fingerprint,
            prompt,
            completion,
            kept_as_error: is_error && self.config.sample_all_errors,
        })
    }

    fn prepare(&self, content: &str, max_chars: usize) -> String {
        let truncated: String = content.chars().take(max_chars).collect();
        match &self.config.redactor {
            Some(redact) => redact(&truncated),
            None => truncated,
        }
    }
}
