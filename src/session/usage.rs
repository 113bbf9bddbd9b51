//! Token usage accounting and per-model cost estimation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token usage reported by a provider for one call.
///
/// `input_tokens` is the full prompt size as the provider counted it,
/// including any tokens served from cache. `cache_read_tokens` is a breakdown
/// of that figure, never an addition to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// Create usage from prompt and completion counts.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    /// Total tokens (input + output).
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Whether every counter is zero.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Add another usage record into this one.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// Pricing for a model family, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelPricing {
    const fn new(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_write,
        }
    }
}

/// Known model prefixes, most specific first.
const PRICING: &[(&str, ModelPricing)] = &[
    ("claude-opus-4", ModelPricing::new(15.0, 75.0, 1.5, 18.75)),
    ("claude-sonnet-4", ModelPricing::new(3.0, 15.0, 0.3, 3.75)),
    ("claude-3-7-sonnet", ModelPricing::new(3.0, 15.0, 0.3, 3.75)),
    ("claude-3-5-sonnet", ModelPricing::new(3.0, 15.0, 0.3, 3.75)),
    ("claude-3-5-haiku", ModelPricing::new(0.8, 4.0, 0.08, 1.0)),
    ("claude-haiku-4", ModelPricing::new(1.0, 5.0, 0.1, 1.25)),
    ("gpt-4o-mini", ModelPricing::new(0.15, 0.6, 0.075, 0.0)),
    ("gpt-4o", ModelPricing::new(2.5, 10.0, 1.25, 0.0)),
    ("gpt-4.1-mini", ModelPricing::new(0.4, 1.6, 0.1, 0.0)),
    ("gpt-4.1", ModelPricing::new(2.0, 8.0, 0.5, 0.0)),
    ("o3-mini", ModelPricing::new(1.1, 4.4, 0.55, 0.0)),
];

/// Look up pricing by longest matching model prefix.
pub fn pricing_for(model: &str) -> Option<ModelPricing> {
    PRICING
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, p)| *p)
}

/// Estimated USD cost of a single call. Unknown models cost zero.
pub fn estimate_cost(model: &str, usage: &TokenUsage) -> f64 {
    let Some(p) = pricing_for(model) else {
        return 0.0;
    };
    let uncached_input = usage.input_tokens.saturating_sub(usage.cache_read_tokens);
    let per_million = 1_000_000.0;
    (uncached_input as f64 * p.input
        + usage.cache_read_tokens as f64 * p.cache_read
        + usage.cache_write_tokens as f64 * p.cache_write
        + (usage.output_tokens + usage.reasoning_tokens) as f64 * p.output)
        / per_million
}

/// Cumulative usage statistics for one model within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    /// Number of assistant messages produced with this model
    pub message_count: u64,
    /// Estimated cost in USD
    pub cost_usd: f64,
    pub first_used: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl ModelUsage {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            input_tokens: 0,
            output_tokens: 0,
            reasoning_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            message_count: 0,
            cost_usd: 0.0,
            first_used: now,
            last_used: now,
        }
    }

    /// Fold one call's usage into the totals.
    pub fn record(&mut self, model: &str, usage: &TokenUsage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.reasoning_tokens += usage.reasoning_tokens;
        self.cache_read_tokens += usage.cache_read_tokens;
        self.cache_write_tokens += usage.cache_write_tokens;
        self.message_count += 1;
        self.cost_usd += estimate_cost(model, usage);
        self.last_used = Utc::now();
    }
}

impl Default for ModelUsage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulate() {
        let mut total = TokenUsage::new(100, 20);
        total.accumulate(&TokenUsage {
            input_tokens: 50,
            output_tokens: 5,
            reasoning_tokens: 3,
            cache_read_tokens: 40,
            cache_write_tokens: 0,
        });
        assert_eq!(total.input_tokens, 150);
        assert_eq!(total.output_tokens, 25);
        assert_eq!(total.reasoning_tokens, 3);
        assert_eq!(total.cache_read_tokens, 40);
        assert_eq!(total.total(), 175);
    }

    #[test]
    fn test_usage_is_empty() {
        assert!(TokenUsage::default().is_empty());
        assert!(!TokenUsage::new(1, 0).is_empty());
    }

    #[test]
    fn test_pricing_longest_prefix_wins() {
        let mini = pricing_for("gpt-4o-mini-2024-07-18").unwrap();
        assert!((mini.input - 0.15).abs() < 1e-9);
        let full = pricing_for("gpt-4o-2024-08-06").unwrap();
        assert!((full.input - 2.5).abs() < 1e-9);
        assert!(pricing_for("llama3").is_none());
    }

    #[test]
    fn test_estimate_cost_does_not_double_count_cache() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cache_read_tokens: 1_000_000,
            ..Default::default()
        };
        // Everything came from cache: only the cache-read rate applies.
        let cost = estimate_cost("claude-sonnet-4-20250514", &usage);
        assert!((cost - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_model_usage_record() {
        let mut usage = ModelUsage::new();
        usage.record("unknown-model", &TokenUsage::new(10, 5));
        usage.record("unknown-model", &TokenUsage::new(20, 5));
        assert_eq!(usage.input_tokens, 30);
        assert_eq!(usage.message_count, 2);
        assert_eq!(usage.cost_usd, 0.0);
        assert!(usage.first_used <= usage.last_used);
    }
}
