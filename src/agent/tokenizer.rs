//! Token estimation.
//!
//! Estimates are heuristic and deterministic: no network calls, no model
//! vocabularies. They only need to be close enough for budget decisions,
//! because the context manager replaces its running estimate with the
//! provider's real count after every completed turn.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{ContentPart, Message};

/// Fixed per-message framing overhead (role markers, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Flat cost charged for each image part.
pub const IMAGE_TOKENS: usize = 1_000;

/// Provider family, which selects both the tokenizer heuristic and the wire
/// formatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// Anthropic Messages API
    Anthropic,
    /// OpenAI Chat Completions and compatible endpoints
    OpenAI,
    /// Anything else
    Generic,
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderFamily::Anthropic => write!(f, "anthropic"),
            ProviderFamily::OpenAI => write!(f, "openai"),
            ProviderFamily::Generic => write!(f, "generic"),
        }
    }
}

/// Provider-specific token estimator.
pub trait Tokenizer: Send + Sync {
    /// Estimate tokens for raw text.
    fn estimate_text(&self, text: &str) -> usize;

    /// Estimate tokens for one message including framing, attachments and
    /// tool calls.
    fn estimate_message(&self, message: &Message) -> usize {
        let mut total = MESSAGE_OVERHEAD_TOKENS;
        for part in &message.content {
            total += match part {
                ContentPart::Text { text } => self.estimate_text(text),
                ContentPart::Image { .. } => IMAGE_TOKENS,
                ContentPart::File { name, content, .. } => {
                    self.estimate_text(name) + self.estimate_text(content)
                }
            };
        }
        if let Some(calls) = &message.tool_calls {
            for call in calls {
                total += self.estimate_text(&call.name) + self.estimate_json(&call.arguments);
            }
        }
        total
    }

    /// Estimate tokens for a slice of messages.
    fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }

    /// Estimate tokens for a JSON value (tool schemas, arguments).
    fn estimate_json(&self, value: &Value) -> usize {
        self.estimate_text(&value.to_string())
    }
}

/// Character/word ratio heuristic per provider family.
///
/// - Anthropic: one token per 3.5 characters
/// - OpenAI: one token per 4 characters
/// - Generic: 1.3 tokens per whitespace-separated word
#[derive(Debug, Clone, Copy)]
pub struct HeuristicTokenizer {
    family: ProviderFamily,
}

impl HeuristicTokenizer {
    pub fn new(family: ProviderFamily) -> Self {
        Self { family }
    }

    pub fn family(&self) -> ProviderFamily {
        self.family
    }
}

impl Tokenizer for HeuristicTokenizer {
    fn estimate_text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.family {
            ProviderFamily::Anthropic => (text.chars().count() as f64 / 3.5).ceil() as usize,
            ProviderFamily::OpenAI => text.chars().count().div_ceil(4),
            ProviderFamily::Generic => (text.split_whitespace().count() as f64 * 1.3) as usize,
        }
    }
}
