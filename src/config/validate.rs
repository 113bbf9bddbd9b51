//! Configuration validation with unknown field detection.

use serde_json::Value;
use std::collections::HashSet;

use super::{ApprovalMode, Config};

/// Known top-level config field names.
const KNOWN_TOP_LEVEL: &[&str] = &[
    "agent",
    "context",
    "approval",
    "tools",
    "providers",
    "hooks",
    "logging",
];

/// Known fields for each section.
const KNOWN_AGENT: &[&str] = &[
    "provider",
    "model",
    "max_iterations",
    "max_tokens",
    "temperature",
    "streaming",
    "system_prompt",
];

const KNOWN_CONTEXT: &[&str] = &[
    "max_input_tokens",
    "compaction_threshold",
    "keep_recent_turns",
    "safety_buffer_tokens",
    "summary_max_chars",
];

const KNOWN_APPROVAL: &[&str] = &[
    "mode",
    "require_for",
    "always_allow",
    "always_require",
    "timeout_secs",
    "deny_without_subscribers",
];

const KNOWN_PROVIDERS: &[&str] = &["anthropic", "openai", "retry", "request_timeout_secs"];

/// Provider names the runtime can construct an adapter for.
pub const KNOWN_PROVIDER_NAMES: &[&str] = &["anthropic", "claude", "openai"];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

impl Diagnostic {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warn(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warn,
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Ok => "[OK]",
            DiagnosticLevel::Warn => "[WARN]",
            DiagnosticLevel::Error => "[ERROR]",
        };
        if self.path.is_empty() {
            write!(f, "{} {}", prefix, self.message)
        } else {
            write!(f, "{} {}: {}", prefix, self.path, self.message)
        }
    }
}

/// Simple Levenshtein distance for "did you mean?" suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

fn check_keys(
    obj: &serde_json::Map<String, Value>,
    known: &[&str],
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let known_set: HashSet<&str> = known.iter().copied().collect();
    for key in obj.keys() {
        if known_set.contains(key.as_str()) {
            continue;
        }
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let msg = match suggest_field(key, known) {
            Some(suggestion) => format!("Unknown field '{}', {}", key, suggestion),
            None => format!("Unknown field '{}'", key),
        };
        diagnostics.push(Diagnostic::error(path, msg));
    }
}

/// Validate a raw JSON config value against known field names.
pub fn validate_config(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let obj = match raw.as_object() {
        Some(o) => o,
        None => {
            diagnostics.push(Diagnostic::error("", "Config must be a JSON object"));
            return diagnostics;
        }
    };

    check_keys(obj, KNOWN_TOP_LEVEL, "", &mut diagnostics);

    let sections: [(&str, &[&str]); 4] = [
        ("agent", KNOWN_AGENT),
        ("context", KNOWN_CONTEXT),
        ("approval", KNOWN_APPROVAL),
        ("providers", KNOWN_PROVIDERS),
    ];
    for (section, known) in sections {
        if let Some(inner) = obj.get(section).and_then(|v| v.as_object()) {
            check_keys(inner, known, section, &mut diagnostics);
        }
    }

    if diagnostics.is_empty() {
        diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Ok,
            path: String::new(),
            message: "All fields recognized".to_string(),
        });
    }

    diagnostics
}

/// Validate value ranges and cross-field constraints of a parsed config.
pub fn validate_semantics(config: &Config) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if !KNOWN_PROVIDER_NAMES.contains(&config.agent.provider.as_str()) {
        let msg = match suggest_field(&config.agent.provider, KNOWN_PROVIDER_NAMES) {
            Some(suggestion) => format!(
                "Unknown provider '{}', {}",
                config.agent.provider, suggestion
            ),
            None => format!("Unknown provider '{}'", config.agent.provider),
        };
        diagnostics.push(Diagnostic::error("agent.provider", msg));
    }
    if config.agent.max_iterations == 0 {
        diagnostics.push(Diagnostic::error(
            "agent.max_iterations",
            "must be at least 1",
        ));
    }
    if config.agent.max_tokens == 0 {
        diagnostics.push(Diagnostic::error("agent.max_tokens", "must be at least 1"));
    }

    let threshold = config.context.compaction_threshold;
    if !(threshold > 0.0 && threshold <= 1.0) {
        diagnostics.push(Diagnostic::error(
            "context.compaction_threshold",
            format!("must be in (0.0, 1.0], got {}", threshold),
        ));
    }
    if let Some(max) = config.context.max_input_tokens {
        if max <= config.context.safety_buffer_tokens {
            diagnostics.push(Diagnostic::error(
                "context.max_input_tokens",
                format!(
                    "{} leaves no room after the {}-token safety buffer",
                    max, config.context.safety_buffer_tokens
                ),
            ));
        }
    }

    if config.approval.timeout_secs == 0 {
        diagnostics.push(Diagnostic::error(
            "approval.timeout_secs",
            "must be at least 1",
        ));
    }
    if config.approval.mode == ApprovalMode::Categories && config.approval.require_for.is_empty()
    {
        diagnostics.push(Diagnostic::warn(
            "approval.require_for",
            "empty, so no tool requires approval",
        ));
    }

    let retry = &config.providers.retry;
    if retry.base_delay_ms > retry.max_delay_ms {
        diagnostics.push(Diagnostic::error(
            "providers.retry.base_delay_ms",
            "must not exceed max_delay_ms",
        ));
    }
    if config.tools.timeout_secs == 0 {
        diagnostics.push(Diagnostic::error("tools.timeout_secs", "must be at least 1"));
    }

    diagnostics
}
