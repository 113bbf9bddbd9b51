//! Provider error classification.
//!
//! HTTP status decides first; message patterns refine it (a 500 whose body
//! says `overloaded_error` is an overload, a 400 about `tool_use.id` is a
//! format error) and serve as the fallback for errors without a status, such
//! as mid-stream `error` events.

use crate::error::ProviderError;

type Ctor = fn(String) -> ProviderError;

/// Checked in order; the first family with a matching pattern wins.
const PATTERNS: &[(Ctor, &[&str])] = &[
    (
        ProviderError::Billing,
        &[
            "payment required",
            "insufficient credits",
            "credit balance",
            "insufficient balance",
            "billing",
        ],
    ),
    (
        ProviderError::Auth,
        &[
            "invalid_api_key",
            "invalid api key",
            "incorrect api key",
            "authentication",
            "unauthorized",
            "forbidden",
            "permission_error",
            "no api key",
        ],
    ),
    (
        ProviderError::RateLimit,
        &[
            "rate_limit",
            "rate limit",
            "too many requests",
            "exceeded your current quota",
            "resource_exhausted",
            "quota exceeded",
        ],
    ),
    (ProviderError::Overloaded, &["overloaded"]),
    (
        ProviderError::Timeout,
        &["timeout", "timed out", "deadline exceeded"],
    ),
    (
        ProviderError::Format,
        &[
            "string should match pattern",
            "tool_use.id",
            "tool_use_id",
            "tool_call_id",
        ],
    ),
    (
        ProviderError::ModelNotFound,
        &["model_not_found", "does not exist", "unknown model"],
    ),
];

/// Classify an error message with no usable HTTP status.
pub fn classify_error_message(msg: &str) -> ProviderError {
    match_patterns(msg).unwrap_or_else(|| ProviderError::Unknown(msg.to_string()))
}

/// Classify an HTTP failure from its status and body text.
pub fn classify_http(status: u16, body: &str) -> ProviderError {
    let refined = match_patterns(body);
    match (status, refined) {
        (401 | 403, _) => ProviderError::Auth(body.to_string()),
        (402, _) => ProviderError::Billing(body.to_string()),
        (404, _) => ProviderError::ModelNotFound(body.to_string()),
        (408, _) => ProviderError::Timeout(body.to_string()),
        (429, Some(err @ ProviderError::Billing(_))) => err,
        (429, _) => ProviderError::RateLimit(body.to_string()),
        (529, _) => ProviderError::Overloaded(body.to_string()),
        (400 | 422, Some(err @ ProviderError::Format(_))) => err,
        (400 | 422, _) => ProviderError::InvalidRequest(body.to_string()),
        (500..=599, Some(err @ ProviderError::Overloaded(_))) => err,
        (500..=599, _) => ProviderError::ServerError(body.to_string()),
        (_, Some(err)) => err,
        _ => ProviderError::Unknown(format!("HTTP {}: {}", status, body)),
    }
}

/// The text a run returns when the provider keeps failing.
///
/// Rate limits carry guidance on what to do next; everything else reports the
/// classified error as-is.
pub fn user_facing_message(err: &ProviderError) -> String {
    match err {
        ProviderError::RateLimit(_) => format!(
            "Error: {}. The provider is rate limiting requests; wait a minute and try again, \
             or lower request volume.",
            err
        ),
        ProviderError::Auth(_) => format!("Error: {}. Check the provider API key.", err),
        ProviderError::Billing(_) => {
            format!("Error: {}. Check the provider account's billing status.", err)
        }
        _ => format!("Error: {}", err),
    }
}

fn match_patterns(msg: &str) -> Option<ProviderError> {
    let lower = msg.to_lowercase();
    PATTERNS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(ctor, _)| ctor(msg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_patterns() {
        assert!(matches!(
            classify_error_message("Your credit balance is too low"),
            ProviderError::Billing(_)
        ));
        assert!(matches!(
            classify_error_message("Incorrect API key provided"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            classify_error_message("Rate limit reached for gpt-4o"),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            classify_error_message(r#"{"type":"overloaded_error"}"#),
            ProviderError::Overloaded(_)
        ));
        assert!(matches!(
            classify_error_message("request timed out"),
            ProviderError::Timeout(_)
        ));
        assert!(matches!(
            classify_error_message("messages.1.content.1.tool_use.id: String should match pattern"),
            ProviderError::Format(_)
        ));
        assert!(matches!(
            classify_error_message("something odd"),
            ProviderError::Unknown(_)
        ));
    }

    #[test]
    fn test_billing_wins_over_rate_limit() {
        assert!(matches!(
            classify_error_message("rate limit: insufficient credits"),
            ProviderError::Billing(_)
        ));
        assert!(matches!(
            classify_http(429, "insufficient balance"),
            ProviderError::Billing(_)
        ));
    }

    #[test]
    fn test_status_first() {
        assert!(matches!(classify_http(401, "nope"), ProviderError::Auth(_)));
        assert!(matches!(classify_http(403, "nope"), ProviderError::Auth(_)));
        assert!(matches!(
            classify_http(429, "slow down"),
            ProviderError::RateLimit(_)
        ));
        assert!(matches!(
            classify_http(529, "busy"),
            ProviderError::Overloaded(_)
        ));
        assert!(matches!(
            classify_http(502, "bad gateway"),
            ProviderError::ServerError(_)
        ));
    }

    #[test]
    fn test_body_refines_status() {
        assert!(matches!(
            classify_http(500, "Claude API error: overloaded_error - Overloaded"),
            ProviderError::Overloaded(_)
        ));
        assert!(matches!(
            classify_http(400, "tool_use_id not found"),
            ProviderError::Format(_)
        ));
        assert!(matches!(
            classify_http(400, "max_tokens too large"),
            ProviderError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_unknown_status_keeps_code() {
        let err = classify_http(418, "teapot");
        assert_eq!(err, ProviderError::Unknown("HTTP 418: teapot".into()));
    }

    #[test]
    fn test_user_facing_message() {
        let msg = user_facing_message(&ProviderError::RateLimit("429".into()));
        assert!(msg.starts_with("Error: Rate limit error: 429"));
        assert!(msg.contains("try again"));
        assert_eq!(
            user_facing_message(&ProviderError::ServerError("boom".into())),
            "Error: Server error: boom"
        );
    }
}
