//! Error types for Conduit
//!
//! [`ConduitError`] is the single error type of the crate. Provider HTTP
//! failures carry a [`ProviderError`] classification so the retry policy and
//! the user-facing message never have to match on strings.

use thiserror::Error;

// ============================================================================
// Provider Error Classification
// ============================================================================

/// Classified failure of one provider call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// 401/403: the key is missing, wrong or revoked
    #[error("Authentication error: {0}")]
    Auth(String),
    /// 429 without a billing cause
    #[error("Rate limit error: {0}")]
    RateLimit(String),
    /// 402, or a 429 whose body says the quota is exhausted
    #[error("Billing error: {0}")]
    Billing(String),
    /// 5xx
    #[error("Server error: {0}")]
    ServerError(String),
    /// 400 that is not a format problem
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    /// Connect or read timeout
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Unknown provider error: {0}")]
    Unknown(String),
    /// 529 or an `overloaded_error` body
    #[error("Overloaded error: {0}")]
    Overloaded(String),
    /// The request shape was rejected (bad tool-call id, bad role order).
    /// Retrying the same request cannot help.
    #[error("Format error: {0}")]
    Format(String),
}

impl ProviderError {
    /// Returns `true` if this error is transient and the request should be retried.
    ///
    /// Retryable errors: RateLimit, ServerError, Timeout, Overloaded.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit(_)
                | ProviderError::ServerError(_)
                | ProviderError::Timeout(_)
                | ProviderError::Overloaded(_)
        )
    }

    /// Returns the HTTP status code associated with this error, if applicable.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ProviderError::Auth(_) => Some(401),
            ProviderError::RateLimit(_) => Some(429),
            ProviderError::Billing(_) => Some(402),
            ProviderError::ServerError(_) => Some(500),
            ProviderError::InvalidRequest(_) => Some(400),
            ProviderError::ModelNotFound(_) => Some(404),
            ProviderError::Timeout(_) => None,
            ProviderError::Overloaded(_) => Some(503),
            ProviderError::Format(_) => Some(400),
            ProviderError::Unknown(_) => None,
        }
    }

    /// Short machine-readable kind, used in error events.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimit(_) => "rate_limit",
            ProviderError::Billing(_) => "billing",
            ProviderError::ServerError(_) => "server_error",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::ModelNotFound(_) => "model_not_found",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Unknown(_) => "third_party",
            ProviderError::Overloaded(_) => "overloaded",
            ProviderError::Format(_) => "format",
        }
    }
}

impl From<ProviderError> for ConduitError {
    fn from(err: ProviderError) -> Self {
        ConduitError::ProviderTyped(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// Every fallible operation in the crate returns this.
#[derive(Error, Debug)]
pub enum ConduitError {
    /// Unknown keys, out-of-range values or missing credentials.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed input detected at setup or argument-validation time.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Untyped provider failure (wire decoding, unexpected payload shape).
    #[error("Provider error: {0}")]
    Provider(String),

    /// Structured provider error with classification for retry decisions.
    #[error("Provider error: {0}")]
    ProviderTyped(ProviderError),

    /// Raised by a tool's `execute`; the manager turns it into a failed result.
    #[error("Tool error: {0}")]
    Tool(String),

    /// Compaction could not bring the history under the token budget.
    #[error("Context overflow: estimated {estimated} tokens exceeds budget of {budget}")]
    ContextOverflow { estimated: usize, budget: usize },

    /// History could not be read or written.
    #[error("Session error: {0}")]
    Session(String),

    /// Run aborted through its cancellation token.
    #[error("Cancelled")]
    Cancelled,

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A specialized `Result` type for Conduit operations.
pub type Result<T> = std::result::Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConduitError::Config("missing API key".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing API key");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ConduitError = io_err.into();
        assert!(matches!(err, ConduitError::Io(_)));
    }

    #[test]
    fn test_context_overflow_display() {
        let err = ConduitError::ContextOverflow {
            estimated: 1200,
            budget: 900,
        };
        assert_eq!(
            err.to_string(),
            "Context overflow: estimated 1200 tokens exceeds budget of 900"
        );
    }

    // ====================================================================
    // ProviderError tests
    // ====================================================================

    #[test]
    fn test_provider_error_display() {
        assert!(ProviderError::Auth("bad key".into())
            .to_string()
            .contains("Authentication error"));
        assert!(ProviderError::RateLimit("quota".into())
            .to_string()
            .contains("Rate limit error"));
        assert!(ProviderError::Overloaded("busy".into())
            .to_string()
            .contains("Overloaded error"));
        assert!(ProviderError::Format("bad id".into())
            .to_string()
            .contains("Format error"));
    }

    #[test]
    fn test_provider_error_is_retryable() {
        assert!(ProviderError::RateLimit("429".into()).is_retryable());
        assert!(ProviderError::ServerError("500".into()).is_retryable());
        assert!(ProviderError::Timeout("timeout".into()).is_retryable());
        assert!(ProviderError::Overloaded("busy".into()).is_retryable());

        assert!(!ProviderError::Auth("401".into()).is_retryable());
        assert!(!ProviderError::Billing("402".into()).is_retryable());
        assert!(!ProviderError::InvalidRequest("400".into()).is_retryable());
        assert!(!ProviderError::ModelNotFound("404".into()).is_retryable());
        assert!(!ProviderError::Unknown("???".into()).is_retryable());
        assert!(!ProviderError::Format("bad id".into()).is_retryable());
    }

    #[test]
    fn test_provider_error_status_code() {
        assert_eq!(ProviderError::Auth("x".into()).status_code(), Some(401));
        assert_eq!(
            ProviderError::RateLimit("x".into()).status_code(),
            Some(429)
        );
        assert_eq!(ProviderError::Timeout("x".into()).status_code(), None);
        assert_eq!(
            ProviderError::Overloaded("x".into()).status_code(),
            Some(503)
        );
    }

    #[test]
    fn test_provider_error_kind() {
        assert_eq!(ProviderError::RateLimit("x".into()).kind(), "rate_limit");
        assert_eq!(ProviderError::Timeout("x".into()).kind(), "timeout");
        assert_eq!(ProviderError::Unknown("x".into()).kind(), "third_party");
    }

    #[test]
    fn test_provider_typed_display() {
        let err: ConduitError = ProviderError::Auth("invalid key".into()).into();
        assert!(matches!(err, ConduitError::ProviderTyped(_)));
        assert_eq!(
            err.to_string(),
            "Provider error: Authentication error: invalid key"
        );
    }
}
