/// Shared error type used across all PenguiFlow crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("llm timeout: {0}")]
    LlmTimeout(String),

    #[error("llm rate limit: {0}")]
    LlmRateLimit(String),

    #[error("llm server: {0}")]
    LlmServer(String),

    #[error("llm invalid request: {0}")]
    LlmInvalidRequest(String),

    #[error("llm auth: {0}")]
    LlmAuth(String),

    #[error("context length exceeded: {0}")]
    ContextLengthExceeded(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("tool {tool_name}: {message}")]
    Tool {
        tool_name: String,
        message: String,
        fatal: bool,
    },

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("store feature {feature}: {message}")]
    StoreOptional { feature: String, message: String },

    #[error("store: {0}")]
    StoreCore(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by the recovery layer to pick a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rate limits, server errors, timeouts — back off and retry.
    RetryableTransport,
    /// The prompt no longer fits — compress the trajectory, then retry once.
    ContextLength,
    /// Structured output failed to parse or validate — retry with feedback.
    OutputInvalid,
    /// A non-context invalid request — synthesize an observation, continue.
    BadRequest,
    /// Cancellation — terminal, not an error to recover from.
    Cancelled,
    /// Everything else — surface as fatal.
    Fatal,
}

impl Error {
    /// Whether the retry loop may re-attempt after this error.
    pub fn retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::RetryableTransport | ErrorClass::OutputInvalid
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::LlmTimeout(_) | Error::LlmRateLimit(_) | Error::LlmServer(_) => {
                ErrorClass::RetryableTransport
            }
            Error::ContextLengthExceeded(_) => ErrorClass::ContextLength,
            Error::Validation(_) | Error::Parse(_) => ErrorClass::OutputInvalid,
            Error::LlmInvalidRequest(_) => ErrorClass::BadRequest,
            Error::Cancelled(_) => ErrorClass::Cancelled,
            _ => ErrorClass::Fatal,
        }
    }

    /// Stable machine-readable kind, used in user-visible failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::LlmTimeout(_) => "llm_timeout",
            Error::LlmRateLimit(_) => "llm_rate_limit",
            Error::LlmServer(_) => "llm_server",
            Error::LlmInvalidRequest(_) => "llm_invalid_request",
            Error::LlmAuth(_) => "llm_auth",
            Error::ContextLengthExceeded(_) => "context_length_exceeded",
            Error::Validation(_) => "validation",
            Error::Parse(_) => "parse",
            Error::Tool { .. } => "tool",
            Error::Constraint(_) => "constraint_violated",
            Error::Cancelled(_) => "cancelled",
            Error::StoreOptional { .. } => "store_optional",
            Error::StoreCore(_) => "store_core",
            Error::Unsupported(_) => "unsupported",
            Error::Other(_) => "other",
        }
    }
}

/// Classify a provider-reported error by its type string and message.
///
/// LLM clients surface wire errors as `(error_type, message)` pairs; this
/// maps them onto the shared taxonomy. Matching is substring-based and
/// case-insensitive because providers disagree on exact spellings.
pub fn classify_llm_error(error_type: &str, message: &str) -> Error {
    let t = error_type.to_ascii_lowercase();
    let m = message.to_ascii_lowercase();

    let matches_any = |needles: &[&str]| needles.iter().any(|n| t.contains(n) || m.contains(n));

    if matches_any(&["context_length", "context length", "maximum context", "too many tokens"]) {
        return Error::ContextLengthExceeded(message.to_string());
    }
    if matches_any(&["rate_limit", "rate limit", "429", "overloaded"]) {
        return Error::LlmRateLimit(message.to_string());
    }
    if matches_any(&["timeout", "timed out", "deadline"]) {
        return Error::LlmTimeout(message.to_string());
    }
    if matches_any(&["auth", "api key", "unauthorized", "401", "403"]) {
        return Error::LlmAuth(message.to_string());
    }
    if matches_any(&["server_error", "internal server", "500", "502", "503", "unavailable"]) {
        return Error::LlmServer(message.to_string());
    }
    if matches_any(&["invalid_request", "invalid request", "bad request", "400"]) {
        return Error::LlmInvalidRequest(message.to_string());
    }
    Error::Other(format!("{error_type}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(Error::LlmRateLimit("x".into()).retryable());
        assert!(Error::LlmTimeout("x".into()).retryable());
        assert!(Error::LlmServer("x".into()).retryable());
        assert!(Error::Validation("x".into()).retryable());
        assert!(Error::Parse("x".into()).retryable());

        assert!(!Error::LlmAuth("x".into()).retryable());
        assert!(!Error::LlmInvalidRequest("x".into()).retryable());
        assert!(!Error::Cancelled("x".into()).retryable());
        assert!(!Error::ContextLengthExceeded("x".into()).retryable());
    }

    #[test]
    fn context_length_has_its_own_class() {
        assert_eq!(
            Error::ContextLengthExceeded("x".into()).class(),
            ErrorClass::ContextLength
        );
    }

    #[test]
    fn classify_context_length() {
        let e = classify_llm_error("invalid_request_error", "maximum context length exceeded");
        assert!(matches!(e, Error::ContextLengthExceeded(_)));
    }

    #[test]
    fn classify_rate_limit() {
        let e = classify_llm_error("rate_limit_error", "slow down");
        assert!(matches!(e, Error::LlmRateLimit(_)));
    }

    #[test]
    fn classify_auth() {
        let e = classify_llm_error("authentication_error", "bad api key");
        assert!(matches!(e, Error::LlmAuth(_)));
    }

    #[test]
    fn classify_server() {
        let e = classify_llm_error("", "503 service unavailable");
        assert!(matches!(e, Error::LlmServer(_)));
    }

    #[test]
    fn classify_invalid_request_non_context() {
        let e = classify_llm_error("invalid_request_error", "unknown parameter");
        assert!(matches!(e, Error::LlmInvalidRequest(_)));
    }

    #[test]
    fn classify_unknown_is_other() {
        let e = classify_llm_error("weird", "never seen this");
        assert!(matches!(e, Error::Other(_)));
        assert_eq!(e.class(), ErrorClass::Fatal);
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(Error::Cancelled("stop".into()).kind(), "cancelled");
        assert_eq!(Error::Constraint("budget".into()).kind(), "constraint_violated");
    }
}
