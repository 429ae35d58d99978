use std::fmt;

/// Errors surfaced directly to callers of [`crate::Registry`].
///
/// Processor failures are not represented here — they are contained and
/// reported only via [`crate::Response::error`] (status `Failed`).
#[derive(Debug)]
#[allow(dead_code)]
pub enum EngineError {
    /// A [`crate::ModelConfig`] failed validation (non-positive limit/period,
    /// empty limiter list).
    InvalidConfiguration(String),
    /// `register` was called with a `model_id` that is already registered.
    AlreadyRegistered(String),
    /// An API call targeted a `model_id` with no registered queue.
    ModelNotRegistered(String),
    /// Reserved for a future timed-submit API; the core `submit` has no timeout.
    QueueTimeout(String),
    /// Reserved for a future timed-submit API that rejects instead of blocking
    /// on `wait_for_slot`.
    RateLimitExceeded(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidConfiguration(msg) => write!(f, "invalid configuration: {msg}"),
            EngineError::AlreadyRegistered(id) => write!(f, "model already registered: {id}"),
            EngineError::ModelNotRegistered(id) => write!(f, "model not registered: {id}"),
            EngineError::QueueTimeout(msg) => write!(f, "queue timeout: {msg}"),
            EngineError::RateLimitExceeded(msg) => write!(f, "rate limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}
