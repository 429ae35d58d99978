use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Request`]. Transitions are monotone:
/// `Pending -> Processing -> (Completed | Failed)`. No back-transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The rate-limit dimension a [`crate::LimiterConfig`] configures.
///
/// Costs charged per kind at admission (see [`crate::limiter::chain::LimiterChain::acquire_all`]):
/// `Rpm`/`Rpd`/`Concurrent` cost 1; `Tpm`/`Tpd` cost `est_input + est_output`;
/// `Itpm` costs `est_input`; `Otpm` costs `est_output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LimiterKind {
    /// Requests per minute.
    Rpm,
    /// Requests per day.
    Rpd,
    /// Tokens (input + output) per minute.
    Tpm,
    /// Tokens (input + output) per day.
    Tpd,
    /// Input tokens per minute.
    Itpm,
    /// Output tokens per minute.
    Otpm,
    /// Bounded in-flight concurrency. `time_period` is ignored for this kind.
    Concurrent,
}

impl LimiterKind {
    /// Default rolling-window period for this kind, in seconds, when a
    /// [`crate::LimiterConfig`] omits `time_period`. `Concurrent` has no period.
    pub fn default_period_secs(self) -> Option<u64> {
        match self {
            LimiterKind::Rpm | LimiterKind::Tpm | LimiterKind::Itpm | LimiterKind::Otpm => {
                Some(60)
            }
            LimiterKind::Rpd | LimiterKind::Tpd => Some(86_400),
            LimiterKind::Concurrent => None,
        }
    }
}

/// A typed unit of work submitted to a [`crate::Registry`].
///
/// Immutable after construction except for the status/usage fields, which
/// the owning [`crate::queue::ModelQueue`] mutates as the request moves
/// through admission, processing, and reconciliation.
#[derive(Debug, Clone)]
pub struct Request<P> {
    pub id: String,
    pub model_id: String,
    pub params: P,
    pub wait_for_completion: bool,
    pub created_at: f64,
    pub estimated_input_tokens: Option<u64>,
    pub estimated_output_tokens: Option<u64>,
    pub actual_input_tokens: Option<u64>,
    pub actual_output_tokens: Option<u64>,
    pub status: RequestStatus,
    pub error: Option<String>,
}

impl<P> Request<P> {
    /// Build a new request. `id` is generated with `uuid::Uuid::new_v4` when
    /// not supplied by the caller; `created_at` is the current wall-clock
    /// time in seconds.
    pub fn new(model_id: impl Into<String>, params: P) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.into(),
            params,
            wait_for_completion: true,
            created_at: now_secs(),
            estimated_input_tokens: None,
            estimated_output_tokens: None,
            actual_input_tokens: None,
            actual_output_tokens: None,
            status: RequestStatus::Pending,
            error: None,
        }
    }

    /// Same as [`Request::new`] but with an explicit id, for clients that
    /// correlate requests against their own identifiers.
    pub fn with_id(id: impl Into<String>, model_id: impl Into<String>, params: P) -> Self {
        let mut req = Self::new(model_id, params);
        req.id = id.into();
        req
    }

    pub fn wait_for_completion(mut self, wait: bool) -> Self {
        self.wait_for_completion = wait;
        self
    }

    pub fn estimated_tokens(mut self, input: Option<u64>, output: Option<u64>) -> Self {
        self.estimated_input_tokens = input;
        self.estimated_output_tokens = output;
        self
    }
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The outcome of processing a [`Request`], or a `Pending` placeholder
/// returned immediately when `wait_for_completion` is `false`.
///
/// `result` is opaque to the engine — it is whatever the processor
/// returned, unmodified.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub request_id: String,
    pub model_id: String,
    pub status: RequestStatus,
    pub result: Option<T>,
    pub error: Option<String>,
    pub processing_time: Option<f64>,
    pub created_at: f64,
    pub input_tokens_used: Option<u64>,
    pub output_tokens_used: Option<u64>,
}

impl<T> Response<T> {
    pub(crate) fn pending(request_id: String, model_id: String, created_at: f64) -> Self {
        Self {
            request_id,
            model_id,
            status: RequestStatus::Pending,
            result: None,
            error: None,
            processing_time: None,
            created_at,
            input_tokens_used: None,
            output_tokens_used: None,
        }
    }
}
