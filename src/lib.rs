//! Multi-tenant request admission and dispatch engine for outbound calls to
//! rate-limited upstream services.
//!
//! Each tenant (a `model_id`) owns an independent [`queue::ModelQueue`]
//! governed by one or more composable rate-limit dimensions — rolling
//! request counts, rolling token budgets, and bounded in-flight
//! concurrency. Client code submits typed [`Request`]s through a
//! [`Registry`]; the engine admits them subject to all configured limits,
//! invokes a user-supplied async [`queue::Processor`], and returns typed
//! [`Response`]s. A later [`Registry::update_token_usage`] call reconciles
//! token ledgers when estimated usage diverges from actual usage.
//!
//! No persistence, no cross-process coordination, no automatic retry, no
//! priority scheduling — see the crate's design notes for the full list of
//! non-goals.

pub mod config;
pub mod error;
pub mod limiter;
pub mod model;
pub mod queue;
pub mod registry;

pub use config::{LimiterConfig, ModelConfig};
pub use error::EngineError;
pub use limiter::{ConcurrencyLimiter, LimiterChain, LimiterInfo, RequestLimiter, TokenLimiter};
pub use model::{LimiterKind, Request, RequestStatus, Response};
pub use queue::{ModelQueue, Processor, ProcessorOutcome};
pub use registry::{QueueInfo, Registry};
