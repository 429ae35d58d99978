pub mod chain;
pub mod concurrency_limiter;
pub mod request_limiter;
pub mod token_limiter;

pub use chain::{LimiterChain, LimiterInfo};
pub use concurrency_limiter::ConcurrencyLimiter;
pub use request_limiter::RequestLimiter;
pub use token_limiter::TokenLimiter;
