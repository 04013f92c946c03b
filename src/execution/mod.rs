//! Order execution: style selection, rate limiting, retries and idempotency.

mod executor;
mod rate_limiter;
mod retry;

pub use executor::{client_order_id, update_key, ExecutionManager, InFlightOrder};
pub use rate_limiter::{RateCategory, RateLimiter};
pub use retry::RetryPolicy;
