//! Admission control: per-operation rate limits and the store circuit breaker.

mod breaker;
mod rate_limit;

pub use breaker::{BreakerState, CircuitBreaker, Protected};
pub use rate_limit::{Admission, Operation, RateLimiter};
