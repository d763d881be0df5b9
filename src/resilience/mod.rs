//! Robustness layer every remote call flows through.
//!
//! Calls are layered as breaker -> retry -> request: the breaker sees one
//! outcome per logical call, after rate-limit retries are exhausted.

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{
    BreakerFailure, CircuitBreaker, CircuitBreakerRegistry, CircuitError, CircuitState,
};
pub use rate_limiter::{RateLimiter, Throttled};
