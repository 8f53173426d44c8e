//! Backoff and retry policies used around every remote call.

pub mod backoff;
pub mod retry;

pub use backoff::ExponentialBackoff;
pub use retry::{RetryPolicy, execute_with_retries};
