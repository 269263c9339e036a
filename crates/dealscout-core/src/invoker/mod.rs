//! Uniform call interface to model backends
//!
//! [`ModelInvoker`] wraps a [`ModelBackend`] with per-attempt timeouts,
//! cancellation, an optional whole-call deadline and retry with exponential
//! backoff for transient failures.

mod backend;
mod executor;
mod retry;
mod types;

pub use backend::{HttpBackend, ModelBackend};
pub use executor::ModelInvoker;
pub use retry::RetryPolicy;
pub use types::{CallOptions, InvocationRequest, InvocationResult};
