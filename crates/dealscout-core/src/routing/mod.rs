//! Model routing
//!
//! - [`RoutingPolicy`] picks a model for a task from the registry and the
//!   learned routing bias
//! - [`ModelRouter`] invokes the pick and falls back to the next candidate
//!   when a backend is unavailable

mod policy;
mod router;
mod types;

pub use policy::RoutingPolicy;
pub use router::{
    DEFAULT_ATTEMPT_TIMEOUT, ModelRouter, ModelRouterBuilder, RouteOptions, RouteOutcome,
};
pub use types::{RoutingContext, RoutingDecision, RoutingReason};
