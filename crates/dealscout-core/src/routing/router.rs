//! Model Router - select, invoke, fall back
//!
//! The router composes the [`RoutingPolicy`] with the [`ModelInvoker`]: it
//! selects a model, records the decision, and invokes it. A backend that
//! exhausts its retries or fails outright is excluded and the next candidate
//! is tried, strictly one at a time, until a call succeeds or no candidate is
//! left.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::policy::RoutingPolicy;
use super::types::{RoutingContext, RoutingDecision};
use crate::error::{Error, Result};
use crate::feedback::{FeedbackEvent, FeedbackStore};
use crate::invoker::{CallOptions, InvocationRequest, InvocationResult, ModelInvoker};
use crate::registry::TaskType;

/// Default bound on a single backend attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);

/// Bounds for one routed request
#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Bound on each backend attempt
    pub timeout: Duration,
    /// Bound on the whole request, fallbacks included
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl RouteOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A completed routed request
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    /// Every decision made for this request, in order; the last one served it
    pub decisions: Vec<RoutingDecision>,
    pub result: InvocationResult,
}

impl RouteOutcome {
    /// The decision that produced the result
    pub fn final_decision(&self) -> Option<&RoutingDecision> {
        self.decisions.last()
    }
}

/// Routes tasks to models with fallback
pub struct ModelRouter {
    policy: Arc<RoutingPolicy>,
    invoker: Arc<ModelInvoker>,
    feedback: Option<Arc<dyn FeedbackStore>>,
}

impl ModelRouter {
    pub fn builder() -> ModelRouterBuilder {
        ModelRouterBuilder::new()
    }

    pub fn policy(&self) -> &Arc<RoutingPolicy> {
        &self.policy
    }

    /// Route one request
    pub async fn route(
        &self,
        task_type: &TaskType,
        request: &InvocationRequest,
        options: &RouteOptions,
    ) -> Result<RouteOutcome> {
        let mut context = RoutingContext::new().with_input_chars(request.input_chars());
        let mut decisions = Vec::new();

        loop {
            if options.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let decision = self.policy.select(task_type, &context)?;
            self.record(&decision).await;

            let model = self.policy.registry().resolve(decision.model_id())?;
            let mut call = CallOptions::new(options.timeout)
                .with_cancel(options.cancel.clone())
                .with_decision(decision.id(), task_type.clone());
            call.deadline = options.deadline;

            match self.invoker.invoke(&model, request, &call).await {
                Ok(result) => {
                    info!(
                        task_type = %task_type,
                        model = %model.id,
                        fallbacks = decisions.len(),
                        latency_ms = result.latency_ms,
                        "Routed request"
                    );
                    decisions.push(decision);
                    return Ok(RouteOutcome { decisions, result });
                }
                Err(Error::BackendUnavailable {
                    attempts,
                    last_error,
                    ..
                }) => {
                    warn!(
                        task_type = %task_type,
                        model = %model.id,
                        attempts,
                        error = %last_error,
                        "Backend unavailable, falling back"
                    );
                    context.exclude.push(model.id.clone());
                    decisions.push(decision);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn record(&self, decision: &RoutingDecision) {
        let Some(store) = &self.feedback else {
            return;
        };
        if let Err(e) = store.append(FeedbackEvent::Decision(decision.clone())).await {
            warn!(decision = %decision.id(), error = %e, "Failed to record routing decision");
        }
    }
}

/// Builder for [`ModelRouter`]
#[derive(Default)]
pub struct ModelRouterBuilder {
    policy: Option<Arc<RoutingPolicy>>,
    invoker: Option<Arc<ModelInvoker>>,
    feedback: Option<Arc<dyn FeedbackStore>>,
}

impl ModelRouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: Arc<RoutingPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn invoker(mut self, invoker: Arc<ModelInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Record routing decisions to this store
    pub fn feedback(mut self, feedback: Arc<dyn FeedbackStore>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn build(self) -> Result<ModelRouter> {
        let policy = self
            .policy
            .ok_or_else(|| Error::ConfigError("router requires a routing policy".to_string()))?;
        let invoker = self
            .invoker
            .ok_or_else(|| Error::ConfigError("router requires a model invoker".to_string()))?;
        Ok(ModelRouter {
            policy,
            invoker,
            feedback: self.feedback,
        })
    }
}
