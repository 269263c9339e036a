//! Routing decision types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::TaskType;

/// Why a model was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    /// Configured default model for the task type
    TaskDefault,
    /// Input exceeded the long-input threshold
    LongInput,
    /// Best effective priority among capable models
    Priority,
    /// Preferred or earlier models were unavailable or already attempted
    Fallback,
}

impl std::fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskDefault => write!(f, "task_default"),
            Self::LongInput => write!(f, "long_input"),
            Self::Priority => write!(f, "priority"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Request-scoped inputs to a routing decision
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Length of the request input in characters
    pub input_chars: usize,
    /// Models already attempted for this request
    pub exclude: Vec<String>,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the context from the request input
    pub fn with_input(mut self, input: &str) -> Self {
        self.input_chars = input.chars().count();
        self
    }

    pub fn with_input_chars(mut self, chars: usize) -> Self {
        self.input_chars = chars;
        self
    }

    /// Exclude a model from consideration
    pub fn excluding(mut self, model_id: impl Into<String>) -> Self {
        self.exclude.push(model_id.into());
        self
    }

    pub fn is_excluded(&self, model_id: &str) -> bool {
        self.exclude.iter().any(|m| m == model_id)
    }
}

/// The outcome of one routing decision
///
/// Immutable after creation and appended to the feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    id: Uuid,
    task_type: TaskType,
    model_id: String,
    decided_at: DateTime<Utc>,
    fallback_chain: Vec<String>,
    reason: RoutingReason,
}

impl RoutingDecision {
    pub(crate) fn new(
        task_type: TaskType,
        model_id: impl Into<String>,
        fallback_chain: Vec<String>,
        reason: RoutingReason,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            model_id: model_id.into(),
            decided_at: Utc::now(),
            fallback_chain,
            reason,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Chosen model
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn decided_at(&self) -> DateTime<Utc> {
        self.decided_at
    }

    /// Models skipped or already attempted before the chosen one
    pub fn fallback_chain(&self) -> &[String] {
        &self.fallback_chain
    }

    pub fn reason(&self) -> RoutingReason {
        self.reason
    }
}
