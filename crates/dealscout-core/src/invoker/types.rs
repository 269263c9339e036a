//! Request and response types for backend calls

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::registry::TaskType;

/// A generation request sent to a model backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub prompt: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl InvocationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Total input length in characters, used for long-input routing
    pub fn input_chars(&self) -> usize {
        self.prompt.chars().count() + self.system.as_deref().map_or(0, |s| s.chars().count())
    }
}

/// A successful backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub model_id: String,
    pub output: String,
    pub latency_ms: u64,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Per-call bounds and attribution
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Bound on each individual attempt
    pub timeout: Duration,
    /// Bound on the whole call, retries included
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
    /// Routing decision this call serves
    pub decision_id: Option<Uuid>,
    pub task_type: Option<TaskType>,
}

impl CallOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
            cancel: CancellationToken::new(),
            decision_id: None,
            task_type: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_decision(mut self, decision_id: Uuid, task_type: TaskType) -> Self {
        self.decision_id = Some(decision_id);
        self.task_type = Some(task_type);
        self
    }
}
