//! Bounded, retried backend calls

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::backend::ModelBackend;
use super::retry::RetryPolicy;
use super::types::{CallOptions, InvocationRequest, InvocationResult};
use crate::error::{Error, Result};
use crate::feedback::{FeedbackEvent, FeedbackStore, InvocationFeedback};
use crate::registry::ModelDescriptor;

/// Executes calls against one model with timeouts, cancellation and retries
///
/// Every call, successful or not, is recorded as an invocation feedback
/// event. Failing to record feedback never fails the call.
pub struct ModelInvoker {
    backend: Arc<dyn ModelBackend>,
    retry: RetryPolicy,
    feedback: Option<Arc<dyn FeedbackStore>>,
}

impl ModelInvoker {
    pub fn new(backend: Arc<dyn ModelBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            retry,
            feedback: None,
        }
    }

    /// Record invocation feedback to this store
    pub fn with_feedback(mut self, feedback: Arc<dyn FeedbackStore>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Call a model
    ///
    /// Transient failures are retried with backoff; once retries are
    /// exhausted the call fails with [`Error::BackendUnavailable`]. Other
    /// backend faults (see [`Error::is_backend_fault`]) fail the same way
    /// after a single attempt.
    /// Cancellation returns [`Error::Cancelled`] immediately and deadline
    /// expiry returns [`Error::Timeout`].
    pub async fn invoke(
        &self,
        model: &ModelDescriptor,
        request: &InvocationRequest,
        options: &CallOptions,
    ) -> Result<InvocationResult> {
        let started = Instant::now();
        let (result, attempts) = self.attempt_all(model, request, options).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        self.record(model, options, latency_ms, attempts, result.as_ref().err())
            .await;

        let output = result?;
        debug!(model = %model.id, latency_ms, attempts, "Invocation succeeded");
        Ok(InvocationResult {
            model_id: model.id.clone(),
            output,
            latency_ms,
            attempts,
        })
    }

    async fn attempt_all(
        &self,
        model: &ModelDescriptor,
        request: &InvocationRequest,
        options: &CallOptions,
    ) -> (Result<String>, u32) {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if options.cancel.is_cancelled() {
                return (Err(Error::Cancelled), attempt - 1);
            }

            let (budget, deadline_bound) = match attempt_budget(options) {
                Some(budget) => budget,
                None => return (Err(deadline_error(options)), attempt - 1),
            };

            let result = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => return (Err(Error::Cancelled), attempt),
                outcome = tokio::time::timeout(budget, self.backend.generate(model, request)) => {
                    match outcome {
                        Ok(result) => result,
                        Err(_) if deadline_bound => return (Err(deadline_error(options)), attempt),
                        Err(_) => Err(Error::Timeout(budget.as_millis() as u64)),
                    }
                }
            };

            let error = match result {
                Ok(output) => return (Ok(output), attempt),
                Err(e) if !e.is_transient() => {
                    if !e.is_backend_fault() {
                        return (Err(e), attempt);
                    }
                    warn!(model = %model.id, error = %e, "Backend failed without retry");
                    return (Err(unavailable(model, attempt, &e)), attempt);
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!(model = %model.id, attempts = attempt, error = %error, "Backend retries exhausted");
                return (Err(unavailable(model, attempt, &error)), attempt);
            }

            let suggested = match &error {
                Error::RateLimited(secs) => Duration::from_secs(*secs),
                _ => Duration::ZERO,
            };
            let delay = self.retry.backoff(attempt, suggested);
            if let Some(deadline) = options.deadline {
                if Instant::now() + delay >= deadline {
                    return (Err(deadline_error(options)), attempt);
                }
            }

            warn!(
                model = %model.id,
                attempt,
                wait_ms = delay.as_millis() as u64,
                error = %error,
                "Transient backend failure, retrying after backoff"
            );
            tokio::select! {
                biased;
                _ = options.cancel.cancelled() => return (Err(Error::Cancelled), attempt),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn record(
        &self,
        model: &ModelDescriptor,
        options: &CallOptions,
        latency_ms: u64,
        attempts: u32,
        error: Option<&Error>,
    ) {
        let Some(store) = &self.feedback else {
            return;
        };
        let event = FeedbackEvent::Invocation(InvocationFeedback {
            decision_id: options.decision_id,
            model_id: model.id.clone(),
            task_type: options.task_type.as_ref().map(|t| t.to_string()),
            latency_ms,
            attempts,
            error: error.map(|e| e.to_string()),
        });
        if let Err(e) = store.append(event).await {
            warn!(model = %model.id, error = %e, "Failed to record invocation feedback");
        }
    }
}

/// Time allowed for the next attempt, and whether the call deadline is what bounds it
fn attempt_budget(options: &CallOptions) -> Option<(Duration, bool)> {
    match options.deadline {
        None => Some((options.timeout, false)),
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                None
            } else if remaining < options.timeout {
                Some((remaining, true))
            } else {
                Some((options.timeout, false))
            }
        }
    }
}

fn unavailable(model: &ModelDescriptor, attempts: u32, last_error: &Error) -> Error {
    Error::BackendUnavailable {
        model: model.id.clone(),
        attempts,
        last_error: last_error.to_string(),
    }
}

fn deadline_error(options: &CallOptions) -> Error {
    Error::Timeout(options.timeout.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use futures_util::TryStreamExt;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::feedback::{FeedbackRecord, InMemoryFeedbackStore};
    use crate::registry::Provider;

    enum Step {
        Reply(&'static str),
        Fail(fn() -> Error),
        Hang,
    }

    /// Backend that plays back a fixed script, one step per call
    struct ScriptedBackend {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn generate(&self, _: &ModelDescriptor, _: &InvocationRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(text)) => Ok(text.to_string()),
                Some(Step::Fail(make)) => Err(make()),
                Some(Step::Hang) | None => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok("late".to_string())
                }
            }
        }
    }

    fn unavailable() -> Error {
        Error::BackendStatus {
            status: 503,
            body: "overloaded".to_string(),
        }
    }

    fn rejected() -> Error {
        Error::BackendRejected {
            status: 400,
            body: "bad request".to_string(),
        }
    }

    fn model() -> ModelDescriptor {
        ModelDescriptor::new(
            "mistral-7b",
            Provider::Ollama {
                base_url: "http://localhost:11434".to_string(),
                model: "mistral".to_string(),
            },
        )
        .with_capabilities(["classify"])
    }

    fn retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
        }
    }

    async fn recorded(store: &InMemoryFeedbackStore) -> Vec<InvocationFeedback> {
        let records: Vec<FeedbackRecord> = store.snapshot(0).await.unwrap().try_collect().await.unwrap();
        records
            .into_iter()
            .filter_map(|r| match r.event {
                FeedbackEvent::Invocation(inv) => Some(inv),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures_then_succeeds() {
        let backend = ScriptedBackend::new(vec![
            Step::Fail(unavailable),
            Step::Fail(unavailable),
            Step::Reply("ok"),
        ]);
        let store = Arc::new(InMemoryFeedbackStore::new());
        let invoker = ModelInvoker::new(backend.clone(), retry()).with_feedback(store.clone());

        let result = invoker
            .invoke(&model(), &InvocationRequest::new("hi"), &CallOptions::new(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(result.output, "ok");
        assert_eq!(result.attempts, 3);
        assert_eq!(backend.calls(), 3);

        let feedback = recorded(&store).await;
        assert_eq!(feedback.len(), 1);
        assert!(feedback[0].succeeded());
        assert_eq!(feedback[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_yield_backend_unavailable() {
        let backend = ScriptedBackend::new(vec![
            Step::Fail(unavailable),
            Step::Fail(unavailable),
            Step::Fail(unavailable),
            Step::Reply("never reached"),
        ]);
        let store = Arc::new(InMemoryFeedbackStore::new());
        let invoker = ModelInvoker::new(backend.clone(), retry()).with_feedback(store.clone());

        let err = invoker
            .invoke(&model(), &InvocationRequest::new("hi"), &CallOptions::new(Duration::from_secs(5)))
            .await
            .unwrap_err();

        match err {
            Error::BackendUnavailable { model, attempts, .. } => {
                assert_eq!(model, "mistral-7b");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected BackendUnavailable, got {:?}", other),
        }
        assert_eq!(backend.calls(), 3);

        let feedback = recorded(&store).await;
        assert_eq!(feedback.len(), 1);
        assert!(!feedback[0].succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_failure_is_not_retried() {
        let backend = ScriptedBackend::new(vec![Step::Fail(rejected), Step::Reply("ok")]);
        let invoker = ModelInvoker::new(backend.clone(), retry());

        let err = invoker
            .invoke(&model(), &InvocationRequest::new("hi"), &CallOptions::new(Duration::from_secs(5)))
            .await
            .unwrap_err();

        match err {
            Error::BackendUnavailable {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("400"));
            }
            other => panic!("expected BackendUnavailable, got {:?}", other),
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credentials_make_backend_unavailable() {
        let backend = ScriptedBackend::new(vec![Step::Fail(|| {
            Error::ConfigError("API key environment variable OPENAI_API_KEY is not set".to_string())
        })]);
        let invoker = ModelInvoker::new(backend.clone(), retry());

        let err = invoker
            .invoke(&model(), &InvocationRequest::new("hi"), &CallOptions::new(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::BackendUnavailable { attempts: 1, .. }));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let backend = ScriptedBackend::new(vec![Step::Hang, Step::Reply("second try")]);
        let invoker = ModelInvoker::new(backend.clone(), retry());

        let result = invoker
            .invoke(&model(), &InvocationRequest::new("hi"), &CallOptions::new(Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(result.output, "second try");
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry_returns_timeout() {
        let backend = ScriptedBackend::new(vec![Step::Hang]);
        let invoker = ModelInvoker::new(backend.clone(), retry());
        let options = CallOptions::new(Duration::from_secs(30))
            .with_deadline(Instant::now() + Duration::from_secs(1));

        let err = invoker
            .invoke(&model(), &InvocationRequest::new("hi"), &options)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_returns_immediately() {
        let backend = ScriptedBackend::new(vec![Step::Hang]);
        let store = Arc::new(InMemoryFeedbackStore::new());
        let invoker = ModelInvoker::new(backend.clone(), retry()).with_feedback(store.clone());
        let cancel = CancellationToken::new();
        let options = CallOptions::new(Duration::from_secs(60)).with_cancel(cancel.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let err = invoker
            .invoke(&model(), &InvocationRequest::new("hi"), &options)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(recorded(&store).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_makes_no_call() {
        let backend = ScriptedBackend::new(vec![Step::Reply("ok")]);
        let invoker = ModelInvoker::new(backend.clone(), retry());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = invoker
            .invoke(
                &model(),
                &InvocationRequest::new("hi"),
                &CallOptions::new(Duration::from_secs(5)).with_cancel(cancel),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled));
        assert_eq!(backend.calls(), 0);
    }
}
