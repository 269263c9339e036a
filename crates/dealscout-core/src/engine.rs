//! DealEngine - the operations collaborators call
//!
//! Wires the registry, weight store, feedback log, router, scorer and trainer
//! from one [`Config`]. The engine is `Send + Sync`; share it behind an `Arc`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::feedback::{
    FeedbackEvent, FeedbackRecord, FeedbackStore, FeedbackStream, InMemoryFeedbackStore, Outcome,
};
use crate::invoker::{HttpBackend, InvocationRequest, ModelBackend, ModelInvoker};
use crate::records::{PropertyRecords, build_score_input};
use crate::registry::{ModelDescriptor, ModelRegistry, TaskType};
use crate::routing::{ModelRouter, RouteOptions, RouteOutcome, RoutingPolicy};
use crate::scoring::{ScoreInput, ScoreResult, ScoringEngine};
use crate::storage::{Database, SqliteFeedbackStore, WeightArchive};
use crate::trainer::{TrainerLoop, TrainerRun};
use crate::weights::{WeightSet, WeightStore};

/// Outcome of scoring one address in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub address: String,
    pub score_id: Option<Uuid>,
    pub score: Option<f64>,
    pub error: Option<String>,
}

/// Summary of a [`DealEngine::score_batch`] run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub details: Vec<BatchItem>,
}

/// Feedback store that counts appends toward the trainer's early wake-up
struct TriggeringFeedback {
    inner: Arc<dyn FeedbackStore>,
    trainer: Arc<TrainerLoop>,
}

#[async_trait]
impl FeedbackStore for TriggeringFeedback {
    async fn append(&self, event: FeedbackEvent) -> Result<FeedbackRecord> {
        let record = self.inner.append(event).await?;
        self.trainer.notify_appended(1);
        Ok(record)
    }

    async fn head(&self) -> Result<u64> {
        self.inner.head().await
    }

    async fn snapshot(&self, since: u64) -> Result<FeedbackStream> {
        self.inner.snapshot(since).await
    }
}

/// Router, scorer and learning loop behind one handle
pub struct DealEngine {
    config: Config,
    registry: Arc<ModelRegistry>,
    weights: Arc<WeightStore>,
    feedback: Arc<dyn FeedbackStore>,
    records: Arc<dyn PropertyRecords>,
    router: ModelRouter,
    scorer: ScoringEngine,
    trainer: Arc<TrainerLoop>,
    archive: Option<WeightArchive>,
    database: Option<Database>,
}

impl std::fmt::Debug for DealEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DealEngine")
            .field("models", &self.registry.snapshot().len())
            .field("active_epoch", &self.weights.active().epoch())
            .field("persistent", &self.database.is_some())
            .finish()
    }
}

impl DealEngine {
    /// Open the engine against the configured SQLite database and HTTP backends
    pub async fn open(config: Config, records: Arc<dyn PropertyRecords>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        let path = config
            .database_path()
            .map_err(|e| Error::ConfigError(e.to_string()))?;

        let database = Database::open(&path).await?;
        let archive = WeightArchive::new(&database);
        let weights = archive
            .restore_or_init(WeightSet::baseline(config.scoring.weights.clone()))
            .await?;
        let feedback: Arc<dyn FeedbackStore> = Arc::new(SqliteFeedbackStore::new(&database));
        let backend: Arc<dyn ModelBackend> =
            Arc::new(HttpBackend::new(config.invoker.connect_timeout())?);

        info!(
            database = %path.display(),
            active_epoch = weights.active().epoch(),
            "Opened deal engine"
        );
        Self::assemble(
            config,
            records,
            feedback,
            Arc::new(weights),
            backend,
            Some((archive, database)),
        )
    }

    /// Engine with in-memory feedback and weights, calling `backend` for models
    pub fn in_memory(
        config: Config,
        records: Arc<dyn PropertyRecords>,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        let weights = WeightStore::new(WeightSet::baseline(config.scoring.weights.clone()));
        Self::assemble(
            config,
            records,
            Arc::new(InMemoryFeedbackStore::new()),
            Arc::new(weights),
            backend,
            None,
        )
    }

    fn assemble(
        config: Config,
        records: Arc<dyn PropertyRecords>,
        store: Arc<dyn FeedbackStore>,
        weights: Arc<WeightStore>,
        backend: Arc<dyn ModelBackend>,
        persistence: Option<(WeightArchive, Database)>,
    ) -> Result<Self> {
        let (archive, database) = match persistence {
            Some((archive, database)) => (Some(archive), Some(database)),
            None => (None, None),
        };

        let mut trainer = TrainerLoop::new(store.clone(), weights.clone(), config.trainer.clone());
        if let Some(archive) = &archive {
            trainer = trainer.with_archive(archive.clone());
        }
        let trainer = Arc::new(trainer);
        let feedback: Arc<dyn FeedbackStore> = Arc::new(TriggeringFeedback {
            inner: store,
            trainer: trainer.clone(),
        });

        let registry = Arc::new(ModelRegistry::new(config.models.clone())?);
        let policy = Arc::new(RoutingPolicy::new(
            registry.clone(),
            weights.clone(),
            &config.routing,
        ));
        let invoker = Arc::new(
            ModelInvoker::new(backend, config.invoker.retry_policy())
                .with_feedback(feedback.clone()),
        );
        let router = ModelRouter::builder()
            .policy(policy)
            .invoker(invoker)
            .feedback(feedback.clone())
            .build()?;
        let scorer = ScoringEngine::new(config.scoring.comp_price_ceiling)?;

        Ok(Self {
            config,
            registry,
            weights,
            feedback,
            records,
            router,
            scorer,
            trainer,
            archive,
            database,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn weights(&self) -> &Arc<WeightStore> {
        &self.weights
    }

    pub fn feedback(&self) -> &Arc<dyn FeedbackStore> {
        &self.feedback
    }

    pub fn trainer(&self) -> &Arc<TrainerLoop> {
        &self.trainer
    }

    /// Route options using the configured per-attempt timeout
    pub fn route_options(&self) -> RouteOptions {
        RouteOptions::default().with_timeout(self.config.invoker.timeout())
    }

    /// Models advertising `capability`, or the whole catalog
    pub fn models(&self, capability: Option<&str>) -> Result<Vec<ModelDescriptor>> {
        match capability {
            Some(name) => Ok(self.registry.list(&TaskType::new(name)?)),
            None => Ok(self.registry.snapshot().all().to_vec()),
        }
    }

    /// Route a task to a model and invoke it
    pub async fn route(
        &self,
        task_type: &str,
        request: &InvocationRequest,
        options: &RouteOptions,
    ) -> Result<RouteOutcome> {
        let task_type = TaskType::new(task_type)?;
        self.router.route(&task_type, request, options).await
    }

    /// Score an address from the record store as of a date
    pub async fn score(&self, address: &str, as_of: NaiveDate) -> Result<ScoreResult> {
        let input = build_score_input(self.records.as_ref(), address, as_of).await?;
        self.score_input(&input).await
    }

    /// Score a fully assembled input against the active weights
    pub async fn score_input(&self, input: &ScoreInput) -> Result<ScoreResult> {
        let weights = self.weights.active();
        let result = self.scorer.score(input, &weights)?;
        debug!(
            address = %result.address(),
            score = result.score(),
            epoch = result.weights_epoch(),
            "Scored lead"
        );

        if let Err(e) = self.feedback.append(FeedbackEvent::Score(result.clone())).await {
            warn!(score = %result.id(), error = %e, "Failed to record score");
        }
        Ok(result)
    }

    /// Record the real-world outcome for a score or routing decision
    pub async fn record_outcome(&self, subject_id: Uuid, outcome: Outcome) -> Result<FeedbackRecord> {
        let record = self
            .feedback
            .append(FeedbackEvent::Outcome {
                subject_id,
                outcome,
            })
            .await?;
        info!(subject = %subject_id, outcome = %outcome, seq = record.seq, "Recorded outcome");
        Ok(record)
    }

    /// Score many addresses; failures are collected instead of aborting
    pub async fn score_batch<S: AsRef<str>>(&self, addresses: &[S], as_of: NaiveDate) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for address in addresses {
            let address = address.as_ref();
            summary.processed += 1;
            let item = match self.score(address, as_of).await {
                Ok(result) => {
                    summary.success += 1;
                    BatchItem {
                        address: address.to_string(),
                        score_id: Some(result.id()),
                        score: Some(result.score()),
                        error: None,
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(address = %address, error = %e, "Failed to score address");
                    BatchItem {
                        address: address.to_string(),
                        score_id: None,
                        score: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            summary.details.push(item);
        }
        info!(
            processed = summary.processed,
            success = summary.success,
            failed = summary.failed,
            "Batch scoring complete"
        );
        summary
    }

    /// Run one training cycle now
    pub async fn train(&self) -> Result<TrainerRun> {
        self.trainer.run_once().await
    }

    /// Run the trainer in the background until `cancel` fires
    pub fn spawn_trainer(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let trainer = self.trainer.clone();
        tokio::spawn(async move { trainer.run(cancel).await })
    }

    /// Make an earlier weight set active again
    pub async fn rollback_weights(&self, epoch: u64) -> Result<Arc<WeightSet>> {
        if self.weights.get(epoch).is_none() {
            return Err(Error::WeightVersionNotFound(epoch));
        }
        // Persist the pointer first so memory never serves an unsaved choice
        if let Some(archive) = &self.archive {
            archive.set_active(epoch).await?;
        }
        self.weights.rollback(epoch)
    }

    /// Close the database pool, if any
    pub async fn close(&self) {
        if let Some(database) = &self.database {
            database.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tempfile::TempDir;

    use super::*;
    use crate::records::{InMemoryPropertyRecords, PropertyRecord};
    use crate::scoring::{DistressFlags, PropertyFeatures};

    struct EchoBackend {
        calls: AtomicU32,
        down: Vec<String>,
        keyless: Vec<String>,
    }

    impl EchoBackend {
        fn new(down: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                down: down.iter().map(|m| m.to_string()).collect(),
                keyless: Vec::new(),
            })
        }

        /// Backend whose cloud models have no API key configured
        fn without_key_for(models: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                down: Vec::new(),
                keyless: models.iter().map(|m| m.to_string()).collect(),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for EchoBackend {
        async fn generate(
            &self,
            model: &ModelDescriptor,
            request: &InvocationRequest,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.keyless.contains(&model.id) {
                return Err(Error::ConfigError(
                    "API key environment variable OPENAI_API_KEY is not set".to_string(),
                ));
            }
            if self.down.contains(&model.id) {
                return Err(Error::BackendStatus {
                    status: 503,
                    body: "down".to_string(),
                });
            }
            Ok(format!("{}: {}", model.id, request.prompt))
        }
    }

    fn as_of() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn records() -> Arc<InMemoryPropertyRecords> {
        let mut records = InMemoryPropertyRecords::new();
        for (address, flags) in [("1 Elm St", 5), ("2 Elm St", 0)] {
            records.insert_property(PropertyRecord {
                address: address.to_string(),
                zip: "30301".to_string(),
                features: PropertyFeatures {
                    ownership_years: Some(15.0),
                    distress: DistressFlags {
                        vacant: flags > 0,
                        absentee_owner: flags > 1,
                        preforeclosure: flags > 2,
                        tax_delinquent: flags > 3,
                        liens: flags > 4,
                        inherited: false,
                    },
                    ..PropertyFeatures::default()
                },
            });
        }
        Arc::new(records)
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.invoker.max_retries = 0;
        config.trainer.min_samples = 2;
        config
    }

    #[tokio::test]
    async fn test_route_falls_back_and_records_feedback() {
        let backend = EchoBackend::new(&["gpt-4o"]);
        let engine = DealEngine::in_memory(config(), records(), backend.clone()).unwrap();

        let request = InvocationRequest::new("is this seller motivated?");
        let outcome = engine
            .route("Classify", &request, &engine.route_options())
            .await
            .unwrap();
        assert_eq!(outcome.result.model_id, "mistral-7b");
        assert_eq!(outcome.decisions.len(), 2);
        // 2 decisions + 2 invocations
        assert_eq!(engine.feedback().head().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_route_skips_model_without_credentials() {
        let backend = EchoBackend::without_key_for(&["gpt-4o"]);
        let engine = DealEngine::in_memory(config(), records(), backend.clone()).unwrap();

        let outcome = engine
            .route("classify", &InvocationRequest::new("stop texting me"), &engine.route_options())
            .await
            .unwrap();
        assert_eq!(outcome.result.model_id, "mistral-7b");
        assert_eq!(
            outcome.final_decision().unwrap().fallback_chain(),
            ["gpt-4o".to_string()]
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_task_type_is_rejected() {
        let engine = DealEngine::in_memory(config(), records(), EchoBackend::new(&[])).unwrap();
        let result = engine
            .route("  ", &InvocationRequest::new("hi"), &engine.route_options())
            .await;
        assert!(matches!(result, Err(Error::InvalidTaskType(_))));
    }

    #[tokio::test]
    async fn test_score_outcome_train_cycle() {
        let engine = DealEngine::in_memory(config(), records(), EchoBackend::new(&[])).unwrap();
        let hot = engine.score("1 Elm St", as_of()).await.unwrap();
        let cold = engine.score("2 elm st", as_of()).await.unwrap();
        assert!(hot.score() > cold.score());

        engine.record_outcome(hot.id(), Outcome::Closed).await.unwrap();
        engine.record_outcome(cold.id(), Outcome::Dead).await.unwrap();

        let run = engine.train().await.unwrap();
        assert_eq!(run.epoch(), Some(1));

        let rescored = engine.score("1 Elm St", as_of()).await.unwrap();
        assert_eq!(rescored.weights_epoch(), 1);
        assert_ne!(rescored.id(), hot.id());
    }

    #[tokio::test]
    async fn test_score_batch_collects_failures() {
        let engine = DealEngine::in_memory(config(), records(), EchoBackend::new(&[])).unwrap();
        let summary = engine
            .score_batch(&["1 Elm St", "404 Missing Way", "2 Elm St"], as_of())
            .await;
        assert_eq!(
            (summary.processed, summary.success, summary.failed),
            (3, 2, 1)
        );
        assert!(summary.details[1].error.as_deref().unwrap().contains("404 Missing Way"));
        assert!(summary.details[0].score.is_some());
    }

    #[tokio::test]
    async fn test_open_persists_weights_across_restarts() {
        let dir = TempDir::new().unwrap();
        let mut config = config();
        config.storage.database_path = Some(dir.path().join("dealscout.db"));

        {
            let engine = DealEngine::open(config.clone(), records()).await.unwrap();
            let hot = engine.score("1 Elm St", as_of()).await.unwrap();
            let cold = engine.score("2 Elm St", as_of()).await.unwrap();
            engine.record_outcome(hot.id(), Outcome::Closed).await.unwrap();
            engine.record_outcome(cold.id(), Outcome::OptOut).await.unwrap();
            assert_eq!(engine.train().await.unwrap().epoch(), Some(1));
            engine.close().await;
        }

        let engine = DealEngine::open(config, records()).await.unwrap();
        assert_eq!(engine.weights().active().epoch(), 1);
        assert_eq!(engine.feedback().head().await.unwrap(), 4);
        // Outcomes applied before the restart are not applied again
        assert!(matches!(engine.train().await.unwrap(), TrainerRun::Skipped { .. }));

        engine.rollback_weights(0).await.unwrap();
        engine.close().await;
        let engine = DealEngine::open(engine.config().clone(), records()).await.unwrap();
        assert_eq!(engine.weights().active().epoch(), 0);
        assert!(matches!(
            engine.rollback_weights(9).await,
            Err(Error::WeightVersionNotFound(9))
        ));
    }

    #[test]
    fn test_models_by_capability() {
        let engine = DealEngine::in_memory(config(), records(), EchoBackend::new(&[])).unwrap();
        let sms: Vec<String> = engine
            .models(Some("sms"))
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert!(sms.contains(&"phi3".to_string()));
        assert!(!sms.contains(&"mistral-7b".to_string()));
        assert_eq!(engine.models(None).unwrap().len(), 3);
    }
}
