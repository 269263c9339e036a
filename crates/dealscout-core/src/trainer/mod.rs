//! Self-learning loop
//!
//! The trainer folds new feedback records into running totals, derives new
//! scoring weights from labelled outcomes and a routing bias from backend
//! success rates, and publishes both as one [`WeightSet`](crate::weights::WeightSet).
//!
//! A cycle runs on a fixed interval, when enough new records have been
//! appended, or on demand through [`TrainerLoop::run_once`]. Cycles never
//! overlap. A cycle that cannot produce a valid update is skipped and the
//! active weights stay as they were.

mod accumulator;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TrainerConfig;
use crate::error::{Error, Result};
use crate::feedback::FeedbackStore;
use crate::storage::WeightArchive;
use crate::weights::WeightStore;

use accumulator::Accumulator;

/// Where the trainer is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerState {
    Idle,
    Collecting,
    Computing,
    Publishing,
}

impl std::fmt::Display for TrainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Collecting => write!(f, "collecting"),
            Self::Computing => write!(f, "computing"),
            Self::Publishing => write!(f, "publishing"),
        }
    }
}

/// Result of one training cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrainerRun {
    /// A new weight set became active
    Published {
        epoch: u64,
        /// Closed mean minus dead mean per feature
        deltas: BTreeMap<String, f64>,
    },
    /// Nothing was published
    Skipped { reason: String },
}

impl TrainerRun {
    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::Published { epoch, .. } => Some(*epoch),
            Self::Skipped { .. } => None,
        }
    }
}

/// Background learner over a feedback store and a weight store
pub struct TrainerLoop {
    feedback: Arc<dyn FeedbackStore>,
    weights: Arc<WeightStore>,
    archive: Option<WeightArchive>,
    config: TrainerConfig,
    state: StdMutex<TrainerState>,
    /// Held for the whole cycle so cycles never overlap
    totals: Mutex<Accumulator>,
    wake: Notify,
    pending: AtomicU64,
}

impl std::fmt::Debug for TrainerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainerLoop")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("archived", &self.archive.is_some())
            .finish()
    }
}

impl TrainerLoop {
    pub fn new(
        feedback: Arc<dyn FeedbackStore>,
        weights: Arc<WeightStore>,
        config: TrainerConfig,
    ) -> Self {
        Self {
            feedback,
            weights,
            archive: None,
            config,
            state: StdMutex::new(TrainerState::Idle),
            totals: Mutex::new(Accumulator::default()),
            wake: Notify::new(),
            pending: AtomicU64::new(0),
        }
    }

    /// Persist every published weight set
    pub fn with_archive(mut self, archive: WeightArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn state(&self) -> TrainerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    fn set_state(&self, state: TrainerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Tell the loop that `count` records were appended
    ///
    /// Wakes [`TrainerLoop::run`] early once `trigger_after_records` new
    /// records have accumulated since the last cycle.
    pub fn notify_appended(&self, count: u64) {
        let trigger = self.config.trigger_after_records;
        if trigger == 0 {
            return;
        }
        let pending = self.pending.fetch_add(count, Ordering::AcqRel) + count;
        if pending >= trigger {
            debug!(pending, "Waking trainer");
            self.wake.notify_one();
        }
    }

    /// Run one full cycle
    ///
    /// Returns `Skipped` when there are too few labelled outcomes or the
    /// computed update is invalid; any other failure is returned as an error.
    pub async fn run_once(&self) -> Result<TrainerRun> {
        let mut totals = self.totals.lock().await;
        let result = self.cycle(&mut totals).await;
        self.set_state(TrainerState::Idle);

        match result {
            Ok(run) => Ok(run),
            Err(e @ (Error::InsufficientFeedback { .. } | Error::InvalidWeightUpdate(_))) => {
                debug!(reason = %e, "Training cycle skipped");
                Ok(TrainerRun::Skipped {
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn cycle(&self, totals: &mut Accumulator) -> Result<TrainerRun> {
        self.set_state(TrainerState::Collecting);
        self.pending.store(0, Ordering::Release);

        if totals.label_floor.is_none() {
            let floor = match &self.archive {
                Some(archive) => archive.trained_through().await?,
                None => 0,
            };
            totals.label_floor = Some(floor);
        }

        let head = self.feedback.head().await?;
        let mut stream = self.feedback.snapshot(totals.cursor).await?;
        let mut folded = 0usize;
        while let Some(item) = stream.next().await {
            match item {
                Ok(record) => {
                    if record.seq > head {
                        break;
                    }
                    let seq = record.seq;
                    totals.ingest(record);
                    totals.cursor = seq;
                    folded += 1;
                }
                Err(Error::DatabaseError(e)) => return Err(Error::DatabaseError(e)),
                Err(e) => warn!(error = %e, "Skipping unreadable feedback record"),
            }
        }
        debug!(folded, cursor = totals.cursor, "Collected feedback");

        self.set_state(TrainerState::Computing);
        let active = self.weights.active();
        let update = totals.compute(&active, &self.config)?;
        let bias = totals.routing_bias(&self.config);

        self.set_state(TrainerState::Publishing);
        // Persist before serving so a failed write leaves the active set and
        // the pending labels as they were
        let pending = self.weights.prepare(update.weights, bias)?;
        if let Some(archive) = &self.archive {
            archive.publish_trained(&pending, totals.cursor).await?;
        }
        let published = self.weights.commit(pending)?;
        let labels = totals.pending_labels();
        totals.consume_labels();

        info!(
            epoch = published.epoch(),
            labels,
            from = active.epoch(),
            "Trainer published weights"
        );
        Ok(TrainerRun::Published {
            epoch: published.epoch(),
            deltas: update.deltas,
        })
    }

    /// Run cycles until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        info!(interval_secs = period.as_secs(), "Trainer started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            match self.run_once().await {
                Ok(TrainerRun::Published { epoch, .. }) => debug!(epoch, "Cycle published"),
                Ok(TrainerRun::Skipped { reason }) => debug!(reason = %reason, "Cycle skipped"),
                Err(e) => error!(error = %e, code = e.code(), "Training cycle failed"),
            }
        }
        info!("Trainer stopped");
    }
}
