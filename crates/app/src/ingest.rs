use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Semaphore,
};
use tracing::{error, info, warn};

use shop_pulse_core::{
    normalizer::{Normalizer, NormalizerError},
    types::TopicFamily,
};
use shop_pulse_storage::{Database, EventError, StoredEvent};

use crate::engine::{ApplyOutcome, EngineError, UpsertEngine};

/// A persisted webhook waiting to be applied.
#[derive(Debug, Clone)]
pub struct IngestJob {
    pub event_id: String,
    pub tenant_id: String,
    pub topic: String,
    pub payload: Value,
}

impl IngestJob {
    /// Rebuilds a job from the stored raw event, used by the replay sweep.
    pub fn from_stored(event: &StoredEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: event.id.clone(),
            tenant_id: event.tenant_id.clone(),
            topic: event.topic.clone(),
            payload: serde_json::from_str(&event.payload)?,
        })
    }
}

/// Bounded hand-off between the webhook handler and [`IngestWorker`].
#[derive(Clone)]
pub struct IngestQueue {
    sender: mpsc::Sender<IngestJob>,
}

impl IngestQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<IngestJob>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queues the job without waiting.
    ///
    /// A full or closed queue is not an error for the caller: the event is
    /// already stored unprocessed and the replay sweep will pick it up.
    pub fn enqueue(&self, job: IngestJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                counter!("ingest_queue_full_total").increment(1);
                warn!(
                    stage = "ingress",
                    event_id = %job.event_id,
                    "ingest queue full; event left for replay"
                );
                false
            }
            Err(TrySendError::Closed(job)) => {
                counter!("ingest_queue_full_total").increment(1);
                error!(
                    stage = "ingress",
                    event_id = %job.event_id,
                    "ingest worker stopped; event left for replay"
                );
                false
            }
        }
    }
}

/// Applies queued events and records the outcome on the raw event row.
#[derive(Clone)]
pub struct IngestWorker {
    database: Database,
    engine: UpsertEngine,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl IngestWorker {
    pub fn new(database: Database) -> Self {
        Self {
            engine: UpsertEngine::new(database.clone()),
            database,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.engine = self.engine.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    /// Drains the queue, running every job on its own task so one failing
    /// delivery cannot stall or crash the others.
    ///
    /// At most `concurrency` jobs run at once. Further jobs wait in the
    /// channel, so a burst beyond its capacity is left for the replay sweep.
    pub fn spawn(
        self,
        mut receiver: mpsc::Receiver<IngestJob>,
        concurrency: usize,
    ) -> tokio::task::JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        tokio::spawn(async move {
            loop {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let Some(job) = receiver.recv().await else {
                    break;
                };
                let worker = self.clone();
                tokio::spawn(async move {
                    // Failures are already logged and stored on the event.
                    let _ = worker.process(job).await;
                    drop(permit);
                });
            }
            info!(stage = "worker", "ingest queue closed; worker exiting");
        })
    }

    pub async fn process(&self, job: IngestJob) -> Result<ApplyOutcome, IngestError> {
        let start = Instant::now();
        let events = self.database.events();

        match self.apply(&job).await {
            Ok(outcome) => {
                events.mark_processed(&job.event_id, (self.clock)()).await?;
                counter!(
                    "ingest_processed_total",
                    "entity" => outcome.entity(),
                    "result" => outcome.result_label()
                )
                .increment(1);
                info!(
                    stage = "worker",
                    event_id = %job.event_id,
                    tenant_id = %job.tenant_id,
                    topic = %job.topic,
                    entity = outcome.entity(),
                    result = outcome.result_label(),
                    latency_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "event processed"
                );
                Ok(outcome)
            }
            Err(err) => {
                let entity = TopicFamily::classify(&job.topic).as_str();
                counter!("ingest_processed_total", "entity" => entity, "result" => "failed")
                    .increment(1);
                error!(
                    stage = "worker",
                    event_id = %job.event_id,
                    tenant_id = %job.tenant_id,
                    topic = %job.topic,
                    conflict = err.is_conflict(),
                    error = %err,
                    "event processing failed"
                );
                if let Err(record_err) = events.record_failure(&job.event_id, &err.to_string()).await
                {
                    error!(
                        stage = "worker",
                        event_id = %job.event_id,
                        error = %record_err,
                        "failed to record processing failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn apply(&self, job: &IngestJob) -> Result<ApplyOutcome, IngestError> {
        let normalized = Normalizer::normalize(&job.topic, &job.payload)?;
        Ok(self.engine.apply(&job.tenant_id, &normalized).await?)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to normalize payload: {0}")]
    Normalize(#[from] NormalizerError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to update event: {0}")]
    Event(#[from] EventError),
    #[error("stored payload is not valid JSON: {0}")]
    StoredPayload(#[from] serde_json::Error),
}

impl IngestError {
    /// True when a uniqueness constraint other than the upsert key rejected the write.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Engine(err) if err.is_conflict())
    }
}
