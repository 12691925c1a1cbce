use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use shop_pulse_storage::{Database, EventError};
use shop_pulse_util::ReplaySettings;

use crate::ingest::{IngestError, IngestJob, IngestWorker};

const REPLAY_BATCH_LIMIT: i64 = 100;
const MIN_REPLAY_INTERVAL: Duration = Duration::from_secs(1);

/// Background worker that retries unprocessed events and checkpoints the WAL.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    worker: IngestWorker,
    settings: ReplaySettings,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl MaintenanceWorker {
    pub fn new(database: Database, worker: IngestWorker, settings: ReplaySettings) -> Self {
        Self {
            database,
            worker,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    /// Overrides the clock used for the grace-period cutoff.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.settings.interval.max(MIN_REPLAY_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "replay", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle (replay + checkpoint).
    pub async fn run_once(&self) -> Result<ReplaySummary, MaintenanceError> {
        let summary = self.replay_pending().await?;
        self.run_checkpoint().await?;
        Ok(summary)
    }

    async fn replay_pending(&self) -> Result<ReplaySummary, MaintenanceError> {
        let now = (self.clock)();
        let grace = ChronoDuration::from_std(self.settings.grace)
            .unwrap_or_else(|_| ChronoDuration::zero());
        let cutoff = now - grace;

        let pending = self
            .database
            .events()
            .list_pending(cutoff, self.settings.max_attempts, REPLAY_BATCH_LIMIT)
            .await?;

        let mut summary = ReplaySummary::default();
        for event in pending {
            let result = match IngestJob::from_stored(&event) {
                Ok(job) => self.worker.process(job).await,
                Err(err) => {
                    self.database
                        .events()
                        .record_failure(&event.id, &err.to_string())
                        .await?;
                    Err(IngestError::StoredPayload(err))
                }
            };

            match result {
                Ok(_) => {
                    summary.succeeded += 1;
                    counter!("replay_events_total", "result" => "succeeded").increment(1);
                }
                Err(err) => {
                    summary.failed += 1;
                    counter!("replay_events_total", "result" => "failed").increment(1);
                    warn!(
                        stage = "replay",
                        event_id = %event.id,
                        attempts = event.attempts + 1,
                        error = %err,
                        "replayed event failed again"
                    );
                }
            }
        }

        if summary.attempted() > 0 {
            info!(
                stage = "replay",
                succeeded = summary.succeeded,
                failed = summary.failed,
                cutoff = %cutoff.to_rfc3339(),
                "replay sweep completed"
            );
        }
        Ok(summary)
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = Instant::now();

        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                if stats.busy_frames > 0 {
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
                Ok(())
            }
            Err(err) if is_sqlite_busy(&err) => {
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }
}

/// Counts from one replay sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub succeeded: u64,
    pub failed: u64,
}

impl ReplaySummary {
    pub fn attempted(&self) -> u64 {
        self.succeeded + self.failed
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to load pending events: {0}")]
    Pending(#[from] EventError),
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
