use std::time::Duration;

use metrics::{counter, histogram};
use redeem_ledger_storage::Database;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::router::{system_clock, Clock};

const BATCH_LIMIT: i64 = 1000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker that purges expired ephemeral keys and checkpoints the WAL.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    clock: Clock,
    interval: Duration,
}

/// Counters from one maintenance cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_deleted: u64,
    pub busy: bool,
}

impl MaintenanceWorker {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            clock: system_clock(),
            interval: DEFAULT_INTERVAL,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
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
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(report) => debug!(
                    stage = "storage",
                    deleted = report.expired_deleted,
                    busy = report.busy,
                    "maintenance run finished"
                ),
                Err(err) => error!(stage = "storage", error = %err, "maintenance run failed"),
            }
        }
    }

    /// Executes one maintenance cycle (TTL sweep + checkpoint).
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let now = (self.clock)();
        let mut report = MaintenanceReport::default();

        loop {
            match self
                .database
                .ephemeral()
                .delete_expired_batch(now, BATCH_LIMIT)
                .await
            {
                Ok(0) => break,
                Ok(deleted) => {
                    report.expired_deleted += deleted;
                    counter!("ephemeral_ttl_deleted_total").increment(deleted);
                }
                Err(err) if is_sqlite_busy(&err) => {
                    report.busy = true;
                    counter!("db_busy_total", "op" => "ttl").increment(1);
                    warn!(stage = "storage", error = %err, "ttl sweep hit busy timeout");
                    break;
                }
                Err(err) => return Err(MaintenanceError::TtlDelete { source: err }),
            }
        }

        if report.expired_deleted > 0 {
            info!(
                stage = "storage",
                deleted = report.expired_deleted,
                "expired ephemeral keys removed"
            );
        }

        if self.run_checkpoint().await? {
            report.busy = true;
        }

        Ok(report)
    }

    /// Returns `true` when the checkpoint could not complete because of readers/writers.
    async fn run_checkpoint(&self) -> Result<bool, MaintenanceError> {
        let start = std::time::Instant::now();

        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                if stats.busy_frames > 0 {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                    return Ok(true);
                }
                debug!(
                    stage = "storage",
                    log_frames = stats.log_frames,
                    checkpointed_frames = stats.checkpointed_frames,
                    duration_secs = duration,
                    "WAL checkpoint completed"
                );
                Ok(false)
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                Ok(true)
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired ephemeral keys")]
    TtlDelete {
        #[source]
        source: SqlxError,
    },
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
