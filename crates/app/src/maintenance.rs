use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sqgate_core::{Clock, IdempotentExecutor};
use sqgate_square::Payment;
use sqgate_storage::Database;
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const TTL_HOURS: i64 = 72;
const BATCH_LIMIT: i64 = 1000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Background worker for ledger TTL deletion, idempotency purges and WAL checkpoints.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    payments: Arc<IdempotentExecutor<Payment>>,
    clock: Clock,
    interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub ledger_deleted: u64,
    pub ledger_busy: bool,
    pub idempotency_purged: usize,
}

impl MaintenanceWorker {
    pub fn new(database: Database, payments: Arc<IdempotentExecutor<Payment>>) -> Self {
        Self {
            database,
            payments,
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Overrides the clock used for determining TTL thresholds.
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
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle.
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let idempotency_purged = self.payments.purge_expired();
        if idempotency_purged > 0 {
            debug!(
                stage = "idempotency",
                purged = idempotency_purged,
                remaining = self.payments.len(),
                "expired idempotency entries purged"
            );
        }

        let now = (self.clock)();
        let threshold = now - ChronoDuration::hours(TTL_HOURS);
        let (ledger_deleted, ledger_busy) = self.sweep_ledger(threshold).await?;
        info!(
            stage = "storage",
            table = "webhook_events",
            deleted = ledger_deleted,
            busy = ledger_busy,
            threshold = %threshold.to_rfc3339(),
            "ledger TTL sweep completed"
        );

        self.run_checkpoint().await?;

        Ok(MaintenanceReport {
            ledger_deleted,
            ledger_busy,
            idempotency_purged,
        })
    }

    async fn sweep_ledger(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<(u64, bool), MaintenanceError> {
        let ledger = self.database.event_ledger();
        let mut total_deleted = 0u64;

        loop {
            match ledger.delete_older_than_batch(threshold, BATCH_LIMIT).await {
                Ok(0) => break,
                Ok(batch_deleted) => {
                    total_deleted += batch_deleted;
                    counter!("ledger_ttl_deleted_total").increment(batch_deleted);
                }
                Err(err) if is_sqlite_busy(&err) => {
                    counter!("db_busy_total", "op" => "ttl").increment(1);
                    warn!(stage = "storage", error = %err, "ttl delete hit busy timeout");
                    return Ok((total_deleted, true));
                }
                Err(err) => return Err(MaintenanceError::TtlDelete { source: err }),
            }
        }

        Ok((total_deleted, false))
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
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
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired ledger rows")]
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
