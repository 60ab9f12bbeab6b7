use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

use sqgate_core::{IntegrationError, PersistenceCode, RetryDecision};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the webhook event ledger.
    pub fn event_ledger(&self) -> EventLedger {
        EventLedger {
            pool: self.pool.clone(),
        }
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counts.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy_frames: row.try_get::<i64, _>(0)?,
            log_frames: row.try_get::<i64, _>(1)?,
            checkpointed_frames: row.try_get::<i64, _>(2)?,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Result row of a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Maps a sqlx error onto the persistence codes the retry classifier understands.
pub fn persistence_code(err: &sqlx::Error) -> PersistenceCode {
    match err {
        sqlx::Error::RowNotFound => PersistenceCode::RecordNotFound,
        sqlx::Error::PoolTimedOut => PersistenceCode::PoolExhausted,
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed | sqlx::Error::Io(_) => {
            PersistenceCode::ConnectionClosed
        }
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some("2067") | Some("1555") => PersistenceCode::UniqueViolation,
            Some("787") => PersistenceCode::ForeignKeyViolation,
            // SQLITE_BUSY and SQLITE_LOCKED with their extended codes.
            Some("5") | Some("6") | Some("261") | Some("262") | Some("517") => {
                PersistenceCode::ConnectionTimeout
            }
            _ => PersistenceCode::Unknown,
        },
        _ => PersistenceCode::Unknown,
    }
}

/// Processing state of a ledger row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// A delivery currently owns the event.
    Processing,
    Processed,
    /// Permanently failed; kept for manual replay.
    Failed,
    /// Retries were exhausted and the provider was asked to redeliver.
    Deferred,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
            Self::Deferred => "deferred",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            "deferred" => Some(Self::Deferred),
            _ => None,
        }
    }

    /// Terminal states are never processed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Failed)
    }
}

/// Repository for the `webhook_events` and `webhook_attempts` tables.
#[derive(Clone)]
pub struct EventLedger {
    pool: SqlitePool,
}

/// Result of attempting to insert into `webhook_events`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerInsertOutcome {
    Inserted,
    Duplicate,
}

impl LedgerInsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Data required to record an admitted webhook.
#[derive(Clone)]
pub struct NewWebhookEvent<'a> {
    pub event_id: Cow<'a, str>,
    pub webhook_id: Cow<'a, str>,
    pub event_type: Cow<'a, str>,
    pub merchant_id: Cow<'a, str>,
    pub environment: &'a str,
    pub payload_json: Cow<'a, str>,
    pub created_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// One processing attempt and, for failures, the retry decision taken.
pub struct NewAttempt<'a> {
    pub event_id: &'a str,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub error: Option<&'a str>,
    pub decision: Option<&'a RetryDecision>,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredWebhookEvent {
    pub event_id: String,
    pub webhook_id: String,
    pub event_type: String,
    pub merchant_id: String,
    pub environment: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub received_at: String,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttempt {
    pub attempt: u32,
    pub outcome: String,
    pub error: Option<String>,
    pub should_retry: Option<bool>,
    pub retry_delay_ms: Option<i64>,
    pub retry_category: Option<String>,
}

/// Error type for ledger operations.
#[derive(Debug, Error)]
pub enum EventLedgerError {
    #[error("ledger row has unknown status {0:?}")]
    CorruptStatus(String),
    #[error("failed to decode stored payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<EventLedgerError> for IntegrationError {
    fn from(err: EventLedgerError) -> Self {
        let code = match &err {
            EventLedgerError::Database(db_err) => persistence_code(db_err),
            EventLedgerError::CorruptStatus(_) | EventLedgerError::Decode(_) => {
                PersistenceCode::Unknown
            }
        };
        IntegrationError::Persistence {
            code,
            message: err.to_string(),
        }
    }
}

impl EventLedger {
    /// Inserts an admitted event, claimed for processing by the caller.
    ///
    /// A second delivery of the same `event_id` yields
    /// [`LedgerInsertOutcome::Duplicate`] instead of an error.
    pub async fn insert(
        &self,
        record: NewWebhookEvent<'_>,
    ) -> Result<LedgerInsertOutcome, EventLedgerError> {
        let received_at = to_rfc3339(record.received_at);
        let result = sqlx::query(
            "INSERT INTO webhook_events \
             (event_id, webhook_id, event_type, merchant_id, environment, payload_json, \
              status, created_at, received_at, claimed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.event_id.as_ref())
        .bind(record.webhook_id.as_ref())
        .bind(record.event_type.as_ref())
        .bind(record.merchant_id.as_ref())
        .bind(record.environment)
        .bind(record.payload_json.as_ref())
        .bind(EventStatus::Processing.as_str())
        .bind(to_rfc3339(record.created_at))
        .bind(&received_at)
        .bind(&received_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(LedgerInsertOutcome::Inserted),
            Err(err) if persistence_code(&err) == PersistenceCode::UniqueViolation => {
                debug!(
                    stage = "storage",
                    event_id = %record.event_id,
                    "duplicate webhook delivery"
                );
                Ok(LedgerInsertOutcome::Duplicate)
            }
            Err(err) => Err(EventLedgerError::Database(err)),
        }
    }

    /// Claims a redelivered event for processing.
    ///
    /// Succeeds for deferred events and for events whose previous claim is
    /// older than `stale_before`. Returns `false` when another delivery owns
    /// the event or it already reached a terminal state.
    pub async fn claim(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, EventLedgerError> {
        let result = sqlx::query(
            "UPDATE webhook_events \
             SET status = ?, claimed_at = ? \
             WHERE event_id = ? \
               AND (status = ? OR (status = ? AND claimed_at < ?))",
        )
        .bind(EventStatus::Processing.as_str())
        .bind(to_rfc3339(now))
        .bind(event_id)
        .bind(EventStatus::Deferred.as_str())
        .bind(EventStatus::Processing.as_str())
        .bind(to_rfc3339(stale_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Number of attempts recorded so far for `event_id`.
    pub async fn attempt_count(&self, event_id: &str) -> Result<u32, EventLedgerError> {
        let row =
            sqlx::query("SELECT COUNT(*) AS attempts FROM webhook_attempts WHERE event_id = ?")
                .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("attempts");
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub async fn record_attempt(&self, attempt: NewAttempt<'_>) -> Result<(), EventLedgerError> {
        let decision = attempt.decision;
        sqlx::query(
            "INSERT INTO webhook_attempts \
             (event_id, attempt, outcome, error, should_retry, retry_delay_ms, \
              retry_category, retry_reason, attempted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attempt.event_id)
        .bind(i64::from(attempt.attempt))
        .bind(attempt.outcome.as_str())
        .bind(attempt.error)
        .bind(decision.map(|d| d.should_retry))
        .bind(decision.map(|d| i64::try_from(d.delay_ms).unwrap_or(i64::MAX)))
        .bind(decision.map(|d| d.category.as_str()))
        .bind(decision.map(|d| d.reason.as_str()))
        .bind(to_rfc3339(attempt.attempted_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves an event to `status`. Returns `false` when the event is unknown.
    pub async fn mark(
        &self,
        event_id: &str,
        status: EventStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, EventLedgerError> {
        let processed_at = status.is_terminal().then(|| to_rfc3339(at));
        let result = sqlx::query(
            "UPDATE webhook_events SET status = ?, processed_at = ? WHERE event_id = ?",
        )
        .bind(status.as_str())
        .bind(processed_at)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_processed(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, EventLedgerError> {
        self.mark(event_id, EventStatus::Processed, at).await
    }

    pub async fn fetch(
        &self,
        event_id: &str,
    ) -> Result<Option<StoredWebhookEvent>, EventLedgerError> {
        let row = sqlx::query(
            "SELECT event_id, webhook_id, event_type, merchant_id, environment, payload_json, \
                    status, received_at, processed_at \
             FROM webhook_events WHERE event_id = ?",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.get("status");
        let status = EventStatus::parse(&status).ok_or(EventLedgerError::CorruptStatus(status))?;
        let payload_json: String = row.get("payload_json");
        Ok(Some(StoredWebhookEvent {
            event_id: row.get("event_id"),
            webhook_id: row.get("webhook_id"),
            event_type: row.get("event_type"),
            merchant_id: row.get("merchant_id"),
            environment: row.get("environment"),
            payload: serde_json::from_str(&payload_json)?,
            status,
            received_at: row.get("received_at"),
            processed_at: row.get("processed_at"),
        }))
    }

    pub async fn attempts(&self, event_id: &str) -> Result<Vec<StoredAttempt>, EventLedgerError> {
        let rows = sqlx::query(
            "SELECT attempt, outcome, error, should_retry, retry_delay_ms, retry_category \
             FROM webhook_attempts WHERE event_id = ? ORDER BY attempt",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let attempt: i64 = row.get("attempt");
                StoredAttempt {
                    attempt: u32::try_from(attempt).unwrap_or_default(),
                    outcome: row.get("outcome"),
                    error: row.get("error"),
                    should_retry: row.get("should_retry"),
                    retry_delay_ms: row.get("retry_delay_ms"),
                    retry_category: row.get("retry_category"),
                }
            })
            .collect())
    }

    /// Deletes up to `limit` events received before `threshold`, with their attempts.
    pub async fn delete_older_than_batch(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM webhook_events WHERE event_id IN ( \
                SELECT event_id FROM webhook_events \
                WHERE received_at < ? AND status != ? \
                ORDER BY received_at LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(EventStatus::Processing.as_str())
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
