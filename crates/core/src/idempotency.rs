use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, warn};

use crate::error::IntegrationError;

type Outcome<T> = Option<Result<T, IntegrationError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

/// Point-in-time view of a key's entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord<T> {
    pub key: String,
    pub status: IdempotencyStatus,
    pub result: Option<Result<T, IntegrationError>>,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
}

/// How a call to [`IdempotentExecutor::execute_once_traced`] was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// This caller ran the operation.
    Executed,
    /// This caller waited on an in-flight call for the same key.
    Joined,
    /// This caller received a stored result.
    Replayed,
    /// The key is held by a request with a different fingerprint.
    Mismatched,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::Joined => "joined",
            Self::Replayed => "replayed",
            Self::Mismatched => "mismatched",
        }
    }
}

enum Slot<T> {
    Pending {
        generation: u64,
        rx: watch::Receiver<Outcome<T>>,
        started_at: Instant,
        fingerprint: Option<String>,
    },
    Completed {
        value: T,
        fingerprint: Option<String>,
        stored_at: Instant,
        /// `None` when the TTL reaches past what `Instant` can represent.
        expires_at: Option<Instant>,
    },
    Failed {
        error: IntegrationError,
        failed_at: Instant,
    },
}

enum Role<T> {
    Leader(u64, watch::Sender<Outcome<T>>),
    Waiter(watch::Receiver<Outcome<T>>),
    Replay(T),
    Mismatch,
}

/// In-process single-flight execution keyed by idempotency key.
///
/// The first caller for a key runs the operation; callers arriving while it
/// is in flight wait for the same outcome, and callers arriving after it
/// succeeded get the stored value until the TTL expires. Failed outcomes are
/// handed to the waiters of that call only, so a later caller may try again.
///
/// The table lives in process memory. Deployments running several instances
/// need a shared store keyed the same way.
pub struct IdempotentExecutor<T> {
    ttl: Duration,
    call_timeout: Option<Duration>,
    slots: Mutex<HashMap<String, Slot<T>>>,
    generation: AtomicU64,
}

impl<T> std::fmt::Debug for IdempotentExecutor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotentExecutor")
            .field("ttl", &self.ttl)
            .field("call_timeout", &self.call_timeout)
            .field("entries", &self.slots.lock().len())
            .finish()
    }
}

/// Resolves the slot for a leader. If the leader future is dropped before
/// completing, waiters are failed with `Cancelled` and the key is freed.
struct LeaderGuard<'a, T: Clone + Send + Sync> {
    executor: &'a IdempotentExecutor<T>,
    key: &'a str,
    generation: u64,
    tx: Option<watch::Sender<Outcome<T>>>,
}

impl<T: Clone + Send + Sync> LeaderGuard<'_, T> {
    fn complete(mut self, result: &Result<T, IntegrationError>) {
        let now = Instant::now();
        let expires_at = now.checked_add(self.executor.ttl);
        let Some(tx) = self.tx.take() else {
            return;
        };
        {
            let mut slots = self.executor.slots.lock();
            if let Some(fingerprint) = self.executor.owned(&slots, self.key, self.generation) {
                let slot = match result {
                    Ok(value) => Slot::Completed {
                        value: value.clone(),
                        fingerprint,
                        stored_at: now,
                        expires_at,
                    },
                    Err(error) => Slot::Failed {
                        error: error.clone(),
                        failed_at: now,
                    },
                };
                slots.insert(self.key.to_string(), slot);
            }
        }
        tx.send_replace(Some(result.clone()));
    }
}

impl<T: Clone + Send + Sync> Drop for LeaderGuard<'_, T> {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        {
            let mut slots = self.executor.slots.lock();
            if self.executor.owned(&slots, self.key, self.generation).is_some() {
                slots.remove(self.key);
            }
        }
        warn!(
            stage = "idempotency",
            key = self.key,
            "in-flight call dropped; failing waiters"
        );
        tx.send_replace(Some(Err(IntegrationError::Cancelled(format!(
            "call for key {} was dropped before completing",
            self.key
        )))));
    }
}

impl<T: Clone + Send + Sync> IdempotentExecutor<T> {
    pub fn new(ttl: Duration, call_timeout: Option<Duration>) -> Self {
        Self {
            ttl,
            call_timeout,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `op` at most once per key while a successful result is retained.
    pub async fn execute_once<F, Fut>(&self, key: &str, op: F) -> Result<T, IntegrationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        self.execute_once_traced(key, op).await.0
    }

    /// Like [`execute_once`](Self::execute_once), also reporting how the call was served.
    pub async fn execute_once_traced<F, Fut>(
        &self,
        key: &str,
        op: F,
    ) -> (Result<T, IntegrationError>, Disposition)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        self.run(key, None, op).await
    }

    /// Like [`execute_once_traced`](Self::execute_once_traced), but only shares
    /// or replays a result with callers presenting the same `fingerprint`.
    /// Reusing a live key for a different request fails with
    /// [`IntegrationError::Validation`] without running `op`.
    pub async fn execute_once_matching<F, Fut>(
        &self,
        key: &str,
        fingerprint: &str,
        op: F,
    ) -> (Result<T, IntegrationError>, Disposition)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        self.run(key, Some(fingerprint), op).await
    }

    async fn run<F, Fut>(
        &self,
        key: &str,
        fingerprint: Option<&str>,
        op: F,
    ) -> (Result<T, IntegrationError>, Disposition)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        match self.claim(key, fingerprint) {
            Role::Mismatch => {
                warn!(stage = "idempotency", key, "key reused with a different request");
                (
                    Err(IntegrationError::Validation(format!(
                        "idempotency key {key} was already used with a different request"
                    ))),
                    Disposition::Mismatched,
                )
            }
            Role::Replay(value) => {
                debug!(stage = "idempotency", key, "replaying stored result");
                (Ok(value), Disposition::Replayed)
            }
            Role::Waiter(rx) => {
                debug!(stage = "idempotency", key, "joining in-flight call");
                (self.wait(key, rx).await, Disposition::Joined)
            }
            Role::Leader(generation, tx) => {
                let guard = LeaderGuard {
                    executor: self,
                    key,
                    generation,
                    tx: Some(tx),
                };
                let result = self.bounded(key, op()).await;
                guard.complete(&result);
                (result, Disposition::Executed)
            }
        }
    }

    /// Returns the current entry for `key`, if any.
    pub fn record(&self, key: &str) -> Option<IdempotencyRecord<T>> {
        let slots = self.slots.lock();
        let record = match slots.get(key)? {
            Slot::Pending { started_at, .. } => IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::Pending,
                result: None,
                created_at: *started_at,
                expires_at: None,
            },
            Slot::Completed {
                value,
                stored_at,
                expires_at,
                ..
            } => IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::Completed,
                result: Some(Ok(value.clone())),
                created_at: *stored_at,
                expires_at: *expires_at,
            },
            Slot::Failed { error, failed_at } => IdempotencyRecord {
                key: key.to_string(),
                status: IdempotencyStatus::Failed,
                result: Some(Err(error.clone())),
                created_at: *failed_at,
                expires_at: failed_at.checked_add(self.ttl),
            },
        };
        Some(record)
    }

    /// Drops completed entries past their TTL and failed entries older than
    /// the TTL. Returns how many entries were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Pending { rx, .. } => rx.has_changed().is_ok(),
            Slot::Completed { expires_at, .. } => live(*expires_at, now),
            Slot::Failed { failed_at, .. } => live(failed_at.checked_add(self.ttl), now),
        });
        let removed = before - slots.len();
        if removed > 0 {
            debug!(stage = "idempotency", removed, "purged expired entries");
        }
        removed
    }

    fn claim(&self, key: &str, fingerprint: Option<&str>) -> Role<T> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Completed {
                value,
                expires_at,
                fingerprint: stored,
                ..
            }) if live(*expires_at, now) => {
                return if conflicts(stored.as_deref(), fingerprint) {
                    Role::Mismatch
                } else {
                    Role::Replay(value.clone())
                };
            }
            Some(Slot::Pending {
                rx,
                fingerprint: stored,
                ..
            }) if rx.has_changed().is_ok() => {
                return if conflicts(stored.as_deref(), fingerprint) {
                    Role::Mismatch
                } else {
                    Role::Waiter(rx.clone())
                };
            }
            Some(Slot::Pending { .. }) => {
                warn!(stage = "idempotency", key, "taking over abandoned in-flight entry");
            }
            _ => {}
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(
            key.to_string(),
            Slot::Pending {
                generation,
                rx,
                started_at: now,
                fingerprint: fingerprint.map(str::to_string),
            },
        );
        Role::Leader(generation, tx)
    }

    /// Returns the pending slot's fingerprint if `generation` still owns `key`.
    fn owned(
        &self,
        slots: &HashMap<String, Slot<T>>,
        key: &str,
        generation: u64,
    ) -> Option<Option<String>> {
        match slots.get(key) {
            Some(Slot::Pending {
                generation: current,
                fingerprint,
                ..
            }) if *current == generation => Some(fingerprint.clone()),
            _ => None,
        }
    }

    async fn bounded<Fut>(&self, key: &str, call: Fut) -> Result<T, IntegrationError>
    where
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(IntegrationError::Timeout(format!(
                    "call for key {key} exceeded {}ms",
                    limit.as_millis()
                )))
            }),
            None => call.await,
        }
    }

    async fn wait(
        &self,
        key: &str,
        mut rx: watch::Receiver<Outcome<T>>,
    ) -> Result<T, IntegrationError> {
        let outcome = async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(result) = current {
                    return result;
                }
                if rx.changed().await.is_err() {
                    let last = rx.borrow().clone();
                    return last.unwrap_or_else(|| {
                        Err(IntegrationError::Cancelled(format!(
                            "call for key {key} ended without an outcome"
                        )))
                    });
                }
            }
        };
        self.bounded(key, outcome).await
    }
}

fn live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |at| at > now)
}

fn conflicts(stored: Option<&str>, presented: Option<&str>) -> bool {
    matches!((stored, presented), (Some(stored), Some(presented)) if stored != presented)
}
