use std::{fmt, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::IntegrationError;

/// Decides whether a failure counts toward opening the circuit.
pub type FailurePredicate = Arc<dyn Fn(&IntegrationError) -> bool + Send + Sync>;

/// Called with the breaker name and its new state on every transition.
pub type StateObserver = Arc<dyn Fn(&str, BreakerState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding for gauges.
    pub fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::Open => 1.0,
            Self::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            call_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// Bumped every time the circuit opens. Results from tickets of an older
    /// generation only update totals.
    generation: u64,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            generation: 0,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    /// Whether a result from `ticket` may drive the state machine. Only the
    /// trial decides while half-open; ordinary calls count while the circuit
    /// is still in the closed period they were admitted in.
    fn counts(&self, ticket: &TicketKind) -> bool {
        match ticket {
            TicketKind::Trial { generation } => {
                self.state == BreakerState::HalfOpen && *generation == self.generation
            }
            TicketKind::Regular { generation } => {
                self.state == BreakerState::Closed && *generation == self.generation
            }
        }
    }

    fn open(&mut self) {
        self.generation += 1;
        self.trial_in_flight = false;
        self.opened_at = Some(Instant::now());
    }
}

/// Circuit breaker guarding a single outbound dependency.
///
/// - Closed -> Open: `failure_threshold` consecutive counted failures
/// - Open -> HalfOpen: first call after `cooldown`
/// - HalfOpen -> Closed: the single trial call succeeds
/// - HalfOpen -> Open: the trial call fails with a counted failure
///
/// Late results from calls admitted before the circuit opened only update
/// totals. The state lock is never held across an `.await`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    predicate: FailurePredicate,
    observer: Option<StateObserver>,
    inner: Mutex<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TicketKind {
    Trial { generation: u64 },
    Regular { generation: u64 },
}

/// Admission ticket for one call. Dropping an unsettled trial ticket frees
/// the half-open slot for the next caller.
struct Ticket<'a> {
    breaker: &'a CircuitBreaker,
    kind: TicketKind,
    settled: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if matches!(self.kind, TicketKind::Trial { .. }) && !self.settled {
            self.breaker.release_trial(self.kind);
            debug!(
                stage = "breaker",
                dependency = %self.breaker.name,
                "trial call abandoned; releasing half-open slot"
            );
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            predicate: Arc::new(IntegrationError::is_infrastructure),
            observer: None,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn with_predicate(mut self, predicate: FailurePredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Runs `op` through the breaker.
    ///
    /// Returns [`IntegrationError::CircuitOpen`] without calling `op` while the
    /// circuit is open or a half-open trial is already in flight.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, IntegrationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, IntegrationError>>,
    {
        let mut ticket = self.admit()?;

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(IntegrationError::Timeout(format!(
                    "{} call exceeded {}ms",
                    self.name,
                    limit.as_millis()
                ))),
            },
            None => op().await,
        };

        ticket.settled = true;
        match &outcome {
            Ok(_) => self.on_success(ticket.kind),
            Err(err) if (self.predicate)(err) => self.on_failure(ticket.kind, err),
            Err(err) => self.on_neutral(ticket.kind, err),
        }
        outcome
    }

    /// Records a success observed outside [`execute`](Self::execute). Only
    /// affects the state while the circuit is closed.
    pub fn record_success(&self) {
        let kind = self.current_kind();
        self.on_success(kind);
    }

    /// Records a counted failure observed outside [`execute`](Self::execute).
    /// Only affects the state while the circuit is closed.
    pub fn record_failure(&self) {
        let kind = self.current_kind();
        self.on_failure(kind, &IntegrationError::Other("recorded failure".into()));
    }

    /// Forces the breaker closed and clears the consecutive failure count.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.consecutive_failures = 0;
            inner.trial_in_flight = false;
            inner.opened_at = None;
            inner.generation += 1;
            self.transition(&mut inner, BreakerState::Closed)
        };
        self.notify(transition);
    }

    fn current_kind(&self) -> TicketKind {
        TicketKind::Regular {
            generation: self.inner.lock().generation,
        }
    }

    fn admit(&self) -> Result<Ticket<'_>, IntegrationError> {
        let now = Instant::now();
        let (result, transition) = {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Closed => (
                    Ok(TicketKind::Regular {
                        generation: inner.generation,
                    }),
                    None,
                ),
                BreakerState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|opened| now.saturating_duration_since(opened))
                        .unwrap_or(self.config.cooldown);
                    if elapsed >= self.config.cooldown {
                        inner.trial_in_flight = true;
                        let transition = self.transition(&mut inner, BreakerState::HalfOpen);
                        (Ok(TicketKind::Trial { generation: inner.generation }), transition)
                    } else {
                        inner.total_rejections += 1;
                        (Err(self.config.cooldown - elapsed), None)
                    }
                }
                BreakerState::HalfOpen if inner.trial_in_flight => {
                    inner.total_rejections += 1;
                    let wait = self.config.call_timeout.unwrap_or(self.config.cooldown);
                    (Err(wait), None)
                }
                BreakerState::HalfOpen => {
                    inner.trial_in_flight = true;
                    (Ok(TicketKind::Trial { generation: inner.generation }), None)
                }
            }
        };
        self.notify(transition);

        match result {
            Ok(kind) => Ok(Ticket {
                breaker: self,
                kind,
                settled: false,
            }),
            Err(remaining) => {
                let retry_after_ms =
                    u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX).max(1);
                debug!(
                    stage = "breaker",
                    dependency = %self.name,
                    retry_after_ms,
                    "short-circuited call"
                );
                Err(IntegrationError::CircuitOpen {
                    dependency: self.name.clone(),
                    retry_after_ms,
                })
            }
        }
    }

    fn on_success(&self, kind: TicketKind) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.total_successes += 1;
            if !inner.counts(&kind) {
                None
            } else if inner.state == BreakerState::HalfOpen {
                inner.consecutive_failures = 0;
                inner.trial_in_flight = false;
                inner.opened_at = None;
                self.transition(&mut inner, BreakerState::Closed)
            } else {
                inner.consecutive_failures = 0;
                None
            }
        };
        if transition.is_some() {
            info!(
                stage = "breaker",
                dependency = %self.name,
                "circuit closed after successful trial"
            );
        }
        self.notify(transition);
    }

    fn on_failure(&self, kind: TicketKind, err: &IntegrationError) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.total_failures += 1;
            if !inner.counts(&kind) {
                None
            } else if inner.state == BreakerState::HalfOpen {
                inner.consecutive_failures += 1;
                inner.open();
                self.transition(&mut inner, BreakerState::Open)
            } else {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open();
                    self.transition(&mut inner, BreakerState::Open)
                } else {
                    None
                }
            }
        };
        if transition.is_some() {
            warn!(
                stage = "breaker",
                dependency = %self.name,
                error = %err,
                cooldown_ms = u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX),
                "circuit opened"
            );
        }
        self.notify(transition);
    }

    fn on_neutral(&self, kind: TicketKind, err: &IntegrationError) {
        self.release_trial(kind);
        debug!(
            stage = "breaker",
            dependency = %self.name,
            error = %err,
            "failure not counted"
        );
    }

    fn release_trial(&self, kind: TicketKind) {
        if let TicketKind::Trial { .. } = kind {
            let mut inner = self.inner.lock();
            if inner.counts(&kind) {
                inner.trial_in_flight = false;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, next: BreakerState) -> Option<BreakerState> {
        if inner.state == next {
            return None;
        }
        debug!(
            stage = "breaker",
            dependency = %self.name,
            from = inner.state.as_str(),
            to = next.as_str(),
            "state transition"
        );
        inner.state = next;
        Some(next)
    }

    fn notify(&self, transition: Option<BreakerState>) {
        if let (Some(state), Some(observer)) = (transition, &self.observer) {
            observer(&self.name, state);
        }
    }
}
