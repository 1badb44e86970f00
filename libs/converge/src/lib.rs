//! Convergence polling primitives.
//!
//! This library waits for an attribute of an eventually-consistent resource
//! to reach one of a set of terminal values. Key concepts:
//!
//! - **Observation**: one full refresh of the resource, plus the value found
//!   at the watched attribute path (if any).
//! - **Step**: a pure classification of an observation against a [`WaitSpec`].
//! - **Wait**: the async driver that re-observes until the step converges,
//!   the resource stays missing for too long, or the deadline passes.
//!
//! # Invariants
//!
//! - A refresh error is never treated as pending
//! - An absent attribute is pending, never converged
//! - The not-found streak resets on every successful observation

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Default delay before the first refresh.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

/// Default lower bound between two refreshes.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Default overall ceiling for a wait.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default number of consecutive not-found refreshes tolerated.
pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 60;

/// First backoff step, before the minimum interval is applied.
const INITIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Backoff ceiling (unless the minimum interval is larger).
const MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Wait errors.
#[derive(Debug, Error)]
pub enum WaitError<E: std::error::Error + 'static> {
    /// The deadline passed before the attribute converged.
    #[error(
        "timeout after {elapsed:?} waiting for {resource} to have {attribute} in {target:?} (last state: {last_state:?})"
    )]
    Timeout {
        resource: String,
        attribute: String,
        target: Vec<String>,
        last_state: Option<String>,
        elapsed: Duration,
    },

    /// The resource was missing for too many consecutive refreshes.
    #[error("timeout waiting for {attribute} of {resource}: not found after {checks} consecutive checks")]
    NotFound {
        resource: String,
        attribute: String,
        checks: u32,
    },

    /// The attribute reached a value that is neither pending nor a target.
    #[error("unexpected state '{value}' for {attribute} of {resource}, wanted {target:?}")]
    UnexpectedState {
        resource: String,
        attribute: String,
        value: String,
        target: Vec<String>,
    },

    /// The caller cancelled the wait.
    #[error("wait for {attribute} of {resource} was cancelled")]
    Cancelled { resource: String, attribute: String },

    /// Refreshing the resource failed outright.
    #[error("refreshing {resource}: {source}")]
    Refresh {
        resource: String,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> WaitError<E> {
    /// Returns true if the wait gave up because time or patience ran out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::NotFound { .. })
    }
}

/// Parameters of a single wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSpec {
    /// Terminal values: reaching one of these converges the wait.
    pub target: Vec<String>,

    /// Known in-between values: keep polling.
    pub pending: Vec<String>,

    /// Delay before the first refresh.
    pub delay: Duration,

    /// Lower bound between two refreshes.
    pub min_interval: Duration,

    /// Overall ceiling, delay included.
    pub timeout: Duration,

    /// Consecutive not-found refreshes tolerated before giving up.
    pub not_found_checks: u32,
}

impl WaitSpec {
    /// Create a wait spec with default timings.
    pub fn new<T, P, S>(target: T, pending: P) -> Self
    where
        T: IntoIterator<Item = S>,
        P: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into_iter().map(Into::into).collect(),
            pending: pending.into_iter().map(Into::into).collect(),
            delay: DEFAULT_DELAY,
            min_interval: DEFAULT_MIN_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            not_found_checks: DEFAULT_NOT_FOUND_CHECKS,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    /// Classify one observation. Pure: no I/O, no clock.
    pub fn classify<T>(&self, observation: Observation<T>) -> PollStep<T> {
        match observation {
            Observation::NotFound => PollStep::NotFound,
            Observation::Found { value: None, .. } => PollStep::Pending { value: None },
            Observation::Found {
                entity,
                value: Some(value),
            } => {
                if self.target.iter().any(|t| *t == value) {
                    PollStep::Converged(Converged { entity, value })
                } else if self.pending.iter().any(|p| *p == value) {
                    PollStep::Pending { value: Some(value) }
                } else {
                    PollStep::Unexpected(value)
                }
            }
        }
    }
}

/// Result of refreshing a resource once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation<T> {
    /// The resource no longer exists (or does not exist yet).
    NotFound,

    /// The resource was read; `value` is the watched attribute, if present.
    Found { entity: T, value: Option<String> },
}

/// Classification of an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep<T> {
    /// Keep polling.
    Pending { value: Option<String> },

    /// A target value was reached.
    Converged(Converged<T>),

    /// The resource was missing.
    NotFound,

    /// The value is neither pending nor a target.
    Unexpected(String),
}

/// A converged wait: the latest entity and the matched target value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Converged<T> {
    pub entity: T,
    pub value: String,
}

/// What the driver should do after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<T> {
    /// Sleep for the given duration, then refresh again.
    Continue(Duration),

    /// Done.
    Converged(Converged<T>),

    /// Not-found streak exceeded the bound.
    NotFoundExhausted(u32),

    /// Unexpected value; stop.
    Unexpected(String),
}

/// Mutable bookkeeping of a wait, kept apart from I/O.
#[derive(Debug, Clone)]
pub struct PollState {
    refreshes: u32,
    not_found_streak: u32,
    backoff: Duration,
    last_state: Option<String>,
}

impl Default for PollState {
    fn default() -> Self {
        Self::new()
    }
}

impl PollState {
    pub fn new() -> Self {
        Self {
            refreshes: 0,
            not_found_streak: 0,
            backoff: INITIAL_INTERVAL,
            last_state: None,
        }
    }

    /// Number of refreshes recorded so far.
    pub fn refreshes(&self) -> u32 {
        self.refreshes
    }

    /// Last observed attribute value.
    pub fn last_state(&self) -> Option<&str> {
        self.last_state.as_deref()
    }

    /// Record a step and decide what happens next.
    pub fn advance<T>(&mut self, spec: &WaitSpec, step: PollStep<T>) -> Transition<T> {
        self.refreshes += 1;

        match step {
            PollStep::Converged(converged) => {
                self.last_state = Some(converged.value.clone());
                Transition::Converged(converged)
            }
            PollStep::Unexpected(value) => {
                self.last_state = Some(value.clone());
                Transition::Unexpected(value)
            }
            PollStep::NotFound => {
                self.not_found_streak += 1;
                if self.not_found_streak > spec.not_found_checks {
                    Transition::NotFoundExhausted(self.not_found_streak)
                } else {
                    Transition::Continue(self.next_interval(spec))
                }
            }
            PollStep::Pending { value } => {
                self.not_found_streak = 0;
                self.last_state = value;
                Transition::Continue(self.next_interval(spec))
            }
        }
    }

    /// Exponential backoff, clamped to `[min_interval, max(MAX_INTERVAL, min_interval)]`.
    fn next_interval(&mut self, spec: &WaitSpec) -> Duration {
        let ceiling = MAX_INTERVAL.max(spec.min_interval);
        let wait = self.backoff.max(spec.min_interval).min(ceiling);
        self.backoff = (self.backoff * 2).min(MAX_INTERVAL);
        wait
    }
}

/// A resource that can be refreshed by identity and attribute path.
#[async_trait]
pub trait Observe: Send + Sync {
    /// The refreshed resource handed back on convergence.
    type Entity: Send;

    /// Hard refresh failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fully refresh `resource` and extract the value at `attribute`.
    async fn observe(
        &self,
        resource: &str,
        attribute: &str,
    ) -> Result<Observation<Self::Entity>, Self::Error>;
}

/// Block until `attribute` of `resource` reaches one of `spec.target`.
///
/// Returns the latest observed entity and the matched value. Fails on a hard
/// refresh error, an unexpected value, too many consecutive not-found
/// refreshes, the overall timeout, or cancellation.
pub async fn wait_for<O>(
    observer: &O,
    resource: &str,
    attribute: &str,
    spec: &WaitSpec,
    cancel: &CancellationToken,
) -> Result<Converged<O::Entity>, WaitError<O::Error>>
where
    O: Observe + ?Sized,
{
    info!(
        resource = %resource,
        attribute = %attribute,
        target = ?spec.target,
        timeout_secs = spec.timeout.as_secs(),
        "Waiting for attribute to converge"
    );

    let started = Instant::now();
    let deadline = started + spec.timeout;
    let mut state = PollState::new();
    let mut pause = spec.delay;

    let timeout = |state: &PollState| WaitError::Timeout {
        resource: resource.to_string(),
        attribute: attribute.to_string(),
        target: spec.target.clone(),
        last_state: state.last_state.clone(),
        elapsed: started.elapsed(),
    };
    let cancelled = || WaitError::Cancelled {
        resource: resource.to_string(),
        attribute: attribute.to_string(),
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = sleep_until(deadline) => return Err(timeout(&state)),
            _ = sleep(pause) => {}
        }

        let observation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = sleep_until(deadline) => return Err(timeout(&state)),
            result = observer.observe(resource, attribute) => {
                result.map_err(|source| WaitError::Refresh {
                    resource: resource.to_string(),
                    source,
                })?
            }
        };

        match state.advance(spec, spec.classify(observation)) {
            Transition::Continue(next) => {
                trace!(
                    resource = %resource,
                    attribute = %attribute,
                    state = ?state.last_state(),
                    next_ms = next.as_millis() as u64,
                    "Still pending"
                );
                pause = next;
            }
            Transition::Converged(converged) => {
                info!(
                    resource = %resource,
                    attribute = %attribute,
                    value = %converged.value,
                    refreshes = state.refreshes(),
                    "Attribute converged"
                );
                return Ok(converged);
            }
            Transition::NotFoundExhausted(checks) => {
                debug!(resource = %resource, checks, "Resource not found, giving up");
                return Err(WaitError::NotFound {
                    resource: resource.to_string(),
                    attribute: attribute.to_string(),
                    checks,
                });
            }
            Transition::Unexpected(value) => {
                return Err(WaitError::UnexpectedState {
                    resource: resource.to_string(),
                    attribute: attribute.to_string(),
                    value,
                    target: spec.target.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Error)]
    #[error("refresh exploded")]
    struct Boom;

    /// Replays a fixed script of observations; repeats the last one forever.
    struct Scripted {
        script: Mutex<VecDeque<Result<Observation<u32>, ()>>>,
        last: Mutex<Option<Result<Observation<u32>, ()>>>,
        refreshes: AtomicU32,
    }

    impl Scripted {
        fn new(script: Vec<Result<Observation<u32>, ()>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(None),
                refreshes: AtomicU32::new(0),
            }
        }

        fn refreshes(&self) -> u32 {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Observe for Scripted {
        type Entity = u32;
        type Error = Boom;

        async fn observe(&self, _: &str, _: &str) -> Result<Observation<u32>, Boom> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            let next = self.script.lock().unwrap().pop_front();
            let item = match next {
                Some(item) => {
                    *self.last.lock().unwrap() = Some(item.clone());
                    item
                }
                None => self.last.lock().unwrap().clone().unwrap_or(Ok(Observation::NotFound)),
            };
            match item {
                Ok(Observation::Found { value, .. }) => Ok(Observation::Found { entity: n, value }),
                Ok(Observation::NotFound) => Ok(Observation::NotFound),
                Err(()) => Err(Boom),
            }
        }
    }

    fn found(value: &str) -> Result<Observation<u32>, ()> {
        Ok(Observation::Found {
            entity: 0,
            value: Some(value.to_string()),
        })
    }

    fn absent() -> Result<Observation<u32>, ()> {
        Ok(Observation::Found {
            entity: 0,
            value: None,
        })
    }

    fn spec() -> WaitSpec {
        WaitSpec::new(["yes"], ["no"])
            .with_delay(Duration::from_secs(1))
            .with_min_interval(Duration::from_secs(2))
            .with_timeout(Duration::from_secs(60))
            .with_not_found_checks(3)
    }

    #[test]
    fn test_classify() {
        let spec = spec();

        let step = spec.classify(Observation::Found {
            entity: 7,
            value: Some("yes".to_string()),
        });
        assert_eq!(
            step,
            PollStep::Converged(Converged {
                entity: 7,
                value: "yes".to_string()
            })
        );

        let step = spec.classify(Observation::Found {
            entity: 7,
            value: Some("no".to_string()),
        });
        assert_eq!(
            step,
            PollStep::Pending {
                value: Some("no".to_string())
            }
        );

        let step = spec.classify(Observation::<u32>::Found {
            entity: 7,
            value: None,
        });
        assert_eq!(step, PollStep::Pending { value: None });

        let step = spec.classify(Observation::<u32>::NotFound);
        assert_eq!(step, PollStep::NotFound);

        let step = spec.classify(Observation::Found {
            entity: 7,
            value: Some("maybe".to_string()),
        });
        assert_eq!(step, PollStep::Unexpected("maybe".to_string()));
    }

    #[test]
    fn test_interval_backoff_respects_bounds() {
        let spec = WaitSpec::new(["yes"], ["no"]).with_min_interval(Duration::from_millis(300));
        let mut state = PollState::new();

        let waits: Vec<Duration> = (0..10)
            .map(|_| match state.advance::<()>(&spec, PollStep::Pending { value: None }) {
                Transition::Continue(d) => d,
                other => panic!("unexpected transition {other:?}"),
            })
            .collect();

        // 100ms and 200ms are lifted to the minimum.
        assert_eq!(waits[0], Duration::from_millis(300));
        assert_eq!(waits[1], Duration::from_millis(300));
        assert_eq!(waits[2], Duration::from_millis(400));
        assert_eq!(waits[3], Duration::from_millis(800));
        assert!(waits.iter().all(|w| *w <= MAX_INTERVAL));
        assert_eq!(*waits.last().unwrap(), MAX_INTERVAL);
    }

    #[test]
    fn test_min_interval_above_ceiling_wins() {
        let spec = WaitSpec::new(["yes"], ["no"]).with_min_interval(Duration::from_secs(30));
        let mut state = PollState::new();
        for _ in 0..8 {
            let t = state.advance::<()>(&spec, PollStep::Pending { value: None });
            assert_eq!(t, Transition::Continue(Duration::from_secs(30)));
        }
    }

    #[test]
    fn test_not_found_streak_resets() {
        let spec = spec();
        let mut state = PollState::new();

        for _ in 0..3 {
            assert!(matches!(
                state.advance::<()>(&spec, PollStep::NotFound),
                Transition::Continue(_)
            ));
        }
        // A successful refresh resets the streak.
        state.advance::<()>(&spec, PollStep::Pending { value: None });
        for _ in 0..3 {
            assert!(matches!(
                state.advance::<()>(&spec, PollStep::NotFound),
                Transition::Continue(_)
            ));
        }
        assert_eq!(
            state.advance::<()>(&spec, PollStep::NotFound),
            Transition::NotFoundExhausted(4)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_third_refresh() {
        let observer = Scripted::new(vec![found("no"), found("no"), found("yes")]);
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let converged = wait_for(&observer, "vm-1", "ready", &spec(), &cancel)
            .await
            .unwrap();

        assert_eq!(converged.value, "yes");
        assert_eq!(converged.entity, 3);
        assert_eq!(observer.refreshes(), 3);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_always_pending() {
        let observer = Scripted::new(vec![found("no")]);
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let err = wait_for(&observer, "vm-1", "ready", &spec(), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        match err {
            WaitError::Timeout {
                resource,
                attribute,
                last_state,
                ..
            } => {
                assert_eq!(resource, "vm-1");
                assert_eq!(attribute, "ready");
                assert_eq!(last_state.as_deref(), Some("no"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_attribute_keeps_polling() {
        let observer = Scripted::new(vec![absent(), absent(), found("no"), found("yes")]);
        let cancel = CancellationToken::new();

        let converged = wait_for(&observer, "vm-1", "ready", &spec(), &cancel)
            .await
            .unwrap();

        assert_eq!(converged.value, "yes");
        assert_eq!(observer.refreshes(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_not_found_checks() {
        let observer = Scripted::new(vec![Ok(Observation::NotFound)]);
        let cancel = CancellationToken::new();

        let err = wait_for(&observer, "vm-1", "ready", &spec(), &cancel)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(matches!(err, WaitError::NotFound { checks: 4, .. }));
        assert_eq!(observer.refreshes(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_error_propagates_immediately() {
        let observer = Scripted::new(vec![found("no"), Err(())]);
        let cancel = CancellationToken::new();

        let err = wait_for(&observer, "vm-1", "ready", &spec(), &cancel)
            .await
            .unwrap_err();

        assert!(!err.is_timeout());
        assert!(matches!(err, WaitError::Refresh { .. }));
        assert_eq!(observer.refreshes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_state_fails() {
        let observer = Scripted::new(vec![found("no"), found("exploded")]);
        let cancel = CancellationToken::new();

        let err = wait_for(&observer, "vm-1", "ready", &spec(), &cancel)
            .await
            .unwrap_err();

        match err {
            WaitError::UnexpectedState { value, .. } => assert_eq!(value, "exploded"),
            other => panic!("expected unexpected state, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_wait() {
        let observer = Scripted::new(vec![found("no")]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = wait_for(&observer, "vm-1", "ready", &spec(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
