//! Retry utilities with exponential backoff and jitter, plus a circuit breaker.
//!
//! Every call a worker makes to the authority or platform goes through these:
//! the retry helper handles transient failures within one logical operation,
//! and the [`CircuitBreaker`] suppresses attempts altogether for a cooldown
//! once an endpoint has failed repeatedly.
//!
//! # Example
//!
//! ```ignore
//! use trellis_common::retry::{retry_with_backoff_when, RetryConfig};
//!
//! let bundle = retry_with_backoff_when(
//!     &RetryConfig::with_max_attempts(5),
//!     "submit_csr",
//!     || async { client.submit_csr(&request).await },
//!     |e: &Error| e.is_retryable(),
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Backoff schedule for one logical operation
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before giving up; 0 means never give up
    pub max_attempts: u32,
    /// Wait after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any single wait
    pub max_delay: Duration,
    /// Growth factor between consecutive waits
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default schedule, bounded to `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Self::default()
        }
    }

    /// Default schedule with no attempt limit
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Whether `attempt` (1-based) was the last one allowed
    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }

    /// Un-jittered delay before the given retry (1-based attempt that just failed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Scale a delay by a random factor in `[0.5, 1.5)`
pub fn jittered(delay: Duration) -> Duration {
    delay.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

/// Run `operation` until it succeeds or the attempt budget runs out,
/// retrying every error
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_when(config, operation_name, operation, |_| true).await
}

/// [`retry_with_backoff`] that gives up at once on errors `should_retry`
/// rejects
pub async fn retry_with_backoff_when<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !should_retry(&e) {
            debug!(operation = %operation_name, attempt, error = %e, "Not retrying");
            return Err(e);
        }
        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %e, "Giving up");
            return Err(e);
        }
        let delay = jittered(config.delay_for_attempt(attempt));
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "Attempt failed, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Consecutive failures before a breaker opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// How long an open breaker rejects attempts before allowing a trial call
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, attempts allowed
    Closed,
    /// Attempts rejected until the cooldown expires
    Open,
    /// Cooldown expired, one trial attempt is allowed
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerRecord {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    /// Start of the outstanding half-open trial
    trial_started: Option<Instant>,
}

impl BreakerRecord {
    fn state(&self) -> CircuitState {
        match self.open_until {
            None => CircuitState::Closed,
            Some(until) if Instant::now() < until => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
        }
    }
}

/// Circuit breaker for one remote endpoint
///
/// Opens after `threshold` consecutive failures. While open, [`allow`]
/// returns false. Once the cooldown has elapsed the breaker is half-open: a
/// single trial call is allowed until its outcome is recorded. A success
/// closes the breaker and a failure re-opens it for another cooldown.
///
/// [`allow`]: CircuitBreaker::allow
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    record: Mutex<BreakerRecord>,
}

impl CircuitBreaker {
    /// Create a breaker with default threshold and cooldown
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }

    /// Create a breaker with explicit settings
    pub fn with_settings(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            record: Mutex::new(BreakerRecord::default()),
        }
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.record.lock().state()
    }

    /// Whether an attempt may be made now
    ///
    /// When half-open, the first caller gets the trial and everyone else is
    /// refused until it records an outcome. A trial whose outcome never
    /// arrives (the caller was cancelled) is given up after one cooldown.
    pub fn allow(&self) -> bool {
        let mut record = self.record.lock();
        let now = Instant::now();
        match record.state() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen
                if record
                    .trial_started
                    .is_some_and(|started| now < started + self.cooldown) =>
            {
                false
            }
            CircuitState::HalfOpen => {
                record.trial_started = Some(now);
                debug!(breaker = %self.name, "Circuit half-open, allowing a trial call");
                true
            }
        }
    }

    /// Record a successful call, closing the breaker
    pub fn record_success(&self) {
        let mut record = self.record.lock();
        if record.open_until.is_some() {
            debug!(breaker = %self.name, "Circuit closed");
        }
        *record = BreakerRecord::default();
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut record = self.record.lock();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        record.trial_started = None;

        let half_open = record.state() == CircuitState::HalfOpen;
        if half_open || record.consecutive_failures >= self.threshold {
            record.open_until = Some(Instant::now() + self.cooldown);
            warn!(
                breaker = %self.name,
                failures = record.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit opened"
            );
        }
    }

    /// Consecutive failures since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.record.lock().consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    /// Operation that fails `failures` times, then returns 7; counts calls
    fn flaky(
        failures: u32,
        calls: Arc<AtomicU32>,
    ) -> impl FnMut() -> std::future::Ready<Result<u8, &'static str>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(if n < failures { Err("unavailable") } else { Ok(7) })
        }
    }

    #[tokio::test]
    async fn first_success_is_returned() {
        let calls = Arc::new(AtomicU32::new(0));
        let got = retry_with_backoff(&fast_config(3), "op", flaky(0, calls.clone())).await;
        assert_eq!(got, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let got = retry_with_backoff(&fast_config(5), "op", flaky(2, calls.clone())).await;
        assert_eq!(got, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_bounds_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let got = retry_with_backoff(&fast_config(3), "op", flaky(u32::MAX, calls.clone())).await;
        assert_eq!(got, Err("unavailable"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejected_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let got = retry_with_backoff_when(
            &fast_config(10),
            "op",
            flaky(u32::MAX, calls.clone()),
            |e| *e != "unavailable",
        )
        .await;
        assert_eq!(got, Err("unavailable"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_and_caps() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };
        let delays: Vec<_> = [1, 2, 3, 4, 100]
            .into_iter()
            .map(|n| config.delay_for_attempt(n).as_millis())
            .collect();
        assert_eq!(delays, [100, 200, 400, 500, 500]);
        assert!(!config.exhausted(1_000));
        assert!(fast_config(2).exhausted(2));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1500));
        }
    }

    /// Story: a flapping platform trips the breaker, which then retries after cooldown
    #[tokio::test(start_paused = true)]
    async fn story_breaker_opens_then_retries() {
        let breaker = CircuitBreaker::with_settings("platform", 3, Duration::from_secs(10));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow(), "below threshold stays closed");

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow());

        // Failed trial re-opens immediately
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    /// Story: after cooldown many callers race in; only one reaches the endpoint
    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_at_a_time() {
        let breaker = CircuitBreaker::with_settings("platform", 1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;

        let admitted = (0..8).filter(|_| breaker.allow()).count();
        assert_eq!(admitted, 1);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // The trial fails: open again, then one new trial after the next cooldown
        breaker.record_failure();
        assert!(!breaker.allow());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.allow());
        assert!(!breaker.allow());

        breaker.record_success();
        assert!(breaker.allow());
        assert!(breaker.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_is_released_after_cooldown() {
        let breaker = CircuitBreaker::with_settings("authority", 1, Duration::from_secs(10));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.allow());

        // The caller was cancelled and never reported back
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!breaker.allow());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(breaker.allow());
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("authority");
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
