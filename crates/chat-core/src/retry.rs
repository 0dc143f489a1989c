use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::debug;

/// Growth factor applied to the previous reconnect delay.
pub const BACKOFF_MULTIPLIER: f64 = 1.3;

/// Reconnect delay policy.
///
/// Attempt 0 waits `base + uniform(jitter_low..=jitter_high)`; every later
/// attempt waits `min(max_delay, previous * 1.3)`. No attempt is scheduled
/// once `max_attempts` have been used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay_ms: u64,
    jitter_low_ms: u64,
    jitter_high_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(
        base_delay_ms: u64,
        jitter_low_ms: u64,
        jitter_high_ms: u64,
        max_delay_ms: u64,
        max_attempts: u32,
    ) -> Self {
        Self {
            base_delay_ms,
            jitter_low_ms: jitter_low_ms.min(jitter_high_ms),
            jitter_high_ms: jitter_high_ms.max(jitter_low_ms),
            max_delay_ms,
            max_attempts,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay for attempt 0.
    pub fn initial_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter = rng.random_range(self.jitter_low_ms..=self.jitter_high_ms);
        Duration::from_millis(self.base_delay_ms.saturating_add(jitter))
    }

    /// Delay following a previous attempt that waited `previous`.
    pub fn next_delay(&self, previous: Duration) -> Duration {
        let grown = (previous.as_millis() as f64 * BACKOFF_MULTIPLIER) as u64;
        Duration::from_millis(grown.min(self.max_delay_ms))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(1_000, 0, 1_000, 30_000, 8)
    }
}

/// Attempt counter paired with a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    previous: Option<Duration>,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            previous: None,
        }
    }

    /// Number of attempts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Schedule the next attempt, or `None` once the attempt cap is reached.
    pub fn next<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = match self.previous {
            Some(previous) if self.attempt > 0 => self.policy.next_delay(previous),
            _ => self.policy.initial_delay(rng),
        };
        self.attempt += 1;
        self.previous = Some(delay);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.previous = None;
    }
}

/// Fixed-count, fixed-interval retry for select remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRetry {
    attempts: u32,
    interval: Duration,
}

impl FixedRetry {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `op` until it succeeds, `should_retry` rejects the error, or the
    /// attempts are used up. The last error is returned.
    pub async fn run<T, E, F, Fut>(
        &self,
        mut op: F,
        should_retry: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.attempts || !should_retry(&err) {
                        return Err(err);
                    }
                    debug!(attempt, interval_ms = self.interval.as_millis() as u64, "retrying remote call");
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

impl Default for FixedRetry {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn initial_delay_stays_within_jitter_range() {
        let policy = ReconnectPolicy::new(1_000, 100, 400, 60_000, 5);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = policy.initial_delay(&mut rng).as_millis() as u64;
            assert!((1_100..=1_400).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn later_attempts_grow_by_multiplier_until_cap() {
        let policy = ReconnectPolicy::new(1_000, 0, 0, 2_000, 10);
        let mut backoff = Backoff::new(policy);
        let mut rng = StdRng::seed_from_u64(1);

        let mut previous = backoff.next(&mut rng).expect("attempt 0");
        assert_eq!(previous, Duration::from_millis(1_000));
        for _ in 1..10 {
            let delay = backoff.next(&mut rng).expect("attempt within cap");
            let expected = ((previous.as_millis() as f64 * 1.3) as u64).min(2_000);
            assert_eq!(delay, Duration::from_millis(expected));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_millis(2_000));
    }

    #[test]
    fn stops_scheduling_after_max_attempts() {
        let mut backoff = Backoff::new(ReconnectPolicy::new(10, 0, 5, 100, 3));
        let mut rng = StdRng::seed_from_u64(3);
        assert!(backoff.next(&mut rng).is_some());
        assert!(backoff.next(&mut rng).is_some());
        assert!(backoff.next(&mut rng).is_some());
        assert_eq!(backoff.next(&mut rng), None);
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next(&mut rng).is_some());
    }

    #[test]
    fn swaps_inverted_jitter_bounds() {
        let policy = ReconnectPolicy::new(0, 50, 10, 1_000, 1);
        let mut rng = StdRng::seed_from_u64(9);
        let delay = policy.initial_delay(&mut rng).as_millis() as u64;
        assert!((10..=50).contains(&delay));
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_retry_stops_on_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32, &str> = FixedRetry::new(5, Duration::from_millis(100))
            .run(
                move |attempt| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async move { if attempt < 2 { Err("flaky") } else { Ok(attempt) } }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_retry_gives_up_after_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), &str> = FixedRetry::new(3, Duration::from_millis(100))
            .run(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err("down") }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_retry_respects_non_retryable_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), &str> = FixedRetry::new(3, Duration::from_millis(100))
            .run(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err("forbidden") }
                },
                |err| *err != "forbidden",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
