//! Fixed-interval pacing for calls against a single remote site.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Spaces successive calls at least `interval` apart, with random jitter.
///
/// The effective gap is drawn uniformly from
/// `interval * [1 - jitter, 1 + jitter]`. The first call never waits.
#[derive(Debug)]
pub struct Throttler {
    interval: Duration,
    jitter: f64,
    last: Mutex<Option<Instant>>,
}

impl Throttler {
    /// Create a throttler. `jitter` is a ratio and is clamped to `0.0..=1.0`.
    #[must_use]
    pub fn new(interval: Duration, jitter: f64) -> Self {
        Self {
            interval,
            jitter: jitter.clamp(0.0, 1.0),
            last: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn next_gap(&self) -> Duration {
        if self.jitter <= 0.0 {
            return self.interval;
        }
        let factor = 2.0f64.mul_add(self.jitter * rand::random::<f64>(), 1.0 - self.jitter);
        self.interval.mul_f64(factor)
    }

    /// Sleep until the next call is allowed, then record it.
    ///
    /// Concurrent callers are serialized, each one spaced from the previous.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.next_gap()).await;
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_does_not_wait() {
        let throttler = Throttler::new(Duration::from_secs(5), 0.0);
        let start = Instant::now();
        throttler.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_spaced() {
        let throttler = Throttler::new(Duration::from_secs(5), 0.0);
        let start = Instant::now();
        throttler.wait().await;
        throttler.wait().await;
        throttler.wait().await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_work_counts_toward_gap() {
        let throttler = Throttler::new(Duration::from_secs(5), 0.0);
        throttler.wait().await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let before = Instant::now();
        throttler.wait().await;
        assert_eq!(before.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_in_bounds() {
        let throttler = Throttler::new(Duration::from_secs(5), 0.1);
        throttler.wait().await;
        for _ in 0..20 {
            let before = Instant::now();
            throttler.wait().await;
            let gap = before.elapsed();
            assert!(gap >= Duration::from_millis(4500), "gap {gap:?} too short");
            assert!(gap <= Duration::from_millis(5500), "gap {gap:?} too long");
        }
    }
}
