use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Exponential backoff schedule: `base * 2^attempt`, capped. Pure data, so
/// retry behavior is testable without any network in the loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Total number of attempts (initial try included) before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to sleep after the given failed attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Token-bucket-of-one pacing for outbound requests: callers queue on the
/// internal lock, and each holder waits out the remainder of the minimum
/// inter-request interval before releasing it. One gate instance is the
/// single serialization point for the whole process.
pub struct RateGate {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(requests_per_second: f64) -> Self {
        let rps = if requests_per_second > 0.0 {
            requests_per_second
        } else {
            1.0
        };
        Self {
            min_interval: Duration::from_secs_f64(1.0 / rps),
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the rate budget allows another request, then claim it.
    /// The lock is held across the wait so concurrent callers are spaced
    /// out instead of all timing against the same last-request mark.
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
            3,
        );
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(30), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_monotone() {
        let policy = RetryPolicy::new(
            Duration::from_millis(250),
            Duration::from_secs(30),
            5,
        );
        let mut prev = Duration::ZERO;
        for attempt in 0..16 {
            let d = policy.delay_for(attempt);
            assert!(d >= prev, "delay decreased at attempt {}", attempt);
            prev = d;
        }
    }

    #[test]
    fn test_at_least_one_attempt() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(1), 0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_spaces_out_sequential_calls() {
        let gate = RateGate::new(2.0); // 500ms minimum spacing
        let start = Instant::now();
        gate.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_serializes_concurrent_callers() {
        let gate = Arc::new(RateGate::new(10.0)); // 100ms spacing
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.acquire().await;
                Instant::now()
            }));
        }

        let mut stamps = Vec::new();
        for h in handles {
            stamps.push(h.await.unwrap());
        }
        stamps.sort();

        // No two requests closer together than the minimum interval.
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
        // Five requests at 10/s need at least 400ms in total.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
