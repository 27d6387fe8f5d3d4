//! Token-bucket rate limiter with 429-triggered cooldown (spec.md §4.4).
//!
//! Burst is fixed at 1: the dispatcher inside a provider pool is
//! single-threaded, so one-at-a-time dispatch is sufficient and keeps the
//! bucket's refill math exact. `wait` suspends until a token is available
//! or the cooldown clock clears, and never returns early or drops a token
//! on cancellation (cancellation aborts the wait entirely, consuming
//! nothing).

use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use crate::cancellation::CancelToken;

/// Rate <= 0 would never refill and deadlock every waiter; spec.md §5 and
/// §8 require mapping it to a small positive default instead.
const MIN_RATE: f64 = 1.0;

struct Bucket {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    cooldown_until: Option<Instant>,
}

pub struct RateLimiter {
    inner: Mutex<Bucket>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterSnapshot {
    pub rate: f64,
    pub tokens: f64,
    pub cooling_down: bool,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        let rate = if requests_per_second > 0.0 { requests_per_second } else { MIN_RATE };
        Self {
            inner: Mutex::new(Bucket {
                rate,
                tokens: 1.0,
                last_refill: Instant::now(),
                cooldown_until: None,
            }),
        }
    }

    /// Acquire a single token, suspending as needed. Returns `Err(())` only
    /// when `cancel` fires first; no token is consumed in that case.
    pub async fn wait(&self, cancel: &CancelToken) -> Result<(), ()> {
        loop {
            if cancel.is_cancelled() {
                return Err(());
            }

            let sleep_for = {
                let mut bucket = self.inner.lock();
                let now = Instant::now();
                Self::refill(&mut bucket, now);

                if let Some(cooldown) = bucket.cooldown_until {
                    if now < cooldown {
                        Some(cooldown - now)
                    } else {
                        bucket.cooldown_until = None;
                        None
                    }
                } else if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                } else {
                    let deficit = 1.0 - bucket.tokens;
                    Some(Duration::from_secs_f64(deficit / bucket.rate))
                }
            };

            match sleep_for {
                None => continue,
                Some(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = cancel.cancelled() => return Err(()),
                    }
                }
            }
        }
    }

    fn refill(bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * bucket.rate).min(1.0);
            bucket.last_refill = now;
        }
    }

    /// Enter (or extend) a 429-triggered cooldown. Concurrent calls retain
    /// the maximum of the existing and new cooldown deadline.
    pub fn record_429(&self, retry_after: Duration) {
        let mut bucket = self.inner.lock();
        let candidate = Instant::now() + retry_after;
        bucket.cooldown_until = Some(match bucket.cooldown_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut bucket = self.inner.lock();
        let now = Instant::now();
        Self::refill(&mut bucket, now);
        RateLimiterSnapshot {
            rate: bucket.rate,
            tokens: bucket.tokens,
            cooling_down: bucket.cooldown_until.map(|c| now < c).unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn drains_at_configured_rate() {
        let limiter = RateLimiter::new(5.0);
        let cancel = CancelToken::new();
        let start = Instant::now();

        for _ in 0..10 {
            limiter.wait(&cancel).await.unwrap();
        }

        // first token is free (burst=1), remaining 9 cost ~1/5s each.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1750), "elapsed={elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2100), "elapsed={elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_maps_to_minimum_positive() {
        let limiter = RateLimiter::new(0.0);
        assert_eq!(limiter.snapshot().rate, MIN_RATE);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_delays_next_wait_and_overrides_tokens() {
        let limiter = RateLimiter::new(100.0);
        let cancel = CancelToken::new();
        limiter.wait(&cancel).await.unwrap();
        limiter.record_429(Duration::from_secs(2));

        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_429_retains_max_cooldown() {
        let limiter = RateLimiter::new(100.0);
        limiter.record_429(Duration::from_secs(5));
        limiter.record_429(Duration::from_secs(1)); // shorter, must not shrink cooldown

        let cancel = CancelToken::new();
        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_aborts_wait_without_consuming_token() {
        let limiter = RateLimiter::new(0.001); // effectively never refills within test
        let cancel = CancelToken::new();
        // drain the single burst token first
        limiter.wait(&cancel).await.unwrap();

        let waiter_cancel = cancel.clone();
        let fut = limiter.wait(&waiter_cancel);
        tokio::pin!(fut);

        tokio::select! {
            _ = &mut fut => panic!("should not acquire a token without refill"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        cancel.cancel();
        assert!(fut.await.is_err());
    }
}
