//! Monotonic time and fixed-rate loop helpers.
//!
//! Every service loop in the runtime paces itself with a [`Ticker`] and
//! sleeps only through [`wait_with_cancel`], so a cancellation token always
//! interrupts a wait immediately.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Monotonic seconds since the process clock was first read.
pub fn now() -> f64 {
    anchor().elapsed().as_secs_f64()
}

/// Fixed-period ticker that absorbs drift instead of bursting.
///
/// After an overrun the next deadline is `max(now, previous + period)`, so a
/// slow iteration delays the schedule rather than producing a flurry of
/// catch-up ticks.
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    /// Waits until the next deadline and advances the schedule.
    pub async fn tick(&mut self) {
        tokio::time::sleep_until(self.next.into()).await;
        let now = Instant::now();
        self.next = (self.next + self.period).max(now);
    }
}

/// Sleeps for `duration` unless `stop` fires first.
///
/// Returns `true` when the wait was cut short by cancellation.
pub async fn wait_with_cancel(duration: Duration, stop: &CancellationToken) -> bool {
    if stop.is_cancelled() {
        return true;
    }
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ticker_keeps_cadence() {
        let mut ticker = Ticker::new(Duration::from_millis(10));
        let start = Instant::now();
        for _ in 0..3 {
            ticker.tick().await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn ticker_recovers_from_overrun() {
        let mut ticker = Ticker::new(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;
        // A late caller gets one tick immediately, not a burst.
        let start = Instant::now();
        ticker.tick().await;
        assert!(start.elapsed() < Duration::from_millis(5));
        let start = Instant::now();
        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(4));
    }

    #[tokio::test]
    async fn wait_returns_on_cancel() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { wait_with_cancel(Duration::from_secs(30), &token).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        let cancelled = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(cancelled);
    }

    #[tokio::test]
    async fn wait_completes_without_cancel() {
        let token = CancellationToken::new();
        assert!(!wait_with_cancel(Duration::from_millis(5), &token).await);
    }

    #[test]
    fn now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }
}
