use std::{collections::VecDeque, time::Duration};

use tokio::{sync::Mutex, time::Instant};

use crate::pipeline::{SyncContext, SyncError};

/// Call instants within the trailing window.
#[derive(Debug)]
pub struct SlidingWindow {
    max_calls: usize,
    window: Duration,
    margin: Duration,
    calls: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(max_calls: usize, window: Duration, margin: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            margin,
            calls: VecDeque::new(),
        }
    }

    /// Books the next call slot at or after `now` and returns it.
    pub fn reserve(&mut self, now: Instant) -> Instant {
        let mut at = self.calls.back().map_or(now, |last| now.max(*last));
        loop {
            while self
                .calls
                .front()
                .is_some_and(|oldest| at.duration_since(*oldest) >= self.window)
            {
                self.calls.pop_front();
            }
            if self.calls.len() < self.max_calls {
                break;
            }
            if let Some(oldest) = self.calls.front() {
                at = *oldest + self.window + self.margin;
            }
        }
        self.calls.push_back(at);
        at
    }

    pub fn calls_in_window(&self) -> usize {
        self.calls.len()
    }
}

/// Shared throttle in front of every API call.
pub struct RateLimiter {
    window: Mutex<SlidingWindow>,
}

impl RateLimiter {
    pub fn per_minute(max_calls: usize, margin: Duration) -> Self {
        Self {
            window: Mutex::new(SlidingWindow::new(max_calls, Duration::from_secs(60), margin)),
        }
    }

    /// Waits for a call slot; returns how long the caller was held back.
    pub async fn acquire(&self, ctx: &SyncContext) -> Result<Duration, SyncError> {
        let now = Instant::now();
        let (at, calls_in_window) = {
            let mut window = self.window.lock().await;
            let at = window.reserve(now);
            (at, window.calls_in_window())
        };

        let wait = at.saturating_duration_since(now);
        if !wait.is_zero() {
            tracing::info!(
                wait_seconds = wait.as_secs_f64(),
                calls_in_window,
                "rate limit reached, waiting before next API call"
            );
            metrics::histogram!("enphase_rate_limit_wait_seconds").record(wait.as_secs_f64());
            ctx.sleep(wait).await?;
        }
        Ok(wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);
    const MARGIN: Duration = Duration::from_millis(500);

    fn max_in_any_window(calls: &[Instant]) -> usize {
        calls
            .iter()
            .map(|start| {
                calls
                    .iter()
                    .filter(|t| **t >= *start && t.duration_since(*start) < WINDOW)
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn first_calls_go_through_immediately() {
        let now = Instant::now();
        let mut window = SlidingWindow::new(10, WINDOW, MARGIN);
        for _ in 0..10 {
            assert_eq!(window.reserve(now), now);
        }
    }

    #[test]
    fn eleventh_call_waits_for_oldest_to_leave_window() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(10, WINDOW, MARGIN);
        for i in 0..10 {
            window.reserve(start + Duration::from_secs(i));
        }

        let at = window.reserve(start + Duration::from_secs(10));

        assert_eq!(at, start + WINDOW + MARGIN);
    }

    #[test]
    fn never_exceeds_limit_in_any_rolling_window() {
        // Irregular cadence: bursts, pauses, and a slow trickle, with the
        // simulated clock advancing to each granted slot.
        let gaps_ms = [0u64, 0, 10, 200, 0, 5_000, 0, 0, 30_000, 1, 1, 1, 61_000, 0, 700, 3];
        let start = Instant::now();
        let mut window = SlidingWindow::new(4, WINDOW, MARGIN);
        let mut clock = start;
        let mut granted = Vec::new();

        for round in 0..6 {
            for (i, gap) in gaps_ms.iter().enumerate() {
                clock += Duration::from_millis(gap * ((round + i as u64) % 3));
                let at = window.reserve(clock);
                assert!(at >= clock);
                clock = at;
                granted.push(at);
            }
        }

        assert!(granted.windows(2).all(|w| w[0] <= w[1]));
        assert!(max_in_any_window(&granted) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_sleeps_on_paused_clock() {
        let ctx = SyncContext::new("test");
        let limiter = RateLimiter::per_minute(2, MARGIN);
        let start = Instant::now();

        assert_eq!(limiter.acquire(&ctx).await.unwrap(), Duration::ZERO);
        assert_eq!(limiter.acquire(&ctx).await.unwrap(), Duration::ZERO);
        let waited = limiter.acquire(&ctx).await.unwrap();

        assert_eq!(waited, WINDOW + MARGIN);
        assert_eq!(Instant::now(), start + WINDOW + MARGIN);
    }
}
