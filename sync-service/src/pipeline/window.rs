use std::time::Duration;

use serde::Serialize;
use time::{Date, OffsetDateTime, Time, UtcOffset};

const SECONDS_PER_DAY: i64 = 86_400;

/// `[start_at, end_at)` in epoch seconds. An absent start lets the API pick
/// its default range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncWindow {
    pub start_at: Option<i64>,
    pub end_at: i64,
}

impl SyncWindow {
    pub fn bounded(start_at: i64, end_at: i64) -> Self {
        Self {
            start_at: Some(start_at),
            end_at,
        }
    }

    pub fn trailing(end_at: i64, length: Duration) -> Self {
        Self::bounded(end_at.saturating_sub(secs(length)), end_at)
    }
}

/// Stored data ends before the lookback cap; steady-state sync will not
/// recover `[watermark, capped_start_at)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataGap {
    pub watermark: i64,
    pub capped_start_at: i64,
    /// Whole days, rounded up, a backfill must cover.
    pub days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    pub window: SyncWindow,
    pub gap: Option<DataGap>,
}

pub fn plan_window(now: i64, watermark: Option<i64>, max_lookback: Duration) -> WindowPlan {
    let Some(watermark) = watermark else {
        return WindowPlan {
            window: SyncWindow {
                start_at: None,
                end_at: now,
            },
            gap: None,
        };
    };

    let floor = now.saturating_sub(secs(max_lookback));
    if watermark >= floor {
        return WindowPlan {
            window: SyncWindow::bounded(watermark, now),
            gap: None,
        };
    }

    let missed = floor - watermark;
    WindowPlan {
        window: SyncWindow::bounded(floor, now),
        gap: Some(DataGap {
            watermark,
            capped_start_at: floor,
            days: (missed + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY,
        }),
    }
}

/// One site-local calendar day of backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillChunk {
    pub date: Date,
    pub window: SyncWindow,
}

/// The `days` complete local days before the current one, oldest first.
pub fn backfill_chunks(now: OffsetDateTime, site_offset: UtcOffset, days: u32) -> Vec<BackfillChunk> {
    let today = now.to_offset(site_offset).replace_time(Time::MIDNIGHT);

    (1..=i64::from(days))
        .rev()
        .map(|offset| {
            let start = today - time::Duration::days(offset);
            let end = start + time::Duration::days(1);
            BackfillChunk {
                date: start.date(),
                window: SyncWindow::bounded(start.unix_timestamp(), end.unix_timestamp()),
            }
        })
        .collect()
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, offset};

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn no_watermark_leaves_start_unbounded() {
        let plan = plan_window(10_000_000, None, DAY);
        assert_eq!(plan.window, SyncWindow { start_at: None, end_at: 10_000_000 });
        assert!(plan.gap.is_none());
    }

    #[test]
    fn recent_watermark_starts_the_window() {
        let now = 10_000_000;
        let plan = plan_window(now, Some(now - 3_600), DAY);
        assert_eq!(plan.window, SyncWindow::bounded(now - 3_600, now));
        assert!(plan.gap.is_none());
    }

    #[test]
    fn stale_watermark_is_clamped_and_reports_gap_days() {
        let now = 10_000_000;
        let watermark = now - 86_400 * 3 - 60;
        let plan = plan_window(now, Some(watermark), DAY);

        assert_eq!(plan.window, SyncWindow::bounded(now - 86_400, now));
        let gap = plan.gap.expect("gap");
        assert_eq!(gap.capped_start_at, now - 86_400);
        assert_eq!(gap.watermark, watermark);
        // two days and a minute missed
        assert_eq!(gap.days, 3);
    }

    #[test]
    fn watermark_exactly_at_cap_is_not_a_gap() {
        let now = 10_000_000;
        let plan = plan_window(now, Some(now - 86_400), DAY);
        assert!(plan.gap.is_none());
    }

    #[test]
    fn huge_lookback_saturates_instead_of_overflowing() {
        let plan = plan_window(10_000_000, Some(0), Duration::MAX);
        assert_eq!(plan.window, SyncWindow::bounded(0, 10_000_000));
        assert!(plan.gap.is_none());

        let window = SyncWindow::trailing(-10, Duration::MAX);
        assert_eq!(window.start_at, Some(i64::MIN));
    }

    #[test]
    fn backfill_chunks_are_local_days_oldest_first() {
        let chunks = backfill_chunks(datetime!(2024-06-05 03:00:00 UTC), offset!(-10), 3);

        // 03:00 UTC is 17:00 on June 4th in UTC-10, so June 4th is "today".
        let dates: Vec<_> = chunks.iter().map(|c| c.date).collect();
        assert_eq!(dates, vec![date!(2024-06-01), date!(2024-06-02), date!(2024-06-03)]);

        let first = chunks[0].window;
        assert_eq!(
            first.start_at,
            Some(datetime!(2024-06-01 00:00:00 -10).unix_timestamp())
        );
        assert_eq!(first.end_at - first.start_at.unwrap_or_default(), 86_400);
        assert_eq!(chunks[2].window.end_at, datetime!(2024-06-04 00:00:00 -10).unix_timestamp());
    }

    #[test]
    fn zero_days_yields_no_chunks() {
        assert!(backfill_chunks(datetime!(2024-06-05 03:00:00 UTC), UtcOffset::UTC, 0).is_empty());
    }
}
