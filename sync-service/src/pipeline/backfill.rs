use std::time::Duration;

use serde::Serialize;
use tracing::Instrument;

use super::{backfill_chunks, BackfillChunk, SyncContext, SyncController, SyncError, TelemetrySink};
use crate::{sources::FetchMode, transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillRequest {
    pub days: u32,
    /// Pause between consecutive days.
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    /// Every requested day was attempted; some may have failed.
    Completed,
    /// Authentication or the deadline stopped the run early.
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub status: BackfillStatus,
    pub days_requested: u32,
    pub days_processed: u32,
    pub total_ingested: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl<K: TelemetrySink> SyncController<K> {
    /// Re-fetches whole local days, oldest first, skipping stored keys.
    pub async fn backfill(&self, ctx: &SyncContext, request: BackfillRequest) -> BackfillSummary {
        let span = tracing::info_span!(
            "backfill",
            invocation_id = %ctx.invocation_id(),
            system_id = self.settings.system_id
        );
        self.run_backfill(ctx, request).instrument(span).await
    }

    async fn run_backfill(&self, ctx: &SyncContext, request: BackfillRequest) -> BackfillSummary {
        let days = request.days.min(self.settings.max_backfill_days);
        if days < request.days {
            tracing::warn!(
                requested = request.days,
                max_days = self.settings.max_backfill_days,
                "backfill request capped"
            );
        }

        let mut summary = BackfillSummary {
            status: BackfillStatus::Completed,
            days_requested: days,
            days_processed: 0,
            total_ingested: 0,
            errors: Vec::new(),
            duration_ms: 0,
        };

        let chunks = backfill_chunks(ctx.retrieved_at(), self.settings.site_offset, days);
        tracing::info!(days, delay_secs = request.delay.as_secs(), "backfill started");

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 && !request.delay.is_zero() {
                if let Err(e) = ctx.sleep(request.delay).await {
                    summary.errors.push(format!("{}: {e}", chunk.date));
                    summary.status = BackfillStatus::Aborted;
                    break;
                }
            }

            match self.backfill_day(ctx, chunk).await {
                Ok(ingested) => {
                    summary.days_processed += 1;
                    summary.total_ingested += ingested;
                    tracing::info!(date = %chunk.date, ingested, "backfill day completed");
                }
                Err(e) if e.aborts_invocation() => {
                    tracing::error!(date = %chunk.date, error = %e, "backfill aborted");
                    summary.errors.push(format!("{}: {e}", chunk.date));
                    summary.status = BackfillStatus::Aborted;
                    break;
                }
                Err(e) => {
                    metrics::counter!("backfill_day_errors_total").increment(1);
                    tracing::warn!(date = %chunk.date, error = %e, "backfill day failed, continuing");
                    summary.errors.push(format!("{}: {e}", chunk.date));
                    if i + 1 < chunks.len() {
                        if let Err(e) = ctx.sleep(self.settings.backfill_error_delay).await {
                            summary.errors.push(format!("{}: {e}", chunk.date));
                            summary.status = BackfillStatus::Aborted;
                            break;
                        }
                    }
                }
            }
        }

        summary.duration_ms = ctx.elapsed().as_millis() as u64;
        metrics::counter!("backfill_records_ingested_total").increment(summary.total_ingested as u64);
        tracing::info!(
            status = ?summary.status,
            days_processed = summary.days_processed,
            total_ingested = summary.total_ingested,
            errors = summary.errors.len(),
            duration_ms = summary.duration_ms,
            "backfill finished"
        );
        summary
    }

    async fn backfill_day(&self, ctx: &SyncContext, chunk: &BackfillChunk) -> Result<usize, SyncError> {
        let system_id = self.settings.system_id;

        let outcome = self
            .fetcher
            .fetch_all(ctx, &chunk.window, FetchMode::FailFast)
            .await?;
        let records = transform::merge_intervals(&outcome.intervals);
        let (Some(first), Some(last)) = (records.first(), records.last()) else {
            return Ok(0);
        };

        // The API may return intervals just outside the requested day.
        let start_at = chunk.window.start_at.unwrap_or(first.end_at).min(first.end_at);
        let end_at = chunk.window.end_at.max(last.end_at.saturating_add(1));
        let existing = self.sink.existing_keys(system_id, start_at, end_at).await?;

        let merged = records.len();
        let records = transform::filter_existing(records, &existing);
        tracing::debug!(
            date = %chunk.date,
            merged,
            existing = existing.len(),
            new_records = records.len(),
            "backfill day deduplicated"
        );
        if records.is_empty() {
            return Ok(0);
        }

        self.sink.ingest(system_id, ctx.retrieved_at(), &records).await
    }
}
