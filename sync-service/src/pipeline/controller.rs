use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use time::UtcOffset;
use tracing::Instrument;

use super::{plan_window, DataGap, SyncContext, SyncError, SyncWindow, TelemetrySink};
use crate::{
    config::AppConfig,
    sinks::QuestDbSink,
    sources::{
        CredentialManager, FetchMode, FileCredentialStore, RateLimitedExecutor, RateLimiter,
        RefreshToken, ReqwestTransport, SourceFailure, TelemetryFetcher, Transport,
    },
    transform,
};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub system_id: i64,
    /// Oldest point steady-state sync will reach back to.
    pub max_lookback: Duration,
    pub events_window: Duration,
    pub fetch_mode: FetchMode,
    pub max_backfill_days: u32,
    pub backfill_error_delay: Duration,
    pub site_offset: UtcOffset,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            system_id: 0,
            max_lookback: Duration::from_secs(86_400),
            events_window: Duration::from_secs(7 * 86_400),
            fetch_mode: FetchMode::FailFast,
            max_backfill_days: 30,
            backfill_error_delay: Duration::from_secs(10),
            site_offset: UtcOffset::UTC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    ReadWatermark,
    Fetch,
    Merge,
    FilterByWatermark,
    Ingest,
    Done,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadWatermark => "read_watermark",
            Self::Fetch => "fetch",
            Self::Merge => "merge",
            Self::FilterByWatermark => "filter_by_watermark",
            Self::Ingest => "ingest",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub invocation_id: String,
    pub watermark: Option<i64>,
    pub window: SyncWindow,
    pub gap: Option<DataGap>,
    pub fetched: usize,
    pub merged: usize,
    pub new_records: usize,
    pub ingested: usize,
    pub events_ingested: usize,
    pub battery_mode: Option<String>,
    pub source_failures: Vec<SourceFailure>,
    pub duration_ms: u64,
}

/// Drives steady-state sync and backfill for one system.
pub struct SyncController<K> {
    pub(super) fetcher: TelemetryFetcher,
    pub(super) sink: K,
    pub(super) settings: SyncSettings,
}

impl SyncController<QuestDbSink> {
    /// Wires the HTTP transport, credentials and QuestDB sink from config.
    pub async fn connect(cfg: &AppConfig) -> anyhow::Result<Self> {
        let settings = cfg.sync_settings()?;

        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(Duration::from_secs(
            cfg.enphase.request_timeout_secs,
        ))?);
        let credentials = CredentialManager::load(
            transport.clone(),
            Box::new(FileCredentialStore::new(&cfg.credentials.token_file)),
            cfg.oauth_settings(),
            cfg.enphase.refresh_token.clone().map(RefreshToken::new),
            cfg.enphase.authorization_code.clone(),
        )
        .await;
        let executor = RateLimitedExecutor::new(
            transport,
            Arc::new(credentials),
            RateLimiter::per_minute(
                cfg.rate_limit.max_calls_per_minute,
                Duration::from_millis(cfg.rate_limit.safety_margin_ms),
            ),
            cfg.retry_policy(),
        );
        let fetcher = TelemetryFetcher::new(
            executor,
            &cfg.enphase.base_url,
            cfg.enphase.system_id,
            &cfg.enphase.api_key,
            &cfg.enphase.granularity,
        );
        let sink = QuestDbSink::connect(&cfg.questdb, &cfg.sink, settings.site_offset).await?;

        Ok(Self::new(fetcher, sink, settings))
    }
}

impl<K: TelemetrySink> SyncController<K> {
    pub fn new(fetcher: TelemetryFetcher, sink: K, settings: SyncSettings) -> Self {
        Self {
            fetcher,
            sink,
            settings,
        }
    }

    pub async fn run_cycle(&self, ctx: &SyncContext) -> Result<CycleReport, SyncError> {
        let span = tracing::info_span!(
            "sync_cycle",
            invocation_id = %ctx.invocation_id(),
            system_id = self.settings.system_id
        );

        async {
            let mut phase = SyncPhase::ReadWatermark;
            let result = self.cycle(ctx, &mut phase).await;
            match &result {
                Ok(report) => {
                    metrics::counter!("sync_cycles_total", "outcome" => "ok").increment(1);
                    metrics::counter!("sync_records_ingested_total").increment(report.ingested as u64);
                    tracing::info!(
                        watermark = ?report.watermark,
                        fetched = report.fetched,
                        merged = report.merged,
                        new_records = report.new_records,
                        ingested = report.ingested,
                        events_ingested = report.events_ingested,
                        duration_ms = report.duration_ms,
                        "sync cycle completed"
                    );
                }
                Err(e) => {
                    metrics::counter!("sync_cycles_total", "outcome" => "failed").increment(1);
                    tracing::error!(error = %e, failed_in = %phase, phase = %SyncPhase::Failed, "sync cycle failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn cycle(&self, ctx: &SyncContext, phase: &mut SyncPhase) -> Result<CycleReport, SyncError> {
        let system_id = self.settings.system_id;
        let now = ctx.retrieved_at().unix_timestamp();

        *phase = SyncPhase::ReadWatermark;
        let watermark = self.sink.watermark(system_id).await?;
        let plan = plan_window(now, watermark, self.settings.max_lookback);
        if let Some(gap) = &plan.gap {
            metrics::counter!("sync_gap_detected_total").increment(1);
            tracing::warn!(
                event = "gap_detected",
                watermark = gap.watermark,
                capped_start_at = gap.capped_start_at,
                days = gap.days,
                "stored data is older than the lookback cap, backfill required"
            );
        }
        tracing::debug!(phase = %phase, watermark = ?watermark, window = ?plan.window, "window planned");

        *phase = SyncPhase::Fetch;
        let outcome = self
            .fetcher
            .fetch_all(ctx, &plan.window, self.settings.fetch_mode)
            .await?;
        let battery_mode = match self.fetcher.fetch_snapshot(ctx).await {
            Ok(mode) => mode,
            Err(e) if e.aborts_invocation() => return Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "battery snapshot unavailable, leaving mode empty");
                None
            }
        };

        *phase = SyncPhase::Merge;
        let mut records = transform::merge_intervals(&outcome.intervals);
        transform::stamp_battery_mode(&mut records, battery_mode.as_deref());
        let merged = records.len();

        *phase = SyncPhase::FilterByWatermark;
        let records = transform::filter_after_watermark(records, watermark);
        let new_records = records.len();

        *phase = SyncPhase::Ingest;
        let ingested = if records.is_empty() {
            tracing::info!(merged, "no new records since watermark");
            0
        } else {
            self.sink.ingest(system_id, ctx.retrieved_at(), &records).await?
        };

        let events_ingested = self.sync_events(ctx, now).await;

        *phase = SyncPhase::Done;
        Ok(CycleReport {
            invocation_id: ctx.invocation_id().to_string(),
            watermark,
            window: plan.window,
            gap: plan.gap,
            fetched: outcome.fetched(),
            merged,
            new_records,
            ingested,
            events_ingested,
            battery_mode,
            source_failures: outcome.failures,
            duration_ms: ctx.elapsed().as_millis() as u64,
        })
    }

    /// Failures here never fail the cycle.
    async fn sync_events(&self, ctx: &SyncContext, now: i64) -> usize {
        let window = SyncWindow::trailing(now, self.settings.events_window);
        let events = match self.fetcher.fetch_events(ctx, &window).await {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "events fetch failed");
                return 0;
            }
        };
        if events.is_empty() {
            return 0;
        }

        match self
            .sink
            .ingest_events(self.settings.system_id, &events, ctx.retrieved_at())
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, events = events.len(), "events ingest failed");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use time::macros::datetime;

    use super::*;
    use crate::sources::TelemetrySource;
    use crate::testing::{controller, json_response, token_response, MemorySink, MockTransport};

    const NOW: i64 = 1_717_200_000;

    fn intervals(source: TelemetrySource, end_ats: &[i64]) -> String {
        let items: Vec<_> = end_ats
            .iter()
            .map(|end_at| match source {
                TelemetrySource::Production => serde_json::json!({"end_at": end_at, "wh_del": 10, "devices_reporting": 3}),
                TelemetrySource::Battery => serde_json::json!({
                    "end_at": end_at,
                    "charge": {"enwh": 5, "devices_reporting": 1},
                    "discharge": {"enwh": 1, "devices_reporting": 1},
                    "soc": {"percent": 80, "devices_reporting": 1}
                }),
                TelemetrySource::GridImport => serde_json::json!([{"end_at": end_at, "wh_imported": 2}]),
                TelemetrySource::GridExport => serde_json::json!([{"end_at": end_at, "wh_exported": 4}]),
                TelemetrySource::Consumption => serde_json::json!({"end_at": end_at, "enwh": 7, "devices_reporting": 1}),
            })
            .collect();
        serde_json::json!({ "intervals": items }).to_string()
    }

    fn api(end_ats: &[i64]) -> MockTransport {
        let end_ats = end_ats.to_vec();
        MockTransport::new(move |req| {
            let source = TelemetrySource::ALL.into_iter().find(|s| s.path() == req.endpoint);
            match (req.endpoint.as_str(), source) {
                ("oauth_token", _) => Ok(token_response("access", None, 3_600)),
                (_, Some(source)) => Ok(json_response(200, &intervals(source, &end_ats))),
                ("latest_telemetry", _) => Ok(json_response(200, r#"{"battery":{"operational_mode":"self_consumption"}}"#)),
                ("events", _) => Ok(json_response(200, r#"{"events":[{"event_id":1,"started_at":1717190000}]}"#)),
                _ => Ok(json_response(404, "{}")),
            }
        })
    }

    fn ctx() -> SyncContext {
        SyncContext::new("test").at(datetime!(2024-06-01 00:00:00 UTC))
    }

    #[tokio::test]
    async fn only_records_after_watermark_are_ingested() {
        let sink = MemorySink::with_watermark(1_000);
        let ctl = controller(Arc::new(api(&[900, 1_000, 1_100, 1_200])), sink.clone()).await;

        let report = ctl.run_cycle(&ctx()).await.unwrap();

        assert_eq!(sink.stored_keys(), vec![1_100, 1_200]);
        assert_eq!(report.watermark, Some(1_000));
        assert_eq!(report.merged, 4);
        assert_eq!(report.new_records, 2);
        assert_eq!(report.ingested, 2);
        assert_eq!(report.events_ingested, 1);
        assert_eq!(report.battery_mode.as_deref(), Some("self_consumption"));
        assert!(sink.records().iter().all(|r| r.battery_mode == "self_consumption"));
    }

    #[tokio::test]
    async fn stale_watermark_clamps_window_and_reports_gap() {
        let watermark = NOW - 3 * 86_400 - 1;
        let sink = MemorySink::with_watermark(watermark);
        let transport = Arc::new(api(&[NOW - 900]));
        let ctl = controller(transport.clone(), sink).await;

        let report = ctl.run_cycle(&ctx()).await.unwrap();

        let gap = report.gap.expect("gap");
        assert_eq!(gap.days, 3);
        assert_eq!(report.window.start_at, Some(NOW - 86_400));
        let call = transport
            .calls()
            .into_iter()
            .find(|r| r.endpoint == "telemetry/production_meter")
            .unwrap();
        assert_eq!(call.query_value("start_at"), Some("1717113600"));
    }

    #[tokio::test]
    async fn empty_store_fetches_unbounded_window() {
        let sink = MemorySink::default();
        let transport = Arc::new(api(&[NOW - 900]));
        let ctl = controller(transport.clone(), sink.clone()).await;

        let report = ctl.run_cycle(&ctx()).await.unwrap();

        assert_eq!(report.window.start_at, None);
        assert_eq!(sink.stored_keys(), vec![NOW - 900]);
        let call = transport
            .calls()
            .into_iter()
            .find(|r| r.endpoint == "telemetry/battery")
            .unwrap();
        assert_eq!(call.query_value("start_at"), None);
    }

    #[tokio::test]
    async fn nothing_new_is_a_normal_outcome() {
        let sink = MemorySink::with_watermark(2_000);
        let ctl = controller(Arc::new(api(&[900, 1_800])), sink.clone()).await;

        let report = ctl.run_cycle(&ctx()).await.unwrap();

        assert_eq!(report.new_records, 0);
        assert_eq!(report.ingested, 0);
        assert_eq!(sink.ingest_calls(), 0);
    }

    #[tokio::test]
    async fn failing_source_fails_the_cycle_without_ingesting() {
        let transport = Arc::new(MockTransport::new(|req| match req.endpoint.as_str() {
            "oauth_token" => Ok(token_response("access", None, 3_600)),
            "telemetry/consumption_meter" => Ok(json_response(400, "bad request")),
            _ => Ok(json_response(200, r#"{"intervals":[{"end_at":5000}]}"#)),
        }));
        let sink = MemorySink::with_watermark(1_000);
        let ctl = controller(transport, sink.clone()).await;

        let res = ctl.run_cycle(&ctx()).await;

        assert!(matches!(res, Err(SyncError::ClientRequest { status: 400, .. })));
        assert!(sink.stored_keys().is_empty());
    }

    #[tokio::test]
    async fn snapshot_and_events_are_best_effort() {
        let snapshot_calls = Arc::new(AtomicUsize::new(0));
        let seen = snapshot_calls.clone();
        let transport = Arc::new(MockTransport::new(move |req| match req.endpoint.as_str() {
            "oauth_token" => Ok(token_response("access", None, 3_600)),
            "latest_telemetry" => {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(json_response(404, "{}"))
            }
            "events" => Ok(json_response(403, "{}")),
            _ => Ok(json_response(200, r#"{"intervals":[{"end_at":5000}]}"#)),
        }));
        let sink = MemorySink::with_watermark(1_000);
        let ctl = controller(transport, sink.clone()).await;

        let report = ctl.run_cycle(&ctx()).await.unwrap();

        assert_eq!(snapshot_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.battery_mode, None);
        assert_eq!(report.events_ingested, 0);
        assert_eq!(sink.stored_keys(), vec![5_000]);
    }
}
