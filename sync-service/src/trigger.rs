use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::{sync::Mutex, time::MissedTickBehavior};

use crate::pipeline::{
    BackfillRequest, BackfillStatus, BackfillSummary, CycleReport, SyncContext, SyncController,
    SyncError, TelemetrySink,
};

const DEFAULT_BACKFILL_DAYS: u32 = 7;
const DEFAULT_BACKFILL_DELAY: Duration = Duration::from_secs(2);

/// Entry points that start invocations. At most one invocation runs at a time.
pub struct Trigger<K> {
    controller: Arc<SyncController<K>>,
    gate: Arc<Mutex<()>>,
    sync_timeout: Option<Duration>,
    backfill_timeout: Option<Duration>,
}

impl<K> Clone for Trigger<K> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            gate: Arc::clone(&self.gate),
            sync_timeout: self.sync_timeout,
            backfill_timeout: self.backfill_timeout,
        }
    }
}

impl<K: TelemetrySink + 'static> Trigger<K> {
    pub fn new(
        controller: SyncController<K>,
        sync_timeout: Option<Duration>,
        backfill_timeout: Option<Duration>,
    ) -> Self {
        Self {
            controller: Arc::new(controller),
            gate: Arc::new(Mutex::new(())),
            sync_timeout,
            backfill_timeout,
        }
    }

    /// Runs one cycle, waiting for any invocation already in progress.
    pub async fn sync_once(&self) -> Result<CycleReport, SyncError> {
        let _guard = self.gate.lock().await;
        let ctx = SyncContext::new("sync").with_timeout(self.sync_timeout);
        self.controller.run_cycle(&ctx).await
    }

    /// Runs one cycle unless another invocation holds the gate.
    pub async fn try_sync_once(&self) -> Option<Result<CycleReport, SyncError>> {
        let _guard = self.gate.try_lock().ok()?;
        let ctx = SyncContext::new("timer").with_timeout(self.sync_timeout);
        Some(self.controller.run_cycle(&ctx).await)
    }

    pub async fn backfill(&self, request: BackfillRequest) -> BackfillSummary {
        let _guard = self.gate.lock().await;
        let ctx = SyncContext::new("backfill").with_timeout(self.backfill_timeout);
        self.controller.backfill(&ctx, request).await
    }

    /// Fires a cycle every `period`; overlapping ticks are skipped.
    pub async fn run_timer(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match self.try_sync_once().await {
                None => {
                    metrics::counter!("sync_timer_skipped_total").increment(1);
                    tracing::warn!("previous invocation still running, skipping timer tick");
                }
                // Outcome is already logged by the controller.
                Some(_) => {}
            }
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/sync", post(sync_handler::<K>))
            .route("/api/backfill", get(backfill_handler::<K>).post(backfill_handler::<K>))
            .with_state(self.clone())
    }

    pub async fn serve(&self, bind_addr: &str) -> anyhow::Result<()> {
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid trigger bind addr: {e}"))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "trigger endpoint listening");
        axum::serve(listener, self.router().into_make_service()).await?;
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct BackfillParams {
    days: Option<String>,
    delay: Option<String>,
}

fn parse_backfill_params(params: &BackfillParams) -> Result<BackfillRequest, String> {
    let days = match params.days.as_deref() {
        None | Some("") => DEFAULT_BACKFILL_DAYS,
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|d| *d > 0)
            .ok_or_else(|| format!("Invalid parameter: days must be a positive integer, got `{raw}`"))?,
    };
    let delay = match params.delay.as_deref() {
        None | Some("") => DEFAULT_BACKFILL_DELAY,
        Some(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|d| *d >= 0.0)
            .and_then(|d| Duration::try_from_secs_f64(d).ok())
            .ok_or_else(|| format!("Invalid parameter: delay must be a non-negative number of seconds, got `{raw}`"))?,
    };

    Ok(BackfillRequest {
        days,
        delay,
    })
}

async fn sync_handler<K: TelemetrySink + 'static>(State(trigger): State<Trigger<K>>) -> Response {
    metrics::counter!("trigger_requests_total", "route" => "sync").increment(1);
    match trigger.sync_once().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "status": "failed", "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn backfill_handler<K: TelemetrySink + 'static>(
    State(trigger): State<Trigger<K>>,
    Query(params): Query<BackfillParams>,
) -> Response {
    metrics::counter!("trigger_requests_total", "route" => "backfill").increment(1);
    let request = match parse_backfill_params(&params) {
        Ok(request) => request,
        Err(message) => return (StatusCode::BAD_REQUEST, message).into_response(),
    };

    let summary = trigger.backfill(request).await;
    let status = match summary.status {
        BackfillStatus::Completed => StatusCode::OK,
        BackfillStatus::Aborted => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(summary)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{controller, json_response, token_response, MemorySink, MockTransport};

    fn params(days: Option<&str>, delay: Option<&str>) -> BackfillParams {
        BackfillParams {
            days: days.map(str::to_string),
            delay: delay.map(str::to_string),
        }
    }

    async fn trigger() -> Trigger<MemorySink> {
        let transport = Arc::new(MockTransport::new(|req| match req.endpoint.as_str() {
            "oauth_token" => Ok(token_response("access", None, 3_600)),
            _ => Ok(json_response(200, r#"{"intervals":[]}"#)),
        }));
        Trigger::new(controller(transport, MemorySink::default()).await, None, None)
    }

    #[test]
    fn backfill_params_default_and_validate() {
        assert_eq!(
            parse_backfill_params(&params(None, None)),
            Ok(BackfillRequest { days: 7, delay: Duration::from_secs(2) })
        );
        assert_eq!(
            parse_backfill_params(&params(Some("3"), Some("0.5"))),
            Ok(BackfillRequest { days: 3, delay: Duration::from_millis(500) })
        );
        assert!(parse_backfill_params(&params(Some("-1"), None)).is_err());
        assert!(parse_backfill_params(&params(Some("0"), None)).is_err());
        assert!(parse_backfill_params(&params(Some("abc"), None)).is_err());
        assert!(parse_backfill_params(&params(None, Some("-2"))).is_err());
        assert!(parse_backfill_params(&params(None, Some("NaN"))).is_err());
        assert!(parse_backfill_params(&params(None, Some("inf"))).is_err());
        assert!(parse_backfill_params(&params(Some("1"), Some("1e30"))).is_err());
    }

    #[tokio::test]
    async fn timer_tick_is_skipped_while_an_invocation_runs() {
        let trigger = trigger().await;
        let _held = trigger.gate.lock().await;

        assert!(trigger.try_sync_once().await.is_none());
    }

    #[tokio::test]
    async fn http_surface_runs_invocations_and_rejects_bad_params() {
        let trigger = trigger().await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = trigger.router();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        let client = reqwest::Client::new();

        let res = client.post(format!("http://{addr}/api/sync")).send().await.unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let report: serde_json::Value = res.json().await.unwrap();
        assert_eq!(report["ingested"], 0);

        let res = client
            .get(format!("http://{addr}/api/backfill?days=abc"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 400);

        let res = client
            .post(format!("http://{addr}/api/backfill?days=1&delay=0"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 200);
        let summary: serde_json::Value = res.json().await.unwrap();
        assert_eq!(summary["status"], "completed");
        assert_eq!(summary["days_requested"], 1);
    }
}
