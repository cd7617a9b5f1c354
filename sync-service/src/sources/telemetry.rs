use std::{collections::BTreeMap, fmt};

use rust_client::domain::SystemEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{executor::RateLimitedExecutor, transport::ApiRequest};
use crate::pipeline::{SyncContext, SyncError, SyncWindow};

/// The five interval feeds merged into one timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySource {
    Production,
    Consumption,
    Battery,
    GridImport,
    GridExport,
}

impl TelemetrySource {
    pub const ALL: [TelemetrySource; 5] = [
        Self::Production,
        Self::Consumption,
        Self::Battery,
        Self::GridImport,
        Self::GridExport,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Consumption => "consumption",
            Self::Battery => "battery",
            Self::GridImport => "grid_import",
            Self::GridExport => "grid_export",
        }
    }

    /// Path below `/systems/{id}/`.
    pub fn path(self) -> &'static str {
        match self {
            Self::Production => "telemetry/production_meter",
            Self::Consumption => "telemetry/consumption_meter",
            Self::Battery => "telemetry/battery",
            Self::GridImport => "energy_import_telemetry",
            Self::GridExport => "energy_export_telemetry",
        }
    }

    pub fn shape(self) -> ResponseShape {
        match self {
            Self::GridImport | Self::GridExport => ResponseShape::Nested,
            _ => ResponseShape::Flat,
        }
    }
}

impl fmt::Display for TelemetrySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Layout of the `intervals` array in a source response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// `intervals: [ {..}, {..} ]`
    Flat,
    /// `intervals: [ [ {..}, {..} ], .. ]`
    Nested,
}

impl ResponseShape {
    /// Produces the flat interval list. Nested responses have every inner
    /// list concatenated; objects found at the outer level are kept as-is.
    pub fn unwrap(self, intervals: Vec<Value>) -> Vec<Value> {
        match self {
            Self::Flat => intervals,
            Self::Nested => intervals
                .into_iter()
                .flat_map(|item| match item {
                    Value::Array(inner) => inner,
                    other => vec![other],
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatteryFlow {
    pub enwh: Option<f64>,
    pub devices_reporting: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StateOfCharge {
    pub percent: Option<f64>,
    pub devices_reporting: Option<i64>,
}

/// One source's reading for one interval; only the source's own fields are
/// populated.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawInterval {
    pub end_at: Option<i64>,
    pub devices_reporting: Option<i64>,
    pub wh_del: Option<f64>,
    pub enwh: Option<f64>,
    pub charge: Option<BatteryFlow>,
    pub discharge: Option<BatteryFlow>,
    pub soc: Option<StateOfCharge>,
    pub wh_imported: Option<f64>,
    pub wh_exported: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// The first failing source fails the whole fetch.
    FailFast,
    /// Failing sources are recorded and skipped. Authentication and deadline
    /// errors still fail the fetch.
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: TelemetrySource,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub intervals: BTreeMap<TelemetrySource, Vec<RawInterval>>,
    pub failures: Vec<SourceFailure>,
}

impl FetchOutcome {
    pub fn fetched(&self) -> usize {
        self.intervals.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEvent {
    event_id: Option<i64>,
    event_type_id: Option<i64>,
    event_type_key: Option<String>,
    event_description: Option<String>,
    severity: Option<Value>,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    is_active: Option<bool>,
    device_serial: Option<String>,
}

impl From<RawEvent> for SystemEvent {
    fn from(e: RawEvent) -> Self {
        SystemEvent {
            event_id: e.event_id.unwrap_or_default(),
            event_type_id: e.event_type_id.unwrap_or_default(),
            event_type_key: e.event_type_key.unwrap_or_default(),
            event_description: e.event_description.unwrap_or_default(),
            severity: match e.severity {
                Some(Value::String(s)) => s,
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            },
            started_at: e.started_at,
            ended_at: e.ended_at,
            is_active: e.is_active.unwrap_or(false),
            device_serial: e.device_serial.unwrap_or_default(),
        }
    }
}

/// Talks to the per-system data endpoints through the shared executor.
pub struct TelemetryFetcher {
    executor: RateLimitedExecutor,
    base_url: String,
    system_id: i64,
    api_key: String,
    granularity: String,
}

impl TelemetryFetcher {
    pub fn new(
        executor: RateLimitedExecutor,
        base_url: impl Into<String>,
        system_id: i64,
        api_key: impl Into<String>,
        granularity: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            base_url: base_url.into(),
            system_id,
            api_key: api_key.into(),
            granularity: granularity.into(),
        }
    }

    fn request(&self, endpoint: &str) -> ApiRequest {
        let url = format!(
            "{}/systems/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.system_id,
            endpoint
        );
        ApiRequest::get(endpoint, url).header("key", self.api_key.clone())
    }

    fn windowed(&self, mut request: ApiRequest, window: &SyncWindow) -> ApiRequest {
        if let Some(start_at) = window.start_at {
            request = request.query("start_at", start_at);
        }
        request.query("end_at", window.end_at)
    }

    /// Sources are fetched one after another, in `TelemetrySource::ALL` order.
    pub async fn fetch_all(
        &self,
        ctx: &SyncContext,
        window: &SyncWindow,
        mode: FetchMode,
    ) -> Result<FetchOutcome, SyncError> {
        let mut outcome = FetchOutcome::default();

        for source in TelemetrySource::ALL {
            match self.fetch_source(ctx, source, window).await {
                Ok(intervals) => {
                    outcome.intervals.insert(source, intervals);
                }
                Err(e) if mode == FetchMode::BestEffort && !e.aborts_invocation() => {
                    metrics::counter!("sync_source_failures_total", "source" => source.name())
                        .increment(1);
                    tracing::warn!(source = %source, error = %e, "source fetch failed, continuing without it");
                    outcome.failures.push(SourceFailure {
                        source,
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        Ok(outcome)
    }

    pub async fn fetch_source(
        &self,
        ctx: &SyncContext,
        source: TelemetrySource,
        window: &SyncWindow,
    ) -> Result<Vec<RawInterval>, SyncError> {
        let request = self
            .windowed(self.request(source.path()), window)
            .query("granularity", &self.granularity);
        let body = self.executor.execute(ctx, &request).await?;

        let raw = match body.get("intervals") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(_) => {
                return Err(SyncError::Decode {
                    endpoint: request.endpoint,
                    message: "`intervals` is not an array".to_string(),
                })
            }
        };

        let mut skipped = 0usize;
        let intervals: Vec<RawInterval> = source
            .shape()
            .unwrap(raw)
            .into_iter()
            .filter_map(|item| match serde_json::from_value(item) {
                Ok(interval) => Some(interval),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(source = %source, error = %e, "skipping malformed interval");
                    None
                }
            })
            .collect();

        tracing::info!(
            source = %source,
            intervals = intervals.len(),
            skipped,
            start_at = ?window.start_at,
            end_at = window.end_at,
            "fetched source intervals"
        );
        Ok(intervals)
    }

    /// Current battery operating mode from the live snapshot, if reported.
    pub async fn fetch_snapshot(&self, ctx: &SyncContext) -> Result<Option<String>, SyncError> {
        let body = self
            .executor
            .execute(ctx, &self.request("latest_telemetry"))
            .await?;
        Ok(battery_mode_from_snapshot(&body))
    }

    pub async fn fetch_events(
        &self,
        ctx: &SyncContext,
        window: &SyncWindow,
    ) -> Result<Vec<SystemEvent>, SyncError> {
        let request = self.windowed(self.request("events"), window);
        let body = self.executor.execute(ctx, &request).await?;

        let events = match body.get("events") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match RawEvent::deserialize(item) {
                    Ok(raw) => Some(SystemEvent::from(raw)),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed event");
                        None
                    }
                })
                .collect(),
            _ => Vec::new(),
        };

        tracing::info!(events = events.len(), "fetched system events");
        Ok(events)
    }
}

fn battery_mode_from_snapshot(body: &Value) -> Option<String> {
    let mode = match body.get("battery") {
        Some(Value::Object(battery)) => battery.get("operational_mode"),
        _ => body.get("battery_mode"),
    };
    mode.and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}
