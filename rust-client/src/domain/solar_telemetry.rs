use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Unified reading for one `end_at`, combining every telemetry source.
///
/// Every measure starts at zero (or an empty mode) and is only overwritten by
/// the source that owns it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedRecord {
    pub end_at: i64,
    pub production_wh: f64,
    pub production_devices: i64,
    pub consumption_wh: f64,
    pub consumption_devices: i64,
    pub battery_charge_wh: f64,
    pub battery_discharge_wh: f64,
    pub battery_soc_percent: f64,
    pub battery_devices: i64,
    pub grid_import_wh: f64,
    pub grid_export_wh: f64,
    pub battery_mode: String,
}

impl MergedRecord {
    /// Zero-initialised record keyed by `end_at`.
    pub fn new(end_at: i64) -> Self {
        Self {
            end_at,
            ..Self::default()
        }
    }
}

/// A `MergedRecord` as persisted in `solar_telemetry`.
#[derive(Debug, Clone, PartialEq)]
pub struct SolarTelemetryRow {
    pub system_id: i64,
    /// Designated timestamp, UTC instant of `end_at`.
    pub reading_time: OffsetDateTime,
    /// Site wall-clock time of `end_at`.
    pub reading_time_local: PrimitiveDateTime,
    pub retrieved_at: OffsetDateTime,
    pub record: MergedRecord,
}

impl SolarTelemetryRow {
    /// Returns `None` when `end_at` is outside the representable range.
    pub fn new(
        system_id: i64,
        retrieved_at: OffsetDateTime,
        site_offset: UtcOffset,
        record: MergedRecord,
    ) -> Option<Self> {
        let reading_time = OffsetDateTime::from_unix_timestamp(record.end_at).ok()?;
        let local = reading_time.to_offset(site_offset);

        Some(Self {
            system_id,
            reading_time,
            reading_time_local: PrimitiveDateTime::new(local.date(), local.time()),
            retrieved_at,
            record,
        })
    }
}
