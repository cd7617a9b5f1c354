use std::{collections::BTreeSet, net::SocketAddr, time::Duration};

use rust_client::{
    db,
    domain::{MergedRecord, SolarEventRow, SolarTelemetryRow, SystemEvent},
};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Postgres, QueryBuilder,
};
use time::{OffsetDateTime, UtcOffset};

use super::questdb_ilp::QuestDbIlpWriter;
use crate::{
    config::{QuestDbConfig, SinkConfig, SinkKind},
    pipeline::{SyncError, TelemetrySink},
};

const TELEMETRY_COLUMNS: &str = "INSERT INTO solar_telemetry (system_id, end_at, reading_time, reading_time_local, retrieved_at, \
     production_wh, production_devices, consumption_wh, consumption_devices, battery_charge_wh, battery_discharge_wh, \
     battery_soc_percent, battery_devices, grid_import_wh, grid_export_wh, battery_mode) ";

const EVENT_COLUMNS: &str = "INSERT INTO solar_events (ts, system_id, event_id, event_type_id, event_type_key, \
     event_description, severity, started_at, ended_at, is_active, device_serial, retrieved_at) ";

/// Reads watermarks over pgwire; writes over pgwire or ILP.
pub struct QuestDbSink {
    pool: PgPool,
    ilp: Option<QuestDbIlpWriter>,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    site_offset: UtcOffset,
}

impl QuestDbSink {
    pub fn new(
        pool: PgPool,
        ilp: Option<QuestDbIlpWriter>,
        batch_size: usize,
        max_retries: u32,
        retry_backoff: Duration,
        site_offset: UtcOffset,
    ) -> Self {
        Self {
            pool,
            ilp,
            batch_size: batch_size.max(1),
            max_retries,
            retry_backoff,
            site_offset,
        }
    }

    pub async fn connect(
        questdb: &QuestDbConfig,
        sink: &SinkConfig,
        site_offset: UtcOffset,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(questdb.max_connections)
            .connect(&questdb.uri)
            .await?;
        let retry_backoff = Duration::from_millis(sink.retry_backoff_ms);

        let ilp = match sink.kind {
            SinkKind::Pgwire => None,
            SinkKind::Ilp => {
                let addr: SocketAddr = questdb
                    .ilp_tcp_addr
                    .parse()
                    .map_err(|e| anyhow::anyhow!("invalid questdb.ilp_tcp_addr: {e}"))?;
                Some(QuestDbIlpWriter::new(addr, sink.max_retries, retry_backoff))
            }
        };
        tracing::info!(kind = ?sink.kind, "QuestDB sink connected");

        Ok(Self::new(
            pool,
            ilp,
            sink.batch_size,
            sink.max_retries,
            retry_backoff,
            site_offset,
        ))
    }

    /// Writes one batch, retrying with linear backoff; on final failure falls
    /// back to row-at-a-time inserts so one bad row costs only itself.
    async fn flush_batch(&self, batch: &[SolarTelemetryRow]) -> usize {
        let mut attempt: u32 = 0;
        loop {
            match self.insert_batch(batch).await {
                Ok(()) => return batch.len(),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "questdb sink flush failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, rows = batch.len(), "questdb batch insert failed, falling back to single rows");
                    metrics::counter!("questdb_sink_errors_total").increment(1);
                    break;
                }
            }
        }

        let mut written = 0;
        for row in batch {
            match self.insert_batch(std::slice::from_ref(row)).await {
                Ok(()) => written += 1,
                Err(e) => {
                    metrics::counter!("questdb_rejected_rows_total").increment(1);
                    tracing::error!(error = %e, end_at = row.record.end_at, "failed to ingest telemetry row");
                }
            }
        }
        written
    }

    async fn insert_batch(&self, batch: &[SolarTelemetryRow]) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(TELEMETRY_COLUMNS);

        builder.push("VALUES ");
        builder.push_values(batch, |mut b, row| {
            let r = &row.record;
            b.push_bind(row.system_id)
                .push_bind(r.end_at)
                .push_bind(row.reading_time)
                .push_bind(row.reading_time_local)
                .push_bind(row.retrieved_at)
                .push_bind(r.production_wh)
                .push_bind(r.production_devices)
                .push_bind(r.consumption_wh)
                .push_bind(r.consumption_devices)
                .push_bind(r.battery_charge_wh)
                .push_bind(r.battery_discharge_wh)
                .push_bind(r.battery_soc_percent)
                .push_bind(r.battery_devices)
                .push_bind(r.grid_import_wh)
                .push_bind(r.grid_export_wh)
                .push_bind(&r.battery_mode);
        });

        let query = builder.build();
        query.execute(&self.pool).await.map(|_| ())
    }

    async fn insert_event(&self, row: &SolarEventRow) -> Result<(), sqlx::Error> {
        let e = &row.event;
        let mut builder = QueryBuilder::<Postgres>::new(EVENT_COLUMNS);
        builder.push("VALUES ");
        builder.push_values(std::iter::once(row), |mut b, row| {
            b.push_bind(row.ts)
                .push_bind(row.system_id)
                .push_bind(e.event_id)
                .push_bind(e.event_type_id)
                .push_bind(&e.event_type_key)
                .push_bind(&e.event_description)
                .push_bind(&e.severity)
                .push_bind(row.started_at)
                .push_bind(row.ended_at)
                .push_bind(e.is_active)
                .push_bind(&e.device_serial)
                .push_bind(row.retrieved_at);
        });
        builder.build().execute(&self.pool).await.map(|_| ())
    }
}

/// Projects merged records onto stored rows, dropping unrepresentable ones.
fn telemetry_rows(
    system_id: i64,
    retrieved_at: OffsetDateTime,
    site_offset: UtcOffset,
    records: &[MergedRecord],
) -> Vec<SolarTelemetryRow> {
    records
        .iter()
        .filter_map(|record| {
            let row = SolarTelemetryRow::new(system_id, retrieved_at, site_offset, record.clone());
            if row.is_none() {
                tracing::warn!(end_at = record.end_at, "skipping record with out-of-range end_at");
            }
            row
        })
        .collect()
}

#[async_trait::async_trait]
impl TelemetrySink for QuestDbSink {
    async fn watermark(&self, system_id: i64) -> Result<Option<i64>, SyncError> {
        db::latest_end_at(&self.pool, system_id)
            .await
            .map_err(|e| SyncError::Sink(format!("failed to read watermark: {e:#}")))
    }

    async fn existing_keys(
        &self,
        system_id: i64,
        start_at: i64,
        end_at: i64,
    ) -> Result<BTreeSet<i64>, SyncError> {
        db::existing_end_ats(&self.pool, system_id, start_at, end_at)
            .await
            .map_err(|e| SyncError::Sink(format!("failed to read existing keys: {e:#}")))
    }

    async fn ingest(
        &self,
        system_id: i64,
        retrieved_at: OffsetDateTime,
        records: &[MergedRecord],
    ) -> Result<usize, SyncError> {
        let rows = telemetry_rows(system_id, retrieved_at, self.site_offset, records);
        if rows.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        for batch in rows.chunks(self.batch_size) {
            written += match &self.ilp {
                Some(ilp) => ilp.write(batch).await.unwrap_or_else(|e| {
                    tracing::error!(error = %e, rows = batch.len(), "ILP batch dropped");
                    0
                }),
                None => self.flush_batch(batch).await,
            };
        }

        metrics::counter!("questdb_ingested_records_total").increment(written as u64);
        if written == 0 {
            return Err(SyncError::Sink(format!("none of {} telemetry rows were written", rows.len())));
        }
        tracing::info!(rows = rows.len(), written, "telemetry ingested");
        Ok(written)
    }

    async fn ingest_events(
        &self,
        system_id: i64,
        events: &[SystemEvent],
        retrieved_at: OffsetDateTime,
    ) -> Result<usize, SyncError> {
        let rows: Vec<SolarEventRow> = events
            .iter()
            .map(|event| SolarEventRow::new(system_id, retrieved_at, event.clone()))
            .collect();

        if let Some(ilp) = &self.ilp {
            return ilp.write(&rows).await;
        }

        let mut written = 0;
        for row in &rows {
            match self.insert_event(row).await {
                Ok(()) => written += 1,
                Err(e) => {
                    metrics::counter!("questdb_rejected_rows_total").increment(1);
                    tracing::error!(error = %e, event_id = row.event.event_id, "failed to ingest event row");
                }
            }
        }
        tracing::info!(events = rows.len(), written, "events ingested");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    #[test]
    fn out_of_range_records_are_dropped() {
        let records = vec![MergedRecord::new(1_717_200_900), MergedRecord::new(i64::MAX)];

        let rows = telemetry_rows(42, datetime!(2024-06-01 01:00:00 UTC), offset!(-10), &records);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].system_id, 42);
        assert_eq!(rows[0].reading_time_local, datetime!(2024-05-31 14:15:00));
    }

    #[test]
    fn column_lists_match_bind_counts() {
        let count = |sql: &str| {
            let open = sql.find('(').unwrap_or(0);
            let close = sql.find(')').unwrap_or(0);
            sql[open + 1..close].split(',').count()
        };
        assert_eq!(count(TELEMETRY_COLUMNS), 16);
        assert_eq!(count(EVENT_COLUMNS), 12);
    }
}
