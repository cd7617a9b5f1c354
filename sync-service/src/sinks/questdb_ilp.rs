use std::{net::SocketAddr, time::Duration};

use rust_client::domain::{SolarEventRow, SolarTelemetryRow};
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::{io::AsyncWriteExt, net::TcpStream};

use crate::pipeline::SyncError;

/// Escape measurement names and column names for ILP.
///
/// ILP requires escaping commas, spaces and equals with a backslash.
fn ilp_escape_ident(s: &str, out: &mut String) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

/// Line writer for one ILP row: `table col=v,col=v ts`.
struct Line<'a> {
    out: &'a mut String,
    first: bool,
}

impl<'a> Line<'a> {
    fn start(out: &'a mut String, table: &str) -> Self {
        ilp_escape_ident(table, out);
        out.push(' ');
        Self { out, first: true }
    }

    fn key(&mut self, key: &str) {
        if self.first {
            self.first = false;
        } else {
            self.out.push(',');
        }
        ilp_escape_ident(key, self.out);
        self.out.push('=');
    }

    fn f64(&mut self, key: &str, value: f64) -> &mut Self {
        self.key(key);
        self.out.push_str(&value.to_string());
        self
    }

    fn i64(&mut self, key: &str, value: i64) -> &mut Self {
        self.key(key);
        self.out.push_str(&value.to_string());
        self.out.push('i');
        self
    }

    fn bool(&mut self, key: &str, value: bool) -> &mut Self {
        self.key(key);
        self.out.push(if value { 't' } else { 'f' });
        self
    }

    /// Quoted string field; quotes, backslashes and newlines are escaped.
    fn str(&mut self, key: &str, value: &str) -> &mut Self {
        self.key(key);
        self.out.push('"');
        for ch in value.chars() {
            match ch {
                '"' | '\\' => {
                    self.out.push('\\');
                    self.out.push(ch);
                }
                '\n' => self.out.push_str("\\n"),
                _ => self.out.push(ch),
            }
        }
        self.out.push('"');
        self
    }

    /// Timestamp column, in microseconds.
    fn ts(&mut self, key: &str, value: OffsetDateTime) -> &mut Self {
        self.key(key);
        self.out.push_str(&(value.unix_timestamp_nanos() / 1_000).to_string());
        self.out.push('t');
        self
    }

    fn opt_ts(&mut self, key: &str, value: Option<OffsetDateTime>) -> &mut Self {
        match value {
            Some(v) => self.ts(key, v),
            None => self,
        }
    }

    /// Designated timestamp, in nanoseconds; ends the line.
    fn at(self, ts: OffsetDateTime) {
        self.out.push(' ');
        self.out.push_str(&ts.unix_timestamp_nanos().to_string());
    }
}

fn local_as_utc(ts: PrimitiveDateTime) -> OffsetDateTime {
    ts.assume_utc()
}

pub trait IlpEncode {
    fn write_ilp_line(&self, out: &mut String);
}

impl IlpEncode for SolarTelemetryRow {
    fn write_ilp_line(&self, out: &mut String) {
        let r = &self.record;
        let mut line = Line::start(out, "solar_telemetry");
        line.i64("system_id", self.system_id)
            .i64("end_at", r.end_at)
            .f64("production_wh", r.production_wh)
            .i64("production_devices", r.production_devices)
            .f64("consumption_wh", r.consumption_wh)
            .i64("consumption_devices", r.consumption_devices)
            .f64("battery_charge_wh", r.battery_charge_wh)
            .f64("battery_discharge_wh", r.battery_discharge_wh)
            .f64("battery_soc_percent", r.battery_soc_percent)
            .i64("battery_devices", r.battery_devices)
            .f64("grid_import_wh", r.grid_import_wh)
            .f64("grid_export_wh", r.grid_export_wh)
            .str("battery_mode", &r.battery_mode)
            .ts("reading_time_local", local_as_utc(self.reading_time_local))
            .ts("retrieved_at", self.retrieved_at);
        line.at(self.reading_time);
    }
}

impl IlpEncode for SolarEventRow {
    fn write_ilp_line(&self, out: &mut String) {
        let e = &self.event;
        let mut line = Line::start(out, "solar_events");
        line.i64("system_id", self.system_id)
            .i64("event_id", e.event_id)
            .i64("event_type_id", e.event_type_id)
            .str("event_type_key", &e.event_type_key)
            .str("event_description", &e.event_description)
            .str("severity", &e.severity)
            .opt_ts("started_at", self.started_at)
            .opt_ts("ended_at", self.ended_at)
            .bool("is_active", e.is_active)
            .str("device_serial", &e.device_serial)
            .ts("retrieved_at", self.retrieved_at);
        line.at(self.ts);
    }
}

/// Writes rows over a fresh ILP/TCP connection per call.
pub struct QuestDbIlpWriter {
    addr: SocketAddr,
    max_retries: u32,
    retry_backoff: Duration,
}

impl QuestDbIlpWriter {
    pub fn new(addr: SocketAddr, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            addr,
            max_retries,
            retry_backoff,
        }
    }

    async fn connect(&self) -> Result<TcpStream, SyncError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| SyncError::Sink(format!("failed to connect to QuestDB ILP: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    fn encode<T: IlpEncode>(rows: &[T]) -> Vec<u8> {
        // Heuristic capacity: ~400 bytes per line.
        let mut s = String::with_capacity(rows.len().saturating_mul(400));
        for row in rows {
            row.write_ilp_line(&mut s);
            s.push('\n');
        }
        s.into_bytes()
    }

    pub async fn write<T: IlpEncode + Sync>(&self, rows: &[T]) -> Result<usize, SyncError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let payload = Self::encode(rows);
        let mut stream = self.connect().await?;

        let mut attempt: u32 = 0;
        loop {
            match stream.write_all(&payload).await {
                Ok(()) => {
                    metrics::counter!("questdb_ilp_bytes_total").increment(payload.len() as u64);
                    // Best-effort flush.
                    let _ = stream.shutdown().await;
                    return Ok(rows.len());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        attempt,
                        "QuestDB ILP write failed, reconnecting and retrying"
                    );
                    metrics::counter!("questdb_ilp_retry_total").increment(1);

                    tokio::time::sleep(sleep_for).await;
                    stream = self.connect().await?;
                }
                Err(e) => {
                    tracing::error!(error = %e, "QuestDB ILP write failed, giving up");
                    metrics::counter!("questdb_ilp_sink_errors_total").increment(1);
                    return Err(SyncError::Sink(format!("ilp write failed: {e}")));
                }
            }
        }
    }
}
