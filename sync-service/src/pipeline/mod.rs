mod backfill;
mod controller;
mod window;

use std::{collections::BTreeSet, time::Duration};

use rust_client::domain::{MergedRecord, SystemEvent};
use time::OffsetDateTime;
use tokio::time::Instant;

pub use backfill::{BackfillRequest, BackfillStatus, BackfillSummary};
pub use controller::{CycleReport, SyncController, SyncPhase, SyncSettings};
pub use window::{backfill_chunks, plan_window, BackfillChunk, DataGap, SyncWindow, WindowPlan};

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// No usable credential, or the API rejected a freshly refreshed token.
    #[error("authentication error: {0}")]
    Authentication(String),
    /// 5xx, 429, 408 or transport failure, after the retry budget ran out.
    #[error("transient request error on `{endpoint}` (status {status:?}): {message}")]
    TransientRequest {
        endpoint: String,
        status: Option<u16>,
        message: String,
    },
    /// Any other 4xx; never retried.
    #[error("client request error on `{endpoint}` (status {status}): {message}")]
    ClientRequest {
        endpoint: String,
        status: u16,
        message: String,
    },
    #[error("failed to decode `{endpoint}` response: {message}")]
    Decode { endpoint: String, message: String },
    #[error("sink error: {0}")]
    Sink(String),
    #[error("credential store error: {0}")]
    Credentials(String),
    #[error("invocation deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientRequest { .. })
    }

    /// Errors that end the whole invocation rather than one source or one day.
    pub fn aborts_invocation(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::DeadlineExceeded(_))
    }
}

/// Per-invocation state handed to every component of one sync or backfill run.
#[derive(Debug, Clone)]
pub struct SyncContext {
    invocation_id: String,
    retrieved_at: OffsetDateTime,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl SyncContext {
    pub fn new(kind: &str) -> Self {
        let retrieved_at = OffsetDateTime::now_utc();
        Self {
            invocation_id: format!("{kind}-{:x}", retrieved_at.unix_timestamp_nanos()),
            retrieved_at,
            started_at: Instant::now(),
            deadline: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.deadline = timeout.and_then(|t| self.started_at.checked_add(t));
        self
    }

    /// Pins the wall-clock instant the invocation treats as "now".
    pub fn at(mut self, retrieved_at: OffsetDateTime) -> Self {
        self.retrieved_at = retrieved_at;
        self
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn retrieved_at(&self) -> OffsetDateTime {
        self.retrieved_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn check_deadline(&self) -> Result<(), SyncError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(SyncError::DeadlineExceeded(self.elapsed()))
            }
            _ => Ok(()),
        }
    }

    /// Sleeps unless the wait would run past the deadline.
    pub async fn sleep(&self, duration: Duration) -> Result<(), SyncError> {
        if let Some(deadline) = self.deadline {
            if Instant::now().checked_add(duration).map_or(true, |wake| wake > deadline) {
                return Err(SyncError::DeadlineExceeded(self.elapsed().saturating_add(duration)));
            }
        }
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

/// Durable store for merged telemetry.
#[async_trait::async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn watermark(&self, system_id: i64) -> Result<Option<i64>, SyncError>;

    async fn existing_keys(
        &self,
        system_id: i64,
        start_at: i64,
        end_at: i64,
    ) -> Result<BTreeSet<i64>, SyncError>;

    /// Returns the number of rows written; failed rows are logged and skipped.
    async fn ingest(
        &self,
        system_id: i64,
        retrieved_at: OffsetDateTime,
        records: &[MergedRecord],
    ) -> Result<usize, SyncError>;

    async fn ingest_events(
        &self,
        system_id: i64,
        events: &[SystemEvent],
        retrieved_at: OffsetDateTime,
    ) -> Result<usize, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_past_deadline_fails_without_waiting() {
        let ctx = SyncContext::new("test").with_timeout(Some(Duration::from_secs(5)));
        let before = Instant::now();

        let res = ctx.sleep(Duration::from_secs(10)).await;

        assert!(matches!(res, Err(SyncError::DeadlineExceeded(_))));
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_trips_once_elapsed() {
        let ctx = SyncContext::new("test").with_timeout(Some(Duration::from_secs(5)));
        assert!(ctx.check_deadline().is_ok());

        ctx.sleep(Duration::from_secs(5)).await.expect("within deadline");

        assert!(matches!(ctx.check_deadline(), Err(SyncError::DeadlineExceeded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_sleep_trips_the_deadline() {
        let ctx = SyncContext::new("test").with_timeout(Some(Duration::from_secs(5)));

        let res = ctx.sleep(Duration::MAX).await;

        assert!(matches!(res, Err(SyncError::DeadlineExceeded(_))));
    }

    #[test]
    fn only_auth_and_deadline_abort_invocations() {
        assert!(SyncError::Authentication("x".into()).aborts_invocation());
        assert!(SyncError::DeadlineExceeded(Duration::ZERO).aborts_invocation());
        assert!(!SyncError::Sink("x".into()).aborts_invocation());
        assert!(!SyncError::TransientRequest {
            endpoint: "battery".into(),
            status: Some(503),
            message: String::new(),
        }
        .aborts_invocation());
    }
}
