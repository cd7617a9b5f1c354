use std::{sync::Arc, time::Duration};

use rand::Rng;
use serde_json::Value;
use tokio::time::Instant;

use super::{
    credentials::CredentialManager,
    rate_limit::RateLimiter,
    transport::{ApiRequest, ApiResponse, Transport},
};
use crate::pipeline::{SyncContext, SyncError};

/// 5xx, 429 and 408 are worth retrying; other statuses are final.
pub fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of each delay that may be shaved off at random.
    pub jitter: f64,
    pub retryable_status: fn(u16) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
            retryable_status: is_retryable_status,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return exp;
        }
        exp.mul_f64(1.0 - jitter * rand::thread_rng().gen::<f64>())
    }
}

/// Maps a non-success response onto the error taxonomy.
pub fn status_error(
    endpoint: &str,
    response: &ApiResponse,
    retryable: impl Fn(u16) -> bool,
) -> SyncError {
    if retryable(response.status) {
        SyncError::TransientRequest {
            endpoint: endpoint.to_string(),
            status: Some(response.status),
            message: response.body_excerpt(),
        }
    } else {
        SyncError::ClientRequest {
            endpoint: endpoint.to_string(),
            status: response.status,
            message: response.body_excerpt(),
        }
    }
}

/// Single path for every data API call: token, throttle, send, retry.
pub struct RateLimitedExecutor {
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialManager>,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl RateLimitedExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialManager>,
        limiter: RateLimiter,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            credentials,
            limiter,
            policy,
        }
    }

    pub async fn execute(&self, ctx: &SyncContext, request: &ApiRequest) -> Result<Value, SyncError> {
        let mut attempt: u32 = 0;
        loop {
            ctx.check_deadline()?;
            match self.execute_once(ctx, request).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    let delay = self.policy.backoff(attempt);
                    attempt += 1;
                    metrics::counter!("enphase_api_retries_total", "endpoint" => request.endpoint.clone())
                        .increment(1);
                    tracing::warn!(
                        endpoint = %request.endpoint,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "API request failed, retrying with backoff"
                    );
                    ctx.sleep(delay).await?;
                }
                Err(e) => {
                    tracing::error!(endpoint = %request.endpoint, error = %e, attempt, "API request failed");
                    return Err(e);
                }
            }
        }
    }

    /// One logical attempt; a 401 earns exactly one forced refresh.
    async fn execute_once(&self, ctx: &SyncContext, request: &ApiRequest) -> Result<Value, SyncError> {
        let token = self.credentials.ensure_access_token(ctx).await?;
        let response = self.send(ctx, &request.with_bearer(token.as_str())).await?;
        if response.status != 401 {
            return self.decode(request, response);
        }

        tracing::warn!(endpoint = %request.endpoint, "access token rejected, forcing refresh");
        let token = self.credentials.force_refresh(ctx, &token).await?;
        let response = self.send(ctx, &request.with_bearer(token.as_str())).await?;
        if response.status == 401 {
            return Err(SyncError::Authentication(format!(
                "`{}` rejected a freshly refreshed access token",
                request.endpoint
            )));
        }
        self.decode(request, response)
    }

    async fn send(&self, ctx: &SyncContext, request: &ApiRequest) -> Result<ApiResponse, SyncError> {
        self.limiter.acquire(ctx).await?;

        let started = Instant::now();
        let result = self.transport.send(request).await;
        let status = match &result {
            Ok(response) => response.status.to_string(),
            Err(_) => "error".to_string(),
        };
        metrics::histogram!("enphase_api_request_duration_seconds", "endpoint" => request.endpoint.clone())
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(
            "enphase_api_requests_total",
            "endpoint" => request.endpoint.clone(),
            "outcome" => status
        )
        .increment(1);

        result.map_err(|e| SyncError::TransientRequest {
            endpoint: request.endpoint.clone(),
            status: None,
            message: e.to_string(),
        })
    }

    fn decode(&self, request: &ApiRequest, response: ApiResponse) -> Result<Value, SyncError> {
        if !response.is_success() {
            return Err(status_error(
                &request.endpoint,
                &response,
                self.policy.retryable_status,
            ));
        }
        serde_json::from_str(&response.body).map_err(|e| SyncError::Decode {
            endpoint: request.endpoint.clone(),
            message: e.to_string(),
        })
    }
}
