pub mod credentials;
pub mod executor;
pub mod rate_limit;
pub mod telemetry;
pub mod transport;

pub use credentials::{
    AccessToken, CredentialManager, CredentialStore, FileCredentialStore, OAuthSettings, RefreshToken,
};
pub use executor::{is_retryable_status, RateLimitedExecutor, RetryPolicy};
pub use rate_limit::{RateLimiter, SlidingWindow};
pub use telemetry::{
    BatteryFlow, FetchMode, FetchOutcome, RawInterval, ResponseShape, SourceFailure, StateOfCharge,
    TelemetryFetcher, TelemetrySource,
};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport, TransportError};
