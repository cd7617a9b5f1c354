use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{sync::Mutex, time::Instant};

use super::{
    executor::{is_retryable_status, status_error},
    transport::{ApiRequest, Transport},
};
use crate::pipeline::{SyncContext, SyncError};

const DEFAULT_EXPIRES_IN_SECS: u64 = 3_600;

#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RefreshToken(String);

impl RefreshToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshToken(***)")
    }
}

/// Where the latest refresh token survives between invocations.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self) -> Result<Option<RefreshToken>, SyncError>;

    async fn save(&self, token: &RefreshToken, updated_at: OffsetDateTime) -> Result<(), SyncError>;
}

#[derive(Serialize, Deserialize)]
struct PersistedToken {
    refresh_token: String,
    updated_at: String,
}

/// JSON file holding `{refresh_token, updated_at}`, replaced atomically.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<RefreshToken>, SyncError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::Credentials(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let persisted: PersistedToken = serde_json::from_str(&contents).map_err(|e| {
            SyncError::Credentials(format!("failed to parse {}: {e}", self.path.display()))
        })?;

        tracing::info!(updated_at = %persisted.updated_at, "loaded persisted refresh token");
        Ok(Some(RefreshToken(persisted.refresh_token)).filter(|t| !t.0.is_empty()))
    }

    async fn save(&self, token: &RefreshToken, updated_at: OffsetDateTime) -> Result<(), SyncError> {
        let persisted = PersistedToken {
            refresh_token: token.0.clone(),
            updated_at: updated_at
                .format(&Rfc3339)
                .map_err(|e| SyncError::Credentials(format!("failed to format timestamp: {e}")))?,
        };
        let json = serde_json::to_vec_pretty(&persisted)
            .map_err(|e| SyncError::Credentials(format!("failed to encode token: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| SyncError::Credentials(format!("failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            SyncError::Credentials(format!("failed to replace {}: {e}", self.path.display()))
        })?;

        tracing::info!(path = %self.path.display(), "saved rotated refresh token");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    /// Tokens are treated as expired this long before their stated expiry.
    pub expiry_margin: Duration,
}

#[derive(Default)]
struct Credential {
    access_token: Option<AccessToken>,
    refresh_token: Option<RefreshToken>,
    expires_at: Option<Instant>,
    /// Single-use bootstrap code, consumed by the first exchange attempt.
    authorization_code: Option<String>,
}

impl Credential {
    fn usable_access_token(&self, now: Instant, margin: Duration) -> Option<&AccessToken> {
        match (&self.access_token, self.expires_at) {
            (Some(token), Some(expires_at)) if now + margin < expires_at => Some(token),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

enum Grant {
    RefreshToken(RefreshToken),
    AuthorizationCode(String),
}

impl Grant {
    fn kind(&self) -> &'static str {
        match self {
            Self::RefreshToken(_) => "refresh_token",
            Self::AuthorizationCode(_) => "authorization_code",
        }
    }
}

/// Owns the OAuth token pair. The refresh path is exclusive: callers queue on
/// the state lock while an exchange is in flight.
pub struct CredentialManager {
    transport: Arc<dyn Transport>,
    store: Box<dyn CredentialStore>,
    settings: OAuthSettings,
    state: Mutex<Credential>,
}

impl CredentialManager {
    /// Prefers the persisted refresh token over the configured one.
    pub async fn load(
        transport: Arc<dyn Transport>,
        store: Box<dyn CredentialStore>,
        settings: OAuthSettings,
        configured: Option<RefreshToken>,
        authorization_code: Option<String>,
    ) -> Self {
        let refresh_token = match store.load().await {
            Ok(Some(token)) => {
                tracing::info!(token_source = "store", "using persisted refresh token");
                Some(token)
            }
            Ok(None) => {
                tracing::info!(token_source = "config", "no persisted refresh token");
                configured
            }
            Err(e) => {
                tracing::warn!(error = %e, token_source = "config", "failed to load persisted refresh token");
                configured
            }
        };

        Self {
            transport,
            store,
            settings,
            state: Mutex::new(Credential {
                refresh_token,
                authorization_code: authorization_code.filter(|c| !c.is_empty()),
                ..Credential::default()
            }),
        }
    }

    pub async fn ensure_access_token(&self, ctx: &SyncContext) -> Result<AccessToken, SyncError> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.usable_access_token(Instant::now(), self.settings.expiry_margin) {
            tracing::debug!("using cached access token");
            return Ok(token.clone());
        }
        self.refresh_locked(ctx, &mut state).await
    }

    /// Refreshes after the API rejected `rejected`, unless a concurrent caller
    /// already replaced it.
    pub async fn force_refresh(
        &self,
        ctx: &SyncContext,
        rejected: &AccessToken,
    ) -> Result<AccessToken, SyncError> {
        let mut state = self.state.lock().await;
        if let Some(current) = state.usable_access_token(Instant::now(), self.settings.expiry_margin) {
            if current != rejected {
                return Ok(current.clone());
            }
        }
        state.access_token = None;
        self.refresh_locked(ctx, &mut state).await
    }

    async fn refresh_locked(
        &self,
        ctx: &SyncContext,
        state: &mut Credential,
    ) -> Result<AccessToken, SyncError> {
        ctx.check_deadline()?;

        let grant = if let Some(token) = &state.refresh_token {
            Grant::RefreshToken(token.clone())
        } else if let Some(code) = state.authorization_code.take() {
            Grant::AuthorizationCode(code)
        } else {
            return Err(SyncError::Authentication(
                "no refresh token or authorization code available".to_string(),
            ));
        };

        let mut request = ApiRequest::post("oauth_token", &self.settings.token_url)
            .basic_auth(&self.settings.client_id, &self.settings.client_secret)
            .form("grant_type", grant.kind());
        request = match &grant {
            Grant::RefreshToken(token) => request.form("refresh_token", token.as_str()),
            Grant::AuthorizationCode(code) => request
                .form("code", code.as_str())
                .form("redirect_uri", &self.settings.redirect_uri),
        };

        let started = Instant::now();
        let response = self.transport.send(&request).await.map_err(|e| {
            metrics::counter!("enphase_token_refresh_total", "outcome" => "error").increment(1);
            SyncError::TransientRequest {
                endpoint: request.endpoint.clone(),
                status: None,
                message: e.to_string(),
            }
        })?;

        if !response.is_success() {
            metrics::counter!("enphase_token_refresh_total", "outcome" => "rejected").increment(1);
            tracing::error!(
                grant = grant.kind(),
                status = response.status,
                response = %response.body_excerpt(),
                "token exchange failed"
            );
            return Err(match response.status {
                400 | 401 | 403 => SyncError::Authentication(format!(
                    "token endpoint rejected {} grant with status {}",
                    grant.kind(),
                    response.status
                )),
                _ => status_error(&request.endpoint, &response, is_retryable_status),
            });
        }

        let token: TokenResponse =
            serde_json::from_str(&response.body).map_err(|e| SyncError::Decode {
                endpoint: request.endpoint.clone(),
                message: e.to_string(),
            })?;

        let access_token = AccessToken(token.access_token);
        state.access_token = Some(access_token.clone());
        state.expires_at = Some(
            Instant::now() + Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)),
        );

        let rotated = token.refresh_token.filter(|t| !t.is_empty());
        let token_rotated = rotated.is_some();
        if let Some(refresh_token) = rotated {
            let refresh_token = RefreshToken(refresh_token);
            state.refresh_token = Some(refresh_token.clone());
            // The upstream has already invalidated the previous token.
            if let Err(e) = self.store.save(&refresh_token, OffsetDateTime::now_utc()).await {
                metrics::counter!("enphase_token_persist_errors_total").increment(1);
                tracing::error!(error = %e, "failed to persist rotated refresh token");
            }
        }

        metrics::counter!("enphase_token_refresh_total", "outcome" => "ok").increment(1);
        tracing::info!(
            grant = grant.kind(),
            token_rotated,
            duration_ms = started.elapsed().as_millis() as u64,
            "access token refreshed"
        );
        Ok(access_token)
    }
}
