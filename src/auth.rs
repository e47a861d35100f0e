use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// OAuth2 scope for full platform access, required for Artifact Registry
/// pushes.
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// GCE metadata server endpoint for the default service account token.
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Registry username that pairs with a GCP OAuth2 access token.
const OAUTH2_ACCESS_TOKEN_USER: &str = "oauth2accesstoken";

/// Refresh ahead of expiry so in-flight copies never straddle it.
const EXPIRY_LEEWAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token exchange request failed: {0}")]
    Exchange(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Endpoint {
        status: reqwest::StatusCode,
        body: String,
    },
}

/// Short-lived registry credential: a fixed principal plus a bearer secret.
///
/// Fetched once per reconciliation and shared read-only by every tag copy of
/// that reconciliation.
#[derive(Debug, Clone)]
pub struct Credential {
    pub principal: String,
    pub secret: String,
}

/// Injected capability for obtaining the current registry credential.
///
/// Implementations are responsible for transparently refreshing an expired
/// underlying token; callers only ever ask for the current value.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn current_token(&self) -> Result<Credential, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    secret: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + EXPIRY_LEEWAY < self.expires_at
    }
}

/// Token source backed by the GCE metadata server, scoped to cloud-platform
/// access. Established once at startup and reused for the process lifetime;
/// the token is cached and re-fetched shortly before it expires.
pub struct GcpTokenSource {
    http: reqwest::Client,
    token_url: String,
    cached: Mutex<Option<CachedToken>>,
}

impl GcpTokenSource {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: METADATA_TOKEN_URL.to_string(),
            cached: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<CachedToken, AuthError> {
        let response = self
            .http
            .get(&self.token_url)
            .query(&[("scopes", CLOUD_PLATFORM_SCOPE)])
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Endpoint { status, body });
        }

        let token: TokenResponse = response.json().await?;
        Ok(CachedToken {
            secret: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}

impl Default for GcpTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for GcpTokenSource {
    async fn current_token(&self) -> Result<Credential, AuthError> {
        let mut cached = self.cached.lock().await;

        let secret = match cached.as_ref().filter(|token| token.is_fresh(Instant::now())) {
            Some(token) => token.secret.clone(),
            None => {
                debug!("Refreshing registry access token");
                let token = self.fetch().await?;
                let secret = token.secret.clone();
                *cached = Some(token);
                secret
            }
        };

        Ok(Credential {
            principal: OAUTH2_ACCESS_TOKEN_USER.to_string(),
            secret,
        })
    }
}
