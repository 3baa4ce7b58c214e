//! Authentication modes for the API client.
//!
//! Exactly one mode is active for the lifetime of a client:
//!
//! - **Access token**: a personal access token sent as basic auth with an empty user.
//! - **Service principal**: OAuth2 client-credentials grant. The token is cached and
//!   refreshed once it is within [`REFRESH_MARGIN`] of expiry.

use std::time::{Duration, Instant};

use reqwest::RequestBuilder;
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use super::error::AuthError;

/// Default Microsoft identity platform authority.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/";

/// OAuth2 scope of the Azure DevOps resource.
pub const DEVOPS_SCOPE: &str = "499b84ac-1321-427f-aa17-267ca6975798/.default";

/// Tokens closer than this to expiry are refreshed before use.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Resolved credentials, chosen once at startup.
#[derive(Clone)]
pub enum Credentials {
    /// Personal access token.
    AccessToken(String),
    /// Service principal client credentials.
    ServicePrincipal(ServicePrincipal),
}

impl Credentials {
    /// Short name of the authentication mode, safe to log.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::AccessToken(_) => "access-token",
            Self::ServicePrincipal(_) => "service-principal",
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessToken(_) => f.write_str("AccessToken(***)"),
            Self::ServicePrincipal(sp) => f.debug_tuple("ServicePrincipal").field(sp).finish(),
        }
    }
}

/// Tenant, client id and secret of a service principal.
#[derive(Clone)]
pub struct ServicePrincipal {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    authority: String,
}

impl ServicePrincipal {
    /// Create service principal credentials against the default authority.
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            authority: DEFAULT_AUTHORITY.to_string(),
        }
    }

    /// Use a different identity authority (sovereign clouds, tests).
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    /// Tenant id.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn token_url(&self) -> Result<Url, AuthError> {
        let mut authority = self.authority.clone();
        if !authority.ends_with('/') {
            authority.push('/');
        }
        let url = Url::parse(&authority)?.join(&format!("{}/oauth2/v2.0/token", self.tenant_id))?;
        Ok(url)
    }
}

impl std::fmt::Debug for ServicePrincipal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServicePrincipal")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.saturating_duration_since(now) > REFRESH_MARGIN
    }
}

/// Applies the active credentials to outgoing requests.
pub(crate) enum Authorizer {
    Basic(String),
    Bearer(TokenSource),
}

impl Authorizer {
    /// Build the authorizer. Service principal mode acquires its first token here,
    /// so bad credentials fail before anything else starts.
    pub(crate) async fn new(
        credentials: Credentials,
        http: reqwest::Client,
    ) -> Result<Self, AuthError> {
        match credentials {
            Credentials::AccessToken(token) => Ok(Self::Basic(token)),
            Credentials::ServicePrincipal(principal) => {
                let source = TokenSource {
                    principal,
                    http,
                    cached: Mutex::new(None),
                };
                source.token().await?;
                Ok(Self::Bearer(source))
            }
        }
    }

    pub(crate) async fn authorize(
        &self,
        request: RequestBuilder,
    ) -> Result<RequestBuilder, AuthError> {
        match self {
            Self::Basic(token) => Ok(request.basic_auth("", Some(token))),
            Self::Bearer(source) => Ok(request.bearer_auth(source.token().await?)),
        }
    }
}

pub(crate) struct TokenSource {
    principal: ServicePrincipal,
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    async fn token(&self) -> Result<String, AuthError> {
        // Held across the refresh so concurrent callers wait for one token request.
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Instant::now()) {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.acquire().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn acquire(&self) -> Result<CachedToken, AuthError> {
        let url = self.principal.token_url()?;
        let response = self
            .http
            .post(url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.principal.client_id.as_str()),
                ("client_secret", self.principal.client_secret.as_str()),
                ("scope", DEVOPS_SCOPE),
            ])
            .send()
            .await
            .map_err(AuthError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, body });
        }

        let token: TokenResponse = response.json().await.map_err(AuthError::Decode)?;
        tracing::debug!(
            tenant_id = %self.principal.tenant_id,
            expires_in = token.expires_in,
            "Acquired service principal token"
        );

        Ok(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }
}
