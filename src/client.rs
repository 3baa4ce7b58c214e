//! Resilient Azure DevOps API client.
//!
//! Every outbound call goes through [`DevOpsClient::execute`], which enforces:
//!
//! - a process-wide concurrency ceiling (one semaphore permit per attempt),
//! - retries with backoff on transport errors, timeouts, 5xx and 429 responses,
//! - the configured `api-version` on every request,
//! - the single authentication mode chosen at construction.
//!
//! List endpoints are read through [`Paginator`], which follows continuation
//! tokens up to a caller supplied result-count limit.
//!
//! # Example
//!
//! ```rust,no_run
//! use devops_exporter::client::{ApiRequest, Credentials, DevOpsClient, UNLIMITED};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DevOpsClient::builder("contoso")
//!     .concurrency_limit(4)
//!     .build(Credentials::AccessToken("pat".into()))
//!     .await?;
//! let projects: Vec<serde_json::Value> = client
//!     .list(ApiRequest::get("_apis/projects"), UNLIMITED)
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod error;
mod pagination;
mod request;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use url::Url;

use auth::Authorizer;

pub use auth::{Credentials, DEFAULT_AUTHORITY, DEVOPS_SCOPE, REFRESH_MARGIN, ServicePrincipal};
pub use error::{ApiError, AuthError, TransientError};
pub use pagination::{Page, Paginator, UNLIMITED};
pub use request::{ApiHost, ApiRequest, ApiResponse, CONTINUATION_HEADER, CONTINUATION_QUERY};
pub use retry::{BackoffStrategy, RetryPolicy};

/// Azure DevOps Services core host.
pub const DEFAULT_CORE_URL: &str = "https://dev.azure.com/";

/// Azure DevOps Services release management host.
pub const DEFAULT_RELEASE_URL: &str = "https://vsrm.dev.azure.com/";

/// Default per-attempt timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default concurrency ceiling.
const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

/// Longest error body kept in `ApiError::Status`.
const MAX_ERROR_BODY: usize = 512;

/// Builder for [`DevOpsClient`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    organization: String,
    base_url: Option<String>,
    api_version: String,
    concurrency_limit: usize,
    retry: RetryPolicy,
    timeout: Duration,
    user_agent: String,
}

impl ClientBuilder {
    /// Start a builder for `organization` on Azure DevOps Services.
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            base_url: None,
            api_version: crate::config::DEFAULT_API_VERSION.to_string(),
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            retry: RetryPolicy::default(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: format!("devops-exporter/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Server URL for on-premises installations. Used for both core and release APIs.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// REST API version sent with every request.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Maximum requests in flight at once (minimum 1).
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Retry policy for transient failures.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// User agent header.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Build the client and activate `credentials`.
    ///
    /// # Errors
    /// Returns `ApiError::Auth` if service principal token acquisition fails,
    /// `ApiError::InvalidUrl` for a bad base URL, `ApiError::Build` if the HTTP
    /// client cannot be created.
    pub async fn build(self, credentials: Credentials) -> Result<DevOpsClient, ApiError> {
        let (core_url, release_url) = match self.base_url {
            Some(ref base) => {
                let url = organization_url(base, &self.organization)?;
                (url.clone(), url)
            }
            None => (
                organization_url(DEFAULT_CORE_URL, &self.organization)?,
                organization_url(DEFAULT_RELEASE_URL, &self.organization)?,
            ),
        };

        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(ApiError::Build)?;

        tracing::info!(
            organization = %self.organization,
            url = %core_url,
            api_version = %self.api_version,
            concurrency = self.concurrency_limit,
            retries = self.retry.retries,
            auth = credentials.mode(),
            "Initializing Azure DevOps client"
        );

        let auth = Authorizer::new(credentials, http.clone()).await?;

        Ok(DevOpsClient {
            inner: Arc::new(Inner {
                http,
                core_url,
                release_url,
                organization: self.organization,
                api_version: self.api_version,
                budget: Semaphore::new(self.concurrency_limit),
                concurrency_limit: self.concurrency_limit,
                retry: self.retry,
                auth,
            }),
        })
    }
}

fn organization_url(base: &str, organization: &str) -> Result<Url, ApiError> {
    let mut base = base.trim_end_matches('/').to_string();
    base.push('/');
    let url = Url::parse(&base)?.join(&format!("{}/", organization.trim_matches('/')))?;
    Ok(url)
}

struct Inner {
    http: reqwest::Client,
    core_url: Url,
    release_url: Url,
    organization: String,
    api_version: String,
    budget: Semaphore,
    concurrency_limit: usize,
    retry: RetryPolicy,
    auth: Authorizer,
}

/// Shared, cheaply cloneable API client.
#[derive(Clone)]
pub struct DevOpsClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DevOpsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevOpsClient")
            .field("organization", &self.inner.organization)
            .field("core_url", &self.inner.core_url.as_str())
            .field("api_version", &self.inner.api_version)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

/// Outcome of a single attempt.
enum AttemptError {
    Transient(TransientError),
    Fatal(ApiError),
}

impl DevOpsClient {
    /// Start building a client for `organization`.
    pub fn builder(organization: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(organization)
    }

    /// Organization name.
    pub fn organization(&self) -> &str {
        &self.inner.organization
    }

    /// Requests currently holding a concurrency permit.
    pub fn in_flight(&self) -> usize {
        self.inner.concurrency_limit - self.inner.budget.available_permits()
    }

    /// Execute a request with retries.
    ///
    /// # Errors
    /// - `ApiError::RemoteUnavailable` after `retries + 1` transient failures
    /// - `ApiError::Status` on a non-retryable error status
    /// - `ApiError::Auth` if the token endpoint rejects the credentials
    ///
    /// A token refresh that fails with a transport error, 5xx or 429 counts as a
    /// transient failure of the attempt it belongs to.
    pub async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.resolve(request)?;
        let policy = self.inner.retry;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            match self.attempt(request, &url).await {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::debug!(url = %url, attempt, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(cause)) => {
                    if attempt >= policy.max_attempts() {
                        tracing::warn!(
                            url = %url,
                            attempts = attempt,
                            error = %cause,
                            "Request failed, retries exhausted"
                        );
                        return Err(ApiError::RemoteUnavailable {
                            attempts: attempt,
                            source: cause,
                        });
                    }

                    let delay = policy.delay(attempt, cause.retry_after());
                    tracing::debug!(
                        url = %url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %cause,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Execute a request and decode the JSON body.
    ///
    /// # Errors
    /// Same as [`DevOpsClient::execute`], plus `ApiError::Decode`.
    pub async fn get_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ApiError> {
        self.execute(request).await?.json()
    }

    /// Lazily page through a list resource, yielding at most `limit` items.
    pub fn paginate<T: DeserializeOwned>(&self, request: ApiRequest, limit: usize) -> Paginator<T> {
        Paginator::new(self.clone(), request, limit)
    }

    /// Fetch up to `limit` items of a list resource.
    ///
    /// # Errors
    /// Returns the first `ApiError` hit while paging.
    pub async fn list<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
        limit: usize,
    ) -> Result<Vec<T>, ApiError> {
        self.paginate(request, limit).collect_all().await
    }

    fn resolve(&self, request: &ApiRequest) -> Result<Url, ApiError> {
        let base = match request.host {
            ApiHost::Core => &self.inner.core_url,
            ApiHost::Release => &self.inner.release_url,
        };

        let mut url = base.join(&request.path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, value);
            }
            if let Some(ref token) = request.continuation {
                pairs.append_pair(CONTINUATION_QUERY, token);
            }
            pairs.append_pair("api-version", &self.inner.api_version);
        }
        Ok(url)
    }

    async fn attempt(&self, request: &ApiRequest, url: &Url) -> Result<ApiResponse, AttemptError> {
        let _permit = self
            .inner
            .budget
            .acquire()
            .await
            .map_err(|_| AttemptError::Fatal(ApiError::Closed))?;

        let builder = self
            .inner
            .http
            .request(request.method.clone(), url.clone())
            .header(reqwest::header::ACCEPT, "application/json");
        let builder = self
            .inner
            .auth
            .authorize(builder)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    AttemptError::Transient(TransientError::from_auth(e))
                } else {
                    AttemptError::Fatal(e.into())
                }
            })?;

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                AttemptError::Fatal(ApiError::Build(e))
            } else {
                AttemptError::Transient(TransientError::from_reqwest(e))
            }
        })?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Transient(TransientError::Status {
                status,
                retry_after: retry_after(response.headers()),
            }));
        }

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(AttemptError::Fatal(ApiError::Status {
                status,
                url: url.to_string(),
                body,
            }));
        }

        let continuation = response
            .headers()
            .get(CONTINUATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Transient(TransientError::from_reqwest(e)))?;

        Ok(ApiResponse {
            url: url.to_string(),
            status,
            continuation,
            body,
        })
    }
}

/// Parse a `Retry-After` header given in seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Router, routing::get};
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_retries(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            strategy: BackoffStrategy::Fixed,
            initial: Duration::from_millis(5),
            max: Duration::from_millis(5),
        }
    }

    async fn client(base: &str, retries: u32) -> DevOpsClient {
        DevOpsClient::builder("org")
            .base_url(base)
            .api_version("7.1")
            .retry_policy(fast_retries(retries))
            .timeout(Duration::from_secs(2))
            .build(Credentials::AccessToken("pat".into()))
            .await
            .unwrap()
    }

    #[test]
    fn test_organization_url() {
        assert_eq!(
            organization_url(DEFAULT_CORE_URL, "contoso").unwrap().as_str(),
            "https://dev.azure.com/contoso/"
        );
        assert_eq!(
            organization_url("https://tfs.example.test/tfs", "/DefaultCollection/")
                .unwrap()
                .as_str(),
            "https://tfs.example.test/tfs/DefaultCollection/"
        );
    }

    #[tokio::test]
    async fn test_default_hosts() {
        let client = DevOpsClient::builder("contoso")
            .build(Credentials::AccessToken("pat".into()))
            .await
            .unwrap();

        let core = client.resolve(&ApiRequest::get("_apis/projects")).unwrap();
        let release = client
            .resolve(&ApiRequest::release("p/_apis/release/definitions").query("$top", 5))
            .unwrap();

        assert_eq!(
            core.as_str(),
            "https://dev.azure.com/contoso/_apis/projects?api-version=7.1"
        );
        assert_eq!(
            release.as_str(),
            "https://vsrm.dev.azure.com/contoso/p/_apis/release/definitions?%24top=5&api-version=7.1"
        );
    }

    #[tokio::test]
    async fn test_request_carries_version_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/org/_apis/projects"))
            .and(query_param("api-version", "7.1"))
            .and(header("authorization", "Basic OnBhdA=="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri(), 0).await;
        let body: serde_json::Value = client
            .get_json(&ApiRequest::get("_apis/projects"))
            .await
            .unwrap();
        assert_eq!(body["value"], json!([]));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/org/_apis/projects"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/org/_apis/projects"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [1] })))
            .expect(1)
            .mount(&server)
            .await;

        // Three retries: the fourth and last allowed attempt succeeds.
        let client = client(&server.uri(), 3).await;
        let response = client
            .execute(&ApiRequest::get("_apis/projects"))
            .await
            .unwrap();
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["value"], json!([1]));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let client = client(&server.uri(), 1).await;
        assert!(client.execute(&ApiRequest::get("_apis/x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(3)
            .mount(&server)
            .await;

        let client = client(&server.uri(), 2).await;
        let err = client
            .execute(&ApiRequest::get("_apis/projects"))
            .await
            .unwrap_err();

        match err {
            ApiError::RemoteUnavailable { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(matches!(
                    source,
                    TransientError::Status { status, .. } if status == StatusCode::BAD_GATEWAY
                ));
            }
            other => panic!("expected RemoteUnavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such project"))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server.uri(), 5).await;
        let err = client
            .execute(&ApiRequest::get("missing/_apis/build/builds"))
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert!(err.to_string().contains("no such project"));
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = DevOpsClient::builder("org")
            .base_url(server.uri())
            .retry_policy(fast_retries(1))
            .timeout(Duration::from_millis(50))
            .build(Credentials::AccessToken("pat".into()))
            .await
            .unwrap();

        let err = client
            .execute(&ApiRequest::get("_apis/slow"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::RemoteUnavailable {
                attempts: 2,
                source: TransientError::Timeout
            }
        ));
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        const LIMIT: usize = 3;

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let app = {
            let (current, peak) = (Arc::clone(&current), Arc::clone(&peak));
            Router::new().route(
                "/org/_apis/slow",
                get(move || {
                    let (current, peak) = (Arc::clone(&current), Arc::clone(&peak));
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(40)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        "{}"
                    }
                }),
            )
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = DevOpsClient::builder("org")
            .base_url(format!("http://{addr}"))
            .concurrency_limit(LIMIT)
            .retry_policy(fast_retries(0))
            .build(Credentials::AccessToken("pat".into()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let result = client.execute(&ApiRequest::get("_apis/slow")).await;
                assert!(client.in_flight() <= LIMIT);
                result
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let observed = peak.load(Ordering::SeqCst);
        assert!(observed >= 1);
        assert!(observed <= LIMIT, "peak concurrency {observed} exceeds {LIMIT}");
        assert_eq!(client.in_flight(), 0);
    }

    async fn service_principal_client(server: &MockServer, retries: u32) -> DevOpsClient {
        let principal = ServicePrincipal::new("t", "client", "secret").with_authority(server.uri());
        DevOpsClient::builder("org")
            .base_url(server.uri())
            .retry_policy(fast_retries(retries))
            .timeout(Duration::from_secs(2))
            .build(Credentials::ServicePrincipal(principal))
            .await
            .unwrap()
    }

    /// Short-lived token: every request has to refresh it.
    fn short_token() -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "expires_in": 60,
            "access_token": "short-lived"
        }))
    }

    #[tokio::test]
    async fn test_token_refresh_outage_is_retried() {
        let server = MockServer::start().await;
        // Startup token.
        Mock::given(method("POST"))
            .and(path("/t/oauth2/v2.0/token"))
            .respond_with(short_token())
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let client = service_principal_client(&server, 3).await;

        Mock::given(method("POST"))
            .and(path("/t/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/t/oauth2/v2.0/token"))
            .respond_with(short_token())
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/org/_apis/projects"))
            .and(header("authorization", "Bearer short-lived"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .expect(1)
            .mount(&server)
            .await;

        assert!(client.execute(&ApiRequest::get("_apis/projects")).await.is_ok());
    }

    #[tokio::test]
    async fn test_token_refresh_outage_exhausts_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(short_token())
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let client = service_principal_client(&server, 1).await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let err = client
            .execute(&ApiRequest::get("_apis/projects"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::RemoteUnavailable {
                attempts: 2,
                source: TransientError::Token(AuthError::Rejected { .. })
            }
        ));
    }

    #[tokio::test]
    async fn test_revoked_credentials_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(short_token())
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let client = service_principal_client(&server, 3).await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client
            .execute(&ApiRequest::get("_apis/projects"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Auth(AuthError::Rejected { .. })));
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
