//! Request and response types for the API client.

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use strum::{AsRefStr, Display};

use super::error::ApiError;

/// Query parameter carrying the continuation token of the previous page.
pub const CONTINUATION_QUERY: &str = "continuationToken";

/// Response header carrying the continuation token for the next page.
pub const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

/// Which service host a resource lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ApiHost {
    /// Projects, builds, repositories, agent pools, work items.
    Core,
    /// Release management (release definitions, releases, deployments).
    Release,
}

/// A single logical call against the remote API.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub(crate) host: ApiHost,
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) continuation: Option<String>,
}

impl ApiRequest {
    /// Create a request. `path` is relative to the organization URL.
    pub fn new(host: ApiHost, method: Method, path: impl Into<String>) -> Self {
        Self {
            host,
            method,
            path: path.into().trim_start_matches('/').to_string(),
            query: Vec::new(),
            continuation: None,
        }
    }

    /// GET against the core host.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(ApiHost::Core, Method::GET, path)
    }

    /// GET against the release management host.
    pub fn release(path: impl Into<String>) -> Self {
        Self::new(ApiHost::Release, Method::GET, path)
    }

    /// Add a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Resume a paged listing.
    pub fn continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation = Some(token.into());
        self
    }

    /// Host this request is sent to.
    pub fn host(&self) -> ApiHost {
        self.host
    }

    /// Relative resource path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Final URL of the request.
    pub url: String,
    /// HTTP status (always 2xx).
    pub status: StatusCode,
    /// Continuation token for the next page, if the server sent one.
    pub continuation: Option<String>,
    /// Raw body.
    pub body: Bytes,
}

impl ApiResponse {
    /// Decode the body as JSON.
    ///
    /// # Errors
    /// Returns `ApiError::Decode` if the body does not match `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body).map_err(|source| ApiError::Decode {
            url: self.url.clone(),
            source,
        })
    }
}
