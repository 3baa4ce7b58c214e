//! Lazy, limit-aware pagination over list resources.

use std::marker::PhantomData;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::DevOpsClient;
use super::error::ApiError;
use super::request::ApiRequest;

/// No result-count ceiling.
pub const UNLIMITED: usize = usize::MAX;

/// List envelope returned by collection endpoints.
#[derive(Debug, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Fetches one page at a time, following continuation tokens until the server
/// stops sending them or `limit` items have been yielded.
///
/// Truncation at the limit keeps the server's ordering, so the same remote state
/// always yields the same prefix.
pub struct Paginator<T> {
    client: DevOpsClient,
    request: ApiRequest,
    limit: usize,
    yielded: usize,
    cursor: Cursor,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Paginator<T> {
    pub(crate) fn new(client: DevOpsClient, request: ApiRequest, limit: usize) -> Self {
        let cursor = if limit == 0 { Cursor::Done } else { Cursor::Start };
        Self {
            client,
            request,
            limit,
            yielded: 0,
            cursor,
            _marker: PhantomData,
        }
    }

    /// Items yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Fetch the next non-empty page, or `None` once the listing is exhausted.
    ///
    /// # Errors
    /// Returns the first `ApiError` hit; the paginator is finished afterwards.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, ApiError> {
        loop {
            let request = match std::mem::replace(&mut self.cursor, Cursor::Done) {
                Cursor::Done => return Ok(None),
                Cursor::Start => self.request.clone(),
                Cursor::Next(token) => self.request.clone().continuation(token),
            };

            let response = self.client.execute(&request).await?;
            let page: Page<T> = response.json()?;
            let mut items = page.value;

            let remaining = self.limit - self.yielded;
            if items.len() >= remaining {
                items.truncate(remaining);
            } else if let Some(token) = response.continuation.filter(|t| !t.is_empty()) {
                self.cursor = Cursor::Next(token);
            }

            self.yielded += items.len();
            if !items.is_empty() {
                return Ok(Some(items));
            }
        }
    }

    /// Drain every remaining page.
    ///
    /// # Errors
    /// Returns the first `ApiError` hit.
    pub async fn collect_all(mut self) -> Result<Vec<T>, ApiError> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
