//! Lazy pagination over list endpoints
//!
//! The termination predicate lives inside the iterator, not the caller:
//! iteration ends when the server omits `result_info`, when the reported
//! `total_pages` is reached, when a page comes back empty, or when a page
//! is shorter than the requested size.

use crate::client::{ApiClient, ApiOutcome};
use crate::error::ApiError;
use reqwest::Method;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;

/// Page size used for every paginated request
pub const PER_PAGE: u32 = 50;

/// Lazy finite iterator of `T` items; `next()` suspends on page fetches
pub struct Paginated<'a, T> {
    client: &'a ApiClient,
    endpoint: String,
    query: Vec<(String, String)>,
    page: u32,
    buffer: VecDeque<T>,
    done: bool,
}

impl<'a, T: DeserializeOwned> Paginated<'a, T> {
    pub(crate) fn new(client: &'a ApiClient, endpoint: &str, query: &[(&str, String)]) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            page: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Yield the next item, fetching the next page when the buffer drains
    pub async fn next(&mut self) -> Result<Option<T>, ApiError> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(Some(item));
            }
            if self.done {
                return Ok(None);
            }
            self.fetch_next_page().await?;
        }
    }

    /// Drain the remaining items into a vector
    pub async fn collect_all(mut self) -> Result<Vec<T>, ApiError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    async fn fetch_next_page(&mut self) -> Result<(), ApiError> {
        self.page += 1;

        let mut query: Vec<(&str, String)> = self
            .query
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        query.push(("per_page", PER_PAGE.to_string()));
        query.push(("page", self.page.to_string()));

        let outcome = self
            .client
            .request::<Vec<T>>(Method::GET, &self.endpoint, None, &query)
            .await?;

        let (items, result_info) = match outcome {
            ApiOutcome::Success {
                result,
                result_info,
            } => (result, result_info),
            ApiOutcome::Recoverable { status, errors, .. } => {
                // Conflicts make no sense while listing; surface as an error
                return Err(ApiError::from_envelope(status, errors));
            }
        };

        let count = items.len() as u32;
        let reached_last_reported_page = result_info
            .and_then(|info| info.total_pages)
            .is_some_and(|total| self.page >= total);

        self.done = result_info.is_none()
            || reached_last_reported_page
            || count == 0
            || count < PER_PAGE;

        self.buffer.extend(items);
        Ok(())
    }
}
