// Copyright 2025 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Minimal OpenSearch REST client.
//!
//! Covers the four calls the sink needs: index, partial update, delete and
//! `_bulk`. Requests are plain JSON over `reqwest`; no retries are attempted
//! here because a failed delivery stops the relay and the unadvanced
//! checkpoint replays the event on restart.

use super::config::OpenSearchConfig;
use async_trait::async_trait;
use penne_core::bulk::{BulkApi, BulkError};
use penne_core::sink::SinkError;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, trace};

/// Single-document operations used by the unbuffered modes.
#[async_trait]
pub trait DocumentApi: Send + Sync {
    /// Indexes `body`. With `id` the document is created or replaced under
    /// that id; without it the cluster assigns one.
    async fn index(&self, index: &str, id: Option<&str>, body: &Value) -> Result<(), SinkError>;

    /// Merges `doc` into the existing document `id`.
    async fn update(&self, index: &str, id: &str, doc: &Value) -> Result<(), SinkError>;

    /// Deletes document `id`. A missing document is not an error.
    async fn delete(&self, index: &str, id: &str) -> Result<(), SinkError>;
}

/// `reqwest`-backed client for one cluster.
#[derive(Debug, Clone)]
pub struct OpenSearchClient {
    http: Client,
    endpoint: Url,
}

impl OpenSearchClient {
    /// Builds a client for `config.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the endpoint is not a valid base
    /// URL, or a connection error if the HTTP client cannot be built.
    pub fn new(config: &OpenSearchConfig) -> Result<Self, SinkError> {
        Self::connect(&config.endpoint, config.request_timeout)
    }

    /// Builds a client for any cluster speaking the document REST API,
    /// such as Elasticsearch.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn connect(endpoint: &str, request_timeout: Duration) -> Result<Self, SinkError> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            SinkError::configuration(
                format!("invalid search endpoint: {e}"),
                Some("endpoint".to_string()),
            )
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(SinkError::configuration(
                "search endpoint cannot be a base URL",
                Some("endpoint".to_string()),
            ));
        }

        let http = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(SinkError::connection)?;

        Ok(Self { http, endpoint })
    }

    /// Returns the base URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SinkError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| SinkError::configuration("search endpoint cannot be a base URL", None))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder, SinkError> {
        Ok(self.http.request(method, self.url(segments)?))
    }

    async fn send(builder: RequestBuilder) -> Result<Response, SinkError> {
        builder.send().await.map_err(classify_transport_error)
    }
}

#[async_trait]
impl DocumentApi for OpenSearchClient {
    async fn index(&self, index: &str, id: Option<&str>, body: &Value) -> Result<(), SinkError> {
        let builder = match id {
            Some(id) => self.request(Method::PUT, &[index, "_doc", id])?,
            None => self.request(Method::POST, &[index, "_doc"])?,
        };
        let response = Self::send(builder.json(body)).await?;
        check_status(response, "index", false).await?;
        trace!(index, id, "Indexed document");
        Ok(())
    }

    async fn update(&self, index: &str, id: &str, doc: &Value) -> Result<(), SinkError> {
        let builder = self.request(Method::POST, &[index, "_update", id])?;
        let response = Self::send(builder.json(&json!({ "doc": doc }))).await?;
        check_status(response, "update", false).await?;
        trace!(index, id, "Updated document");
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<(), SinkError> {
        let builder = self.request(Method::DELETE, &[index, "_doc", id])?;
        let response = Self::send(builder).await?;
        check_status(response, "delete", true).await?;
        trace!(index, id, "Deleted document");
        Ok(())
    }
}

#[async_trait]
impl BulkApi for OpenSearchClient {
    async fn bulk(&self, payload: Vec<u8>) -> Result<(), BulkError> {
        let builder = self
            .request(Method::POST, &["_bulk"])
            .map_err(BulkError::flush)?
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(payload);
        let response = Self::send(builder).await.map_err(BulkError::flush)?;

        let status = response.status();
        let text = response.text().await.map_err(BulkError::flush)?;
        if !status.is_success() {
            return Err(BulkError::flush_msg(format!(
                "bulk request failed with {status}: {}",
                truncate(&text)
            )));
        }

        let body: Value = serde_json::from_str(&text)?;
        if let Some(reason) = first_item_error(&body) {
            return Err(BulkError::flush_msg(format!("bulk item rejected: {reason}")));
        }
        let took_ms = body.get("took").and_then(serde_json::Value::as_u64);
        debug!(took_ms, "Bulk request accepted");
        Ok(())
    }
}

/// Returns the first per-item failure of a `_bulk` response, if any.
///
/// Items without an `error` object (including deletes of missing
/// documents) count as accepted.
pub fn first_item_error(body: &Value) -> Option<String> {
    if !body.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    body.get("items")?
        .as_array()?
        .iter()
        .filter_map(Value::as_object)
        .flat_map(|item| item.values())
        .find_map(|result| {
            let error = result.get("error")?;
            let reason = error
                .get("reason")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            Some(reason)
        })
        .or_else(|| Some("errors flag set without item details".to_string()))
}

async fn check_status(response: Response, operation: &str, allow_missing: bool) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() || (allow_missing && status == StatusCode::NOT_FOUND) {
        return Ok(());
    }
    let text = response.text().await.unwrap_or_default();
    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
    Err(SinkError::write_msg(
        format!("OpenSearch {operation} failed with {status}: {}", truncate(&text)),
        retryable,
    ))
}

fn classify_transport_error(err: reqwest::Error) -> SinkError {
    if err.is_connect() || err.is_timeout() {
        SinkError::connection(err)
    } else {
        SinkError::write(err, true)
    }
}

fn truncate(text: &str) -> &str {
    const MAX: usize = 512;
    if text.len() <= MAX {
        return text;
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(endpoint: &str) -> OpenSearchClient {
        let config = OpenSearchConfig::builder()
            .endpoint(endpoint)
            .index("orders")
            .build()
            .unwrap();
        OpenSearchClient::new(&config).unwrap()
    }

    #[test]
    fn document_urls_escape_ids() {
        let client = client("http://localhost:9200");
        let url = client.url(&["orders", "_doc", "a/b c"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9200/orders/_doc/a%2Fb%20c");
    }

    #[test]
    fn endpoint_path_prefix_is_kept() {
        let client = client("https://proxy.internal/search");
        let url = client.url(&["_bulk"]).unwrap();
        assert_eq!(url.as_str(), "https://proxy.internal/search/_bulk");
    }

    #[test]
    fn bulk_response_without_errors_is_accepted() {
        let body = json!({
            "took": 3,
            "errors": false,
            "items": [{ "delete": { "status": 404, "result": "not_found" } }]
        });
        assert_eq!(first_item_error(&body), None);
    }

    #[test]
    fn bulk_item_error_reason_is_reported() {
        let body = json!({
            "errors": true,
            "items": [
                { "update": { "status": 200 } },
                { "create": { "status": 400, "error": { "type": "mapper_parsing_exception", "reason": "failed to parse" } } }
            ]
        });
        assert_eq!(first_item_error(&body).as_deref(), Some("failed to parse"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "é".repeat(400);
        let cut = truncate(&text);
        assert!(cut.len() <= 512);
        assert!(text.starts_with(cut));
    }
}
