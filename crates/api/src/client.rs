//! REST client for the video library HTTP endpoints.
//!
//! Wraps entity reads, field writes and the progress history endpoint
//! using [`reqwest`]. Every response body uses the server's
//! `{ "data": ... }` envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vidshelf_core::entity::EntitySnapshot;
use vidshelf_core::progress::ProgressEvent;
use vidshelf_core::types::Timestamp;
use vidshelf_store::{FieldAck, FieldWrite};

/// HTTP client for one library server.
#[derive(Clone)]
pub struct LibraryApi {
    client: reqwest::Client,
    api_url: String,
    auth_token: Option<String>,
}

/// Errors from the REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, decoding).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Library API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The configured base URL cannot carry a request path.
    #[error("Invalid API URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Request(e) => e.status().map(|s| s.as_u16()),
            ApiError::ApiError { status, .. } => Some(*status),
            ApiError::InvalidUrl(_) => None,
        }
    }

    /// Human-readable reason: the `error` field of a JSON error body
    /// when present, otherwise the raw body.
    pub fn reason(&self) -> String {
        match self {
            ApiError::Request(e) => e.to_string(),
            ApiError::InvalidUrl(url) => format!("invalid API URL {url}"),
            ApiError::ApiError { body, .. } => serde_json::from_str::<ErrorBody>(body)
                .map(|b| b.error)
                .unwrap_or_else(|_| body.clone()),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Serialize)]
struct FieldWriteBody<'a> {
    values: &'a [FieldWrite],
}

impl LibraryApi {
    /// * `api_url` - base URL, e.g. `http://host:3000/api/v1`.
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.auth_token = (!token.is_empty()).then_some(token);
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Fetch one video with its import progress and field values.
    ///
    /// Sends `GET /videos/{id}`.
    pub async fn get_video(&self, video_id: &str) -> Result<EntitySnapshot, ApiError> {
        let response = self
            .request(reqwest::Method::GET, &["videos", video_id])?
            .send()
            .await?;

        Self::parse_data(response).await
    }

    /// Write a batch of field values for one video.
    ///
    /// Sends `PATCH /videos/{id}/fields` with `{"values": [...]}` and
    /// returns the server's canonical value per field.
    pub async fn update_fields(
        &self,
        video_id: &str,
        writes: &[FieldWrite],
    ) -> Result<Vec<FieldAck>, ApiError> {
        let response = self
            .request(reqwest::Method::PATCH, &["videos", video_id, "fields"])?
            .json(&FieldWriteBody { values: writes })
            .send()
            .await?;

        Self::parse_data(response).await
    }

    /// Progress events newer than `since`, oldest first.
    ///
    /// Sends `GET /progress/history?since=<rfc3339>`. Entries that do
    /// not parse as progress events are skipped with a warning.
    pub async fn progress_history(
        &self,
        since: Option<Timestamp>,
    ) -> Result<Vec<ProgressEvent>, ApiError> {
        let mut request = self.request(reqwest::Method::GET, &["progress", "history"])?;
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }
        let response = request.send().await?;

        let raw: Vec<serde_json::Value> = Self::parse_data(response).await?;
        let total = raw.len();
        let events: Vec<ProgressEvent> = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed history entry");
                    None
                }
            })
            .collect();

        tracing::debug!(total, parsed = events.len(), "Fetched progress history");
        Ok(events)
    }

    // ---- private helpers ----

    fn request(
        &self,
        method: reqwest::Method,
        segments: &[&str],
    ) -> Result<reqwest::RequestBuilder, ApiError> {
        let request = self.client.request(method, self.endpoint(segments)?);
        Ok(match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    /// Append `segments` to the base URL, percent-encoding each one so
    /// an id containing `/` or `?` stays a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<reqwest::Url, ApiError> {
        let mut url = reqwest::Url::parse(&self.api_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {e}", self.api_url)))?;
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidUrl(self.api_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or an [`ApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Check the status, then unwrap the `{ "data": T }` envelope.
    async fn parse_data<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        let envelope: DataEnvelope<T> = response.json().await?;
        Ok(envelope.data)
    }
}
