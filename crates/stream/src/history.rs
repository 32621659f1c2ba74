//! Missed-event recovery after a reconnect.

use std::time::Duration;

use async_trait::async_trait;
use vidshelf_core::progress::ProgressEvent;
use vidshelf_core::types::Timestamp;

/// The "progress since <cursor>" endpoint.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Events newer than `since`, oldest first. `None` asks for
    /// everything the server still considers current.
    async fn progress_since(
        &self,
        since: Option<Timestamp>,
    ) -> Result<Vec<ProgressEvent>, HistoryError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryError {
    #[error("History fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("History fetch failed: {0}")]
    Fetch(String),
}

/// Fetch history, giving up after `timeout`.
pub async fn fetch_with_timeout(
    source: &dyn HistorySource,
    since: Option<Timestamp>,
    timeout: Duration,
) -> Result<Vec<ProgressEvent>, HistoryError> {
    tokio::time::timeout(timeout, source.progress_since(since))
        .await
        .map_err(|_| HistoryError::Timeout(timeout))?
}

/// A history source with nothing to replay.
pub struct NoHistory;

#[async_trait]
impl HistorySource for NoHistory {
    async fn progress_since(
        &self,
        _since: Option<Timestamp>,
    ) -> Result<Vec<ProgressEvent>, HistoryError> {
        Ok(Vec::new())
    }
}
