//! [`LibraryApi`] as the backing service for the store and stream seams.

use async_trait::async_trait;
use vidshelf_core::entity::EntitySnapshot;
use vidshelf_core::error::CoreError;
use vidshelf_core::progress::ProgressEvent;
use vidshelf_core::types::Timestamp;
use vidshelf_store::{EntitySource, FieldAck, FieldWrite, FieldWriteError, FieldWriter};
use vidshelf_stream::{HistoryError, HistorySource};

use crate::client::{ApiError, LibraryApi};

#[async_trait]
impl FieldWriter for LibraryApi {
    async fn write_fields(
        &self,
        entity_id: &str,
        writes: &[FieldWrite],
    ) -> Result<Vec<FieldAck>, FieldWriteError> {
        self.update_fields(entity_id, writes)
            .await
            .map_err(field_write_error)
    }
}

#[async_trait]
impl HistorySource for LibraryApi {
    async fn progress_since(
        &self,
        since: Option<Timestamp>,
    ) -> Result<Vec<ProgressEvent>, HistoryError> {
        self.progress_history(since)
            .await
            .map_err(|e| HistoryError::Fetch(e.to_string()))
    }
}

#[async_trait]
impl EntitySource for LibraryApi {
    async fn fetch_entity(&self, entity_id: &str) -> Result<EntitySnapshot, CoreError> {
        self.get_video(entity_id).await.map_err(|e| match e.status() {
            Some(404) => CoreError::NotFound {
                entity: "video",
                id: entity_id.to_string(),
            },
            _ => CoreError::Unavailable(e.to_string()),
        })
    }
}

fn field_write_error(err: ApiError) -> FieldWriteError {
    match &err {
        ApiError::ApiError { status, .. } => FieldWriteError::Rejected {
            status: *status,
            message: err.reason(),
        },
        ApiError::Request(e) => FieldWriteError::Transport(e.to_string()),
        ApiError::InvalidUrl(_) => FieldWriteError::Transport(err.to_string()),
    }
}
