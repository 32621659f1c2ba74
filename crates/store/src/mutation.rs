//! Optimistic per-field writes.
//!
//! [`FieldMutationController::set_field`] shows the new value at once
//! through the [`EntityCache`], sends the write, and resolves the
//! pending chain with the server's answer. The request and its
//! resolution run on a spawned task, so a caller that stops waiting
//! cannot leave a field stuck in the optimistic state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vidshelf_core::fields::FieldValue;
use vidshelf_core::types::{EntityId, FieldId};
use vidshelf_core::wire;

use crate::entity_cache::{EntityCache, WriteTicket};

/// One field assignment sent to the write endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldWrite {
    pub field_id: FieldId,
    pub value: FieldValue,
}

/// The server's acknowledgement for one field.
///
/// `value` is the canonical value after server-side normalisation; a
/// missing or `null` value means "stored as sent".
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldAck {
    #[serde(deserialize_with = "wire::opaque_id")]
    pub field_id: FieldId,
    #[serde(default)]
    pub value: Option<FieldValue>,
}

/// Why a field write did not go through.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FieldWriteError {
    /// The server refused the write (validation, permissions, ...).
    #[error("Write rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The request never produced an answer.
    #[error("Write failed: {0}")]
    Transport(String),
}

/// The entity field-write endpoint.
#[async_trait]
pub trait FieldWriter: Send + Sync {
    async fn write_fields(
        &self,
        entity_id: &str,
        writes: &[FieldWrite],
    ) -> Result<Vec<FieldAck>, FieldWriteError>;
}

/// Applies optimistic field edits with rollback on failure.
#[derive(Clone)]
pub struct FieldMutationController {
    cache: Arc<EntityCache>,
    writer: Arc<dyn FieldWriter>,
}

impl FieldMutationController {
    pub fn new(cache: Arc<EntityCache>, writer: Arc<dyn FieldWriter>) -> Self {
        Self { cache, writer }
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Set one field.
    ///
    /// Resolves once the server answered. On error the rollback has
    /// already been applied; user-facing messaging is the caller's call.
    pub async fn set_field(
        &self,
        entity_id: &str,
        field_id: &str,
        value: FieldValue,
    ) -> Result<(), FieldWriteError> {
        self.set_fields(entity_id, vec![(field_id.to_string(), value)])
            .await
    }

    /// Set several fields of one entity with a single request.
    ///
    /// Every field is confirmed or rolled back together with the batch.
    pub async fn set_fields(
        &self,
        entity_id: &str,
        values: Vec<(FieldId, FieldValue)>,
    ) -> Result<(), FieldWriteError> {
        if values.is_empty() {
            return Ok(());
        }

        let mut tickets: Vec<(FieldId, WriteTicket)> = Vec::with_capacity(values.len());
        let mut writes = Vec::with_capacity(values.len());
        for (field_id, value) in values {
            let ticket = self
                .cache
                .begin_write(entity_id, &field_id, value.clone())
                .await;
            tickets.push((field_id.clone(), ticket));
            writes.push(FieldWrite { field_id, value });
        }

        tracing::debug!(entity_id, fields = writes.len(), "Issuing optimistic field write");

        let cache = Arc::clone(&self.cache);
        let writer = Arc::clone(&self.writer);
        let owned_entity: EntityId = entity_id.to_string();
        let task_tickets = tickets.clone();

        let task = tokio::spawn(async move {
            let result = writer.write_fields(&owned_entity, &writes).await;
            resolve_batch(&cache, &owned_entity, task_tickets, &result).await;
            result.map(|_| ())
        });

        match task.await {
            Ok(result) => {
                if let Err(e) = &result {
                    tracing::warn!(entity_id, error = %e, "Field write failed, rolled back");
                }
                result
            }
            Err(join_error) => {
                // The writer panicked before resolving; roll back here.
                tracing::error!(entity_id, error = %join_error, "Field write task aborted");
                for (field_id, ticket) in tickets {
                    self.cache.reject_write(entity_id, &field_id, ticket).await;
                }
                Err(FieldWriteError::Transport(join_error.to_string()))
            }
        }
    }
}

async fn resolve_batch(
    cache: &EntityCache,
    entity_id: &str,
    tickets: Vec<(FieldId, WriteTicket)>,
    result: &Result<Vec<FieldAck>, FieldWriteError>,
) {
    match result {
        Ok(acks) => {
            for (field_id, ticket) in tickets {
                let canonical = acks
                    .iter()
                    .find(|ack| ack.field_id == field_id)
                    .and_then(|ack| ack.value.clone());
                cache
                    .confirm_write(entity_id, &field_id, ticket, canonical)
                    .await;
            }
        }
        Err(_) => {
            for (field_id, ticket) in tickets {
                cache.reject_write(entity_id, &field_id, ticket).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;
    use vidshelf_core::entity::EntitySnapshot;

    use crate::entity_cache::FieldState;

    /// Writer that answers from a fixed script and records requests.
    struct ScriptedWriter {
        answer: Result<Vec<FieldAck>, FieldWriteError>,
        seen: Mutex<Vec<Vec<FieldWrite>>>,
    }

    impl ScriptedWriter {
        fn answering(answer: Result<Vec<FieldAck>, FieldWriteError>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl FieldWriter for ScriptedWriter {
        async fn write_fields(
            &self,
            _entity_id: &str,
            writes: &[FieldWrite],
        ) -> Result<Vec<FieldAck>, FieldWriteError> {
            self.seen.lock().unwrap().push(writes.to_vec());
            self.answer.clone()
        }
    }

    async fn seeded_cache() -> Arc<EntityCache> {
        let cache = Arc::new(EntityCache::new());
        cache
            .seed(
                EntitySnapshot::new("v1")
                    .with_field("rating", 2.0)
                    .with_field("status", "draft"),
            )
            .await;
        cache
    }

    #[tokio::test]
    async fn failed_write_rolls_back_and_propagates() {
        let cache = seeded_cache().await;
        let writer = ScriptedWriter::answering(Err(FieldWriteError::Rejected {
            status: 422,
            message: "rating out of range".into(),
        }));
        let controller = FieldMutationController::new(Arc::clone(&cache), writer);

        let result = controller.set_field("v1", "rating", 9.0.into()).await;
        assert_matches!(result, Err(FieldWriteError::Rejected { status: 422, .. }));

        let view = cache.field("v1", "rating").await;
        assert_eq!(view.value, Some(FieldValue::Number(2.0)));
        assert_eq!(view.state, FieldState::Idle);
    }

    #[tokio::test]
    async fn successful_write_takes_canonical_echo() {
        let cache = seeded_cache().await;
        let writer = ScriptedWriter::answering(Ok(vec![FieldAck {
            field_id: "status".into(),
            value: Some("Published".into()),
        }]));
        let controller = FieldMutationController::new(Arc::clone(&cache), writer.clone());

        controller
            .set_field("v1", "status", "published".into())
            .await
            .unwrap();

        let view = cache.field("v1", "status").await;
        assert_eq!(view.value, Some(FieldValue::from("Published")));
        assert_eq!(view.state, FieldState::Idle);
        assert_eq!(writer.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_confirms_each_field() {
        let cache = seeded_cache().await;
        let writer = ScriptedWriter::answering(Ok(vec![FieldAck {
            field_id: "rating".into(),
            value: None,
        }]));
        let controller = FieldMutationController::new(Arc::clone(&cache), writer.clone());

        controller
            .set_fields(
                "v1",
                vec![
                    ("rating".into(), 4.0.into()),
                    ("watched".into(), true.into()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(
            cache.field("v1", "rating").await.value,
            Some(FieldValue::Number(4.0))
        );
        assert_eq!(
            cache.field("v1", "watched").await.value,
            Some(FieldValue::Boolean(true))
        );
        let seen = writer.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let cache = seeded_cache().await;
        let writer = ScriptedWriter::answering(Ok(Vec::new()));
        let controller = FieldMutationController::new(cache, writer.clone());

        controller.set_fields("v1", Vec::new()).await.unwrap();
        assert!(writer.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn ack_accepts_numeric_field_ids_and_null_values() {
        let ack: FieldAck = serde_json::from_str(r#"{"field_id": 7, "value": null}"#).unwrap();
        assert_eq!(ack.field_id, "7");
        assert!(ack.value.is_none());
    }
}
