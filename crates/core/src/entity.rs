//! Entity representation as returned by the read endpoint.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::fields::FieldValue;
use crate::progress::Stage;
use crate::types::{EntityId, FieldId};
use crate::wire;

/// The import-progress snapshot persisted on an entity.
///
/// Written by the server at some point during the job and possibly
/// stale; the live stream supersedes it whenever a record exists.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PersistedProgress {
    pub import_stage: Option<Stage>,
    pub import_progress: Option<u8>,
}

/// A fetched entity: persisted progress fields plus custom-field values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    #[serde(deserialize_with = "wire::opaque_id")]
    pub id: EntityId,

    #[serde(default, deserialize_with = "wire::stage_opt")]
    pub import_stage: Option<Stage>,

    #[serde(default, deserialize_with = "wire::progress_opt")]
    pub import_progress: Option<u8>,

    #[serde(default, alias = "field_values", deserialize_with = "wire::scalar_fields")]
    pub fields: HashMap<FieldId, FieldValue>,
}

impl EntitySnapshot {
    /// An entity with no progress snapshot and no field values.
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            import_stage: None,
            import_progress: None,
            fields: HashMap::new(),
        }
    }

    pub fn with_import(mut self, stage: &str, progress: Option<u8>) -> Self {
        self.import_stage = Stage::new(stage);
        self.import_progress = progress;
        self
    }

    pub fn with_field(mut self, field_id: impl Into<FieldId>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(field_id.into(), value.into());
        self
    }

    pub fn persisted_progress(&self) -> PersistedProgress {
        PersistedProgress {
            import_stage: self.import_stage.clone(),
            import_progress: self.import_progress,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::STAGE_ERROR;

    #[test]
    fn parses_entity_with_null_progress_fields() {
        let json = r#"{
            "id": 12,
            "title": "Lecture 3",
            "import_stage": null,
            "import_progress": null,
            "fields": {"rating": 4, "watched": true, "tags": ["a"]}
        }"#;
        let entity: EntitySnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(entity.id, "12");
        assert_eq!(entity.persisted_progress(), PersistedProgress::default());
        assert_eq!(entity.fields.get("rating"), Some(&FieldValue::Number(4.0)));
        assert_eq!(entity.fields.get("watched"), Some(&FieldValue::Boolean(true)));
        assert!(!entity.fields.contains_key("tags"));
    }

    #[test]
    fn parses_error_stage_snapshot() {
        let json = r#"{"id":"v1","import_stage":"error","import_progress":"35"}"#;
        let entity: EntitySnapshot = serde_json::from_str(json).unwrap();
        let persisted = entity.persisted_progress();
        assert_eq!(persisted.import_stage.as_ref().map(Stage::as_str), Some(STAGE_ERROR));
        assert_eq!(persisted.import_progress, Some(35));
        assert!(entity.fields.is_empty());
    }
}
