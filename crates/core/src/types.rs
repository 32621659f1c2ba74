/// Server-side job identifier. Opaque; numeric ids are stringified on ingest.
pub type JobId = String;

/// Persisted entity (video) identifier. Opaque, like [`JobId`].
pub type EntityId = String;

/// Custom-field identifier within an entity's schema.
pub type FieldId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
