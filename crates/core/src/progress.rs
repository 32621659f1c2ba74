//! Job progress vocabulary and the [`ProgressEvent`] wire shape.

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, JobId};
use crate::wire;

pub const STAGE_METADATA: &str = "metadata";
pub const STAGE_CAPTIONS: &str = "captions";
pub const STAGE_CHAPTERS: &str = "chapters";
pub const STAGE_COMPLETE: &str = "complete";
pub const STAGE_ERROR: &str = "error";

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a server-side job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    CompletedWithErrors,
}

impl JobStatus {
    /// `true` once the job can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::CompletedWithErrors
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
        }
    }

    /// Parse a status string from the wire.
    ///
    /// Matching is case-insensitive and accepts a few synonyms the import
    /// workers have been seen to emit. Anything unrecognised is treated
    /// as `Processing`: the job exists and is not known to be finished.
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => JobStatus::Pending,
            "processing" | "running" | "in_progress" => JobStatus::Processing,
            "completed" | "complete" | "done" | "succeeded" => JobStatus::Completed,
            "failed" | "error" => JobStatus::Failed,
            "completed_with_errors" | "partial" => JobStatus::CompletedWithErrors,
            _ => JobStatus::Processing,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Named phase within a job (`metadata`, `captions`, ...).
///
/// Free-form on the wire; stored trimmed and lower-cased so the terminal
/// names compare reliably.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stage(String);

impl Stage {
    /// Normalise a stage name. Blank names are treated as "no stage".
    pub fn new(name: impl AsRef<str>) -> Option<Self> {
        let name = name.as_ref().trim();
        if name.is_empty() {
            None
        } else {
            Some(Self(name.to_ascii_lowercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_complete(&self) -> bool {
        self.0 == STAGE_COMPLETE
    }

    pub fn is_error(&self) -> bool {
        self.0 == STAGE_ERROR
    }

    /// `complete` and `error` end an import; every other stage is in flight.
    pub fn is_terminal(&self) -> bool {
        self.is_complete() || self.is_error()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ProgressEvent
// ---------------------------------------------------------------------------

/// A progress update pushed by the server for one job.
///
/// Deserialisation is deliberately forgiving: unknown fields are
/// ignored, optional fields may be missing and `progress` is coerced
/// into `0..=100`. Only a missing or unusable `job_id` rejects the
/// event, because an unkeyed update cannot be applied anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(deserialize_with = "wire::opaque_id")]
    pub job_id: JobId,

    #[serde(default, deserialize_with = "wire::opaque_id_opt")]
    pub entity_id: Option<EntityId>,

    #[serde(default, deserialize_with = "wire::status")]
    pub status: JobStatus,

    #[serde(default, deserialize_with = "wire::progress")]
    pub progress: u8,

    #[serde(default, deserialize_with = "wire::stage_opt")]
    pub stage: Option<Stage>,

    #[serde(default, deserialize_with = "wire::string_or_default")]
    pub message: String,

    #[serde(default, deserialize_with = "wire::text_opt")]
    pub error: Option<String>,
}

impl ProgressEvent {
    /// Create an event with the required fields; `progress` is clamped.
    pub fn new(job_id: impl Into<JobId>, status: JobStatus, progress: f64) -> Self {
        Self {
            job_id: job_id.into(),
            entity_id: None,
            status,
            progress: wire::clamp_progress(progress),
            stage: None,
            message: String::new(),
            error: None,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<EntityId>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Stage::new(stage);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_full_event() {
        let json = r#"{
            "job_id": "job-1",
            "entity_id": "video-9",
            "status": "processing",
            "progress": 40,
            "stage": "captions",
            "message": "Fetching captions",
            "error": null
        }"#;
        let event: ProgressEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.job_id, "job-1");
        assert_eq!(event.entity_id.as_deref(), Some("video-9"));
        assert_eq!(event.status, JobStatus::Processing);
        assert_eq!(event.progress, 40);
        assert_eq!(event.stage.as_ref().map(Stage::as_str), Some(STAGE_CAPTIONS));
        assert!(event.error.is_none());
    }

    #[test]
    fn tolerates_unknown_and_missing_fields() {
        let json = r#"{"job_id": 17, "unexpected": {"nested": true}}"#;
        let event: ProgressEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.job_id, "17");
        assert_eq!(event.status, JobStatus::Pending);
        assert_eq!(event.progress, 0);
        assert!(event.stage.is_none());
        assert!(event.message.is_empty());
    }

    #[test]
    fn clamps_malformed_progress() {
        let over: ProgressEvent =
            serde_json::from_str(r#"{"job_id":"a","progress":180}"#).unwrap();
        assert_eq!(over.progress, 100);

        let negative: ProgressEvent =
            serde_json::from_str(r#"{"job_id":"a","progress":-4}"#).unwrap();
        assert_eq!(negative.progress, 0);

        let nan: ProgressEvent =
            serde_json::from_str(r#"{"job_id":"a","progress":"NaN"}"#).unwrap();
        assert_eq!(nan.progress, 0);
    }

    #[test]
    fn missing_job_id_is_rejected() {
        let result = serde_json::from_str::<ProgressEvent>(r#"{"status":"processing"}"#);
        assert_matches!(result, Err(_));
    }

    #[test]
    fn unknown_status_is_treated_as_processing() {
        assert_eq!(JobStatus::from_wire("warming_up"), JobStatus::Processing);
        assert_eq!(JobStatus::from_wire("DONE"), JobStatus::Completed);
        assert_eq!(
            JobStatus::from_wire("completed_with_errors"),
            JobStatus::CompletedWithErrors
        );
    }

    #[test]
    fn stage_normalisation() {
        assert!(Stage::new("   ").is_none());
        let stage = Stage::new(" Complete ").unwrap();
        assert_eq!(stage.as_str(), STAGE_COMPLETE);
        assert!(stage.is_terminal());
        assert!(!Stage::new(STAGE_METADATA).unwrap().is_terminal());
        assert!(Stage::new("ERROR").unwrap().is_error());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::CompletedWithErrors.is_terminal());
    }
}
