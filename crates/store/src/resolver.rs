//! Merge live progress with the persisted import snapshot.
//!
//! A live [`ProgressRecord`] always wins because it is fresher. Without
//! one, the entity's persisted `import_stage`/`import_progress` is the
//! only information available (page just loaded, or the job finished
//! before this session subscribed).

use serde::Serialize;
use vidshelf_core::entity::PersistedProgress;
use vidshelf_core::progress::{JobStatus, Stage};

use crate::progress::ProgressRecord;

/// Where a [`ResolvedProgress`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressSource {
    Live,
    Persisted,
    None,
}

/// The single progress value a presentation surface renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedProgress {
    /// Authoritative percentage.
    pub progress: u8,
    /// Smoothed percentage for progress bars.
    pub display_progress: f32,
    pub stage: Option<Stage>,
    pub status: Option<JobStatus>,
    /// The entity is mid-import: show the overlay, disable interaction.
    pub importing: bool,
    /// Terminal failure; rendered distinctly from a stalled import.
    pub failed: bool,
    pub message: Option<String>,
    pub source: ProgressSource,
}

impl ResolvedProgress {
    fn nothing() -> Self {
        Self {
            progress: 0,
            display_progress: 0.0,
            stage: None,
            status: None,
            importing: false,
            failed: false,
            message: None,
            source: ProgressSource::None,
        }
    }
}

/// `true` for a present, non-terminal stage.
fn stage_in_flight(stage: Option<&Stage>) -> bool {
    stage.is_some_and(|s| !s.is_terminal())
}

/// Produce the displayable progress for one entity.
pub fn resolve(
    live: Option<&ProgressRecord>,
    persisted: Option<&PersistedProgress>,
) -> ResolvedProgress {
    if let Some(record) = live {
        return from_live(record);
    }
    match persisted {
        Some(snapshot) => from_persisted(snapshot),
        None => ResolvedProgress::nothing(),
    }
}

fn from_live(record: &ProgressRecord) -> ResolvedProgress {
    let status = record.status();
    let stage = record.stage().cloned();
    let failed = status == JobStatus::Failed || stage.as_ref().is_some_and(Stage::is_error);
    let message = record
        .event
        .error
        .clone()
        .or_else(|| (!record.event.message.is_empty()).then(|| record.event.message.clone()));

    ResolvedProgress {
        progress: record.target(),
        display_progress: record.display_progress,
        importing: !status.is_terminal() && stage_in_flight(stage.as_ref()),
        stage,
        status: Some(status),
        failed,
        message,
        source: ProgressSource::Live,
    }
}

fn from_persisted(snapshot: &PersistedProgress) -> ResolvedProgress {
    let stage = snapshot.import_stage.clone();
    let status = stage.as_ref().map(|s| {
        if s.is_error() {
            JobStatus::Failed
        } else if s.is_complete() {
            JobStatus::Completed
        } else {
            JobStatus::Processing
        }
    });
    let progress = snapshot.import_progress.unwrap_or(match &stage {
        Some(s) if s.is_complete() => 100,
        _ => 0,
    });

    ResolvedProgress {
        progress,
        display_progress: f32::from(progress),
        importing: stage_in_flight(stage.as_ref()),
        failed: stage.as_ref().is_some_and(Stage::is_error),
        stage,
        status,
        message: None,
        source: if snapshot.import_stage.is_none() && snapshot.import_progress.is_none() {
            ProgressSource::None
        } else {
            ProgressSource::Persisted
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressKey, ProgressStore};
    use crate::smoothing::SmoothingConfig;
    use vidshelf_core::progress::{ProgressEvent, STAGE_ERROR};

    async fn live_record(event: ProgressEvent) -> std::sync::Arc<ProgressRecord> {
        let store = ProgressStore::new(SmoothingConfig::default());
        let key = ProgressKey::job(event.job_id.clone());
        store.apply(event).await;
        store.get_progress(&key).await.unwrap()
    }

    fn persisted(stage: Option<&str>, progress: Option<u8>) -> PersistedProgress {
        PersistedProgress {
            import_stage: stage.and_then(Stage::new),
            import_progress: progress,
        }
    }

    #[tokio::test]
    async fn live_record_wins_over_snapshot() {
        let record = live_record(
            ProgressEvent::new("j1", JobStatus::Processing, 64.0)
                .with_entity("v1")
                .with_stage("chapters")
                .with_message("Detecting chapters"),
        )
        .await;
        let snapshot = persisted(Some("metadata"), Some(10));

        let resolved = resolve(Some(&record), Some(&snapshot));
        assert_eq!(resolved.source, ProgressSource::Live);
        assert_eq!(resolved.progress, 64);
        assert_eq!(resolved.stage.as_ref().map(Stage::as_str), Some("chapters"));
        assert_eq!(resolved.status, Some(JobStatus::Processing));
        assert!(resolved.importing);
        assert_eq!(resolved.message.as_deref(), Some("Detecting chapters"));
    }

    #[tokio::test]
    async fn live_terminal_record_is_not_importing() {
        let record = live_record(
            ProgressEvent::new("j1", JobStatus::Failed, 40.0)
                .with_stage("captions")
                .with_error("caption track missing"),
        )
        .await;

        let resolved = resolve(Some(&record), None);
        assert!(!resolved.importing);
        assert!(resolved.failed);
        assert_eq!(resolved.message.as_deref(), Some("caption track missing"));
    }

    #[test]
    fn persisted_error_stage_is_failed_not_importing() {
        let resolved = resolve(None, Some(&persisted(Some(STAGE_ERROR), Some(35))));
        assert_eq!(resolved.source, ProgressSource::Persisted);
        assert!(!resolved.importing);
        assert!(resolved.failed);
        assert_eq!(resolved.status, Some(JobStatus::Failed));
        assert_eq!(resolved.progress, 35);
    }

    #[test]
    fn persisted_midway_stage_is_importing() {
        let resolved = resolve(None, Some(&persisted(Some("captions"), Some(50))));
        assert!(resolved.importing);
        assert!(!resolved.failed);
        assert_eq!(resolved.status, Some(JobStatus::Processing));
        assert_eq!(resolved.display_progress, 50.0);
    }

    #[test]
    fn persisted_complete_without_progress_reads_full() {
        let resolved = resolve(None, Some(&persisted(Some("complete"), None)));
        assert!(!resolved.importing);
        assert_eq!(resolved.progress, 100);
        assert_eq!(resolved.status, Some(JobStatus::Completed));
    }

    #[test]
    fn null_snapshot_is_idle() {
        let resolved = resolve(None, Some(&persisted(None, None)));
        assert_eq!(resolved.source, ProgressSource::None);
        assert!(!resolved.importing);
        assert!(resolved.status.is_none());

        assert_eq!(resolve(None, None), ResolvedProgress::nothing());
    }
}
