//! Process-wide keyed progress state.
//!
//! [`ProgressStore`] holds one [`ProgressRecord`] per job and indexes it
//! by the entity the job targets. Every key has a `watch` channel, so
//! all surfaces subscribed to the same id observe the same
//! `Arc<ProgressRecord>` and no surface keeps its own copy.
//!
//! Records are immutable snapshots: each change (event or animation
//! step) publishes a new `Arc` with a higher `version`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use vidshelf_core::progress::{JobStatus, ProgressEvent, Stage, STAGE_COMPLETE, STAGE_ERROR};
use vidshelf_core::types::{EntityId, JobId, Timestamp};

use crate::entity_cache::EntityCache;
use crate::smoothing::{advance, SmoothingConfig};

/// Tombstones outlive the completion grace by this factor.
const TOMBSTONE_RETENTION_FACTOR: u32 = 10;

/// Lower bound for tombstone retention, for very short grace periods.
const MIN_TOMBSTONE_RETENTION: Duration = Duration::from_secs(60);

/// A non-terminal record nobody watches is dropped after this long
/// without an event.
const ORPHAN_RECORD_TTL: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Keys and records
// ---------------------------------------------------------------------------

/// Identifier a caller subscribes on.
///
/// One job usually targets one entity, but the mapping is not assumed
/// to be permanent: an entity key always follows the most recent job
/// that named it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProgressKey {
    Job(JobId),
    Entity(EntityId),
}

impl ProgressKey {
    pub fn job(id: impl Into<JobId>) -> Self {
        ProgressKey::Job(id.into())
    }

    pub fn entity(id: impl Into<EntityId>) -> Self {
        ProgressKey::Entity(id.into())
    }
}

impl std::fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressKey::Job(id) => write!(f, "job:{id}"),
            ProgressKey::Entity(id) => write!(f, "entity:{id}"),
        }
    }
}

/// Latest state of one job as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRecord {
    /// The most recent accepted event.
    pub event: ProgressEvent,
    /// Animated value shown to the user, always within `0.0..=100.0`.
    pub display_progress: f32,
    /// Store-wide monotonically increasing change counter.
    pub version: u64,
    /// When the last event was accepted.
    pub updated_at: Timestamp,
    received_at: Instant,
    completed_at: Option<Instant>,
}

impl ProgressRecord {
    pub fn job_id(&self) -> &str {
        &self.event.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.event.status
    }

    pub fn stage(&self) -> Option<&Stage> {
        self.event.stage.as_ref()
    }

    /// Authoritative progress from the server.
    pub fn target(&self) -> u8 {
        self.event.progress
    }

    pub fn display_percent(&self) -> u8 {
        self.display_progress.round() as u8
    }

    pub fn is_complete(&self) -> bool {
        self.event.is_terminal()
    }

    pub fn is_animating(&self) -> bool {
        !self.is_complete() && self.display_progress < f32::from(self.target())
    }
}

/// What [`ProgressStore::apply`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First event for this job.
    Created,
    /// The record changed.
    Updated,
    /// Identical to the current record; nothing published.
    Duplicate,
    /// Non-terminal event for a job that already finished.
    IgnoredTerminal,
    /// The job finished and its record has already been evicted.
    IgnoredEvicted,
}

impl ApplyOutcome {
    pub fn changed(self) -> bool {
        matches!(self, ApplyOutcome::Created | ApplyOutcome::Updated)
    }
}

/// Result of one smoothing tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub advanced: usize,
    pub evicted: usize,
    /// Unwatched, non-terminal records that went quiet.
    pub dropped: usize,
}

/// Returned when the store behind a subscription has been dropped.
#[derive(Debug, thiserror::Error)]
#[error("progress store dropped")]
pub struct StoreClosed;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Live view of one key. Dropping it unsubscribes; the record and the
/// connection stay untouched.
pub struct ProgressSubscription {
    key: ProgressKey,
    rx: watch::Receiver<Option<Arc<ProgressRecord>>>,
}

impl ProgressSubscription {
    pub fn key(&self) -> &ProgressKey {
        &self.key
    }

    /// The record as of now, or `None` if the key has no live record.
    pub fn current(&self) -> Option<Arc<ProgressRecord>> {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the new value.
    pub async fn changed(&mut self) -> Result<Option<Arc<ProgressRecord>>, StoreClosed> {
        self.rx.changed().await.map_err(|_| StoreClosed)?;
        Ok(self.rx.borrow_and_update().clone())
    }

    /// Wait until the current value satisfies `predicate`.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<Option<Arc<ProgressRecord>>, StoreClosed>
    where
        F: FnMut(Option<&ProgressRecord>) -> bool,
    {
        let value = self
            .rx
            .wait_for(|record| predicate(record.as_deref()))
            .await
            .map_err(|_| StoreClosed)?;
        Ok(value.clone())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

type RecordSlot = watch::Sender<Option<Arc<ProgressRecord>>>;

#[derive(Default)]
struct StoreState {
    records: HashMap<JobId, Arc<ProgressRecord>>,
    entity_jobs: HashMap<EntityId, JobId>,
    channels: HashMap<ProgressKey, RecordSlot>,
    /// Jobs whose completed record was evicted, with the eviction time.
    /// Kept for a retention window so a late event cannot resurrect them.
    finished: HashMap<JobId, Instant>,
    next_version: u64,
}

/// Keyed progress state shared by every UI surface.
///
/// Construct once per session and share as `Arc<ProgressStore>`; all
/// writes go through [`apply`](Self::apply) and [`tick`](Self::tick).
pub struct ProgressStore {
    state: RwLock<StoreState>,
    config: SmoothingConfig,
    entity_cache: Option<Arc<EntityCache>>,
}

impl ProgressStore {
    pub fn new(config: SmoothingConfig) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            config,
            entity_cache: None,
        }
    }

    /// Write terminal outcomes back into the entity cache's persisted
    /// progress fields, so the fallback does not regress once a
    /// completed record is evicted.
    pub fn with_entity_cache(mut self, cache: Arc<EntityCache>) -> Self {
        self.entity_cache = Some(cache);
        self
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    /// Apply one event in arrival order.
    pub async fn apply(&self, event: ProgressEvent) -> ApplyOutcome {
        let write_back = event
            .is_terminal()
            .then(|| event.entity_id.clone())
            .flatten()
            .map(|entity_id| (entity_id, terminal_stage(&event), event.progress));
        let job_id = event.job_id.clone();

        let outcome = self.state.write().await.apply(event);

        match outcome {
            ApplyOutcome::Created | ApplyOutcome::Updated => {
                tracing::trace!(job_id = %job_id, ?outcome, "Progress event applied");
            }
            ApplyOutcome::Duplicate => {}
            ApplyOutcome::IgnoredTerminal | ApplyOutcome::IgnoredEvicted => {
                tracing::debug!(job_id = %job_id, ?outcome, "Dropped event for finished job");
            }
        }

        if outcome.changed() {
            if let (Some(cache), Some((entity_id, stage, progress))) =
                (&self.entity_cache, write_back)
            {
                cache
                    .record_import_outcome(&entity_id, stage, Some(progress))
                    .await;
            }
        }

        outcome
    }

    /// Advance every animating record by one step and evict completed
    /// records whose grace period has elapsed. A no-op when empty.
    pub async fn tick(&self) -> TickSummary {
        let mut state = self.state.write().await;
        let summary = state.tick(&self.config, Instant::now());
        if summary.evicted > 0 {
            tracing::debug!(evicted = summary.evicted, "Evicted completed progress records");
        }
        if summary.dropped > 0 {
            tracing::debug!(dropped = summary.dropped, "Dropped quiet unwatched progress records");
        }
        summary
    }

    pub async fn get_progress(&self, key: &ProgressKey) -> Option<Arc<ProgressRecord>> {
        self.state.read().await.current_for(key)
    }

    /// Subscribe to a job or entity key.
    ///
    /// The subscription starts at the current value (possibly `None`)
    /// and sees every later change, including eviction back to `None`.
    pub async fn subscribe(&self, key: ProgressKey) -> ProgressSubscription {
        let mut state = self.state.write().await;
        let current = state.current_for(&key);
        let rx = state
            .channels
            .entry(key.clone())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe();
        ProgressSubscription { key, rx }
    }

    /// Job currently associated with an entity, if any.
    pub async fn job_for_entity(&self, entity_id: &str) -> Option<JobId> {
        self.state.read().await.entity_jobs.get(entity_id).cloned()
    }

    pub async fn record_count(&self) -> usize {
        self.state.read().await.records.len()
    }
}

impl StoreState {
    fn apply(&mut self, event: ProgressEvent) -> ApplyOutcome {
        if self.finished.contains_key(&event.job_id) {
            return ApplyOutcome::IgnoredEvicted;
        }

        let terminal = event.is_terminal();
        let target = f32::from(event.progress);
        let now = Instant::now();

        let (display, completed_at, previous_entity, outcome) =
            match self.records.get(&event.job_id) {
                Some(existing) => {
                    if existing.event == event {
                        return ApplyOutcome::Duplicate;
                    }
                    if existing.is_complete() && !terminal {
                        return ApplyOutcome::IgnoredTerminal;
                    }
                    let display = if terminal {
                        target
                    } else {
                        existing.display_progress
                    };
                    let completed_at = existing.completed_at.or(terminal.then_some(now));
                    (
                        display,
                        completed_at,
                        existing.event.entity_id.clone(),
                        ApplyOutcome::Updated,
                    )
                }
                // Seed at the target so a record taking over from the
                // persisted snapshot does not animate up from zero.
                None => (target, terminal.then_some(now), None, ApplyOutcome::Created),
            };

        self.next_version += 1;
        let record = Arc::new(ProgressRecord {
            event,
            display_progress: display,
            version: self.next_version,
            updated_at: Utc::now(),
            received_at: now,
            completed_at,
        });
        let job_id = record.event.job_id.clone();

        if let Some(previous) = previous_entity {
            if record.event.entity_id.as_ref() != Some(&previous)
                && self.entity_jobs.get(&previous) == Some(&job_id)
            {
                self.entity_jobs.remove(&previous);
                self.publish(&ProgressKey::Entity(previous), None);
            }
        }
        if let Some(entity_id) = &record.event.entity_id {
            self.entity_jobs.insert(entity_id.clone(), job_id.clone());
        }

        self.records.insert(job_id, Arc::clone(&record));
        self.publish_record(&record);
        outcome
    }

    fn tick(&mut self, config: &SmoothingConfig, now: Instant) -> TickSummary {
        let mut summary = TickSummary::default();

        let retention = tombstone_retention(config);
        self.finished
            .retain(|_, evicted_at| now.saturating_duration_since(*evicted_at) < retention);

        let expired: Vec<JobId> = self
            .records
            .values()
            .filter(|r| {
                r.completed_at
                    .is_some_and(|at| now.saturating_duration_since(at) >= config.completion_grace)
            })
            .map(|r| r.event.job_id.clone())
            .collect();
        for job_id in expired {
            self.evict(&job_id, now);
            summary.evicted += 1;
        }

        let orphaned: Vec<JobId> = self
            .records
            .values()
            .filter(|r| {
                r.completed_at.is_none()
                    && now.saturating_duration_since(r.received_at) >= ORPHAN_RECORD_TTL
                    && !self.is_watched(r)
            })
            .map(|r| r.event.job_id.clone())
            .collect();
        for job_id in orphaned {
            self.drop_record(&job_id);
            summary.dropped += 1;
        }

        let stepped: Vec<ProgressRecord> = self
            .records
            .values()
            .filter(|r| r.is_animating())
            .map(|r| ProgressRecord {
                display_progress: advance(
                    r.display_progress,
                    f32::from(r.target()),
                    config.step_cap,
                ),
                ..ProgressRecord::clone(r)
            })
            .collect();
        for mut record in stepped {
            self.next_version += 1;
            record.version = self.next_version;
            let record = Arc::new(record);
            self.records
                .insert(record.event.job_id.clone(), Arc::clone(&record));
            self.publish_record(&record);
            summary.advanced += 1;
        }

        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        summary
    }

    fn evict(&mut self, job_id: &str, now: Instant) {
        let Some(record) = self.records.remove(job_id) else {
            return;
        };
        self.finished.insert(job_id.to_string(), now);
        self.publish(&ProgressKey::Job(job_id.to_string()), None);
        if let Some(entity_id) = &record.event.entity_id {
            if self.entity_jobs.get(entity_id).map(String::as_str) == Some(job_id) {
                self.entity_jobs.remove(entity_id);
                self.publish(&ProgressKey::Entity(entity_id.clone()), None);
            }
        }
    }

    /// Remove a record without a tombstone; a later event recreates it.
    fn drop_record(&mut self, job_id: &str) {
        let Some(record) = self.records.remove(job_id) else {
            return;
        };
        if let Some(entity_id) = &record.event.entity_id {
            if self.entity_jobs.get(entity_id).map(String::as_str) == Some(job_id) {
                self.entity_jobs.remove(entity_id);
            }
        }
    }

    fn is_watched(&self, record: &ProgressRecord) -> bool {
        let watched = |key: ProgressKey| {
            self.channels
                .get(&key)
                .is_some_and(|tx| tx.receiver_count() > 0)
        };
        let job_id = &record.event.job_id;
        watched(ProgressKey::Job(job_id.clone()))
            || record.event.entity_id.as_ref().is_some_and(|entity_id| {
                self.entity_jobs.get(entity_id) == Some(job_id)
                    && watched(ProgressKey::Entity(entity_id.clone()))
            })
    }

    fn current_for(&self, key: &ProgressKey) -> Option<Arc<ProgressRecord>> {
        match key {
            ProgressKey::Job(id) => self.records.get(id).cloned(),
            ProgressKey::Entity(id) => self
                .entity_jobs
                .get(id)
                .and_then(|job_id| self.records.get(job_id))
                .cloned(),
        }
    }

    fn publish_record(&self, record: &Arc<ProgressRecord>) {
        let job_id = &record.event.job_id;
        self.publish(&ProgressKey::Job(job_id.clone()), Some(Arc::clone(record)));
        if let Some(entity_id) = &record.event.entity_id {
            if self.entity_jobs.get(entity_id) == Some(job_id) {
                self.publish(
                    &ProgressKey::Entity(entity_id.clone()),
                    Some(Arc::clone(record)),
                );
            }
        }
    }

    fn publish(&self, key: &ProgressKey, record: Option<Arc<ProgressRecord>>) {
        if let Some(tx) = self.channels.get(key) {
            tx.send_replace(record);
        }
    }
}

fn tombstone_retention(config: &SmoothingConfig) -> Duration {
    (config.completion_grace * TOMBSTONE_RETENTION_FACTOR).max(MIN_TOMBSTONE_RETENTION)
}

/// Stage to persist for a terminal event: the event's own terminal
/// stage, otherwise the one implied by its status.
fn terminal_stage(event: &ProgressEvent) -> Option<Stage> {
    match &event.stage {
        Some(stage) if stage.is_terminal() => Some(stage.clone()),
        _ if event.status == JobStatus::Failed => Stage::new(STAGE_ERROR),
        _ => Stage::new(STAGE_COMPLETE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store() -> ProgressStore {
        ProgressStore::new(SmoothingConfig {
            step_cap: 10.0,
            completion_grace: Duration::from_secs(5),
        })
    }

    fn processing(job: &str, progress: f64) -> ProgressEvent {
        ProgressEvent::new(job, JobStatus::Processing, progress)
    }

    #[tokio::test]
    async fn first_event_creates_record_seeded_at_target() {
        let store = store();
        let outcome = store.apply(processing("j1", 35.0)).await;
        assert_eq!(outcome, ApplyOutcome::Created);

        let record = store.get_progress(&ProgressKey::job("j1")).await.unwrap();
        assert_eq!(record.target(), 35);
        assert_eq!(record.display_progress, 35.0);
        assert!(!record.is_animating());
    }

    #[tokio::test]
    async fn duplicate_events_are_noops() {
        let store = store();
        store.apply(processing("j1", 10.0)).await;
        let before = store.get_progress(&ProgressKey::job("j1")).await.unwrap();

        let outcome = store.apply(processing("j1", 10.0)).await;
        assert_eq!(outcome, ApplyOutcome::Duplicate);

        let after = store.get_progress(&ProgressKey::job("j1")).await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn terminal_record_is_never_regressed() {
        let store = store();
        store.apply(processing("j1", 40.0)).await;
        store
            .apply(ProgressEvent::new("j1", JobStatus::Completed, 100.0))
            .await;

        let outcome = store.apply(processing("j1", 60.0)).await;
        assert_eq!(outcome, ApplyOutcome::IgnoredTerminal);

        let record = store.get_progress(&ProgressKey::job("j1")).await.unwrap();
        assert_eq!(record.status(), JobStatus::Completed);
        assert_eq!(record.target(), 100);
    }

    #[tokio::test]
    async fn terminal_status_jumps_display_immediately() {
        let store = store();
        store.apply(processing("j1", 0.0)).await;
        store.apply(processing("j1", 80.0)).await;
        store.tick().await;

        let record = store.get_progress(&ProgressKey::job("j1")).await.unwrap();
        assert_eq!(record.display_progress, 10.0);

        store
            .apply(ProgressEvent::new("j1", JobStatus::Completed, 100.0))
            .await;
        let record = store.get_progress(&ProgressKey::job("j1")).await.unwrap();
        assert_eq!(record.display_progress, 100.0);
        assert!(!record.is_animating());
    }

    #[tokio::test]
    async fn display_is_monotonic_across_ticks() {
        let store = store();
        store.apply(processing("j1", 5.0)).await;
        store.apply(processing("j1", 95.0)).await;

        let mut previous = 0.0;
        for _ in 0..20 {
            store.tick().await;
            let record = store.get_progress(&ProgressKey::job("j1")).await.unwrap();
            assert!(record.display_progress >= previous);
            previous = record.display_progress;
        }
        assert_eq!(previous, 95.0);

        // A lower target does not pull the display back down.
        store.apply(processing("j1", 50.0)).await;
        store.tick().await;
        let record = store.get_progress(&ProgressKey::job("j1")).await.unwrap();
        assert_eq!(record.display_progress, 95.0);
    }

    #[tokio::test]
    async fn tick_on_empty_store_is_noop() {
        let store = store();
        assert_eq!(store.tick().await, TickSummary::default());
    }

    #[tokio::test]
    async fn subscribers_share_the_same_record() {
        let store = store();
        let mut by_job = store.subscribe(ProgressKey::job("j1")).await;
        let mut by_entity = store.subscribe(ProgressKey::entity("v1")).await;
        assert!(by_job.current().is_none());

        store.apply(processing("j1", 20.0).with_entity("v1")).await;

        let a = by_job.changed().await.unwrap().unwrap();
        let b = by_entity.changed().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.version, b.version);
    }

    #[tokio::test]
    async fn entity_key_follows_latest_job() {
        let store = store();
        store.apply(processing("j1", 20.0).with_entity("v1")).await;
        store.apply(processing("j2", 5.0).with_entity("v1")).await;

        assert_eq!(store.job_for_entity("v1").await.as_deref(), Some("j2"));
        let record = store.get_progress(&ProgressKey::entity("v1")).await.unwrap();
        assert_eq!(record.job_id(), "j2");

        // Whichever job most recently named the entity owns the key.
        store.apply(processing("j1", 40.0).with_entity("v1")).await;
        assert_eq!(store.job_for_entity("v1").await.as_deref(), Some("j1"));
    }

    #[tokio::test]
    async fn unsubscribing_keeps_the_record() {
        let store = store();
        let sub = store.subscribe(ProgressKey::job("j1")).await;
        store.apply(processing("j1", 20.0)).await;
        drop(sub);
        store.tick().await;
        assert!(store.get_progress(&ProgressKey::job("j1")).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn completed_records_are_evicted_after_grace() {
        let store = store();
        store
            .apply(ProgressEvent::new("j1", JobStatus::Failed, 30.0).with_entity("v1"))
            .await;
        let mut sub = store.subscribe(ProgressKey::entity("v1")).await;
        assert!(sub.current().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.tick().await.evicted, 0);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.tick().await.evicted, 1);
        assert!(sub.changed().await.unwrap().is_none());
        assert!(store.get_progress(&ProgressKey::job("j1")).await.is_none());

        // A stale event cannot bring the job back.
        let outcome = store.apply(processing("j1", 10.0)).await;
        assert_eq!(outcome, ApplyOutcome::IgnoredEvicted);
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tombstones_expire_after_retention() {
        let store = store();
        store.apply(ProgressEvent::new("j1", JobStatus::Completed, 100.0)).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.tick().await.evicted, 1);
        assert_eq!(store.state.read().await.finished.len(), 1);

        // Still inside the window: late events stay dropped.
        tokio::time::advance(Duration::from_secs(30)).await;
        store.tick().await;
        assert_eq!(
            store.apply(processing("j1", 10.0)).await,
            ApplyOutcome::IgnoredEvicted
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        store.tick().await;
        assert!(store.state.read().await.finished.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_unwatched_records_are_dropped() {
        let store = store();
        store.apply(processing("quiet", 20.0).with_entity("v1")).await;
        store.apply(processing("watched", 20.0).with_entity("v2")).await;
        let _sub = store.subscribe(ProgressKey::entity("v2")).await;

        tokio::time::advance(ORPHAN_RECORD_TTL).await;
        let summary = store.tick().await;
        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.evicted, 0);
        assert!(store.get_progress(&ProgressKey::job("quiet")).await.is_none());
        assert!(store.job_for_entity("v1").await.is_none());
        assert!(store.get_progress(&ProgressKey::job("watched")).await.is_some());

        // Not tombstoned: the job may still report.
        let outcome = store.apply(processing("quiet", 30.0)).await;
        assert_eq!(outcome, ApplyOutcome::Created);
    }

    #[test]
    fn terminal_stage_prefers_event_stage() {
        let failed = ProgressEvent::new("j", JobStatus::Failed, 10.0).with_stage("captions");
        assert_eq!(terminal_stage(&failed).unwrap().as_str(), STAGE_ERROR);

        let done = ProgressEvent::new("j", JobStatus::CompletedWithErrors, 100.0);
        assert_eq!(terminal_stage(&done).unwrap().as_str(), STAGE_COMPLETE);

        let explicit = ProgressEvent::new("j", JobStatus::Failed, 10.0).with_stage("complete");
        assert_eq!(terminal_stage(&explicit).unwrap().as_str(), STAGE_COMPLETE);
    }
}
