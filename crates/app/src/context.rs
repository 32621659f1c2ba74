//! Service container handed to presentation code.
//!
//! [`LiveContext`] owns the process-wide progress store, the entity
//! cache, the shared connection and the field mutation controller.
//! Construct it once and pass it by reference or `Arc`; there are no
//! globals.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vidshelf_api::LibraryApi;
use vidshelf_core::entity::EntitySnapshot;
use vidshelf_core::error::CoreError;
use vidshelf_core::fields::FieldValue;
use vidshelf_core::types::{EntityId, FieldId};
use vidshelf_store::progress::StoreClosed;
use vidshelf_store::{
    resolve, run_smoothing, EntityCache, EntitySource, FieldMutationController, FieldView,
    FieldWriteError, FieldWriter, IntervalTicks, ProgressKey, ProgressStore, ProgressSubscription,
    ResolvedProgress, SmoothingConfig,
};
use vidshelf_stream::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, Connector, HistorySource, WsConnector,
};

use crate::config::AppConfig;

/// The backing services a [`LiveContext`] talks to.
pub struct Services {
    pub connector: Arc<dyn Connector>,
    pub history: Arc<dyn HistorySource>,
    pub writer: Arc<dyn FieldWriter>,
    pub entities: Arc<dyn EntitySource>,
}

pub struct LiveContext {
    store: Arc<ProgressStore>,
    cache: Arc<EntityCache>,
    connection: Arc<ConnectionManager>,
    mutations: FieldMutationController,
    entities: Arc<dyn EntitySource>,
}

impl LiveContext {
    /// Wire the context to the configured server.
    pub fn from_config(config: &AppConfig) -> Self {
        let api = Arc::new(LibraryApi::new(config.api_url.clone()).with_token(config.auth_token.clone()));
        let services = Services {
            connector: Arc::new(WsConnector::new(config.ws_url.clone())),
            history: api.clone(),
            writer: api.clone(),
            entities: api,
        };
        Self::new(services, config.smoothing_config(), config.connection_config())
    }

    pub fn new(services: Services, smoothing: SmoothingConfig, connection: ConnectionConfig) -> Self {
        let cache = Arc::new(EntityCache::new());
        let store = Arc::new(ProgressStore::new(smoothing).with_entity_cache(Arc::clone(&cache)));
        let connection = ConnectionManager::new(
            services.connector,
            services.history,
            Arc::clone(&store),
            connection,
        );
        let mutations = FieldMutationController::new(Arc::clone(&cache), services.writer);

        Self {
            store,
            cache,
            connection,
            mutations,
            entities: services.entities,
        }
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Acquire the shared progress stream connection.
    pub fn connect(&self, token: impl Into<String>) -> ConnectionHandle {
        self.connection.connect(token)
    }

    /// Drive display smoothing every `period` until `cancel` fires.
    pub fn start_smoothing(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_smoothing(
            Arc::clone(&self.store),
            IntervalTicks::new(period),
            cancel,
        ))
    }

    /// Fetch an entity and seed the cache with it.
    pub async fn load_entity(&self, entity_id: &str) -> Result<EntitySnapshot, CoreError> {
        self.cache.load(self.entities.as_ref(), entity_id).await
    }

    /// Current value and pending state of one field.
    pub async fn field(&self, entity_id: &str, field_id: &str) -> FieldView {
        self.cache.field(entity_id, field_id).await
    }

    /// Optimistically set one field. On error the field has already
    /// been rolled back.
    pub async fn set_field(
        &self,
        entity_id: &str,
        field_id: &str,
        value: FieldValue,
    ) -> Result<(), FieldWriteError> {
        self.mutations.set_field(entity_id, field_id, value).await
    }

    pub async fn set_fields(
        &self,
        entity_id: &str,
        values: Vec<(FieldId, FieldValue)>,
    ) -> Result<(), FieldWriteError> {
        self.mutations.set_fields(entity_id, values).await
    }

    /// Live-or-persisted progress for an entity.
    pub async fn use_progress(&self, entity_id: &str) -> ProgressView {
        ProgressView {
            entity_id: Some(entity_id.to_string()),
            subscription: self.store.subscribe(ProgressKey::entity(entity_id)).await,
            cache: Arc::clone(&self.cache),
            cache_changes: self.cache.subscribe(),
        }
    }

    /// Live progress for a job. Jobs have no persisted snapshot, so
    /// this resolves to nothing once the record is gone.
    pub async fn use_job_progress(&self, job_id: &str) -> ProgressView {
        ProgressView {
            entity_id: None,
            subscription: self.store.subscribe(ProgressKey::job(job_id)).await,
            cache: Arc::clone(&self.cache),
            cache_changes: self.cache.subscribe(),
        }
    }
}

/// One consumer's view of resolved progress. Dropping it unsubscribes.
pub struct ProgressView {
    entity_id: Option<EntityId>,
    subscription: ProgressSubscription,
    cache: Arc<EntityCache>,
    cache_changes: broadcast::Receiver<EntityId>,
}

impl ProgressView {
    pub fn key(&self) -> &ProgressKey {
        self.subscription.key()
    }

    pub async fn current(&self) -> ResolvedProgress {
        let live = self.subscription.current();
        let persisted = match &self.entity_id {
            Some(entity_id) => self.cache.persisted_progress(entity_id).await,
            None => None,
        };
        resolve(live.as_deref(), persisted.as_ref())
    }

    /// Wait until the live record or the entity's cached snapshot
    /// changes, then return the new resolved value.
    pub async fn changed(&mut self) -> Result<ResolvedProgress, StoreClosed> {
        loop {
            tokio::select! {
                result = self.subscription.changed() => {
                    result?;
                    break;
                }
                received = self.cache_changes.recv() => match received {
                    Ok(entity_id) if self.entity_id.as_ref() == Some(&entity_id) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        self.subscription.changed().await?;
                        break;
                    }
                },
            }
        }
        Ok(self.current().await)
    }
}
