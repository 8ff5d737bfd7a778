//! Application state shared across all HTTP and WebSocket handlers.

use std::sync::Arc;

use crate::api::CoordinationStore;
use crate::config::AppConfig;
use crate::docstore::{DocumentCodec, DocumentStore};
use crate::engine::pipeline::{OperationPipeline, PipelineConfig};
use crate::engine::save::PersistenceCoordinator;
use crate::engine::sync::SyncService;
use crate::hub::FanoutHub;
use crate::presence::PresenceRegistry;
use crate::transform::OperationTransformer;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

struct StateInner {
    config: AppConfig,
    store: Arc<dyn CoordinationStore>,
    pipeline: OperationPipeline<dyn CoordinationStore>,
    sync: SyncService<dyn CoordinationStore>,
    persistence: PersistenceCoordinator<dyn CoordinationStore>,
    presence: PresenceRegistry<dyn CoordinationStore>,
    hub: Arc<FanoutHub>,
}

impl AppState {
    /// Wire the engine services over one store and its collaborators.
    pub fn new(
        config: AppConfig,
        store: Arc<dyn CoordinationStore>,
        documents: Arc<dyn DocumentStore>,
        codec: Arc<dyn DocumentCodec>,
        transformer: Arc<dyn OperationTransformer>,
    ) -> Self {
        let pipeline_config = PipelineConfig {
            max_retries: config.engine.max_retries,
            retry_backoff: config.engine.retry_backoff(),
            pending_slot_ttl: config.engine.pending_slot_ttl(),
        };
        AppState {
            inner: Arc::new(StateInner {
                pipeline: OperationPipeline::new(store.clone(), transformer.clone(), pipeline_config),
                sync: SyncService::new(store.clone(), documents.clone(), codec.clone(), transformer),
                persistence: PersistenceCoordinator::new(store.clone(), documents, codec),
                presence: PresenceRegistry::new(store.clone()),
                hub: Arc::new(FanoutHub::new()),
                store,
                config,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.inner.store
    }

    pub fn pipeline(&self) -> &OperationPipeline<dyn CoordinationStore> {
        &self.inner.pipeline
    }

    pub fn sync(&self) -> &SyncService<dyn CoordinationStore> {
        &self.inner.sync
    }

    pub fn persistence(&self) -> &PersistenceCoordinator<dyn CoordinationStore> {
        &self.inner.persistence
    }

    pub fn presence(&self) -> &PresenceRegistry<dyn CoordinationStore> {
        &self.inner.presence
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.inner.hub
    }
}
