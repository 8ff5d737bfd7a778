use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use vellum::api::CoordinationStore;
use vellum::api::inmemory::DeterministicStore;
use vellum::config::{AppConfig, DocumentStorageBackend, StoreBackend};
use vellum::docstore::{DocumentStore, FsDocumentStore, MemoryDocumentStore, PassthroughCodec};
use vellum::reaper::{Reaper, ReaperConfig};
use vellum::server::{build_router, serve};
use vellum::state::AppState;
use vellum::transform::IdentityTransformer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = AppConfig::load().context("invalid configuration")?;

    let store: Arc<dyn CoordinationStore> = match config.store.backend {
        StoreBackend::Memory => DeterministicStore::new(),
    };
    let documents: Arc<dyn DocumentStore> = match config.documents.backend {
        DocumentStorageBackend::Memory => MemoryDocumentStore::new(),
        DocumentStorageBackend::Fs => FsDocumentStore::new(config.documents.root.clone()),
    };

    let state = AppState::new(
        config.clone(),
        store.clone(),
        documents,
        Arc::new(PassthroughCodec),
        Arc::new(IdentityTransformer),
    );

    let reaper = Reaper::new(
        store,
        state.hub().clone(),
        ReaperConfig {
            sweep_interval: config.timing.room_cleanup_interval(),
            stale_session_after: config.timing.stale_session_after(),
        },
    );
    let reaper_cancel = reaper.spawn();

    let app = build_router(&state);
    serve(&config.server.bind_addr(), app, reaper_cancel).await
}
