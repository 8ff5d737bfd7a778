//! Axum router configuration.
//!
//! ```text
//! /
//! ├── /api/collab/*   - collaboration REST API (editor clients)
//! ├── /ws             - per-document event subscription
//! └── /health         - liveness probe
//! ```

use axum::Router;
use axum::routing::{any, get, post};

use crate::handlers::*;
use crate::state::AppState;

/// Build the complete router with all routes.
pub fn build_router(state: &AppState) -> Router {
    Router::new()
        .nest("/api/collab", collab_api_router())
        .route("/ws", any(ws_upgrade))
        .route("/health", get(health))
        .with_state(state.clone())
}

/// Collaboration API routes.
///
/// Routes:
/// - `POST /api/collab/ImportFile` - load a document, replaying pending operations
/// - `POST /api/collab/UpdateAction` - submit one operation
/// - `POST /api/collab/GetActionsFromServer` - catch-up read for lagging clients
/// - `POST /api/collab/ShouldSave` - save-necessity check (doubles as heartbeat)
/// - `POST /api/collab/SaveDocument` - persist the rendered document
fn collab_api_router() -> Router<AppState> {
    Router::new()
        .route("/ImportFile", post(import_file))
        .route("/UpdateAction", post(update_action))
        .route("/GetActionsFromServer", post(get_actions))
        .route("/ShouldSave", post(should_save))
        .route("/SaveDocument", post(save_document))
}
