//! Collaboration API handlers.
//!
//! Request and response bodies use camelCase field names on the wire.
//! Handlers orchestrate the engine services: the submit path also refreshes
//! presence timestamps and fans the committed operation out to document
//! subscribers, in that order, after the commit has returned.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::engine::EngineError;
use crate::hub::CollabEvent;
use crate::presence::TouchUpdate;
use crate::state::AppState;
use crate::transform::EditOperation;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFileRequest {
    pub file_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFileResponse {
    pub sfdt: String,
    pub version: u64,
}

/// Load a document and replay pending operations for a joining client.
pub async fn import_file(State(state): State<AppState>, Json(req): Json<ImportFileRequest>) -> impl IntoResponse {
    match state.sync().import(&req.file_id).await {
        Ok(imported) => Json(ImportFileResponse {
            sfdt: imported.sfdt,
            version: imported.version,
        })
        .into_response(),
        Err(EngineError::UnknownDocument { doc }) => {
            (StatusCode::NOT_FOUND, format!("Document '{doc}' not found")).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to import document: {e}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateActionRequest {
    pub file_id: String,
    #[serde(flatten)]
    pub operation: EditOperation,
}

/// Accept one edit operation: assign a version, transform, commit, fan out.
pub async fn update_action(State(state): State<AppState>, Json(req): Json<UpdateActionRequest>) -> impl IntoResponse {
    let client_version = req.operation.version;
    match state.pipeline().submit(&req.file_id, client_version, req.operation).await {
        Ok(committed) => {
            if let Some(author) = committed.author.as_deref()
                && let Err(e) = state.presence().touch(&req.file_id, author, TouchUpdate::action()).await
            {
                warn!(doc = %req.file_id, error = %e, "presence touch failed after commit");
            }
            state.hub().publish(&req.file_id, CollabEvent::OpCommitted {
                payload: committed.clone(),
            });
            Json(committed).into_response()
        }
        Err(EngineError::StaleClient {
            client_version,
            persisted_version,
        }) => (
            StatusCode::CONFLICT,
            format!("RESYNC_REQUIRED: client at {client_version} < persisted {persisted_version}"),
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to apply operation: {e}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetActionsRequest {
    pub file_id: String,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetActionsResponse {
    pub operations: Vec<EditOperation>,
    pub resync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_start: Option<u64>,
}

/// Serve the committed operations a client has not seen yet.
pub async fn get_actions(State(state): State<AppState>, Json(req): Json<GetActionsRequest>) -> impl IntoResponse {
    match state.sync().get_since(&req.file_id, req.version).await {
        Ok(batch) => Json(GetActionsResponse {
            operations: batch.operations,
            resync: batch.resync,
            window_start: batch.resync.then_some(batch.window_start),
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to fetch operations: {e}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShouldSaveRequest {
    pub file_id: String,
    pub latest_applied_version: u64,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShouldSaveResponse {
    pub should_save: bool,
    pub current_persisted_version: u64,
}

/// Save-necessity check. Doubles as the client liveness ping.
pub async fn should_save(State(state): State<AppState>, Json(req): Json<ShouldSaveRequest>) -> impl IntoResponse {
    if let Some(user) = req.user_name.as_deref()
        && let Err(e) = state.presence().touch(&req.file_id, user, TouchUpdate::heartbeat()).await
    {
        warn!(doc = %req.file_id, error = %e, "heartbeat touch failed");
    }
    match state.persistence().should_save(&req.file_id, req.latest_applied_version).await {
        Ok(check) => Json(ShouldSaveResponse {
            should_save: check.should_save,
            current_persisted_version: check.persisted_version,
        })
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to check save state: {e}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDocumentRequest {
    pub file_id: String,
    pub sfdt: String,
    pub latest_applied_version: u64,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDocumentResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<bool>,
}

/// Persist the client's rendered document and advance the persisted tip.
pub async fn save_document(State(state): State<AppState>, Json(req): Json<SaveDocumentRequest>) -> impl IntoResponse {
    match state
        .persistence()
        .save(&req.file_id, &req.sfdt, req.latest_applied_version)
        .await
    {
        Ok(receipt) => {
            if !receipt.skipped
                && let Some(user) = req.user_name.as_deref()
                && let Err(e) = state.presence().touch(&req.file_id, user, TouchUpdate::save()).await
            {
                warn!(doc = %req.file_id, error = %e, "presence touch failed after save");
            }
            Json(SaveDocumentResponse {
                success: true,
                message: if receipt.skipped {
                    "Document already persisted".to_string()
                } else {
                    "Document saved".to_string()
                },
                skipped: receipt.skipped.then_some(true),
            })
            .into_response()
        }
        Err(EngineError::SaveFailed { reason }) => {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to save document: {reason}")).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to save document: {e}")).into_response(),
    }
}

/// Liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_action_request_flattens_operation() {
        let body = json!({
            "fileId": "9c1f",
            "version": 3,
            "isTransformed": false,
            "author": "ada",
            "operations": [{"insert": "x"}]
        });
        let req: UpdateActionRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.file_id, "9c1f");
        assert_eq!(req.operation.version, 3);
        assert_eq!(req.operation.author.as_deref(), Some("ada"));
    }

    #[test]
    fn get_actions_response_omits_window_unless_resync() {
        let response = GetActionsResponse {
            operations: Vec::new(),
            resync: false,
            window_start: None,
        };
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(!encoded.contains("windowStart"));

        let response = GetActionsResponse {
            operations: Vec::new(),
            resync: true,
            window_start: Some(4),
        };
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains(r#""windowStart":4"#));
    }

    #[test]
    fn save_response_camel_case() {
        let response = SaveDocumentResponse {
            success: true,
            message: "Document saved".into(),
            skipped: None,
        };
        let encoded = serde_json::to_string(&response).unwrap();
        assert!(encoded.contains(r#""success":true"#));
        assert!(!encoded.contains("skipped"));
    }
}
