//! Save path: persistence coordination for the binary document.
//!
//! Saves are client-initiated: the client holds the authoritative
//! latest-applied state and serializes it, so the server never maintains a
//! document replica in memory. The coordinator's job is the ordering
//! around the upload — skip work that is already durable, and only after a
//! successful upload advance the persisted tip (monotone) and let the
//! superseded slots be pruned.

use std::sync::Arc;

use snafu::ResultExt;
use tracing::debug;
use tracing::info;

use crate::api::CoordinationStore;
use crate::docstore::{DocumentCodec, DocumentStore};
use crate::engine::{EngineError, StoreSnafu};

/// Answer to a save-necessity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveCheck {
    /// True when the client has applied versions beyond the persisted tip.
    pub should_save: bool,
    /// The persisted tip at check time.
    pub persisted_version: u64,
}

/// Outcome of a save request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReceipt {
    /// True when the store already covered the client's version and no
    /// upload was performed.
    pub skipped: bool,
}

/// Coordinates document saves against the persisted tip.
pub struct PersistenceCoordinator<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    documents: Arc<dyn DocumentStore>,
    codec: Arc<dyn DocumentCodec>,
}

impl<S: CoordinationStore + ?Sized> PersistenceCoordinator<S> {
    pub fn new(store: Arc<S>, documents: Arc<dyn DocumentStore>, codec: Arc<dyn DocumentCodec>) -> Self {
        Self {
            store,
            documents,
            codec,
        }
    }

    /// Does the client's applied state contain anything not yet durable?
    pub async fn should_save(&self, doc: &str, client_applied: u64) -> Result<SaveCheck, EngineError> {
        let heads = self.store.heads(doc).await.context(StoreSnafu)?;
        Ok(SaveCheck {
            should_save: client_applied > heads.persisted_version,
            persisted_version: heads.persisted_version,
        })
    }

    /// Persist the client's rendered document.
    ///
    /// Upload failures leave the ledger untouched: the tip does not move
    /// and no slot is pruned, so a retry or a later save redoes the work.
    /// The tip advance itself is idempotent and monotone, so a stale save
    /// racing a newer one can never move the tip backwards.
    pub async fn save(&self, doc: &str, sfdt: &str, client_applied: u64) -> Result<SaveReceipt, EngineError> {
        let heads = self.store.heads(doc).await.context(StoreSnafu)?;
        if client_applied <= heads.persisted_version {
            debug!(doc = %doc, client_applied, persisted = heads.persisted_version, "save skipped");
            return Ok(SaveReceipt { skipped: true });
        }

        let data = self
            .codec
            .encode(sfdt)
            .map_err(|e| EngineError::SaveFailed { reason: e.to_string() })?;
        self.documents
            .put(doc, data)
            .await
            .map_err(|e| EngineError::SaveFailed { reason: e.to_string() })?;

        self.store.advance_persisted(doc, client_applied).await.context(StoreSnafu)?;
        info!(doc = %doc, persisted = client_applied, "document saved");
        Ok(SaveReceipt { skipped: false })
    }
}
