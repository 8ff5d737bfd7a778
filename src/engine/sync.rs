//! Read path: document import and contiguous catch-up.
//!
//! Import loads the stored binary document, replays the committed
//! operations the stored copy has not absorbed yet, and stamps the result
//! with the highest version the client can claim to have applied. Clients
//! that fall behind afterwards catch up through `get_since`, which serves
//! strictly contiguous suffixes and signals a resync when the client has
//! dropped below the persisted prefix.

use std::sync::Arc;

use snafu::ResultExt;
use tracing::debug;

use crate::api::{CoordinationStore, PendingBatch};
use crate::docstore::{DocumentCodec, DocumentStore};
use crate::engine::{DocumentsSnafu, EngineError, PayloadSnafu, StoreSnafu, TransformSnafu};
use crate::transform::{EditOperation, OperationTransformer, parse_slots};

/// A document prepared for a joining client.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedDocument {
    /// Editor exchange format with pending operations applied.
    pub sfdt: String,
    /// Version stamp: the highest version whose effect is reflected in
    /// `sfdt`. The client submits its next edit against this version.
    pub version: u64,
}

/// Committed operations for a catching-up client.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncBatch {
    /// Operations in strictly increasing version order.
    pub operations: Vec<EditOperation>,
    /// True when the client must re-import instead of applying.
    pub resync: bool,
    /// First version still served by the ledger (`persisted + 1`).
    pub window_start: u64,
}

/// The read-side sync service.
pub struct SyncService<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    documents: Arc<dyn DocumentStore>,
    codec: Arc<dyn DocumentCodec>,
    transformer: Arc<dyn OperationTransformer>,
}

impl<S: CoordinationStore + ?Sized> SyncService<S> {
    pub fn new(
        store: Arc<S>,
        documents: Arc<dyn DocumentStore>,
        codec: Arc<dyn DocumentCodec>,
        transformer: Arc<dyn OperationTransformer>,
    ) -> Self {
        Self {
            store,
            documents,
            codec,
            transformer,
        }
    }

    /// Load a document for a joining client.
    ///
    /// Creates the ledger if this is the document's first use. Only the
    /// contiguous committed prefix above the persisted tip is applied; a
    /// pending slot mid-suffix bounds the replay, and the operations beyond
    /// it reach the client later through [`get_since`](Self::get_since).
    pub async fn import(&self, doc: &str) -> Result<ImportedDocument, EngineError> {
        self.store.init(doc).await.context(StoreSnafu)?;
        self.store.ensure_floor(doc).await.context(StoreSnafu)?;

        let data = self
            .documents
            .get(doc)
            .await
            .context(DocumentsSnafu)?
            .ok_or_else(|| EngineError::UnknownDocument { doc: doc.to_string() })?;
        let sfdt = self.codec.decode(&data).context(DocumentsSnafu)?;

        let heads = self.store.heads(doc).await.context(StoreSnafu)?;
        let batch = self
            .store
            .pending_since(doc, heads.persisted_version)
            .await
            .context(StoreSnafu)?;
        let ops = parse_slots(&batch.operations).context(PayloadSnafu)?;

        let applied_tip = ops.last().map(|op| op.version).unwrap_or(0);
        let sfdt = if ops.is_empty() {
            sfdt
        } else {
            self.transformer.apply(&sfdt, &ops).context(TransformSnafu)?
        };

        // The stamp is the highest version actually reflected in the
        // returned document; stamping past an unapplied slot would make the
        // client skip it.
        let version = heads.persisted_version.max(applied_tip);
        debug!(doc = %doc, version, applied = ops.len(), "document imported");
        Ok(ImportedDocument { sfdt, version })
    }

    /// Committed operations a client at `client_version` has not seen.
    pub async fn get_since(&self, doc: &str, client_version: u64) -> Result<SyncBatch, EngineError> {
        let PendingBatch {
            operations,
            resync,
            window_start,
        } = self
            .store
            .pending_since(doc, client_version)
            .await
            .context(StoreSnafu)?;
        Ok(SyncBatch {
            operations: parse_slots(&operations).context(PayloadSnafu)?,
            resync,
            window_start,
        })
    }
}
