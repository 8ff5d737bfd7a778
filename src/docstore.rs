//! Binary document storage and the document-format codec seam.
//!
//! The coordination engine only ever moves whole documents in and out of
//! external storage: a full read at import time and a full write at save
//! time. [`DocumentStore`] is that narrow contract. [`DocumentCodec`]
//! converts between the stored binary form and the editor's exchange
//! format (`sfdt`, a JSON string); the real converter lives in the editor's
//! document library and plugs in behind the trait.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from document storage and format conversion.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DocStoreError {
    /// Storage backend failure.
    #[snafu(display("document storage error: {message}"))]
    Storage { message: String },

    /// Format conversion failure.
    #[snafu(display("document codec error: {reason}"))]
    Codec { reason: String },
}

/// Whole-document binary storage.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document by its id. `None` when the id is unknown.
    async fn get(&self, doc: &str) -> Result<Option<Bytes>, DocStoreError>;

    /// Store a document under its id, replacing any previous content.
    async fn put(&self, doc: &str, data: Bytes) -> Result<(), DocStoreError>;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    async fn get(&self, doc: &str) -> Result<Option<Bytes>, DocStoreError> {
        (**self).get(doc).await
    }

    async fn put(&self, doc: &str, data: Bytes) -> Result<(), DocStoreError> {
        (**self).put(doc, data).await
    }
}

/// Conversion between stored binary documents and the editor exchange
/// format.
pub trait DocumentCodec: Send + Sync {
    /// Decode stored bytes into the exchange format.
    fn decode(&self, data: &Bytes) -> Result<String, DocStoreError>;

    /// Encode the exchange format for storage.
    fn encode(&self, sfdt: &str) -> Result<Bytes, DocStoreError>;
}

/// Codec for deployments that store the exchange format directly as UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl DocumentCodec for PassthroughCodec {
    fn decode(&self, data: &Bytes) -> Result<String, DocStoreError> {
        String::from_utf8(data.to_vec()).map_err(|e| DocStoreError::Codec { reason: e.to_string() })
    }

    fn encode(&self, sfdt: &str) -> Result<Bytes, DocStoreError> {
        Ok(Bytes::copy_from_slice(sfdt.as_bytes()))
    }
}

/// In-memory document store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryDocumentStore {
    inner: Mutex<HashMap<String, Bytes>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, doc: &str) -> Result<Option<Bytes>, DocStoreError> {
        Ok(self.inner.lock().await.get(doc).cloned())
    }

    async fn put(&self, doc: &str, data: Bytes) -> Result<(), DocStoreError> {
        self.inner.lock().await.insert(doc.to_string(), data);
        Ok(())
    }
}

/// Filesystem-backed document store.
///
/// One file per document id under a root directory. Document ids are
/// opaque identifiers (UUIDs at ingest) and are used verbatim as file
/// names; ids containing path separators are rejected.
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }

    fn path_for(&self, doc: &str) -> Result<PathBuf, DocStoreError> {
        if doc.is_empty() || doc.contains(['/', '\\']) || doc.contains("..") {
            return Err(DocStoreError::Storage {
                message: format!("invalid document id '{doc}'"),
            });
        }
        Ok(self.root.join(doc))
    }

    /// Root directory holding the documents.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn get(&self, doc: &str) -> Result<Option<Bytes>, DocStoreError> {
        let path = self.path_for(doc)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DocStoreError::Storage { message: e.to_string() }),
        }
    }

    async fn put(&self, doc: &str, data: Bytes) -> Result<(), DocStoreError> {
        let path = self.path_for(doc)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DocStoreError::Storage { message: e.to_string() })?;
        }
        // Write-then-rename so a crashed save never truncates the stored
        // document.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| DocStoreError::Storage { message: e.to_string() })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| DocStoreError::Storage { message: e.to_string() })?;
        debug!(doc = %doc, bytes = data.len(), "document stored");
        Ok(())
    }
}
