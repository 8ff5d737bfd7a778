//! The operation coordination engine.
//!
//! Three services share the scripted ledger primitives:
//!
//! - [`pipeline::OperationPipeline`] — the append path: reserve, transform,
//!   commit under compare-and-swap with bounded retry.
//! - [`sync::SyncService`] — the read path: document import and contiguous
//!   catch-up for lagging clients.
//! - [`save::PersistenceCoordinator`] — the save path: external upload and
//!   monotone advance of the persisted tip.

pub mod pipeline;
pub mod save;
pub mod sync;

use snafu::Snafu;

use crate::api::StoreError;
use crate::docstore::DocStoreError;
use crate::transform::TransformError;

/// Errors surfaced by the coordination engine.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    /// The client's base version is below the persisted prefix; it must
    /// re-import the document.
    #[snafu(display("client at {client_version} < persisted {persisted_version}"))]
    StaleClient {
        client_version: u64,
        persisted_version: u64,
    },

    /// The commit CAS kept failing; the reservation was resolved before
    /// this error was raised.
    #[snafu(display("commit retries exhausted after {attempts} attempts for document '{doc}'"))]
    RetriesExhausted { doc: String, attempts: u32 },

    /// Coordination-store failure.
    #[snafu(display("coordination store error: {source}"))]
    Store { source: StoreError },

    /// The external transform function failed.
    #[snafu(display("operation transform failed: {source}"))]
    Transform { source: TransformError },

    /// Document storage or codec failure.
    #[snafu(display("document storage error: {source}"))]
    Documents { source: DocStoreError },

    /// An operation payload could not be serialized or parsed.
    #[snafu(display("malformed operation payload: {source}"))]
    Payload { source: serde_json::Error },

    /// The binary document could not be written; the ledger is untouched.
    #[snafu(display("failed to save document: {reason}"))]
    SaveFailed { reason: String },

    /// No stored document exists under this id.
    #[snafu(display("document '{doc}' not found"))]
    UnknownDocument { doc: String },
}
