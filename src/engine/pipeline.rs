//! Append path: reserve, transform, commit with bounded CAS retry.
//!
//! The pipeline holds no lock across the transform computation. Only the
//! scripted reserve and commit phases are atomic; the "all priors
//! committed" commit precondition is what makes the ledger a totally
//! ordered log without a central mutex. A reservation that cannot be
//! committed is always resolved — on the error path explicitly, and on
//! cancellation by a guard — so later versions stay deliverable.

use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tracing::debug;
use tracing::warn;

use crate::api::{CommitStatus, CommittedSlot, CoordinationStore, ReserveOutcome, now_unix_ms};
use crate::constants::{DEFAULT_MAX_RETRIES, DEFAULT_PENDING_SLOT_TTL_MS, DEFAULT_RETRY_BACKOFF_MS};
use crate::engine::{EngineError, PayloadSnafu, RetriesExhaustedSnafu, StoreSnafu, TransformSnafu};
use crate::transform::{EditOperation, OperationTransformer, parse_slots};

/// Tunables for the submit path.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum commit attempts before the submission is abandoned.
    pub max_retries: u32,
    /// Base delay between commit attempts, scaled by attempt number.
    pub retry_backoff: Duration,
    /// How long a reservation may stay pending before the reaper may
    /// resolve it.
    pub pending_slot_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            pending_slot_ttl: Duration::from_millis(DEFAULT_PENDING_SLOT_TTL_MS),
        }
    }
}

/// The operation append pipeline.
pub struct OperationPipeline<S: CoordinationStore + ?Sized> {
    store: Arc<S>,
    transformer: Arc<dyn OperationTransformer>,
    config: PipelineConfig,
}

impl<S: CoordinationStore + ?Sized + 'static> OperationPipeline<S> {
    pub fn new(store: Arc<S>, transformer: Arc<dyn OperationTransformer>, config: PipelineConfig) -> Self {
        Self {
            store,
            transformer,
            config,
        }
    }

    /// Accept one operation from a client whose last observed version is
    /// `client_version`. Returns the committed operation carrying its
    /// assigned version, transformed against everything ordered before it.
    pub async fn submit(&self, doc: &str, client_version: u64, op: EditOperation) -> Result<EditOperation, EngineError> {
        self.store.ensure_floor(doc).await.context(StoreSnafu)?;

        let deadline = now_unix_ms() + self.config.pending_slot_ttl.as_millis() as u64;
        let (version, prior) = match self
            .store
            .reserve(doc, client_version, deadline)
            .await
            .context(StoreSnafu)?
        {
            ReserveOutcome::Stale { persisted_version } => {
                debug!(doc = %doc, client_version, persisted_version, "stale client rejected");
                return Err(EngineError::StaleClient {
                    client_version,
                    persisted_version,
                });
            }
            ReserveOutcome::Reserved { new_version, prior_ops } => (new_version, prior_ops),
        };

        // The guard resolves the reservation if this future is dropped
        // before the commit outcome is known (client disconnect mid-submit).
        let mut guard = SlotGuard::new(self.store.clone(), doc, version);

        let result = self.transform_and_commit(doc, client_version, version, &op, prior).await;
        guard.disarm();
        match result {
            Ok(committed) => Ok(committed),
            Err(e) => {
                // Mandatory resolution before surfacing the error: the slot
                // must not keep blocking commits beyond it.
                if let Err(abandon_err) = self.store.abandon(doc, version).await {
                    warn!(doc = %doc, version, error = %abandon_err, "failed to resolve reservation");
                }
                Err(e)
            }
        }
    }

    /// Transform against the current context and commit, rebuilding the
    /// context from the store whenever a concurrent submitter slipped in
    /// between our reserve and commit.
    async fn transform_and_commit(
        &self,
        doc: &str,
        client_version: u64,
        version: u64,
        source: &EditOperation,
        mut prior: Vec<CommittedSlot>,
    ) -> Result<EditOperation, EngineError> {
        for attempt in 0..self.config.max_retries {
            let context = parse_slots(&prior).context(PayloadSnafu)?;
            let mut staged = source.clone();
            staged.version = version;
            let mut transformed = self.transformer.transform(&staged, &context).context(TransformSnafu)?;
            transformed.version = version;
            transformed.is_transformed = true;

            let payload = transformed.to_payload().context(PayloadSnafu)?;
            match self.store.commit(doc, version, &payload).await.context(StoreSnafu)? {
                CommitStatus::Committed => {
                    debug!(doc = %doc, version, context_len = prior.len(), attempt, "operation committed");
                    return Ok(transformed);
                }
                CommitStatus::GapBefore { missing } => {
                    debug!(doc = %doc, version, missing, attempt, "commit blocked by gap, retrying");
                }
                CommitStatus::PendingBefore { version: blocker } => {
                    debug!(doc = %doc, version, blocker, attempt, "commit blocked by pending slot, retrying");
                }
                CommitStatus::VersionConflict => {
                    // Our own slot is no longer pending. Either a duplicate
                    // commit of ours or outside interference; retry and let
                    // the bounded loop decide.
                    warn!(doc = %doc, version, attempt, "commit version conflict");
                }
            }

            tokio::time::sleep(self.config.retry_backoff * (attempt + 1)).await;
            prior = self
                .store
                .committed_range(doc, client_version, version)
                .await
                .context(StoreSnafu)?;
        }

        RetriesExhaustedSnafu {
            doc: doc.to_string(),
            attempts: self.config.max_retries,
        }
        .fail()
    }
}

/// Resolves a reservation when the submit future is dropped mid-flight.
struct SlotGuard<S: CoordinationStore + ?Sized + 'static> {
    store: Arc<S>,
    doc: String,
    version: u64,
    armed: bool,
}

impl<S: CoordinationStore + ?Sized + 'static> SlotGuard<S> {
    fn new(store: Arc<S>, doc: &str, version: u64) -> Self {
        Self {
            store,
            doc: doc.to_string(),
            version,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: CoordinationStore + ?Sized + 'static> Drop for SlotGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let doc = std::mem::take(&mut self.doc);
        let version = self.version;
        warn!(doc = %doc, version, "submit cancelled mid-flight, resolving reservation");
        tokio::spawn(async move {
            if let Err(e) = store.abandon(&doc, version).await {
                warn!(doc = %doc, version, error = %e, "failed to resolve cancelled reservation");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::api::LedgerScripts;
    use crate::api::inmemory::DeterministicStore;
    use crate::transform::{IdentityTransformer, TransformError};

    fn op(text: &str) -> EditOperation {
        EditOperation {
            version: 0,
            is_transformed: false,
            author: Some("ada".into()),
            operations: json!([{ "insert": text, "position": 0 }]),
        }
    }

    fn pipeline(store: Arc<DeterministicStore>) -> OperationPipeline<DeterministicStore> {
        OperationPipeline::new(
            store,
            Arc::new(IdentityTransformer),
            PipelineConfig {
                retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn single_writer_gets_version_one() {
        let store = DeterministicStore::new();
        let pipeline = pipeline(store.clone());

        let committed = pipeline.submit("d", 0, op("hello")).await.unwrap();
        assert_eq!(committed.version, 1);
        assert!(committed.is_transformed);

        let batch = store.pending_since("d", 0).await.unwrap();
        assert_eq!(batch.operations.len(), 1);
        assert_eq!(batch.operations[0].version, 1);

        let heads = store.heads("d").await.unwrap();
        assert_eq!(heads.version, 1);
        assert_eq!(heads.persisted_version, 0);
    }

    #[tokio::test]
    async fn stale_client_is_rejected_before_reserving() {
        let store = DeterministicStore::new();
        let pipeline = pipeline(store.clone());

        pipeline.submit("d", 0, op("a")).await.unwrap();
        pipeline.submit("d", 1, op("b")).await.unwrap();
        store.advance_persisted("d", 2).await.unwrap();

        let err = pipeline.submit("d", 1, op("late")).await.unwrap_err();
        match err {
            EngineError::StaleClient {
                client_version,
                persisted_version,
            } => {
                assert_eq!(client_version, 1);
                assert_eq!(persisted_version, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        // No reservation leaked.
        assert_eq!(store.heads("d").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn client_at_persisted_tip_is_not_stale() {
        let store = DeterministicStore::new();
        let pipeline = pipeline(store.clone());

        pipeline.submit("d", 0, op("a")).await.unwrap();
        store.advance_persisted("d", 1).await.unwrap();

        let committed = pipeline.submit("d", 1, op("b")).await.unwrap();
        assert_eq!(committed.version, 2);
    }

    #[tokio::test]
    async fn concurrent_submitters_get_distinct_versions() {
        let store = DeterministicStore::new();
        // Eight writers from the same base form a deep retry chain; give
        // the tail enough attempts to observe every predecessor.
        let pipeline = Arc::new(OperationPipeline::new(
            store.clone(),
            Arc::new(IdentityTransformer),
            PipelineConfig {
                max_retries: 32,
                retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
        ));

        let mut handles = Vec::new();
        for i in 0..8 {
            let p = pipeline.clone();
            handles.push(tokio::spawn(async move { p.submit("d", 0, op(&format!("op-{i}"))).await }));
        }

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap().version);
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn retries_exhausted_resolves_reservation() {
        let store = DeterministicStore::new();
        let pipeline = pipeline(store.clone());

        // Leak a pending reservation at version 1 that never commits.
        store.reserve("d", 0, u64::MAX).await.unwrap();

        let err = pipeline.submit("d", 0, op("blocked")).await.unwrap_err();
        assert!(matches!(err, EngineError::RetriesExhausted { attempts: 5, .. }));

        // Our own slot (version 2) was resolved as a no-op, so once the
        // blocker clears, the log is contiguous again.
        store.abandon("d", 1).await.unwrap();
        let batch = store.pending_since("d", 0).await.unwrap();
        let versions: Vec<u64> = batch.operations.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    /// Transformer that shifts insert positions by the length of every
    /// prior insert, recording how much context it saw.
    struct ShiftTransformer;

    impl OperationTransformer for ShiftTransformer {
        fn transform(&self, op: &EditOperation, context: &[EditOperation]) -> Result<EditOperation, TransformError> {
            let shift: u64 = context
                .iter()
                .filter_map(|c| c.operations.as_array())
                .flatten()
                .filter_map(|entry| entry.get("insert")?.as_str().map(|s| s.len() as u64))
                .sum();
            let mut out = op.clone();
            if let Some(entries) = out.operations.as_array_mut() {
                for entry in entries {
                    if let Some(pos) = entry.get("position").and_then(|p| p.as_u64()) {
                        entry["position"] = json!(pos + shift);
                    }
                }
            }
            out.is_transformed = true;
            Ok(out)
        }

        fn apply(&self, sfdt: &str, _ops: &[EditOperation]) -> Result<String, TransformError> {
            Ok(sfdt.to_string())
        }
    }

    #[tokio::test]
    async fn second_writer_is_transformed_against_first() {
        let store = DeterministicStore::new();
        let pipeline = OperationPipeline::new(
            store.clone(),
            Arc::new(ShiftTransformer),
            PipelineConfig {
                retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
        );

        pipeline.submit("d", 0, op("abc")).await.unwrap();
        // Same base version as the first writer: must be shifted past "abc".
        let second = pipeline.submit("d", 0, op("z")).await.unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.operations[0]["position"], json!(3));
    }

    struct FailingTransformer;

    impl OperationTransformer for FailingTransformer {
        fn transform(&self, _op: &EditOperation, _context: &[EditOperation]) -> Result<EditOperation, TransformError> {
            Err(TransformError::Rejected {
                reason: "bad operation".into(),
            })
        }

        fn apply(&self, sfdt: &str, _ops: &[EditOperation]) -> Result<String, TransformError> {
            Ok(sfdt.to_string())
        }
    }

    #[tokio::test]
    async fn transform_failure_resolves_reservation() {
        let store = DeterministicStore::new();
        let pipeline = OperationPipeline::new(store.clone(), Arc::new(FailingTransformer), PipelineConfig::default());

        let err = pipeline.submit("d", 0, op("x")).await.unwrap_err();
        assert!(matches!(err, EngineError::Transform { .. }));

        // The reservation was resolved; a fresh submit commits cleanly.
        let ok_pipeline = OperationPipeline::new(store.clone(), Arc::new(IdentityTransformer), PipelineConfig::default());
        let committed = ok_pipeline.submit("d", 0, op("y")).await.unwrap();
        assert_eq!(committed.version, 2);
    }
}
