//! In-memory implementation of the coordination store.
//!
//! Backs tests and single-node deployments. All state lives in one ordered
//! map guarded by a single mutex, so every scripted primitive executes
//! atomically, mirroring the transaction boundary a production backend
//! provides. Keys and values are plain strings laid out per [`super::keys`].

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::keys;
use super::{
    BatchOperation, CommitStatus, CommittedSlot, InitOutcome, KeyValue, KeyValueStore, LedgerHeads,
    LedgerScripts, PendingBatch, ReadRequest, ReadResult, ReserveOutcome, ScanRequest, ScanResult,
    SlotRecord, StoreError, WriteCommand, WriteRequest, WriteResult, noop_operation_payload,
    validate_write_command,
};
use crate::constants::{DEFAULT_SCAN_LIMIT, MAX_SCAN_RESULTS};

/// Deterministic, non-persistent coordination store.
///
/// Operations are instantaneous and repeatable, which makes this
/// implementation suitable for property tests driving concurrent histories.
#[derive(Default)]
pub struct DeterministicStore {
    inner: Mutex<BTreeMap<String, String>>,
}

impl DeterministicStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

// Script helpers. All take the locked map, so each public method body is a
// single critical section with no awaits inside.

fn read_counter(map: &BTreeMap<String, String>, key: &str) -> Result<u64, StoreError> {
    match map.get(key) {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| StoreError::Corrupted {
            key: key.to_string(),
            reason: "not a valid u64".to_string(),
        }),
    }
}

fn read_slot(map: &BTreeMap<String, String>, doc: &str, version: u64) -> Result<Option<SlotRecord>, StoreError> {
    let key = keys::slot_key(doc, version);
    match map.get(&key) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupted {
                key,
                reason: e.to_string(),
            }),
    }
}

fn write_slot(map: &mut BTreeMap<String, String>, doc: &str, version: u64, record: &SlotRecord) {
    let encoded = serde_json::to_string(record).expect("slot record serialization is infallible");
    map.insert(keys::slot_key(doc, version), encoded);
}

/// Longest contiguous committed run starting at `from`, stopping before
/// `before` or at the first missing or pending slot.
fn contiguous_committed(
    map: &BTreeMap<String, String>,
    doc: &str,
    from: u64,
    before: u64,
) -> Result<Vec<CommittedSlot>, StoreError> {
    let mut out = Vec::new();
    let mut version = from;
    while version < before {
        match read_slot(map, doc, version)? {
            Some(SlotRecord::Committed { payload }) => {
                out.push(CommittedSlot { version, payload });
                version += 1;
            }
            _ => break,
        }
    }
    Ok(out)
}

#[async_trait]
impl LedgerScripts for DeterministicStore {
    async fn init(&self, doc: &str) -> Result<InitOutcome, StoreError> {
        let mut map = self.inner.lock().await;
        let version_key = keys::version_key(doc);
        if map.contains_key(&version_key) {
            return Ok(InitOutcome { created: false });
        }
        map.insert(version_key, "0".to_string());
        map.insert(keys::persisted_key(doc), "0".to_string());
        Ok(InitOutcome { created: true })
    }

    async fn ensure_floor(&self, doc: &str) -> Result<u64, StoreError> {
        let mut map = self.inner.lock().await;
        let version = read_counter(&map, &keys::version_key(doc))?;
        let persisted = read_counter(&map, &keys::persisted_key(doc))?;
        if version < persisted {
            map.insert(keys::version_key(doc), persisted.to_string());
            return Ok(persisted);
        }
        Ok(version)
    }

    async fn heads(&self, doc: &str) -> Result<LedgerHeads, StoreError> {
        let map = self.inner.lock().await;
        Ok(LedgerHeads {
            version: read_counter(&map, &keys::version_key(doc))?,
            persisted_version: read_counter(&map, &keys::persisted_key(doc))?,
        })
    }

    async fn reserve(&self, doc: &str, client_version: u64, pending_deadline_ms: u64) -> Result<ReserveOutcome, StoreError> {
        let mut map = self.inner.lock().await;
        let persisted = read_counter(&map, &keys::persisted_key(doc))?;
        if client_version < persisted {
            return Ok(ReserveOutcome::Stale {
                persisted_version: persisted,
            });
        }

        let version = read_counter(&map, &keys::version_key(doc))?;
        let new_version = version + 1;
        map.insert(keys::version_key(doc), new_version.to_string());
        if !map.contains_key(&keys::persisted_key(doc)) {
            map.insert(keys::persisted_key(doc), "0".to_string());
        }
        write_slot(
            &mut map,
            doc,
            new_version,
            &SlotRecord::Pending {
                deadline_ms: pending_deadline_ms,
            },
        );

        let prior_ops = contiguous_committed(&map, doc, client_version + 1, new_version)?;
        Ok(ReserveOutcome::Reserved { new_version, prior_ops })
    }

    async fn commit(&self, doc: &str, version: u64, payload: &str) -> Result<CommitStatus, StoreError> {
        let mut map = self.inner.lock().await;
        let persisted = read_counter(&map, &keys::persisted_key(doc))?;

        // Contiguity law: everything between the persisted tip and the
        // target must already be committed.
        let mut check = persisted + 1;
        while check < version {
            match read_slot(&map, doc, check)? {
                Some(SlotRecord::Committed { .. }) => check += 1,
                Some(SlotRecord::Pending { .. }) => {
                    return Ok(CommitStatus::PendingBefore { version: check });
                }
                None => return Ok(CommitStatus::GapBefore { missing: check }),
            }
        }

        match read_slot(&map, doc, version)? {
            Some(SlotRecord::Pending { .. }) => {
                write_slot(
                    &mut map,
                    doc,
                    version,
                    &SlotRecord::Committed {
                        payload: payload.to_string(),
                    },
                );
                Ok(CommitStatus::Committed)
            }
            _ => Ok(CommitStatus::VersionConflict),
        }
    }

    async fn abandon(&self, doc: &str, version: u64) -> Result<(), StoreError> {
        let mut map = self.inner.lock().await;
        // Only a still-pending slot is resolved; a committed slot is
        // immutable and a missing one needs no action.
        if let Some(SlotRecord::Pending { .. }) = read_slot(&map, doc, version)? {
            write_slot(
                &mut map,
                doc,
                version,
                &SlotRecord::Committed {
                    payload: noop_operation_payload(version),
                },
            );
        }
        Ok(())
    }

    async fn pending_since(&self, doc: &str, client_version: u64) -> Result<PendingBatch, StoreError> {
        let map = self.inner.lock().await;
        let persisted = read_counter(&map, &keys::persisted_key(doc))?;
        if client_version < persisted {
            return Ok(PendingBatch {
                operations: Vec::new(),
                resync: true,
                window_start: persisted + 1,
            });
        }
        let version = read_counter(&map, &keys::version_key(doc))?;
        let operations = contiguous_committed(&map, doc, client_version + 1, version + 1)?;
        Ok(PendingBatch {
            operations,
            resync: false,
            window_start: persisted + 1,
        })
    }

    async fn advance_persisted(&self, doc: &str, saved_version: u64) -> Result<(), StoreError> {
        let mut map = self.inner.lock().await;
        let persisted = read_counter(&map, &keys::persisted_key(doc))?;
        if saved_version > persisted {
            map.insert(keys::persisted_key(doc), saved_version.to_string());
        }
        // Prune strictly below the saved version regardless of whether the
        // tip moved; a stale caller re-deletes already-deleted keys.
        let prefix = keys::slot_prefix(doc);
        let doomed: Vec<String> = map
            .range::<String, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| keys::parse_slot_version(k).is_some_and(|v| v < saved_version))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            map.remove(&key);
        }
        Ok(())
    }

    async fn committed_range(&self, doc: &str, after: u64, before: u64) -> Result<Vec<CommittedSlot>, StoreError> {
        let map = self.inner.lock().await;
        contiguous_committed(&map, doc, after + 1, before)
    }

    async fn reap_expired_pending(&self, doc: &str, now_ms: u64) -> Result<u32, StoreError> {
        let mut map = self.inner.lock().await;
        let prefix = keys::slot_prefix(doc);
        let expired: Vec<u64> = map
            .range::<String, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, raw)| {
                let version = keys::parse_slot_version(k)?;
                match serde_json::from_str::<SlotRecord>(raw) {
                    Ok(SlotRecord::Pending { deadline_ms }) if deadline_ms <= now_ms => Some(version),
                    _ => None,
                }
            })
            .collect();
        for version in &expired {
            write_slot(
                &mut map,
                doc,
                *version,
                &SlotRecord::Committed {
                    payload: noop_operation_payload(*version),
                },
            );
        }
        Ok(expired.len() as u32)
    }

    async fn purge_document(&self, doc: &str) -> Result<bool, StoreError> {
        let mut map = self.inner.lock().await;
        let slot_prefix = keys::slot_prefix(doc);
        let has_pending = map
            .range::<String, _>((Bound::Included(slot_prefix.clone()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&slot_prefix))
            .any(|(_, raw)| matches!(serde_json::from_str::<SlotRecord>(raw), Ok(SlotRecord::Pending { .. })));
        if has_pending {
            return Ok(false);
        }
        let doc_prefix = keys::doc_prefix(doc);
        let doomed: Vec<String> = map
            .range::<String, _>((Bound::Included(doc_prefix.clone()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&doc_prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            map.remove(&key);
        }
        Ok(true)
    }
}

#[async_trait]
impl KeyValueStore for DeterministicStore {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, StoreError> {
        validate_write_command(&request.command)?;

        let mut map = self.inner.lock().await;
        match request.command {
            WriteCommand::Set { key, value } => {
                map.insert(key, value);
                Ok(WriteResult::default())
            }
            WriteCommand::Delete { key } => {
                map.remove(&key);
                Ok(WriteResult::default())
            }
            WriteCommand::DeleteMulti { keys } => {
                for key in &keys {
                    map.remove(key);
                }
                Ok(WriteResult {
                    batch_applied: Some(keys.len() as u32),
                })
            }
            WriteCommand::CompareAndSwap {
                key,
                expected,
                new_value,
            } => {
                let current = map.get(&key).cloned();
                let matches = match (&expected, &current) {
                    (None, None) => true,
                    (Some(exp), Some(cur)) => exp == cur,
                    _ => false,
                };
                if matches {
                    map.insert(key, new_value);
                    Ok(WriteResult::default())
                } else {
                    Err(StoreError::CompareAndSwapFailed {
                        key,
                        expected,
                        actual: current,
                    })
                }
            }
            WriteCommand::CompareAndDelete { key, expected } => {
                let current = map.get(&key).cloned();
                if current.as_deref() == Some(expected.as_str()) {
                    map.remove(&key);
                    Ok(WriteResult::default())
                } else {
                    Err(StoreError::CompareAndSwapFailed {
                        key,
                        expected: Some(expected),
                        actual: current,
                    })
                }
            }
            WriteCommand::Batch { operations } => {
                for op in &operations {
                    match op {
                        BatchOperation::Set { key, value } => {
                            map.insert(key.clone(), value.clone());
                        }
                        BatchOperation::Delete { key } => {
                            map.remove(key);
                        }
                    }
                }
                Ok(WriteResult {
                    batch_applied: Some(operations.len() as u32),
                })
            }
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, StoreError> {
        let map = self.inner.lock().await;
        Ok(ReadResult {
            kv: map.get(&request.key).map(|value| KeyValue {
                key: request.key.clone(),
                value: value.clone(),
            }),
        })
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, StoreError> {
        let map = self.inner.lock().await;
        let limit = request.limit.unwrap_or(DEFAULT_SCAN_LIMIT).min(MAX_SCAN_RESULTS) as usize;
        let entries: Vec<KeyValue> = map
            .range::<String, _>((Bound::Included(request.prefix.clone()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&request.prefix))
            .take(limit)
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        let count = entries.len() as u32;
        Ok(ScanResult { entries, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u64) -> String {
        format!(r#"{{"version":{n},"isTransformed":true,"operations":[{{"insert":"x"}}]}}"#)
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = DeterministicStore::new();
        assert!(store.init("d").await.unwrap().created);
        assert!(!store.init("d").await.unwrap().created);
        let heads = store.heads("d").await.unwrap();
        assert_eq!(heads.version, 0);
        assert_eq!(heads.persisted_version, 0);
    }

    #[tokio::test]
    async fn reserve_on_fresh_ledger_allocates_one() {
        let store = DeterministicStore::new();
        match store.reserve("d", 0, 0).await.unwrap() {
            ReserveOutcome::Reserved { new_version, prior_ops } => {
                assert_eq!(new_version, 1);
                assert!(prior_ops.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.heads("d").await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn reserve_below_persisted_tip_is_stale() {
        let store = DeterministicStore::new();
        // Commit versions 1 and 2, then persist up to 2.
        for v in 1..=2 {
            store.reserve("d", v - 1, 0).await.unwrap();
            store.commit("d", v, &payload(v)).await.unwrap();
        }
        store.advance_persisted("d", 2).await.unwrap();

        match store.reserve("d", 1, 0).await.unwrap() {
            ReserveOutcome::Stale { persisted_version } => assert_eq!(persisted_version, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // A client exactly at the tip is not stale.
        assert!(matches!(
            store.reserve("d", 2, 0).await.unwrap(),
            ReserveOutcome::Reserved { new_version: 3, .. }
        ));
    }

    #[tokio::test]
    async fn reserve_returns_contiguous_prior_context() {
        let store = DeterministicStore::new();
        for v in 1..=3 {
            store.reserve("d", v - 1, 0).await.unwrap();
            store.commit("d", v, &payload(v)).await.unwrap();
        }
        // Leak a pending slot at 4.
        store.reserve("d", 3, 0).await.unwrap();

        match store.reserve("d", 0, 0).await.unwrap() {
            ReserveOutcome::Reserved { new_version, prior_ops } => {
                assert_eq!(new_version, 5);
                // Context stops before the pending slot at 4.
                let versions: Vec<u64> = prior_ops.iter().map(|s| s.version).collect();
                assert_eq!(versions, vec![1, 2, 3]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn commit_requires_pending_slot() {
        let store = DeterministicStore::new();
        store.reserve("d", 0, 0).await.unwrap();
        assert_eq!(store.commit("d", 1, &payload(1)).await.unwrap(), CommitStatus::Committed);
        // Second commit to the same slot is a conflict, not a mutation.
        assert_eq!(
            store.commit("d", 1, &payload(1)).await.unwrap(),
            CommitStatus::VersionConflict
        );
        // Commit to the next never-reserved slot is also a conflict.
        assert_eq!(
            store.commit("d", 2, &payload(2)).await.unwrap(),
            CommitStatus::VersionConflict
        );
    }

    #[tokio::test]
    async fn commit_reports_pending_predecessor() {
        let store = DeterministicStore::new();
        store.reserve("d", 0, 0).await.unwrap(); // v=1 pending
        store.reserve("d", 0, 0).await.unwrap(); // v=2 pending
        assert_eq!(
            store.commit("d", 2, &payload(2)).await.unwrap(),
            CommitStatus::PendingBefore { version: 1 }
        );
        assert_eq!(store.commit("d", 1, &payload(1)).await.unwrap(), CommitStatus::Committed);
        assert_eq!(store.commit("d", 2, &payload(2)).await.unwrap(), CommitStatus::Committed);
    }

    #[tokio::test]
    async fn abandon_resolves_pending_slot_as_noop() {
        let store = DeterministicStore::new();
        store.reserve("d", 0, 0).await.unwrap(); // v=1
        store.reserve("d", 0, 0).await.unwrap(); // v=2
        store.abandon("d", 1).await.unwrap();

        // The abandoned slot no longer blocks the successor.
        assert_eq!(store.commit("d", 2, &payload(2)).await.unwrap(), CommitStatus::Committed);

        // Catch-up delivers the no-op followed by the real operation.
        let batch = store.pending_since("d", 0).await.unwrap();
        let versions: Vec<u64> = batch.operations.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert!(batch.operations[0].payload.contains(r#""operations":[]"#));
    }

    #[tokio::test]
    async fn abandon_never_touches_committed_slots() {
        let store = DeterministicStore::new();
        store.reserve("d", 0, 0).await.unwrap();
        store.commit("d", 1, &payload(1)).await.unwrap();
        store.abandon("d", 1).await.unwrap();

        let batch = store.pending_since("d", 0).await.unwrap();
        assert_eq!(batch.operations[0].payload, payload(1));
    }

    #[tokio::test]
    async fn pending_since_signals_resync_below_tip() {
        let store = DeterministicStore::new();
        for v in 1..=3 {
            store.reserve("d", v - 1, 0).await.unwrap();
            store.commit("d", v, &payload(v)).await.unwrap();
        }
        store.advance_persisted("d", 3).await.unwrap();

        let batch = store.pending_since("d", 1).await.unwrap();
        assert!(batch.resync);
        assert!(batch.operations.is_empty());
        assert_eq!(batch.window_start, 4);

        // At the tip: empty, no resync.
        let batch = store.pending_since("d", 3).await.unwrap();
        assert!(!batch.resync);
        assert!(batch.operations.is_empty());
    }

    #[tokio::test]
    async fn pending_since_stops_at_first_pending() {
        let store = DeterministicStore::new();
        for v in 1..=2 {
            store.reserve("d", v - 1, 0).await.unwrap();
            store.commit("d", v, &payload(v)).await.unwrap();
        }
        store.reserve("d", 2, 0).await.unwrap(); // v=3 pending

        let batch = store.pending_since("d", 0).await.unwrap();
        let versions: Vec<u64> = batch.operations.iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert!(!batch.resync);
    }

    #[tokio::test]
    async fn advance_persisted_is_monotone_and_prunes() {
        let store = DeterministicStore::new();
        for v in 1..=4 {
            store.reserve("d", v - 1, 0).await.unwrap();
            store.commit("d", v, &payload(v)).await.unwrap();
        }
        store.advance_persisted("d", 3).await.unwrap();
        assert_eq!(store.heads("d").await.unwrap().persisted_version, 3);

        // Slots 1 and 2 pruned, 3 and 4 remain.
        let batch = store.pending_since("d", 3).await.unwrap();
        assert_eq!(batch.operations.len(), 1);
        assert_eq!(batch.operations[0].version, 4);

        // A stale advance never lowers the tip.
        store.advance_persisted("d", 1).await.unwrap();
        assert_eq!(store.heads("d").await.unwrap().persisted_version, 3);
    }

    #[tokio::test]
    async fn ensure_floor_raises_version_to_persisted() {
        let store = DeterministicStore::new();
        store.advance_persisted("d", 5).await.unwrap();
        assert_eq!(store.ensure_floor("d").await.unwrap(), 5);
        assert_eq!(store.heads("d").await.unwrap().version, 5);
        // Idempotent once raised.
        assert_eq!(store.ensure_floor("d").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn reap_expired_pending_unblocks_successors() {
        let store = DeterministicStore::new();
        for v in 1..=4 {
            store.reserve("d", v - 1, 0).await.unwrap();
            store.commit("d", v, &payload(v)).await.unwrap();
        }
        // Crash-leaked reservation at 5 with a deadline in the past.
        store.reserve("d", 4, 1_000).await.unwrap();

        let reaped = store.reap_expired_pending("d", 2_000).await.unwrap();
        assert_eq!(reaped, 1);

        // The document is unstuck: a new reservation commits cleanly.
        match store.reserve("d", 4, 0).await.unwrap() {
            ReserveOutcome::Reserved { new_version, .. } => {
                assert_eq!(new_version, 6);
                assert_eq!(
                    store.commit("d", 6, &payload(6)).await.unwrap(),
                    CommitStatus::Committed
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reap_spares_unexpired_pending() {
        let store = DeterministicStore::new();
        store.reserve("d", 0, 10_000).await.unwrap();
        assert_eq!(store.reap_expired_pending("d", 2_000).await.unwrap(), 0);
        assert_eq!(
            store.commit("d", 1, &payload(1)).await.unwrap(),
            CommitStatus::Committed
        );
    }

    #[tokio::test]
    async fn purge_refuses_while_pending_exists() {
        let store = DeterministicStore::new();
        store.reserve("d", 0, u64::MAX).await.unwrap();
        assert!(!store.purge_document("d").await.unwrap());

        store.commit("d", 1, &payload(1)).await.unwrap();
        assert!(store.purge_document("d").await.unwrap());
        assert_eq!(store.heads("d").await.unwrap(), LedgerHeads::default());
    }

    #[tokio::test]
    async fn compare_and_swap_enforces_expectation() {
        let store = DeterministicStore::new();
        store.write(WriteRequest::set("k", "1")).await.unwrap();

        let err = store
            .write(WriteRequest::compare_and_swap("k", Some("0".into()), "2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CompareAndSwapFailed { .. }));

        store
            .write(WriteRequest::compare_and_swap("k", Some("1".into()), "2"))
            .await
            .unwrap();
        let read = store.read(ReadRequest::new("k")).await.unwrap();
        assert_eq!(read.kv.unwrap().value, "2");
    }

    #[tokio::test]
    async fn scan_returns_prefix_in_order() {
        let store = DeterministicStore::new();
        store.write(WriteRequest::set("p:b", "2")).await.unwrap();
        store.write(WriteRequest::set("p:a", "1")).await.unwrap();
        store.write(WriteRequest::set("q:c", "3")).await.unwrap();

        let result = store
            .scan(ScanRequest {
                prefix: "p:".into(),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(result.count, 2);
        assert_eq!(result.entries[0].key, "p:a");
        assert_eq!(result.entries[1].key, "p:b");
    }
}
