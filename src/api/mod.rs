//! Coordination-store API: traits, command types, and scripted primitives.
//!
//! The coordination store is the only source of truth for operation
//! ordering. It is addressed through two traits:
//!
//! - [`KeyValueStore`] carries plain key-value traffic (presence records,
//!   active-document markers) with compare-and-swap for racing writers.
//! - [`LedgerScripts`] exposes the version-ledger primitives. Each method
//!   executes as a single atomic transaction against the store; callers
//!   must never decompose one into smaller reads and writes, because the
//!   ledger invariants only hold at transaction boundaries.
//!
//! [`DeterministicStore`](inmemory::DeterministicStore) implements both
//! traits in memory for tests and single-node deployments; a production
//! backend plugs in behind the same seams.

pub mod inmemory;
pub mod keys;

use std::sync::Arc;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Errors from coordination-store operations.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Key does not exist.
    #[snafu(display("key '{key}' not found"))]
    NotFound { key: String },

    /// Compare-and-swap precondition failed.
    #[snafu(display("compare-and-swap failed for key '{key}': expected {expected:?}, found {actual:?}"))]
    CompareAndSwapFailed {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Stored value could not be interpreted.
    #[snafu(display("corrupted value at '{key}': {reason}"))]
    Corrupted { key: String, reason: String },

    /// Transport-level failure reaching the store.
    #[snafu(display("coordination store unavailable: {reason}"))]
    Unavailable { reason: String },

    /// Empty keys are never valid.
    #[snafu(display("key cannot be empty"))]
    EmptyKey,
}

// ============================================================================
// Plain key-value types
// ============================================================================

/// Commands for modifying plain key-value state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WriteCommand {
    /// Set a single key-value pair.
    Set { key: String, value: String },
    /// Delete a single key.
    Delete { key: String },
    /// Delete multiple keys atomically.
    DeleteMulti { keys: Vec<String> },
    /// Atomically update a value if the current value matches.
    /// `expected: None` requires the key to be absent.
    CompareAndSwap {
        key: String,
        expected: Option<String>,
        new_value: String,
    },
    /// Atomically delete a key if the current value matches.
    CompareAndDelete { key: String, expected: String },
    /// Atomically apply multiple set/delete operations.
    Batch { operations: Vec<BatchOperation> },
}

/// A single operation within a batch write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BatchOperation {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Request to perform a write against the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteRequest {
    pub command: WriteCommand,
}

impl WriteRequest {
    /// Create a Set command.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::Set {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    /// Create a Delete command.
    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::Delete { key: key.into() },
        }
    }

    /// Create a CompareAndSwap command.
    pub fn compare_and_swap(key: impl Into<String>, expected: Option<String>, new_value: impl Into<String>) -> Self {
        Self {
            command: WriteCommand::CompareAndSwap {
                key: key.into(),
                expected,
                new_value: new_value.into(),
            },
        }
    }
}

/// Result of a write operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteResult {
    /// Number of operations applied, for batch commands.
    pub batch_applied: Option<u32>,
}

/// Request to read a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub key: String,
}

impl ReadRequest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// A stored key-value pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Response from a read operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub kv: Option<KeyValue>,
}

/// Request to scan keys with a given prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub prefix: String,
    pub limit: Option<u32>,
}

/// Response from a scan, in key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub entries: Vec<KeyValue>,
    pub count: u32,
}

/// Validate a write command against structural rules.
pub fn validate_write_command(command: &WriteCommand) -> Result<(), StoreError> {
    let check_key = |key: &str| if key.is_empty() { Err(StoreError::EmptyKey) } else { Ok(()) };

    match command {
        WriteCommand::Set { key, .. }
        | WriteCommand::Delete { key }
        | WriteCommand::CompareAndSwap { key, .. }
        | WriteCommand::CompareAndDelete { key, .. } => check_key(key),
        WriteCommand::DeleteMulti { keys } => keys.iter().try_for_each(|k| check_key(k)),
        WriteCommand::Batch { operations } => operations.iter().try_for_each(|op| match op {
            BatchOperation::Set { key, .. } | BatchOperation::Delete { key } => check_key(key),
        }),
    }
}

/// Plain key-value access to the coordination store.
///
/// Direct reads are permitted for presence listings; direct writes to any
/// ledger key are forbidden. Ledger state changes only through
/// [`LedgerScripts`].
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Apply a write command atomically.
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, StoreError>;

    /// Read a value by key.
    async fn read(&self, request: ReadRequest) -> Result<ReadResult, StoreError>;

    /// Scan keys matching a prefix, in key order.
    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, StoreError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn write(&self, request: WriteRequest) -> Result<WriteResult, StoreError> {
        (**self).write(request).await
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadResult, StoreError> {
        (**self).read(request).await
    }

    async fn scan(&self, request: ScanRequest) -> Result<ScanResult, StoreError> {
        (**self).scan(request).await
    }
}

// ============================================================================
// Version-ledger types
// ============================================================================

/// One slot of the per-document operation log.
///
/// A slot is born `Pending` during reserve and becomes `Committed` exactly
/// once. Committed payloads are never mutated; they disappear only when the
/// persisted tip advances past them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotRecord {
    /// Reserved but not yet committed. The deadline bounds how long the
    /// reservation may block later commits before the reaper resolves it.
    Pending { deadline_ms: u64 },
    /// Committed operation payload (opaque serialized operation).
    Committed { payload: String },
}

/// Canonical payload written when a reservation is resolved without a real
/// operation (abandon, or reaper expiry). Clients apply it as a no-op;
/// keeping the slot committed keeps every later version deliverable.
pub fn noop_operation_payload(version: u64) -> String {
    format!(r#"{{"version":{version},"isTransformed":true,"operations":[]}}"#)
}

/// Outcome of ledger initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOutcome {
    /// True when this call created the ledger.
    pub created: bool,
}

/// Version counter and persisted tip of one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerHeads {
    /// Highest assigned version.
    pub version: u64,
    /// Highest version whose effect is durable in external storage.
    pub persisted_version: u64,
}

/// A committed slot returned from a ledger read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedSlot {
    pub version: u64,
    pub payload: String,
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The client's base version is below the persisted prefix; it must
    /// re-import the document before submitting.
    Stale { persisted_version: u64 },
    /// A fresh version was allocated and its slot marked pending.
    Reserved {
        /// The allocated version, `V(D) + 1` at execution time.
        new_version: u64,
        /// Longest contiguous committed prefix starting at the client's
        /// base version + 1, ending before the first missing or pending
        /// slot. This is the transform context.
        prior_ops: Vec<CommittedSlot>,
    },
}

/// Outcome of a commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStatus {
    /// Payload written; the slot is now immutable.
    Committed,
    /// The target slot was not pending (absent or already committed).
    VersionConflict,
    /// A version below the target has no slot at all.
    GapBefore { missing: u64 },
    /// A version below the target is still pending.
    PendingBefore { version: u64 },
}

/// Contiguous batch of committed operations for client catch-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBatch {
    /// Committed operations in strictly increasing version order.
    pub operations: Vec<CommittedSlot>,
    /// True when the client is below the persisted prefix and must
    /// re-import instead of applying `operations`.
    pub resync: bool,
    /// First version the server can still serve (`P(D) + 1`).
    pub window_start: u64,
}

/// Atomic version-ledger primitives.
///
/// Every method runs as one transaction against the coordination store.
/// The ledger invariants hold at the end of each call:
///
/// 1. every version in `(persisted, version]` has a slot;
/// 2. the version counter never decreases;
/// 3. slots below the persisted tip are pruned;
/// 4. committed payloads are immutable until pruned;
/// 5. the version counter never trails the persisted tip after
///    [`ensure_floor`](LedgerScripts::ensure_floor).
///
/// All primitives are idempotent for the same inputs except
/// [`reserve`](LedgerScripts::reserve), which always allocates a fresh
/// version; callers resolve partial progress through
/// [`abandon`](LedgerScripts::abandon).
#[async_trait]
pub trait LedgerScripts: Send + Sync {
    /// Create the ledger for a document if absent. Idempotent.
    async fn init(&self, doc: &str) -> Result<InitOutcome, StoreError>;

    /// Raise the version counter to the persisted tip if it trails it.
    /// Returns the current version counter.
    async fn ensure_floor(&self, doc: &str) -> Result<u64, StoreError>;

    /// Read the version counter and persisted tip.
    async fn heads(&self, doc: &str) -> Result<LedgerHeads, StoreError>;

    /// Allocate the next version and mark its slot pending, or report the
    /// client stale. `pending_deadline_ms` is the absolute time after which
    /// the reaper may resolve the reservation.
    async fn reserve(&self, doc: &str, client_version: u64, pending_deadline_ms: u64) -> Result<ReserveOutcome, StoreError>;

    /// Write a payload into a pending slot, after atomically checking that
    /// every slot between the persisted tip and `version` is committed.
    async fn commit(&self, doc: &str, version: u64, payload: &str) -> Result<CommitStatus, StoreError>;

    /// Resolve a reservation the caller is giving up on. The slot is
    /// committed as an empty operation so later versions stay deliverable.
    async fn abandon(&self, doc: &str, version: u64) -> Result<(), StoreError>;

    /// Committed operations a client at `client_version` has not seen yet,
    /// or a resync signal when the client is below the persisted prefix.
    async fn pending_since(&self, doc: &str, client_version: u64) -> Result<PendingBatch, StoreError>;

    /// Monotonically advance the persisted tip and prune slots strictly
    /// below `saved_version`. Safe to call with a stale version.
    async fn advance_persisted(&self, doc: &str, saved_version: u64) -> Result<(), StoreError>;

    /// Contiguous committed prefix strictly inside `(after, before)`.
    /// Used by the submit path to rebuild its transform context on retry.
    async fn committed_range(&self, doc: &str, after: u64, before: u64) -> Result<Vec<CommittedSlot>, StoreError>;

    /// Resolve pending slots whose deadline has passed. Returns how many
    /// were resolved.
    async fn reap_expired_pending(&self, doc: &str, now_ms: u64) -> Result<u32, StoreError>;

    /// Delete every ledger key of a document, provided no slot is still
    /// pending. Returns true when the document was purged.
    async fn purge_document(&self, doc: &str) -> Result<bool, StoreError>;
}

#[async_trait]
impl<T: LedgerScripts + ?Sized> LedgerScripts for Arc<T> {
    async fn init(&self, doc: &str) -> Result<InitOutcome, StoreError> {
        (**self).init(doc).await
    }

    async fn ensure_floor(&self, doc: &str) -> Result<u64, StoreError> {
        (**self).ensure_floor(doc).await
    }

    async fn heads(&self, doc: &str) -> Result<LedgerHeads, StoreError> {
        (**self).heads(doc).await
    }

    async fn reserve(&self, doc: &str, client_version: u64, pending_deadline_ms: u64) -> Result<ReserveOutcome, StoreError> {
        (**self).reserve(doc, client_version, pending_deadline_ms).await
    }

    async fn commit(&self, doc: &str, version: u64, payload: &str) -> Result<CommitStatus, StoreError> {
        (**self).commit(doc, version, payload).await
    }

    async fn abandon(&self, doc: &str, version: u64) -> Result<(), StoreError> {
        (**self).abandon(doc, version).await
    }

    async fn pending_since(&self, doc: &str, client_version: u64) -> Result<PendingBatch, StoreError> {
        (**self).pending_since(doc, client_version).await
    }

    async fn advance_persisted(&self, doc: &str, saved_version: u64) -> Result<(), StoreError> {
        (**self).advance_persisted(doc, saved_version).await
    }

    async fn committed_range(&self, doc: &str, after: u64, before: u64) -> Result<Vec<CommittedSlot>, StoreError> {
        (**self).committed_range(doc, after, before).await
    }

    async fn reap_expired_pending(&self, doc: &str, now_ms: u64) -> Result<u32, StoreError> {
        (**self).reap_expired_pending(doc, now_ms).await
    }

    async fn purge_document(&self, doc: &str) -> Result<bool, StoreError> {
        (**self).purge_document(doc).await
    }
}

/// Full coordination-store interface: plain key-value access plus the
/// scripted ledger primitives.
pub trait CoordinationStore: KeyValueStore + LedgerScripts {}

impl<T: KeyValueStore + LedgerScripts + ?Sized> CoordinationStore for T {}
