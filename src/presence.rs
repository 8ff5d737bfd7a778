//! Session and presence registry.
//!
//! Tracks which sessions are connected to which document, with per-user
//! activity timestamps that drive stale-session reaping. Records are JSON
//! documents in the coordination store, updated through compare-and-swap
//! loops so racing transports (connect, disconnect, heartbeat, reaper) can
//! never clobber each other's writes.
//!
//! The registry also maintains the global active-document markers the
//! reaper sweeps, and the reverse session-to-document mapping used when a
//! socket drops without a clean leave.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::api::keys;
use crate::api::{
    BatchOperation, KeyValueStore, ReadRequest, ScanRequest, StoreError, WriteCommand, WriteRequest,
    now_unix_ms,
};

/// One connected session on one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Unique per-connection id.
    pub session_id: String,
    /// Authenticated user this session belongs to.
    pub user_name: String,
    /// When the session joined, Unix ms.
    pub joined_at_ms: u64,
    /// Last liveness signal: save-check ping or accepted operation.
    pub last_heartbeat_ms: u64,
    /// Last accepted operation.
    pub last_action_ms: u64,
    /// Last successful save. Zero until the first save.
    pub last_save_ms: u64,
}

impl SessionRecord {
    /// True when the last heartbeat is older than `threshold`.
    pub fn is_stale(&self, now_ms: u64, threshold: Duration) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms) > threshold.as_millis() as u64
    }
}

/// Which timestamps a touch refreshes.
#[derive(Debug, Clone, Copy, Default)]
pub struct TouchUpdate {
    pub heartbeat: bool,
    pub action: bool,
    pub save: bool,
}

impl TouchUpdate {
    /// Refresh heartbeat only (save-check ping).
    pub fn heartbeat() -> Self {
        Self {
            heartbeat: true,
            ..Self::default()
        }
    }

    /// Refresh heartbeat and action (accepted operation).
    pub fn action() -> Self {
        Self {
            heartbeat: true,
            action: true,
            save: false,
        }
    }

    /// Refresh save (successful save).
    pub fn save() -> Self {
        Self {
            save: true,
            ..Self::default()
        }
    }
}

/// Registry of connected sessions, keyed by document.
pub struct PresenceRegistry<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
}

impl<S: KeyValueStore + ?Sized> Clone for PresenceRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: KeyValueStore + ?Sized> PresenceRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Register a session on a document and mark the document active.
    pub async fn add_session(&self, doc: &str, session_id: &str, user_name: &str) -> Result<SessionRecord, StoreError> {
        let now = now_unix_ms();
        let record = SessionRecord {
            session_id: session_id.to_string(),
            user_name: user_name.to_string(),
            joined_at_ms: now,
            last_heartbeat_ms: now,
            last_action_ms: now,
            last_save_ms: 0,
        };
        let encoded = encode(&record);
        self.store
            .write(WriteRequest {
                command: WriteCommand::Batch {
                    operations: vec![
                        BatchOperation::Set {
                            key: keys::session_key(doc, session_id),
                            value: encoded,
                        },
                        BatchOperation::Set {
                            key: keys::active_doc_key(doc),
                            value: "1".to_string(),
                        },
                        BatchOperation::Set {
                            key: keys::session_doc_key(session_id),
                            value: doc.to_string(),
                        },
                    ],
                },
            })
            .await?;
        debug!(doc = %doc, session_id, user = %user_name, "session joined");
        Ok(record)
    }

    /// Remove a session. Returns true when the session existed.
    ///
    /// The active-document marker is left in place even for the last
    /// session: the reaper needs the document to stay visible until the
    /// ledger itself is empty and purged.
    pub async fn remove_session(&self, doc: &str, session_id: &str) -> Result<bool, StoreError> {
        let key = keys::session_key(doc, session_id);
        let existed = self.store.read(ReadRequest::new(key.clone())).await?.kv.is_some();
        self.store
            .write(WriteRequest {
                command: WriteCommand::Batch {
                    operations: vec![
                        BatchOperation::Delete { key },
                        BatchOperation::Delete {
                            key: keys::session_doc_key(session_id),
                        },
                    ],
                },
            })
            .await?;
        if existed {
            debug!(doc = %doc, session_id, "session left");
        }
        Ok(existed)
    }

    /// Refresh activity timestamps on every session of a user. Sessions of
    /// other users are untouched.
    pub async fn touch(&self, doc: &str, user_name: &str, update: TouchUpdate) -> Result<(), StoreError> {
        let now = now_unix_ms();
        for session in self.list_sessions(doc).await? {
            if session.user_name != user_name {
                continue;
            }
            self.touch_record(doc, &session.session_id, update, now).await?;
        }
        Ok(())
    }

    /// All sessions of a document, in session-id order.
    pub async fn list_sessions(&self, doc: &str) -> Result<Vec<SessionRecord>, StoreError> {
        let result = self
            .store
            .scan(ScanRequest {
                prefix: keys::session_prefix(doc),
                limit: None,
            })
            .await?;
        result.entries.iter().map(|entry| decode(&entry.key, &entry.value)).collect()
    }

    /// Documents with an active marker.
    pub async fn active_documents(&self) -> Result<Vec<String>, StoreError> {
        let result = self
            .store
            .scan(ScanRequest {
                prefix: keys::ACTIVE_DOC_PREFIX.to_string(),
                limit: None,
            })
            .await?;
        Ok(result
            .entries
            .iter()
            .filter_map(|entry| keys::parse_active_doc(&entry.key))
            .map(str::to_string)
            .collect())
    }

    /// The document a session is subscribed to, if any.
    pub async fn session_document(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let result = self.store.read(ReadRequest::new(keys::session_doc_key(session_id))).await?;
        Ok(result.kv.map(|kv| kv.value))
    }

    /// Drop a document's active marker once its ledger has been purged.
    pub async fn deactivate_document(&self, doc: &str) -> Result<(), StoreError> {
        self.store.write(WriteRequest::delete(keys::active_doc_key(doc))).await?;
        Ok(())
    }

    /// CAS-update one session record. Concurrent writers retry until their
    /// read matches.
    async fn touch_record(&self, doc: &str, session_id: &str, update: TouchUpdate, now: u64) -> Result<(), StoreError> {
        let key = keys::session_key(doc, session_id);
        loop {
            let current = match self.store.read(ReadRequest::new(key.clone())).await?.kv {
                // Session vanished between list and touch (reaped or left).
                None => return Ok(()),
                Some(kv) => kv.value,
            };
            let mut record = decode(&key, &current)?;
            if update.heartbeat {
                record.last_heartbeat_ms = now;
            }
            if update.action {
                record.last_action_ms = now;
            }
            if update.save {
                record.last_save_ms = now;
            }
            let encoded = encode(&record);
            match self
                .store
                .write(WriteRequest::compare_and_swap(key.clone(), Some(current), encoded))
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::CompareAndSwapFailed { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

fn encode(record: &SessionRecord) -> String {
    serde_json::to_string(record).expect("session record serialization is infallible")
}

fn decode(key: &str, value: &str) -> Result<SessionRecord, StoreError> {
    serde_json::from_str(value).map_err(|e| StoreError::Corrupted {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
