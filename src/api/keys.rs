//! Key layout for coordination-store state.
//!
//! Every ledger and presence record lives under a document-scoped prefix so
//! a whole document can be purged with a single prefix delete. Slot keys
//! embed a zero-padded version number so lexicographic key order matches
//! numeric version order.
//!
//! Document ids are opaque identifiers assigned at ingest (UUIDs in
//! practice) and are embedded verbatim; identity is never derived from a
//! file name.

use crate::constants::SLOT_KEY_WIDTH;

/// Prefix of every key belonging to one document.
pub fn doc_prefix(doc: &str) -> String {
    format!("doc:{doc}:")
}

/// Scalar key holding the document's version counter.
pub fn version_key(doc: &str) -> String {
    format!("doc:{doc}:version")
}

/// Scalar key holding the document's persisted tip.
pub fn persisted_key(doc: &str) -> String {
    format!("doc:{doc}:persisted_version")
}

/// Slot key for one version of the operation log.
pub fn slot_key(doc: &str, version: u64) -> String {
    format!("doc:{doc}:ops:{version:0width$}", width = SLOT_KEY_WIDTH)
}

/// Prefix of all slot keys for a document.
pub fn slot_prefix(doc: &str) -> String {
    format!("doc:{doc}:ops:")
}

/// Session record key.
pub fn session_key(doc: &str, session_id: &str) -> String {
    format!("doc:{doc}:sessions:{session_id}")
}

/// Prefix of all session records for a document.
pub fn session_prefix(doc: &str) -> String {
    format!("doc:{doc}:sessions:")
}

/// Marker key recording that a document is active (has or recently had
/// sessions or ledger state). The reaper sweeps this keyspace.
pub fn active_doc_key(doc: &str) -> String {
    format!("active_docs:{doc}")
}

/// Prefix of all active-document markers.
pub const ACTIVE_DOC_PREFIX: &str = "active_docs:";

/// Reverse mapping from a session id to the document it is subscribed to.
pub fn session_doc_key(session_id: &str) -> String {
    format!("session_docs:{session_id}")
}

/// Extract the version number from a slot key, if the key is one.
pub fn parse_slot_version(key: &str) -> Option<u64> {
    let idx = key.rfind(":ops:")?;
    key[idx + ":ops:".len()..].parse().ok()
}

/// Extract the document id from an active-document marker key.
pub fn parse_active_doc(key: &str) -> Option<&str> {
    key.strip_prefix(ACTIVE_DOC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_keys_sort_numerically() {
        let k9 = slot_key("d", 9);
        let k10 = slot_key("d", 10);
        let k100 = slot_key("d", 100);
        assert!(k9 < k10);
        assert!(k10 < k100);
    }

    #[test]
    fn slot_version_round_trips() {
        let key = slot_key("doc-1", 42);
        assert_eq!(parse_slot_version(&key), Some(42));
        assert_eq!(parse_slot_version("doc:x:version"), None);
    }

    #[test]
    fn document_keys_share_prefix() {
        let prefix = doc_prefix("abc");
        assert!(version_key("abc").starts_with(&prefix));
        assert!(persisted_key("abc").starts_with(&prefix));
        assert!(slot_key("abc", 1).starts_with(&prefix));
        assert!(session_key("abc", "s1").starts_with(&prefix));
    }

    #[test]
    fn active_doc_round_trips() {
        let key = active_doc_key("doc-7");
        assert_eq!(parse_active_doc(&key), Some("doc-7"));
    }
}
