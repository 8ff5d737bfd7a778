//! Operation model and the operational-transformation seam.
//!
//! The engine never interprets operation contents. An [`EditOperation`]
//! carries a server-assigned version, a transformed flag, and an opaque
//! payload owned by the editor's OT library. That library is reached
//! through [`OperationTransformer`]: a pure function from an operation and
//! its prior context to a new operation, plus an apply function used when a
//! freshly loaded document must catch up with committed operations.
//!
//! Keeping `transform` pure (input untouched, new value returned) is what
//! lets the submit path re-transform the same source operation against a
//! fresh context on every commit retry.

use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

use crate::api::CommittedSlot;

/// A fine-grained edit against a shared document.
///
/// `operations` is the editor's own OT representation and is treated as an
/// opaque value end to end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    /// Server-assigned total-order position. Zero until assigned.
    #[serde(default)]
    pub version: u64,
    /// True once the operation reflects every operation ordered before it.
    #[serde(default)]
    pub is_transformed: bool,
    /// User who produced the edit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Opaque OT payload.
    #[serde(default)]
    pub operations: serde_json::Value,
}

impl EditOperation {
    /// Parse an operation from its stored payload form.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Serialize to the stored payload form.
    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// True when the payload carries no edits (abandoned-slot filler).
    pub fn is_noop(&self) -> bool {
        self.operations.as_array().is_some_and(|ops| ops.is_empty())
    }
}

/// Parse a batch of committed slots into operations, oldest first.
pub fn parse_slots(slots: &[CommittedSlot]) -> Result<Vec<EditOperation>, serde_json::Error> {
    slots.iter().map(|slot| EditOperation::from_payload(&slot.payload)).collect()
}

/// Errors from the transform library boundary.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformError {
    /// The library rejected the operation.
    #[snafu(display("transform rejected: {reason}"))]
    Rejected { reason: String },

    /// An operation payload could not be interpreted.
    #[snafu(display("malformed operation payload: {source}"))]
    Malformed { source: serde_json::Error },
}

/// Contract consumed from the external OT library.
///
/// `transform` must be pure: the input operation and context are not
/// mutated, and the same inputs always yield the same output.
pub trait OperationTransformer: Send + Sync {
    /// Rewrite `op` so that it reflects having been applied after every
    /// operation in `context` (oldest first).
    fn transform(&self, op: &EditOperation, context: &[EditOperation]) -> Result<EditOperation, TransformError>;

    /// Apply committed operations to a document in the editor's exchange
    /// format, returning the updated document.
    fn apply(&self, sfdt: &str, ops: &[EditOperation]) -> Result<String, TransformError>;
}

/// Stand-in transformer for deployments where transformation happens in the
/// editor library on the client. Marks operations transformed and leaves
/// positions and documents untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl OperationTransformer for IdentityTransformer {
    fn transform(&self, op: &EditOperation, _context: &[EditOperation]) -> Result<EditOperation, TransformError> {
        let mut out = op.clone();
        out.is_transformed = true;
        Ok(out)
    }

    fn apply(&self, sfdt: &str, _ops: &[EditOperation]) -> Result<String, TransformError> {
        Ok(sfdt.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_field_names_are_camel_case() {
        let op = EditOperation {
            version: 3,
            is_transformed: true,
            author: Some("ada".into()),
            operations: json!([{"insert": "hi"}]),
        };
        let encoded = serde_json::to_string(&op).unwrap();
        assert!(encoded.contains(r#""isTransformed":true"#));
        assert!(encoded.contains(r#""version":3"#));

        let decoded = EditOperation::from_payload(&encoded).unwrap();
        assert_eq!(decoded, op);
    }

    #[test]
    fn missing_flags_default_to_untransformed() {
        let decoded: EditOperation = serde_json::from_str(r#"{"operations":[{"insert":"x"}]}"#).unwrap();
        assert_eq!(decoded.version, 0);
        assert!(!decoded.is_transformed);
        assert!(decoded.author.is_none());
    }

    #[test]
    fn noop_detection() {
        let noop = EditOperation::from_payload(&crate::api::noop_operation_payload(5)).unwrap();
        assert!(noop.is_noop());
        assert_eq!(noop.version, 5);
        assert!(noop.is_transformed);

        let real: EditOperation = serde_json::from_str(r#"{"operations":[{"insert":"x"}]}"#).unwrap();
        assert!(!real.is_noop());
    }

    #[test]
    fn identity_marks_transformed() {
        let op = EditOperation {
            version: 1,
            is_transformed: false,
            author: None,
            operations: json!([{"insert": "a"}]),
        };
        let out = IdentityTransformer.transform(&op, &[]).unwrap();
        assert!(out.is_transformed);
        assert_eq!(out.operations, op.operations);
    }
}
