//! Positional text operations.
//!
//! An operation addresses the document as one long string in which lines
//! are joined by a single `\n`. Positions and lengths count Unicode scalar
//! values, not bytes.
//!
//! Wire form:
//! ```text
//! {"p": 6, "i": "there\n"}   insert
//! {"p": 6, "d": "there\n"}   delete
//! ```

use serde::{Deserialize, Serialize};

/// The edit carried by an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    Insert(String),
    Delete(String),
}

/// A positional insert or delete against the flattened document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireOp", try_from = "WireOp")]
pub struct Operation {
    /// Absolute character offset.
    pub position: usize,
    pub edit: Edit,
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            edit: Edit::Insert(text.into()),
        }
    }

    pub fn delete(position: usize, text: impl Into<String>) -> Self {
        Self {
            position,
            edit: Edit::Delete(text.into()),
        }
    }

    /// Text inserted or removed by this operation.
    pub fn text(&self) -> &str {
        match &self.edit {
            Edit::Insert(text) | Edit::Delete(text) => text,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.edit, Edit::Insert(_))
    }

    /// The operation that undoes this one.
    pub fn inverse(&self) -> Self {
        let edit = match &self.edit {
            Edit::Insert(text) => Edit::Delete(text.clone()),
            Edit::Delete(text) => Edit::Insert(text.clone()),
        };
        Self {
            position: self.position,
            edit,
        }
    }
}

/// Untyped wire shape of an operation.
///
/// Remote peers may send an op with both `d` and `i` (a replace) or with
/// neither (comment ops); [`WireOp::into_operations`] handles both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireOp {
    pub p: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl WireOp {
    /// Expand into typed operations, deletion first.
    pub fn into_operations(self) -> impl Iterator<Item = Operation> {
        let p = self.p;
        let delete = self.d.map(|text| Operation::delete(p, text));
        let insert = self.i.map(|text| Operation::insert(p, text));
        delete.into_iter().chain(insert)
    }
}

impl From<Operation> for WireOp {
    fn from(op: Operation) -> Self {
        match op.edit {
            Edit::Insert(text) => WireOp {
                p: op.position,
                i: Some(text),
                d: None,
            },
            Edit::Delete(text) => WireOp {
                p: op.position,
                i: None,
                d: Some(text),
            },
        }
    }
}

impl TryFrom<WireOp> for Operation {
    type Error = String;

    fn try_from(wire: WireOp) -> Result<Self, Self::Error> {
        match (wire.i, wire.d) {
            (Some(text), None) => Ok(Operation::insert(wire.p, text)),
            (None, Some(text)) => Ok(Operation::delete(wire.p, text)),
            (Some(_), Some(_)) => Err(format!("op at {} has both 'i' and 'd'", wire.p)),
            (None, None) => Err(format!("op at {} has neither 'i' nor 'd'", wire.p)),
        }
    }
}

/// Expand a remote op list into typed operations, preserving order.
pub fn operations_from_wire(ops: Vec<WireOp>) -> Vec<Operation> {
    ops.into_iter().flat_map(WireOp::into_operations).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_json_shape() {
        let op = Operation::insert(6, "there\n");
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"p":6,"i":"there\n"}"#);
    }

    #[test]
    fn test_delete_json_shape() {
        let op = Operation::delete(1, "\nb");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json, serde_json::json!({"p": 1, "d": "\nb"}));
    }

    #[test]
    fn test_parse_rejects_ambiguous_op() {
        let both: Result<Operation, _> = serde_json::from_str(r#"{"p":0,"i":"a","d":"b"}"#);
        assert!(both.is_err());
        let neither: Result<Operation, _> = serde_json::from_str(r#"{"p":0}"#);
        assert!(neither.is_err());
    }

    #[test]
    fn test_wire_replace_expands_delete_first() {
        let wire: Vec<WireOp> =
            serde_json::from_str(r#"[{"p":3,"i":"new","d":"old"},{"p":9,"c":"note"}]"#).unwrap();
        let ops = operations_from_wire(wire);
        assert_eq!(
            ops,
            vec![Operation::delete(3, "old"), Operation::insert(3, "new")]
        );
    }

    #[test]
    fn test_inverse() {
        let op = Operation::insert(4, "xy");
        assert_eq!(op.inverse(), Operation::delete(4, "xy"));
        assert_eq!(op.inverse().inverse(), op);
        assert!(op.is_insert());
        assert_eq!(op.text(), "xy");
    }
}
