//! Remote cursor tracking.
//!
//! Maps each connected client to its last known cursor position.
//!
//! ## Data flow
//!
//! ```text
//! joinProject reply
//!       │
//!       ▼
//! getConnectedUsers reply ──► CursorTable::replace_all()
//!                                   │
//! clientTracking.clientUpdated ──► CursorTable::merge()
//!                                   │
//! clientTracking.clientDisconnected ──► CursorTable::remove()
//!                                   │
//!                                   ▼
//!                         SessionEvent::RemoteCursor / CursorRemoved
//!                                   │
//!                                   ▼
//!                            host editor markers
//! ```

use std::collections::HashMap;

use serde::Deserialize;

// ───────────────────────────────────────────────────────────────────
// Wire shapes
// ───────────────────────────────────────────────────────────────────

/// Nested position block used by `getConnectedUsers`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CursorData {
    pub doc_id: Option<String>,
    pub row: Option<u32>,
    pub column: Option<u32>,
}

/// One client entry as sent by the server.
///
/// `clientUpdated` sends the position inline and names the client `id`;
/// `getConnectedUsers` uses `client_id` and nests the position under
/// `cursorData`. Both decode into this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CursorUpdate {
    #[serde(alias = "client_id")]
    pub id: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub doc_id: Option<String>,
    pub row: Option<u32>,
    pub column: Option<u32>,
    #[serde(rename = "cursorData")]
    pub cursor_data: Option<CursorData>,
}

impl CursorUpdate {
    /// Lift `cursorData` fields to the top level.
    fn flattened(mut self) -> Self {
        if let Some(data) = self.cursor_data.take() {
            self.doc_id = data.doc_id.or(self.doc_id);
            self.row = data.row.or(self.row);
            self.column = data.column.or(self.column);
        }
        self
    }

    fn display_name(&self) -> Option<String> {
        if self.name.is_some() {
            return self.name.clone();
        }
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}").trim().to_string()),
            (Some(first), None) => Some(first.clone()),
            (None, Some(last)) => Some(last.clone()),
            (None, None) => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Cursor state
// ───────────────────────────────────────────────────────────────────

/// Last known state of one remote client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub client_id: String,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub doc_id: Option<String>,
    /// Zero-based line.
    pub row: Option<u32>,
    pub column: Option<u32>,
}

impl Cursor {
    fn from_update(update: CursorUpdate) -> Self {
        let mut cursor = Cursor {
            client_id: update.id.clone(),
            ..Cursor::default()
        };
        cursor.merge(update);
        cursor
    }

    /// Overwrite every field the update carries.
    fn merge(&mut self, update: CursorUpdate) {
        let update = update.flattened();
        if let Some(name) = update.display_name() {
            self.name = Some(name);
        }
        if update.user_id.is_some() {
            self.user_id = update.user_id;
        }
        if update.email.is_some() {
            self.email = update.email;
        }
        if update.doc_id.is_some() {
            self.doc_id = update.doc_id;
        }
        if update.row.is_some() {
            self.row = update.row;
        }
        if update.column.is_some() {
            self.column = update.column;
        }
    }

    /// `(doc_id, row, column)` once all three are known.
    pub fn position(&self) -> Option<(&str, u32, u32)> {
        match (&self.doc_id, self.row, self.column) {
            (Some(doc_id), Some(row), Some(column)) => Some((doc_id, row, column)),
            _ => None,
        }
    }
}

/// All remote cursors of a project session.
#[derive(Debug, Default)]
pub struct CursorTable {
    cursors: HashMap<String, Cursor>,
}

impl CursorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table. Returns the new cursors.
    pub fn replace_all(&mut self, updates: Vec<CursorUpdate>) -> Vec<Cursor> {
        self.cursors.clear();
        updates
            .into_iter()
            .map(|update| {
                let cursor = Cursor::from_update(update);
                self.cursors.insert(cursor.client_id.clone(), cursor.clone());
                cursor
            })
            .collect()
    }

    /// Merge per-client fields. Unknown clients are added.
    /// Returns the updated cursors.
    pub fn merge(&mut self, updates: Vec<CursorUpdate>) -> Vec<Cursor> {
        updates
            .into_iter()
            .map(|update| {
                let cursor = self
                    .cursors
                    .entry(update.id.clone())
                    .or_insert_with(|| Cursor {
                        client_id: update.id.clone(),
                        ..Cursor::default()
                    });
                cursor.merge(update);
                cursor.clone()
            })
            .collect()
    }

    /// Drop disconnected clients. Returns the ids that were present.
    pub fn remove(&mut self, client_ids: &[String]) -> Vec<String> {
        client_ids
            .iter()
            .filter(|id| self.cursors.remove(*id).is_some())
            .cloned()
            .collect()
    }

    pub fn get(&self, client_id: &str) -> Option<&Cursor> {
        self.cursors.get(client_id)
    }

    /// Cursors currently placed in `doc_id`.
    pub fn for_document(&self, doc_id: &str) -> Vec<Cursor> {
        self.cursors
            .values()
            .filter(|c| c.doc_id.as_deref() == Some(doc_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn updates(value: serde_json::Value) -> Vec<CursorUpdate> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_connected_users_flatten_cursor_data() {
        let mut table = CursorTable::new();
        let cursors = table.replace_all(updates(json!([
            {
                "client_id": "c1",
                "user_id": "u1",
                "first_name": "Ada",
                "last_name": "Lovelace",
                "email": "ada@example.com",
                "connected": true,
                "cursorData": {"doc_id": "d1", "row": 3, "column": 7}
            },
            {"client_id": "c2", "first_name": "Bob"}
        ])));

        assert_eq!(cursors.len(), 2);
        let ada = table.get("c1").unwrap();
        assert_eq!(ada.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(ada.position(), Some(("d1", 3, 7)));
        assert_eq!(table.get("c2").unwrap().position(), None);
    }

    #[test]
    fn test_replace_all_drops_previous_entries() {
        let mut table = CursorTable::new();
        table.replace_all(updates(json!([{"client_id": "old"}])));
        table.replace_all(updates(json!([{"client_id": "new"}])));
        assert!(table.get("old").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_client_updated_merges_fields() {
        let mut table = CursorTable::new();
        table.replace_all(updates(json!([
            {"client_id": "c1", "first_name": "Ada", "cursorData": {"doc_id": "d1", "row": 0, "column": 0}}
        ])));

        let changed = table.merge(updates(json!([
            {"id": "c1", "row": 5, "column": 2, "doc_id": "d1"}
        ])));
        assert_eq!(changed.len(), 1);
        let ada = table.get("c1").unwrap();
        assert_eq!(ada.position(), Some(("d1", 5, 2)));
        // name survives a position-only update
        assert_eq!(ada.name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_client_updated_adds_unknown_client() {
        let mut table = CursorTable::new();
        table.merge(updates(json!([
            {"id": "c9", "name": "Eve", "doc_id": "d2", "row": 1, "column": 1}
        ])));
        assert_eq!(table.get("c9").unwrap().name.as_deref(), Some("Eve"));
    }

    #[test]
    fn test_remove_reports_only_known_ids() {
        let mut table = CursorTable::new();
        table.replace_all(updates(json!([{"client_id": "a"}, {"client_id": "b"}])));
        let removed = table.remove(&["a".to_string(), "zzz".to_string()]);
        assert_eq!(removed, vec!["a".to_string()]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_for_document() {
        let mut table = CursorTable::new();
        table.merge(updates(json!([
            {"id": "a", "doc_id": "d1", "row": 0, "column": 0},
            {"id": "b", "doc_id": "d2", "row": 0, "column": 0},
            {"id": "c", "doc_id": "d1", "row": 4, "column": 1}
        ])));
        let mut ids: Vec<String> = table
            .for_document("d1")
            .into_iter()
            .map(|c| c.client_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
