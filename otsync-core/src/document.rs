//! Per-document synchronization state.
//!
//! ```text
//!            write_local(lines)                 apply_remote(ops)
//!   editor ─────────────────────┐      ┌───────────────────────── server
//!                               ▼      ▼
//!                      ┌──────────────────────┐
//!                      │ Mutex<DocumentState> │
//!                      │  buffer   snapshot   │
//!                      │  version  pending    │
//!                      └──────────────────────┘
//! ```
//!
//! The editor thread and the session loop both mutate the same buffer, so
//! every read-modify-write happens under one document-scoped lock. The lock
//! is held only for the mutation itself, never across an await point.

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::diff::compute_ops;
use crate::ops::Operation;
use crate::patch::{apply_ops, PatchError};

pub type DocId = String;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("document {0} has not been loaded from the server yet")]
    NotLoaded(DocId),
    #[error("failed to patch document: {0}")]
    Patch(#[from] PatchError),
}

#[derive(Debug, Clone, Default)]
struct DocumentState {
    /// Live lines as last written by the editor or patched by a peer.
    buffer: Vec<String>,
    /// Last synchronized lines. `None` until the server sent the document.
    snapshot: Option<Vec<String>>,
    version: u64,
    /// Local ops not yet sent.
    pending: Vec<Operation>,
}

/// One open document. Owned by the session's document arena.
#[derive(Debug)]
pub struct Document {
    id: DocId,
    state: Mutex<DocumentState>,
}

impl Document {
    pub fn new(id: impl Into<DocId>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(DocumentState {
                buffer: vec![String::new()],
                ..DocumentState::default()
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Install the server copy; it becomes both buffer and snapshot.
    pub fn load(&self, lines: Vec<String>, version: u64) {
        let lines = if lines.is_empty() {
            vec![String::new()]
        } else {
            lines
        };
        let mut state = self.state.lock();
        state.snapshot = Some(lines.clone());
        state.buffer = lines;
        state.version = version;
        state.pending.clear();
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().snapshot.is_some()
    }

    /// Replace the live buffer without synchronizing.
    pub fn set_buffer(&self, lines: Vec<String>) {
        self.state.lock().buffer = lines;
    }

    /// Diff the live buffer against the snapshot.
    ///
    /// Returns the ops in application order (last edit position first) and
    /// moves the snapshot forward to the buffer.
    pub fn commit_local(&self) -> Result<Vec<Operation>, DocumentError> {
        let mut state = self.state.lock();
        Self::commit_locked(&self.id, &mut state)
    }

    /// `set_buffer` + `commit_local` without releasing the lock in between.
    pub fn write_local(&self, lines: Vec<String>) -> Result<Vec<Operation>, DocumentError> {
        let mut state = self.state.lock();
        state.buffer = lines;
        Self::commit_locked(&self.id, &mut state)
    }

    fn commit_locked(id: &str, state: &mut DocumentState) -> Result<Vec<Operation>, DocumentError> {
        let snapshot = state
            .snapshot
            .as_ref()
            .ok_or_else(|| DocumentError::NotLoaded(id.to_string()))?;

        let mut ops = compute_ops(snapshot, &state.buffer);
        if ops.is_empty() {
            return Ok(ops);
        }
        ops.reverse();
        state.snapshot = Some(state.buffer.clone());
        Ok(ops)
    }

    /// Apply a remote op list, in order, to snapshot and buffer alike.
    ///
    /// Returns the patched buffer. On error neither copy is modified.
    pub fn apply_remote(&self, ops: &[Operation]) -> Result<Vec<String>, DocumentError> {
        let mut state = self.state.lock();
        let mut snapshot = state
            .snapshot
            .clone()
            .ok_or_else(|| DocumentError::NotLoaded(self.id.clone()))?;
        let mut buffer = state.buffer.clone();

        apply_ops(&mut snapshot, ops)?;
        apply_ops(&mut buffer, ops)?;

        state.snapshot = Some(snapshot);
        state.buffer = buffer.clone();
        Ok(buffer)
    }

    /// Track the version carried by a remote update.
    pub fn observe_remote_version(&self, version: u64) -> u64 {
        let mut state = self.state.lock();
        if version >= state.version {
            state.version = version + 1;
        }
        state.version
    }

    /// The server accepted our update.
    pub fn acknowledge(&self) -> u64 {
        let mut state = self.state.lock();
        state.version += 1;
        state.version
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn push_pending(&self, ops: Vec<Operation>) {
        self.state.lock().pending.extend(ops);
    }

    pub fn take_pending(&self) -> Vec<Operation> {
        std::mem::take(&mut self.state.lock().pending)
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn lines(&self) -> Vec<String> {
        self.state.lock().buffer.clone()
    }

    pub fn snapshot(&self) -> Option<Vec<String>> {
        self.state.lock().snapshot.clone()
    }

    /// Hex SHA-1 of the buffer in blob form, as the service computes it.
    pub fn content_hash(&self) -> String {
        let text = self.state.lock().buffer.join("\n");
        content_hash(&text)
    }
}

/// `sha1("blob " + len + "\0" + text)`, with the length in UTF-16 units.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", text.encode_utf16().count()).as_bytes());
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
