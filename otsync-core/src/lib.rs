//! # otsync-core: text engine for operational-transform document sync
//!
//! Pure, I/O-free building blocks shared by the sync client:
//!
//! ```text
//! ┌──────────────┐  compute_ops   ┌──────────────┐  apply_ops   ┌──────────────┐
//! │ snapshot     │ ─────────────► │Vec<Operation>│ ───────────► │ line buffer  │
//! │ + buffer     │  (line → char) │ {p, i | d}   │  (in order)  │              │
//! └──────────────┘                └──────────────┘              └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ops`]: `Operation` and its `{"p","i"|"d"}` wire form
//! - [`diff`]: two-level line/char diff (`similar`) into positional ops
//! - [`patch`]: applying ops to a line array
//! - [`document`]: per-document buffer, snapshot, version and outbox

pub mod ops;
pub mod diff;
pub mod patch;
pub mod document;

pub use ops::{operations_from_wire, Edit, Operation, WireOp};
pub use diff::{compute_ops, line_offsets};
pub use patch::{apply_op, apply_ops, PatchError};
pub use document::{content_hash, DocId, Document, DocumentError};
