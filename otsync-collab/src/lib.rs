//! # otsync-collab: client side of a real-time OT collaboration service
//!
//! Keeps local line buffers in step with documents hosted by a
//! collaborative-editing server speaking a line-framed socket protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  write_buffer   ┌─────────────┐   EditQueue   ┌─────────────┐
//! │ host editor │ ──────────────► │  Document   │ ────────────► │ Dispatcher  │
//! │             │ ◄────────────── │ (per doc,   │               │ (one update │
//! └─────────────┘  SessionEvent   │  locked)    │               │  in flight) │
//!        ▲                        └──────▲──────┘               └──────┬──────┘
//!        │                               │ apply_remote                │ applyOtUpdate
//!        │                        ┌──────┴──────────────────────────────▼──────┐
//!        └─────────────────────── │ ProjectSession (frames, correlation table, │
//!                                 │ cursor table)                              │
//!                                 └──────────────────────┬─────────────────────┘
//!                                                        │ WebSocket
//!                                                        ▼
//!                                                 collaboration server
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: frame codec, commands and push events
//! - [`session`]: connection state machine and reply correlation
//! - [`dispatcher`]: batching of outgoing edits
//! - [`presence`]: remote cursor table
//! - [`project`]: project tree metadata
//! - [`client`]: socket tasks and the host-facing API

pub mod protocol;
pub mod presence;
pub mod project;
pub mod session;
pub mod dispatcher;
pub mod client;

pub use protocol::{Command, Frame, FrameCode, ProtocolError, ServerEvent, UpdatePayload};
pub use presence::{Cursor, CursorTable, CursorUpdate};
pub use project::{DocEntry, ProjectInfo};
pub use session::{
    ConnectionState, Flow, ProjectSession, SessionConfig, SessionError, SessionEvent,
};
pub use dispatcher::{Dispatcher, EditQueue};
pub use client::{ClientConfig, ClientError, SyncClient};
