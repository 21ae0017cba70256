//! Project session: the connection state machine.
//!
//! Owns everything that lives for one socket connection: the document
//! arena, the cursor table, and the table correlating outgoing commands
//! with their replies.
//!
//! ```text
//!                    ┌────────────┐  1:: / connectionAccepted
//!   new() ─────────► │ Connecting │ ─────────────────────────┐
//!                    └────────────┘                          ▼
//!                                                     ┌───────────┐
//!                                                     │ Connected │
//!                                                     └─────┬─────┘
//!                                       joinProject reply   │
//!                                                           ▼
//!                                                  ┌───────────────┐
//!                                                  │ ProjectJoined │
//!                                                  └───────────────┘
//!
//!   any state ── 0:: / otUpdateError / rejected applyOtUpdate /
//!                socket error / shutdown() ─────────────────────────► Disconnected
//!   any state ── 7:: ───────────────────────────────────────────────► Unauthorized
//! ```
//!
//! Both closed states are terminal. A new connection gets a new session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use otsync_core::{operations_from_wire, DocId, Document, DocumentError, Operation};

use crate::dispatcher::{Dispatcher, EditQueue};
use crate::presence::{Cursor, CursorTable, CursorUpdate};
use crate::project::ProjectInfo;
use crate::protocol::{
    decode_transport_line, encode_command, encode_heartbeat, split_reply, Command, Frame,
    FrameCode, ProtocolError, RemoteUpdate, ServerEvent, UpdatePayload,
};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub project_id: String,
    /// Interval between keep-alive frames
    pub heartbeat_interval: Duration,
    /// Attach the buffer hash to outgoing updates
    pub send_content_hash: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            heartbeat_interval: Duration::from_secs(20),
            send_content_hash: false,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// State, events, errors
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ProjectJoined,
    Unauthorized,
}

impl ConnectionState {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Disconnected | Self::Unauthorized)
    }
}

/// Notifications for the host editor.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Human-readable status line
    Status(String),
    /// Handshake completed
    Connected,
    ProjectOpened(ProjectInfo),
    /// Server copy received; replace the whole buffer.
    DocumentLoaded {
        doc_id: DocId,
        lines: Vec<String>,
        version: u64,
    },
    /// Remote ops applied; `lines` is the patched buffer.
    DocumentPatched {
        doc_id: DocId,
        ops: Vec<Operation>,
        lines: Vec<String>,
    },
    UpdateAcknowledged {
        doc_id: DocId,
        version: u64,
    },
    /// An update is in flight (`true`) or was answered (`false`).
    AwaitingAck {
        doc_id: DocId,
        waiting: bool,
    },
    RemoteCursor(Cursor),
    CursorRemoved(String),
    Unauthorized,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session closed before the operation completed.
    Disconnected,
    Unauthorized,
    /// The server answered a command with an error.
    Rejected(String),
    UnknownDocument(DocId),
    Document(DocumentError),
    Protocol(ProtocolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Session disconnected"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::Rejected(reason) => write!(f, "Rejected by server: {reason}"),
            Self::UnknownDocument(id) => write!(f, "Document not open: {id}"),
            Self::Document(e) => write!(f, "Document error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<DocumentError> for SessionError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// What the read loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Completion signal of a command: the reply's result values.
pub type Reply = oneshot::Receiver<Result<Value, SessionError>>;

// ───────────────────────────────────────────────────────────────────
// Correlation table
// ───────────────────────────────────────────────────────────────────

struct PendingRequest {
    command: Command,
    reply: oneshot::Sender<Result<Value, SessionError>>,
}

struct RequestTable {
    next_seq: u64,
    pending: HashMap<u64, PendingRequest>,
    /// Set once by `shutdown`; no request may be registered afterwards.
    closed: bool,
}

/// Channel ends the connection owner drives.
pub struct SessionHandles {
    /// Encoded frames to write to the socket, in order
    pub outgoing: mpsc::UnboundedReceiver<String>,
    pub dispatcher: Dispatcher,
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

pub struct ProjectSession {
    config: SessionConfig,
    state: watch::Sender<ConnectionState>,
    requests: Mutex<RequestTable>,
    documents: RwLock<HashMap<DocId, Arc<Document>>>,
    cursors: Mutex<CursorTable>,
    project: Mutex<Option<ProjectInfo>>,
    outgoing: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<SessionEvent>,
    edits: EditQueue,
}

impl ProjectSession {
    pub fn new(
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> (Arc<Self>, SessionHandles) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (edits, edit_rx) = EditQueue::new();
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let session = Arc::new(Self {
            config,
            state,
            requests: Mutex::new(RequestTable {
                next_seq: 1,
                pending: HashMap::new(),
                closed: false,
            }),
            documents: RwLock::new(HashMap::new()),
            cursors: Mutex::new(CursorTable::new()),
            project: Mutex::new(None),
            outgoing: outgoing_tx,
            events,
            edits,
        });
        let dispatcher = Dispatcher::new(session.clone(), edit_rx);

        (
            session,
            SessionHandles {
                outgoing: outgoing_rx,
                dispatcher,
            },
        )
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Closed states are terminal; `Unauthorized` is never left.
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            let allowed = match *current {
                ConnectionState::Unauthorized => false,
                ConnectionState::Disconnected => next == ConnectionState::Unauthorized,
                _ => *current != next,
            };
            if allowed {
                log::info!("connection state {:?} -> {:?}", *current, next);
                *current = next;
            }
            allowed
        });
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // the host may have dropped its receiver
        let _ = self.events.send(event);
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{message}");
        self.emit(SessionEvent::Status(message));
    }

    pub fn project(&self) -> Option<ProjectInfo> {
        self.project.lock().clone()
    }

    pub fn document(&self, doc_id: &str) -> Option<Arc<Document>> {
        self.documents.read().get(doc_id).cloned()
    }

    pub fn open_documents(&self) -> Vec<DocId> {
        self.documents.read().keys().cloned().collect()
    }

    pub fn cursors_in(&self, doc_id: &str) -> Vec<Cursor> {
        self.cursors.lock().for_document(doc_id)
    }

    /// Number of commands still awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.requests.lock().pending.len()
    }

    // ── Outgoing ───────────────────────────────────────────────────

    /// Register a command in the correlation table and queue its frame.
    pub fn send_command(&self, command: Command) -> Reply {
        let (tx, rx) = oneshot::channel();
        let payload = command.to_payload();

        let seq = {
            let mut table = self.requests.lock();
            if table.closed {
                let _ = tx.send(Err(SessionError::Disconnected));
                return rx;
            }
            let seq = table.next_seq;
            table.next_seq += 1;
            table.pending.insert(seq, PendingRequest { command, reply: tx });
            seq
        };

        let frame = encode_command(seq, &payload);
        log::debug!("send cmd: {frame}");
        if self.outgoing.send(frame).is_err() {
            if let Some(request) = self.requests.lock().pending.remove(&seq) {
                let _ = request.reply.send(Err(SessionError::Disconnected));
            }
        }
        rx
    }

    pub fn send_heartbeat(&self) {
        log::debug!("send keep_alive");
        let _ = self.outgoing.send(encode_heartbeat());
    }

    /// Send one `applyOtUpdate` for `ops` at the document's current version.
    pub(crate) fn send_update(&self, doc: &Document, ops: Vec<Operation>) -> Reply {
        let mut update = UpdatePayload::new(doc.id(), ops, doc.version());
        if self.config.send_content_hash {
            update.hash = Some(doc.content_hash());
        }
        self.send_command(Command::ApplyOtUpdate {
            doc_id: doc.id().to_string(),
            update,
        })
    }

    // ── Host-facing operations ─────────────────────────────────────

    /// Register a document and request its content.
    pub fn open_document(&self, doc_id: &str) -> Reply {
        self.documents
            .write()
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(Document::new(doc_id)));
        self.send_command(Command::JoinDoc {
            doc_id: doc_id.to_string(),
        })
    }

    /// Drop a document from the arena and stop watching it.
    pub fn close_document(&self, doc_id: &str) -> Option<Reply> {
        self.documents.write().remove(doc_id)?;
        Some(self.send_command(Command::LeaveDoc {
            doc_id: doc_id.to_string(),
        }))
    }

    /// Publish our cursor. `row` is one-based as editors count lines.
    pub fn update_cursor(&self, doc_id: &str, row: u32, column: u32) {
        // the reply carries nothing; dropping the receiver is fine
        let _ = self.send_command(Command::UpdatePosition {
            doc_id: doc_id.to_string(),
            row: row.saturating_sub(1),
            column,
        });
    }

    /// Edit hook: diff `lines` against the snapshot and queue the result.
    ///
    /// Callable from any thread. Returns the number of ops queued.
    pub fn write_buffer(
        &self,
        doc_id: &str,
        lines: Vec<String>,
        cursor: Option<(u32, u32)>,
    ) -> Result<usize, SessionError> {
        let doc = self
            .document(doc_id)
            .ok_or_else(|| SessionError::UnknownDocument(doc_id.to_string()))?;

        if let Some((row, column)) = cursor {
            self.update_cursor(doc_id, row, column);
        }

        let ops = doc.write_local(lines)?;
        let count = ops.len();
        if count > 0 {
            log::debug!("writeBuffer({doc_id}) -> {count} ops");
            if !self.edits.push(doc_id, ops) {
                return Err(SessionError::Disconnected);
            }
        }
        Ok(count)
    }

    /// Close the session and fail every waiter. Idempotent.
    pub fn shutdown(&self) {
        let pending: Vec<PendingRequest> = {
            let mut table = self.requests.lock();
            if table.closed {
                return;
            }
            table.closed = true;
            table.pending.drain().map(|(_, request)| request).collect()
        };

        self.set_state(ConnectionState::Disconnected);
        if !pending.is_empty() {
            log::debug!("failing {} pending requests", pending.len());
        }
        for request in pending {
            let _ = request.reply.send(Err(SessionError::Disconnected));
        }
        self.cursors.lock().clear();
        self.status("Disconnected.");
        self.emit(SessionEvent::Disconnected);
    }

    // ── Incoming ───────────────────────────────────────────────────

    /// Process one frame from the socket.
    pub fn handle_frame(&self, text: &str) -> Result<Flow, SessionError> {
        log::debug!("answer: {text}");
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(ProtocolError::UnknownCode(_)) => {
                self.status(format!("Unknown Code: {text}"));
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e.into()),
        };

        match frame.code {
            FrameCode::Disconnect => {
                self.status("The server closed the connection.");
                Ok(Flow::Close)
            }
            FrameCode::Connect => {
                self.mark_connected();
                Ok(Flow::Continue)
            }
            FrameCode::Heartbeat => {
                self.send_heartbeat();
                Ok(Flow::Continue)
            }
            FrameCode::Event => match frame.data {
                Some(data) => self.handle_push(data),
                None => Ok(Flow::Continue),
            },
            FrameCode::Ack => self.handle_reply(frame),
            FrameCode::Error => {
                self.set_state(ConnectionState::Unauthorized);
                self.status(
                    "Error: Unauthorized. The session cookie is probably outdated; \
                     log in again with a browser and refresh it.",
                );
                self.emit(SessionEvent::Unauthorized);
                Ok(Flow::Close)
            }
        }
    }

    fn mark_connected(&self) {
        if self.state() == ConnectionState::Connecting {
            self.set_state(ConnectionState::Connected);
            self.emit(SessionEvent::Connected);
        }
    }

    fn handle_push(&self, data: Value) -> Result<Flow, SessionError> {
        let event = match ServerEvent::from_value(data) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("ignoring undecodable push: {e}");
                return Ok(Flow::Continue);
            }
        };

        match event {
            ServerEvent::ConnectionAccepted => {
                self.mark_connected();
                self.status("Connection Active.");
                let _ = self.send_command(Command::JoinProject {
                    project_id: self.config.project_id.clone(),
                });
            }
            ServerEvent::BroadcastDocMeta => {}
            ServerEvent::ClientUpdated(updates) => {
                let cursors = self.cursors.lock().merge(updates);
                self.publish_cursors(cursors);
            }
            ServerEvent::ClientDisconnected(ids) => {
                let removed = self.cursors.lock().remove(&ids);
                for id in removed {
                    self.emit(SessionEvent::CursorRemoved(id));
                }
            }
            ServerEvent::OtUpdateApplied(updates) => {
                for update in updates {
                    self.apply_remote_update(update)?;
                }
            }
            ServerEvent::OtUpdateError(reason) => {
                log::error!("otUpdateError: {reason}");
                self.status(format!("Error occurred on operation update: {reason}"));
                return Ok(Flow::Close);
            }
            ServerEvent::Error => log::warn!("server sent an unreadable event"),
            ServerEvent::Unknown(name) => self.status(format!("Data not known: {name}")),
        }
        Ok(Flow::Continue)
    }

    fn apply_remote_update(&self, update: RemoteUpdate) -> Result<(), SessionError> {
        let Some(doc) = self.document(&update.doc) else {
            log::debug!("update for unopened document {}", update.doc);
            return Ok(());
        };

        if let Some(v) = update.v {
            let version = doc.observe_remote_version(v);
            log::debug!("{}: remote v {v}, local version now {version}", update.doc);
        }

        let Some(wire) = update.op else {
            return Ok(());
        };
        let ops = operations_from_wire(wire);
        if ops.is_empty() {
            return Ok(());
        }
        let lines = doc.apply_remote(&ops)?;
        self.emit(SessionEvent::DocumentPatched {
            doc_id: update.doc,
            ops,
            lines,
        });
        Ok(())
    }

    fn publish_cursors(&self, cursors: Vec<Cursor>) {
        for cursor in cursors {
            if cursor.position().is_some() {
                self.emit(SessionEvent::RemoteCursor(cursor));
            }
        }
    }

    fn handle_reply(&self, frame: Frame) -> Result<Flow, SessionError> {
        // `6:::N+json` carries the id in the data, `6:N+::json` in the id field
        let Some(seq) = frame.ack_id.or(frame.message_id) else {
            log::warn!("reply without a sequence id: {}", frame.raw);
            return Ok(Flow::Continue);
        };
        let Some(request) = self.requests.lock().pending.remove(&seq) else {
            log::warn!("reply to unknown request {seq}");
            return Ok(Flow::Continue);
        };

        let name = request.command.name();
        let results = match split_reply(frame.data) {
            Ok(results) => results,
            Err(reason) => {
                let _ = request.reply.send(Err(SessionError::Rejected(reason.clone())));
                if let Command::ApplyOtUpdate { doc_id, .. } = &request.command {
                    // the snapshot already holds the rejected ops
                    log::error!("update to {doc_id} rejected: {reason}");
                    self.status(format!("Error occurred on operation update: {reason}"));
                    return Ok(Flow::Close);
                }
                log::warn!("{name} rejected: {reason}");
                self.status(format!("{name} failed: {reason}"));
                return Ok(Flow::Continue);
            }
        };

        match self.complete(&request.command, &results) {
            Ok(()) => {
                let _ = request.reply.send(Ok(Value::Array(results)));
                Ok(Flow::Continue)
            }
            Err(e) => {
                let _ = request.reply.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Apply the effect of a successful reply.
    fn complete(&self, command: &Command, results: &[Value]) -> Result<(), SessionError> {
        match command {
            Command::JoinProject { .. } => {
                let raw = results.first().cloned().unwrap_or(Value::Null);
                let info = ProjectInfo::from_value(raw)?;
                log::info!(
                    "joined project {} ({} documents)",
                    info.name,
                    info.documents.len()
                );
                *self.project.lock() = Some(info.clone());
                let _ = self.send_command(Command::GetConnectedUsers);
                self.set_state(ConnectionState::ProjectJoined);
                self.emit(SessionEvent::ProjectOpened(info));
            }

            Command::JoinDoc { doc_id } => {
                let lines: Vec<String> = reply_field(results, 0, "joinDoc")?;
                let version: u64 = reply_field(results, 1, "joinDoc")?;
                let lines: Vec<String> = lines.iter().map(|l| decode_transport_line(l)).collect();

                let Some(doc) = self.document(doc_id) else {
                    log::debug!("{doc_id} closed before joinDoc returned");
                    return Ok(());
                };
                doc.load(lines, version);
                self.emit(SessionEvent::DocumentLoaded {
                    doc_id: doc_id.clone(),
                    lines: doc.lines(),
                    version,
                });
            }

            Command::ApplyOtUpdate { doc_id, .. } => {
                if let Some(doc) = self.document(doc_id) {
                    let version = doc.acknowledge();
                    self.emit(SessionEvent::UpdateAcknowledged {
                        doc_id: doc_id.clone(),
                        version,
                    });
                }
            }

            Command::GetConnectedUsers => {
                let users: Vec<CursorUpdate> = reply_field(results, 0, "getConnectedUsers")?;
                let cursors = self.cursors.lock().replace_all(users);
                self.publish_cursors(cursors);
            }

            Command::LeaveDoc { .. } | Command::UpdatePosition { .. } => {}
        }
        Ok(())
    }
}

fn reply_field<T: DeserializeOwned>(
    results: &[Value],
    index: usize,
    command: &str,
) -> Result<T, ProtocolError> {
    let value = results.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| ProtocolError::DeserializationError(format!("{command} reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Harness {
        session: Arc<ProjectSession>,
        outgoing: mpsc::UnboundedReceiver<String>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        _dispatcher: Dispatcher,
    }

    impl Harness {
        fn new() -> Self {
            let (event_tx, events) = mpsc::unbounded_channel();
            let config = SessionConfig {
                project_id: "p1".into(),
                ..SessionConfig::default()
            };
            let (session, handles) = ProjectSession::new(config, event_tx);
            Self {
                session,
                outgoing: handles.outgoing,
                events,
                _dispatcher: handles.dispatcher,
            }
        }

        fn feed(&self, frame: &str) -> Flow {
            self.session.handle_frame(frame).unwrap()
        }

        fn sent(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outgoing.try_recv() {
                frames.push(frame);
            }
            frames
        }

        fn events(&mut self) -> Vec<SessionEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        /// Open `d1` and answer its joinDoc with `lines` at `version`.
        fn loaded(&mut self, lines: Value, version: u64) {
            let _ = self.session.open_document("d1");
            let frame = self.sent().pop().unwrap();
            let seq = frame[2..frame.find('+').unwrap()].to_string();
            self.feed(&format!("6:::{seq}+[null,{lines},{version},[],{{}}]"));
            self.events();
        }
    }

    fn payload(frame: &str) -> Value {
        let json = &frame[frame.find("::").unwrap() + 2..];
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_starts_connecting() {
        let h = Harness::new();
        assert_eq!(h.session.state(), ConnectionState::Connecting);
        assert!(!h.session.state().is_closed());
    }

    #[test]
    fn test_handshake_then_connection_accepted_joins_project() {
        let mut h = Harness::new();
        assert_eq!(h.feed("1::"), Flow::Continue);
        assert_eq!(h.session.state(), ConnectionState::Connected);

        h.feed(r#"5:::{"name":"connectionAccepted"}"#);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("5:1+::"));
        assert_eq!(
            payload(&sent[0]),
            json!({"name": "joinProject", "args": [{"project_id": "p1"}]})
        );
        assert!(h.events().contains(&SessionEvent::Connected));
    }

    #[test]
    fn test_join_project_reply_opens_project_and_requests_users() {
        let mut h = Harness::new();
        h.feed(r#"5:::{"name":"connectionAccepted"}"#);
        h.sent();

        h.feed(r#"6:::1+[null,{"_id":"p1","name":"Paper","rootFolder":[{"name":"rootFolder","docs":[{"_id":"d1","name":"main.tex"}],"folders":[]}]},"owner",2]"#);
        assert_eq!(h.session.state(), ConnectionState::ProjectJoined);
        assert_eq!(h.session.project().unwrap().documents[0].path, "main.tex");

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("5:2+::"));
        assert_eq!(payload(&sent[0])["name"], "clientTracking.getConnectedUsers");
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::ProjectOpened(info) if info.name == "Paper")));
        assert_eq!(h.session.pending_requests(), 1);
    }

    #[test]
    fn test_join_doc_reply_loads_document() {
        let mut h = Harness::new();
        let _ = h.session.open_document("d1");
        let sent = h.sent();
        assert_eq!(
            payload(&sent[0]),
            json!({"name": "joinDoc", "args": ["d1", {"encodeRanges": true}]})
        );

        // "café" arrives as its UTF-8 bytes, one char each
        h.feed("6:::1+[null,[\"caf\u{c3}\u{a9}\",\"world\"],42,[],{}]");
        let doc = h.session.document("d1").unwrap();
        assert!(doc.is_loaded());
        assert_eq!(doc.lines(), vec!["café".to_string(), "world".to_string()]);
        assert_eq!(doc.version(), 42);
        assert!(h.events().contains(&SessionEvent::DocumentLoaded {
            doc_id: "d1".into(),
            lines: vec!["café".into(), "world".into()],
            version: 42,
        }));
        assert_eq!(h.session.pending_requests(), 0);
    }

    #[test]
    fn test_update_ack_bumps_version_and_completes_waiter() {
        let mut h = Harness::new();
        h.loaded(json!(["hello", "world"]), 3);

        let doc = h.session.document("d1").unwrap();
        let mut reply = h.session.send_update(&doc, vec![Operation::insert(6, "there\n")]);
        let frame = h.sent().pop().unwrap();
        let body = payload(&frame);
        assert_eq!(body["args"][1]["v"], 3);
        assert_eq!(body["args"][1]["lastV"], 2);

        h.feed("6:::2+[null]");
        assert_eq!(doc.version(), 4);
        assert!(reply.try_recv().unwrap().is_ok());
        assert_eq!(h.session.pending_requests(), 0);
        assert!(h.events().contains(&SessionEvent::UpdateAcknowledged {
            doc_id: "d1".into(),
            version: 4,
        }));
    }

    #[test]
    fn test_ack_with_id_in_id_field() {
        let mut h = Harness::new();
        h.loaded(json!(["hello", "world"]), 3);

        let doc = h.session.document("d1").unwrap();
        let mut reply = h.session.send_update(&doc, vec![Operation::insert(5, "!")]);
        let frame = h.sent().pop().unwrap();
        assert!(frame.starts_with("5:2+::"));

        assert_eq!(h.feed("6:2+::[null]"), Flow::Continue);
        assert!(reply.try_recv().unwrap().is_ok());
        assert_eq!(doc.version(), 4);
        assert_eq!(h.session.pending_requests(), 0);
    }

    #[test]
    fn test_rejected_update_closes_session() {
        let mut h = Harness::new();
        h.loaded(json!(["a"]), 3);
        let doc = h.session.document("d1").unwrap();
        let mut reply = h.session.send_update(&doc, vec![Operation::insert(0, "x")]);
        h.sent();

        assert_eq!(h.feed(r#"6:::2+["version mismatch"]"#), Flow::Close);
        assert_eq!(
            reply.try_recv().unwrap(),
            Err(SessionError::Rejected("version mismatch".into()))
        );
        assert_eq!(doc.version(), 3);
        assert!(h.events().iter().any(
            |e| matches!(e, SessionEvent::Status(msg) if msg.contains("version mismatch"))
        ));
    }

    #[test]
    fn test_rejected_join_doc_keeps_session_open() {
        let mut h = Harness::new();
        let _ = h.session.open_document("d1");
        h.sent();

        assert_eq!(h.feed(r#"6:::1+["not found"]"#), Flow::Continue);
        assert!(!h.session.document("d1").unwrap().is_loaded());
        assert_eq!(h.session.pending_requests(), 0);
    }

    #[test]
    fn test_remote_update_patches_document() {
        let mut h = Harness::new();
        h.loaded(json!(["hello", "world"]), 3);

        h.feed(r#"5:::{"name":"otUpdateApplied","args":[{"doc":"d1","op":[{"p":5,"d":"\nworld"},{"p":5,"i":"!"}],"v":3}]}"#);
        let doc = h.session.document("d1").unwrap();
        assert_eq!(doc.lines(), vec!["hello!".to_string()]);
        assert_eq!(doc.snapshot(), Some(doc.lines()));
        assert_eq!(doc.version(), 4);

        let events = h.events();
        assert!(matches!(
            &events[..],
            [SessionEvent::DocumentPatched { ops, lines, .. }] if ops.len() == 2 && lines == &vec!["hello!".to_string()]
        ));
    }

    #[test]
    fn test_remote_update_with_delete_and_insert_in_one_op() {
        let mut h = Harness::new();
        h.loaded(json!(["cat"]), 1);
        // one wire op carrying both: the deletion happens first
        h.feed(r#"5:::{"name":"otUpdateApplied","args":[{"doc":"d1","op":[{"p":0,"d":"c","i":"b"}],"v":1}]}"#);
        assert_eq!(h.session.document("d1").unwrap().lines(), vec!["bat".to_string()]);
    }

    #[test]
    fn test_remote_update_for_unknown_document_is_ignored() {
        let mut h = Harness::new();
        let flow = h.feed(r#"5:::{"name":"otUpdateApplied","args":[{"doc":"zzz","op":[{"p":0,"i":"x"}]}]}"#);
        assert_eq!(flow, Flow::Continue);
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_unpatchable_remote_update_is_fatal() {
        let mut h = Harness::new();
        h.loaded(json!(["ab"]), 1);
        let result = h
            .session
            .handle_frame(r#"5:::{"name":"otUpdateApplied","args":[{"doc":"d1","op":[{"p":99,"i":"x"}]}]}"#);
        assert!(matches!(result, Err(SessionError::Document(_))));
    }

    #[test]
    fn test_ot_update_error_closes() {
        let mut h = Harness::new();
        let flow = h.feed(r#"5:::{"name":"otUpdateError","args":["Delete component does not match"]}"#);
        assert_eq!(flow, Flow::Close);
        assert!(h.events().iter().any(
            |e| matches!(e, SessionEvent::Status(msg) if msg.contains("Delete component"))
        ));
    }

    #[test]
    fn test_unauthorized_is_terminal() {
        let mut h = Harness::new();
        assert_eq!(h.feed("7:::"), Flow::Close);
        assert_eq!(h.session.state(), ConnectionState::Unauthorized);
        assert!(h.events().contains(&SessionEvent::Unauthorized));

        h.session.shutdown();
        assert_eq!(h.session.state(), ConnectionState::Unauthorized);
    }

    #[test]
    fn test_server_disconnect_closes() {
        let h = Harness::new();
        assert_eq!(h.feed("0::"), Flow::Close);
    }

    #[test]
    fn test_heartbeat_is_answered() {
        let mut h = Harness::new();
        h.feed("2::");
        assert_eq!(h.sent(), vec!["2::".to_string()]);
    }

    #[test]
    fn test_unknown_reply_and_code_are_tolerated() {
        let mut h = Harness::new();
        assert_eq!(h.feed("6:::99+[null]"), Flow::Continue);
        assert_eq!(h.feed("8::"), Flow::Continue);
        assert!(h
            .events()
            .iter()
            .any(|e| matches!(e, SessionEvent::Status(msg) if msg.starts_with("Unknown Code"))));
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        let h = Harness::new();
        assert!(matches!(
            h.session.handle_frame("5"),
            Err(SessionError::Protocol(ProtocolError::Malformed(_)))
        ));
    }

    #[test]
    fn test_cursor_events() {
        let mut h = Harness::new();
        h.feed(r#"5:::{"name":"connectionAccepted"}"#);
        h.feed(r#"6:::1+[null,{"_id":"p1","name":"P","rootFolder":[]}]"#);
        h.events();

        h.feed(r#"6:::2+[null,[{"client_id":"c1","first_name":"Ada","cursorData":{"doc_id":"d1","row":2,"column":4}},{"client_id":"c2"}]]"#);
        let events = h.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SessionEvent::RemoteCursor(c) if c.client_id == "c1"));

        h.feed(r#"5:::{"name":"clientTracking.clientUpdated","args":[{"id":"c2","doc_id":"d1","row":0,"column":1}]}"#);
        assert_eq!(h.session.cursors_in("d1").len(), 2);

        h.feed(r#"5:::{"name":"clientTracking.clientDisconnected","args":["c1"]}"#);
        let events = h.events();
        assert!(events.contains(&SessionEvent::CursorRemoved("c1".into())));
        assert_eq!(h.session.cursors_in("d1").len(), 1);
    }

    #[test]
    fn test_write_buffer_sends_zero_based_cursor_row() {
        let mut h = Harness::new();
        h.loaded(json!(["hello", "world"]), 1);

        let count = h
            .session
            .write_buffer(
                "d1",
                vec!["hello".into(), "there".into(), "world".into()],
                Some((2, 3)),
            )
            .unwrap();
        assert_eq!(count, 1);

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            payload(&sent[0]),
            json!({
                "name": "clientTracking.updatePosition",
                "args": [{"doc_id": "d1", "row": 1, "column": 3}]
            })
        );
    }

    #[test]
    fn test_write_buffer_unknown_document() {
        let h = Harness::new();
        assert_eq!(
            h.session.write_buffer("nope", vec![], None),
            Err(SessionError::UnknownDocument("nope".into()))
        );
    }

    #[test]
    fn test_close_document_sends_leave() {
        let mut h = Harness::new();
        h.loaded(json!(["a"]), 1);
        assert!(h.session.close_document("d1").is_some());
        assert!(h.session.document("d1").is_none());
        assert_eq!(payload(&h.sent()[0]), json!({"name": "leaveDoc", "args": ["d1"]}));
        assert!(h.session.close_document("d1").is_none());
    }

    #[test]
    fn test_shutdown_fails_pending_waiters() {
        let mut h = Harness::new();
        let mut join = h.session.open_document("d1");
        assert_eq!(h.session.pending_requests(), 1);

        h.session.shutdown();
        assert_eq!(join.try_recv().unwrap(), Err(SessionError::Disconnected));
        assert_eq!(h.session.pending_requests(), 0);
        assert_eq!(h.session.state(), ConnectionState::Disconnected);
        assert!(h.events().contains(&SessionEvent::Disconnected));

        // commands after shutdown fail immediately
        let mut late = h.session.send_command(Command::GetConnectedUsers);
        assert_eq!(late.try_recv().unwrap(), Err(SessionError::Disconnected));

        // idempotent
        h.session.shutdown();
        assert!(h.events().is_empty());
    }
}
