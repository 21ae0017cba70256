//! WebSocket sync client for one project.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect; no automatic reconnect)
//! - Keep-alive heartbeats
//! - Document open/close and the edit hook for the host editor
//! - Cursor publishing
//!
//! ```text
//!                       ┌──────────────────── connection task ───────────────────┐
//!  socket ── frames ──► │ select! { incoming → handle_frame                      │
//!                       │           outgoing → write                             │
//!                       │           heartbeat tick → "2::"                       │
//!                       │           session closed → close socket }              │
//!                       └────────────────────────────────────────────────────────┘
//!                       ┌──────────────────── dispatcher task ───────────────────┐
//!                       │ drain_cycle → applyOtUpdate → await ack                │
//!                       └────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::COOKIE, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use otsync_core::DocId;

use crate::project::ProjectInfo;
use crate::session::{
    ConnectionState, Flow, ProjectSession, SessionConfig, SessionError, SessionEvent,
};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, including the handshake token if the service needs one
    pub url: String,
    /// Sent verbatim as the `Cookie` header
    pub cookie: Option<String>,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000/socket.io/1/websocket".to_string(),
            cookie: None,
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    NotConnected,
    InvalidUrl(String),
    InvalidCookie,
    Connect(String),
    Session(SessionError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected"),
            Self::InvalidUrl(e) => write!(f, "Invalid URL: {e}"),
            Self::InvalidCookie => write!(f, "Cookie is not a valid header value"),
            Self::Connect(e) => write!(f, "Connection error: {e}"),
            Self::Session(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

/// The sync client.
pub struct SyncClient {
    config: ClientConfig,
    session: Option<Arc<ProjectSession>>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            session: None,
            event_tx,
            event_rx: Some(event_rx),
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open the socket and start the connection and dispatcher tasks.
    ///
    /// Returns once the socket is open; the handshake and project join
    /// continue in the background and are reported as events.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        if let Some(session) = &self.session {
            if !session.state().is_closed() {
                return Ok(());
            }
        }

        let request = build_request(&self.config)?;
        let (session, handles) =
            ProjectSession::new(self.config.session.clone(), self.event_tx.clone());
        session.emit(SessionEvent::Status("Connecting Websocket.".to_string()));
        log::info!("connecting to {}", self.config.url);

        let ws = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                session.emit(SessionEvent::Status(format!("Connection Error: {e}")));
                session.shutdown();
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        session.emit(SessionEvent::Status("Connected.".to_string()));

        let heartbeat = self.config.session.heartbeat_interval;
        self.tasks = vec![
            tokio::spawn(run_connection(session.clone(), ws, handles.outgoing, heartbeat)),
            tokio::spawn(handles.dispatcher.run()),
        ];
        self.session = Some(session);
        Ok(())
    }

    /// Close the session and wait for its tasks.
    pub async fn disconnect(&mut self) {
        if let Some(session) = &self.session {
            session.shutdown();
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("session task failed: {e}");
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn session(&self) -> Result<&Arc<ProjectSession>, ClientError> {
        match &self.session {
            Some(session) if !session.state().is_closed() => Ok(session),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Wait until the project is joined.
    pub async fn project_joined(&self) -> Result<ProjectInfo, ClientError> {
        let session = self.session()?;
        let mut state = session.subscribe();
        let reached = state
            .wait_for(|s| *s == ConnectionState::ProjectJoined || s.is_closed())
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected);
        match reached {
            ConnectionState::ProjectJoined => session.project().ok_or(ClientError::NotConnected),
            ConnectionState::Unauthorized => Err(SessionError::Unauthorized.into()),
            _ => Err(SessionError::Disconnected.into()),
        }
    }

    pub fn project(&self) -> Option<ProjectInfo> {
        self.session.as_ref().and_then(|s| s.project())
    }

    /// Join a document and wait for its content.
    pub async fn open_document(&self, doc_id: &str) -> Result<Vec<String>, ClientError> {
        let session = self.session()?;
        let reply = session.open_document(doc_id);
        reply.await.unwrap_or(Err(SessionError::Disconnected))?;
        session
            .document(doc_id)
            .map(|doc| doc.lines())
            .ok_or_else(|| SessionError::UnknownDocument(doc_id.to_string()).into())
    }

    pub fn close_document(&self, doc_id: &str) -> Result<(), ClientError> {
        let session = self.session()?;
        session
            .close_document(doc_id)
            .map(|_| ())
            .ok_or_else(|| SessionError::UnknownDocument(doc_id.to_string()).into())
    }

    /// Edit hook. `cursor` is `(row, column)` with one-based rows.
    pub fn write_buffer(
        &self,
        doc_id: &str,
        lines: Vec<String>,
        cursor: Option<(u32, u32)>,
    ) -> Result<usize, ClientError> {
        Ok(self.session()?.write_buffer(doc_id, lines, cursor)?)
    }

    /// Publish our cursor; `row` is one-based.
    pub fn update_cursor(&self, doc_id: &str, row: u32, column: u32) -> Result<(), ClientError> {
        self.session()?.update_cursor(doc_id, row, column);
        Ok(())
    }

    pub fn document_lines(&self, doc_id: &str) -> Option<Vec<String>> {
        self.session
            .as_ref()
            .and_then(|s| s.document(doc_id))
            .map(|doc| doc.lines())
    }

    pub fn open_documents(&self) -> Vec<DocId> {
        self.session
            .as_ref()
            .map(|s| s.open_documents())
            .unwrap_or_default()
    }
}

fn build_request(
    config: &ClientConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ClientError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    if let Some(cookie) = &config.cookie {
        let value = HeaderValue::from_str(cookie).map_err(|_| ClientError::InvalidCookie)?;
        request.headers_mut().insert(COOKIE, value);
    }
    Ok(request)
}

/// Drive one socket until either side closes it.
async fn run_connection<S>(
    session: Arc<ProjectSession>,
    ws: WebSocketStream<S>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    heartbeat_period: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = ws.split();
    let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    let mut state = session.subscribe();

    loop {
        tokio::select! {
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => match session.handle_frame(text.as_str()) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Close) => break,
                    Err(e) => {
                        log::error!("read loop fault: {e}");
                        session.emit(SessionEvent::Status(format!("Error: {e}")));
                        break;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("socket closed by peer");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("socket error: {e}");
                    session.emit(SessionEvent::Status(format!("Error: {e}")));
                    break;
                }
            },

            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(Message::Text(frame.into())).await {
                        log::error!("socket write failed: {e}");
                        break;
                    }
                }
                None => break,
            },

            _ = heartbeat.tick() => session.send_heartbeat(),

            _ = wait_closed(&mut state) => break,
        }
    }

    if let Err(e) = writer.close().await {
        log::debug!("closing socket: {e}");
    }
    session.shutdown();
}

async fn wait_closed(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| s.is_closed()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let config = ClientConfig {
            url: "ws://localhost:9090/socket.io/1/websocket".into(),
            ..ClientConfig::default()
        };
        let client = SyncClient::new(config);
        assert_eq!(client.config().url, "ws://localhost:9090/socket.io/1/websocket");
        assert_eq!(client.config().session.heartbeat_interval, Duration::from_secs(20));
        assert!(!client.config().session.send_content_hash);
    }

    #[test]
    fn test_initial_state() {
        let client = SyncClient::new(ClientConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.project().is_none());
        assert!(client.open_documents().is_empty());
        assert!(client.document_lines("d1").is_none());
    }

    #[test]
    fn test_operations_require_connection() {
        let client = SyncClient::new(ClientConfig::default());
        assert_eq!(
            client.write_buffer("d1", vec![], None),
            Err(ClientError::NotConnected)
        );
        assert_eq!(client.update_cursor("d1", 1, 0), Err(ClientError::NotConnected));
        assert_eq!(client.close_document("d1"), Err(ClientError::NotConnected));
    }

    #[test]
    fn test_take_event_rx() {
        let mut client = SyncClient::new(ClientConfig::default());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_request_carries_cookie() {
        let config = ClientConfig {
            cookie: Some("sid=abc".into()),
            ..ClientConfig::default()
        };
        let request = build_request(&config).unwrap();
        assert_eq!(request.headers()[COOKIE], "sid=abc");
    }

    #[test]
    fn test_request_rejects_bad_input() {
        let bad_url = ClientConfig {
            url: "not a url".into(),
            ..ClientConfig::default()
        };
        assert!(matches!(build_request(&bad_url), Err(ClientError::InvalidUrl(_))));

        let bad_cookie = ClientConfig {
            cookie: Some("line\nbreak".into()),
            ..ClientConfig::default()
        };
        assert_eq!(build_request(&bad_cookie).unwrap_err(), ClientError::InvalidCookie);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_status() {
        // nothing listens on port 9 of the loopback interface
        let mut client = SyncClient::new(ClientConfig {
            url: "ws://127.0.0.1:9/socket.io/1/websocket".into(),
            ..ClientConfig::default()
        });
        let mut events = client.take_event_rx().unwrap();
        assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::Status(msg) = event {
                saw_error |= msg.starts_with("Connection Error");
            }
        }
        assert!(saw_error);
    }
}
