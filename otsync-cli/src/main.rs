//! `otsync`: mirror the documents of a collaborative project into a local
//! directory and push local file edits back as operations.
//!
//! ```text
//!  server ──► DocumentLoaded / DocumentPatched ──► <dir>/<path>
//!  <dir>/<path> ──► poll tick: content changed? ──► write_buffer
//! ```
//!
//! A remote patch that finds unpolled edits in the file is applied on top
//! of them, the way an editor buffer receives it, and the result is pushed.

use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use log::{debug, error, info, warn};

use otsync_collab::{ClientConfig, DocEntry, SessionConfig, SessionEvent, SyncClient};
use otsync_core::{apply_ops, DocId, Operation};

/// Command-line interface configuration
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// WebSocket endpoint of the collaboration service
    #[arg(long)]
    url: String,

    /// Project to join
    #[arg(long)]
    project: String,

    /// Session cookie sent with the connection request
    #[arg(long, env = "OTSYNC_COOKIE", hide_env_values = true)]
    cookie: Option<String>,

    /// Document id to mirror; repeat for several (default: every document)
    #[arg(long = "doc")]
    docs: Vec<String>,

    /// Directory the documents are mirrored into
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// How often mirrored files are checked for local edits
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,

    #[arg(long, default_value_t = 20)]
    heartbeat_secs: u64,

    /// Attach the content hash to every update
    #[arg(long)]
    send_hash: bool,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            url: self.url.clone(),
            cookie: self.cookie.clone(),
            session: SessionConfig {
                project_id: self.project.clone(),
                heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
                send_content_hash: self.send_hash,
            },
        }
    }
}

/// Files on disk standing in for editor buffers.
struct Mirror {
    root: PathBuf,
    paths: HashMap<DocId, PathBuf>,
    /// Text last written to, or sent from, each file
    synced: HashMap<DocId, String>,
}

impl Mirror {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            paths: HashMap::new(),
            synced: HashMap::new(),
        }
    }

    /// Map a project path below the root, dropping `..` and absolute parts.
    fn track(&mut self, entry: &DocEntry) {
        let relative: PathBuf = Path::new(&entry.path)
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.paths.insert(entry.id.clone(), self.root.join(relative));
    }

    fn tracked(&self) -> Vec<DocId> {
        self.paths.keys().cloned().collect()
    }

    fn write(&mut self, doc_id: &str, lines: &[String]) -> io::Result<()> {
        let Some(path) = self.paths.get(doc_id) else {
            return Ok(());
        };
        let text = lines.join("\n");
        if self.synced.get(doc_id) == Some(&text) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &text)?;
        debug!("wrote {}", path.display());
        self.synced.insert(doc_id.to_string(), text);
        Ok(())
    }

    /// Lines of the file if it changed since it was last synced.
    fn local_change(&self, doc_id: &str) -> io::Result<Option<Vec<String>>> {
        let (Some(path), Some(synced)) = (self.paths.get(doc_id), self.synced.get(doc_id)) else {
            return Ok(None);
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if &text == synced {
            return Ok(None);
        }
        Ok(Some(text.split('\n').map(String::from).collect()))
    }

    fn mark_synced(&mut self, doc_id: &str, lines: &[String]) {
        self.synced.insert(doc_id.to_string(), lines.join("\n"));
    }

    /// Unpolled local edits with the remote `ops` applied on top.
    fn rebase_local(&self, doc_id: &str, ops: &[Operation]) -> io::Result<Option<Vec<String>>> {
        let Some(mut local) = self.local_change(doc_id)? else {
            return Ok(None);
        };
        match apply_ops(&mut local, ops) {
            Ok(()) => Ok(Some(local)),
            Err(e) => {
                warn!("{doc_id}: dropping local edits, remote patch does not apply: {e}");
                Ok(None)
            }
        }
    }
}

fn push_local(client: &SyncClient, mirror: &mut Mirror, doc_id: &str, lines: Vec<String>) {
    match client.write_buffer(doc_id, lines.clone(), None) {
        Ok(count) => {
            debug!("{doc_id}: queued {count} ops");
            mirror.mark_synced(doc_id, &lines);
        }
        Err(e) => warn!("{doc_id}: {e}"),
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut client = SyncClient::new(cli.client_config());
    let mut events = client
        .take_event_rx()
        .ok_or("event receiver already taken")?;

    client.connect().await?;
    let project = client.project_joined().await?;
    info!("project {} has {} documents", project.name, project.documents.len());

    let selected: Vec<DocEntry> = if cli.docs.is_empty() {
        project.documents.clone()
    } else {
        cli.docs
            .iter()
            .filter_map(|id| {
                let entry = project.document(id).cloned();
                if entry.is_none() {
                    warn!("document {id} is not part of the project");
                }
                entry
            })
            .collect()
    };

    let mut mirror = Mirror::new(cli.dir.clone());
    for entry in &selected {
        mirror.track(entry);
        let lines = client.open_document(&entry.id).await?;
        mirror.write(&entry.id, &lines)?;
        info!("mirroring {} -> {}", entry.id, entry.path);
    }

    let mut poll = tokio::time::interval(Duration::from_millis(cli.poll_ms.max(10)));
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SessionEvent::DocumentLoaded { doc_id, lines, .. }) => {
                    mirror.write(&doc_id, &lines)?;
                }
                Some(SessionEvent::DocumentPatched { doc_id, ops, lines }) => {
                    match mirror.rebase_local(&doc_id, &ops)? {
                        Some(merged) => {
                            mirror.write(&doc_id, &merged)?;
                            push_local(&client, &mut mirror, &doc_id, merged);
                        }
                        None => mirror.write(&doc_id, &lines)?,
                    }
                }
                Some(SessionEvent::Status(message)) => info!("{message}"),
                Some(SessionEvent::RemoteCursor(cursor)) => {
                    if let Some((doc_id, row, column)) = cursor.position() {
                        let who = cursor.name.as_deref().unwrap_or(&cursor.client_id);
                        info!("{who} is at {doc_id}:{}:{column}", row + 1);
                    }
                }
                Some(SessionEvent::CursorRemoved(client_id)) => debug!("{client_id} left"),
                Some(SessionEvent::AwaitingAck { doc_id, waiting }) => {
                    debug!("{doc_id}: awaiting ack = {waiting}");
                }
                Some(SessionEvent::UpdateAcknowledged { doc_id, version }) => {
                    debug!("{doc_id} acknowledged at v{version}");
                }
                Some(SessionEvent::Unauthorized) => {
                    error!("not authorized; refresh the session cookie");
                    break;
                }
                Some(SessionEvent::Disconnected) | None => break,
                Some(SessionEvent::Connected) | Some(SessionEvent::ProjectOpened(_)) => {}
            },

            _ = poll.tick() => {
                for doc_id in mirror.tracked() {
                    let Some(lines) = mirror.local_change(&doc_id)? else {
                        continue;
                    };
                    push_local(&client, &mut mirror, &doc_id, lines);
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    client.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e}");
        std::process::exit(1);
    }
}
