//! Outgoing edit dispatcher.
//!
//! ```text
//!  editor thread(s)             session task
//!  ───────────────             ────────────────────────────────────────
//!  write_buffer ──► EditQueue ──► drain_cycle
//!  write_buffer ──►    │            ├─ recv() first item (blocks)
//!                      │            ├─ try_recv() everything else queued
//!                      │            ├─ group by document, first-seen order
//!                      │            └─ per document: flush
//!                      │                 push_pending → take_pending
//!                      │                 send applyOtUpdate(v, lastV)
//!                      │                 await ack ◄── handle_frame("6:::N+")
//!                      ▼
//!             queued while an ack is awaited → next cycle
//! ```
//!
//! Flushes are strictly sequential, so each document has at most one
//! unacknowledged update in flight.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use otsync_core::{DocId, Operation};

use crate::session::{ConnectionState, ProjectSession, SessionError, SessionEvent};

type EditBatch = (DocId, Vec<Operation>);

/// Thread-safe handle for queueing locally computed ops.
#[derive(Debug, Clone)]
pub struct EditQueue {
    tx: mpsc::UnboundedSender<EditBatch>,
}

impl EditQueue {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<EditBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns `false` once the dispatcher is gone.
    pub fn push(&self, doc_id: &str, ops: Vec<Operation>) -> bool {
        self.tx.send((doc_id.to_string(), ops)).is_ok()
    }
}

/// Single consumer of the edit queue.
pub struct Dispatcher {
    session: Arc<ProjectSession>,
    rx: mpsc::UnboundedReceiver<EditBatch>,
}

impl Dispatcher {
    pub(crate) fn new(session: Arc<ProjectSession>, rx: mpsc::UnboundedReceiver<EditBatch>) -> Self {
        Self { session, rx }
    }

    /// Flush until the session closes.
    pub async fn run(mut self) {
        log::debug!("starting dispatcher");
        let mut state = self.session.subscribe();
        loop {
            tokio::select! {
                result = self.drain_cycle() => {
                    if let Err(e) = result {
                        log::info!("dispatcher stopped: {e}");
                        break;
                    }
                }
                _ = wait_closed(&mut state) => break,
            }
        }
        log::debug!("dispatcher finished");
    }

    /// Wait for at least one batch, then flush everything queued.
    pub async fn drain_cycle(&mut self) -> Result<(), SessionError> {
        let first = self.rx.recv().await.ok_or(SessionError::Disconnected)?;

        let mut batches: Vec<EditBatch> = Vec::new();
        let mut add = |(doc_id, ops): EditBatch| {
            match batches.iter_mut().find(|(id, _)| *id == doc_id) {
                Some((_, existing)) => existing.extend(ops),
                None => batches.push((doc_id, ops)),
            }
        };
        add(first);
        while let Ok(batch) = self.rx.try_recv() {
            add(batch);
        }

        log::debug!("drain cycle: {} documents", batches.len());
        for (doc_id, ops) in batches {
            self.flush(&doc_id, ops).await?;
        }
        Ok(())
    }

    /// Send one document's accumulated ops and wait for the ack.
    async fn flush(&self, doc_id: &str, ops: Vec<Operation>) -> Result<(), SessionError> {
        let Some(doc) = self.session.document(doc_id) else {
            log::debug!("dropping ops for closed document {doc_id}");
            return Ok(());
        };

        doc.push_pending(ops);
        let pending = doc.take_pending();
        if pending.is_empty() {
            return Ok(());
        }

        log::debug!("flush {doc_id}: {} ops at v{}", pending.len(), doc.version());
        let reply = self.session.send_update(&doc, pending);
        self.session.emit(SessionEvent::AwaitingAck {
            doc_id: doc_id.to_string(),
            waiting: true,
        });

        let result = reply.await.unwrap_or(Err(SessionError::Disconnected));

        self.session.emit(SessionEvent::AwaitingAck {
            doc_id: doc_id.to_string(),
            waiting: false,
        });

        result.map(|_| ())
    }
}

async fn wait_closed(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state.wait_for(|s| s.is_closed()).await;
}
