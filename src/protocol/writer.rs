// Single serialized writer: the only task that touches a connection's sink.
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::protocol::transport::FrameSink;
use crate::protocol::types::OutboundFrame;

pub enum Outbound {
    Frame(OutboundFrame),
    /// Flush marker: everything enqueued before it is written, then the
    /// sink is closed.
    Close,
}

/// Outbound queue shared by every producer. The receiving end outlives
/// individual connections; each connection's writer locks it while alive.
pub type OutboundQueue = Arc<Mutex<mpsc::UnboundedReceiver<Outbound>>>;

pub fn outbound_channel() -> (mpsc::UnboundedSender<Outbound>, OutboundQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Arc::new(Mutex::new(rx)))
}

pub struct Writer {
    pub handle: JoinHandle<DeskPilotResult<()>>,
    /// Fires once if a write fails; dropped without a value on a clean close.
    pub failed: oneshot::Receiver<DeskPilotError>,
}

pub fn spawn_writer(sink: Box<dyn FrameSink>, queue: OutboundQueue) -> Writer {
    let (failed_tx, failed) = oneshot::channel();
    let handle = tokio::spawn(write_loop(sink, queue, failed_tx));
    Writer { handle, failed }
}

async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    queue: OutboundQueue,
    failed: oneshot::Sender<DeskPilotError>,
) -> DeskPilotResult<()> {
    let mut queue = queue.lock().await;
    while let Some(item) = queue.recv().await {
        match item {
            Outbound::Frame(frame) => {
                let kind = frame.kind();
                let text = match frame.to_json() {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!(kind, error = %e, "outbound frame not serializable, skipped");
                        continue;
                    }
                };
                let bytes = text.len();
                if let Err(e) = sink.send(text).await {
                    tracing::warn!(kind, error = %e, "frame write failed");
                    let msg = e.to_string();
                    let _ = failed.send(e);
                    return Err(DeskPilotError::Transport(msg));
                }
                tracing::debug!(kind, bytes, "frame written");
            }
            Outbound::Close => {
                tracing::debug!("writer closing sink");
                return sink.close().await;
            }
        }
    }
    Ok(())
}

/// Discards frames left over from a previous connection. Returns how many
/// frames were dropped.
pub async fn drain_stale(queue: &OutboundQueue) -> usize {
    let mut queue = queue.lock().await;
    let mut dropped = 0;
    while let Ok(item) = queue.try_recv() {
        if let Outbound::Frame(frame) = item {
            tracing::warn!(kind = frame.kind(), "dropping frame queued for a closed connection");
            dropped += 1;
        }
    }
    dropped
}
