//! Shared output queue between samplers and the writer
//!
//! Unbounded multi-producer/single-consumer channel with an explicit
//! acknowledgment barrier: every enqueued message bumps a pending counter,
//! the consumer calls [`OutputReceiver::task_done`] after processing one, and
//! producers can [`OutputSender::join`] until the counter drops to zero.

use crate::error::QueueClosed;
use crate::models::{Envelope, EnvelopeKind, Sample};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Message on the output queue
#[derive(Debug, Clone)]
pub enum OutputMessage {
    Envelope(Envelope),
    /// No more data; the writer drains and flushes
    Close,
}

/// Create a connected sender/receiver pair
pub fn output_queue() -> (OutputSender, OutputReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (pending, _) = watch::channel(0usize);
    let pending = Arc::new(pending);

    (
        OutputSender {
            tx,
            pending: pending.clone(),
        },
        OutputReceiver { rx, pending },
    )
}

/// Producer handle; clone one per sampler
#[derive(Debug, Clone)]
pub struct OutputSender {
    tx: mpsc::UnboundedSender<OutputMessage>,
    pending: Arc<watch::Sender<usize>>,
}

impl OutputSender {
    fn put(&self, message: OutputMessage) -> Result<(), QueueClosed> {
        self.pending.send_modify(|n| *n += 1);
        if self.tx.send(message).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(QueueClosed);
        }
        Ok(())
    }

    /// Enqueue an envelope; never blocks
    pub fn send(&self, envelope: Envelope) -> Result<(), QueueClosed> {
        self.put(OutputMessage::Envelope(envelope))
    }

    /// Ask the writer to drain and stop
    pub fn close(&self) -> Result<(), QueueClosed> {
        self.put(OutputMessage::Close)
    }

    /// Messages enqueued but not yet acknowledged
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every enqueued message has been acknowledged
    pub async fn join(&self) {
        let mut rx = self.pending.subscribe();
        // The sender half lives in this struct, so the channel cannot close under us
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Bind this sender to a source id
    pub fn publisher(&self, source_id: impl Into<String>) -> Publisher {
        Publisher {
            source_id: source_id.into(),
            sender: self.clone(),
        }
    }
}

/// Consumer handle, owned by the writer task
#[derive(Debug)]
pub struct OutputReceiver {
    rx: mpsc::UnboundedReceiver<OutputMessage>,
    pending: Arc<watch::Sender<usize>>,
}

impl OutputReceiver {
    /// Next message; `None` once every sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<OutputMessage> {
        self.rx.recv().await
    }

    /// Acknowledge one processed message
    pub fn task_done(&self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Drop for OutputReceiver {
    fn drop(&mut self) {
        // Nobody is left to acknowledge anything; release joiners
        self.rx.close();
        self.pending.send_replace(0);
    }
}

/// Output sender bound to one sampler's source id
#[derive(Debug, Clone)]
pub struct Publisher {
    source_id: String,
    sender: OutputSender,
}

impl Publisher {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Publish a regular observation
    pub fn store(&self, payload: Sample) -> Result<(), QueueClosed> {
        self.publish(payload, EnvelopeKind::Now)
    }

    pub(crate) fn publish(&self, payload: Sample, kind: EnvelopeKind) -> Result<(), QueueClosed> {
        self.sender
            .send(Envelope::new(self.source_id.clone(), payload, kind))
    }

    pub fn pending(&self) -> usize {
        self.sender.pending()
    }

    pub async fn join(&self) {
        self.sender.join().await
    }
}
