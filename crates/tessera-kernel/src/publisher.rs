//! Fan-out of kernel messages.
//!
//! Broadcast subscribers are bounded and lose the oldest messages when they
//! fall behind. Streams are unbounded and see every message in order.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};

use crate::protocol::KernelMessage;

/// Sends each kernel message to every subscriber and stream.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: broadcast::Sender<KernelMessage>,
    streams: Arc<Mutex<Vec<mpsc::UnboundedSender<KernelMessage>>>>,
}

impl Publisher {
    /// Create a publisher whose broadcast channel holds `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            streams: Arc::default(),
        }
    }

    /// Bounded receiver; may report `Lagged` if not drained in time.
    pub fn subscribe(&self) -> broadcast::Receiver<KernelMessage> {
        self.tx.subscribe()
    }

    /// Lossless receiver. It ends once every publisher clone is dropped.
    pub fn stream(&self) -> mpsc::UnboundedReceiver<KernelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn send(&self, message: KernelMessage) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        // Closed streams are dropped on the next send.
        streams.retain(|stream| stream.send(message.clone()).is_ok());
        drop(streams);

        // No subscribers is not an error.
        let _ = self.tx.send(message);
    }
}
