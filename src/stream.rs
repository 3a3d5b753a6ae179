//! Bounded pub/sub channel between a producer task and its declared
//! consumer.

use serde_json::Value;
use tokio::sync::mpsc;

/// Default channel capacity when a template does not override it.
pub const DEFAULT_CAPACITY: usize = 64;

/// A message carried on a producer/consumer channel: either a value emitted
/// by the producer, or an end-of-stream marker (with an error flag if the
/// producer failed mid-stream).
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Item(Value),
    End { failed: bool },
}

#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<StreamMessage>,
}

impl StreamSender {
    /// Publish a value. Blocks (applying back-pressure) when the channel is
    /// full.
    pub async fn publish(&self, value: Value) -> bool {
        self.tx.send(StreamMessage::Item(value)).await.is_ok()
    }

    pub async fn close(&self, failed: bool) {
        let _ = self.tx.send(StreamMessage::End { failed }).await;
    }
}

pub struct StreamReceiver {
    rx: mpsc::Receiver<StreamMessage>,
}

impl StreamReceiver {
    /// Read the next message. Returns `None` once the channel is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<StreamMessage> {
        self.rx.recv().await
    }
}

/// Create a bounded producer/consumer channel pair.
#[must_use]
pub fn channel(capacity: usize) -> (StreamSender, StreamReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (StreamSender { tx }, StreamReceiver { rx })
}

/// The streaming endpoint handed to a task through its `TaskContext`: a
/// producer gets a `Sender`, a consumer gets a `Receiver`.
#[derive(Clone)]
pub enum StreamHandle {
    Producer(StreamSender),
    Consumer(std::sync::Arc<tokio::sync::Mutex<StreamReceiver>>),
}

impl StreamHandle {
    #[must_use]
    pub fn consumer(rx: StreamReceiver) -> Self {
        StreamHandle::Consumer(std::sync::Arc::new(tokio::sync::Mutex::new(rx)))
    }
}
