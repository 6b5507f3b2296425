//! Task queue abstractions
//!
//! A [`TaskSource`] yields [`TaskMessage`]s. Each message is settled exactly
//! once: [`TaskMessage::acknowledge`] and [`TaskMessage::reject`] consume the
//! message, so a second disposition does not compile.

use async_trait::async_trait;

use crate::error::QueueError;

/// Broker-side settlement of a single delivery
#[async_trait]
pub trait MessageAcker: Send + Sync {
    /// Removes the message from the queue permanently
    async fn ack(&self) -> Result<(), QueueError>;

    /// Rejects the message; `requeue` asks the broker to redeliver it
    async fn nack(&self, requeue: bool) -> Result<(), QueueError>;
}

/// One delivered build request
pub struct TaskMessage {
    payload: Vec<u8>,
    delivery_count: Option<u32>,
    acker: Box<dyn MessageAcker>,
}

impl std::fmt::Debug for TaskMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMessage")
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

impl TaskMessage {
    /// Creates a message
    ///
    /// # Arguments
    /// * `payload` - Raw message body
    /// * `delivery_count` - Previous deliveries reported by the broker, if known
    /// * `acker` - Settles the delivery with the broker
    pub fn new(
        payload: Vec<u8>,
        delivery_count: Option<u32>,
        acker: impl MessageAcker + 'static,
    ) -> Self {
        Self {
            payload,
            delivery_count,
            acker: Box::new(acker),
        }
    }

    /// Raw message body
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Number of earlier deliveries of this message, when the broker tracks it
    pub fn delivery_count(&self) -> Option<u32> {
        self.delivery_count
    }

    /// Acknowledges the message (task succeeded)
    pub async fn acknowledge(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    /// Rejects the message (task failed)
    pub async fn reject(self, requeue: bool) -> Result<(), QueueError> {
        self.acker.nack(requeue).await
    }
}

/// Source of incoming task messages
#[async_trait]
pub trait TaskSource: Send {
    /// Waits for the next message
    ///
    /// Returns `None` once the source is closed.
    async fn next_message(&mut self) -> Option<Result<TaskMessage, QueueError>>;
}
