use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// One broker delivery
#[derive(Debug, Clone)]
pub struct TransportMessage {
    pub subject: String,
    pub payload: Bytes,
    pub sequence: Option<u64>,
}

/// Durable consumer identity. The consumer name is fixed per deployment so a
/// restarted process resumes from the last acknowledged position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub stream: String,
    pub subject: String,
    pub durable_name: String,
}

/// Subscription handle for receiving messages
#[async_trait]
pub trait Subscription: Send {
    /// Receive next message (blocks until available). `None` means the
    /// broker closed the subscription.
    async fn next(&mut self) -> Result<Option<TransportMessage>, TransportError>;

    /// Acknowledge a message once it has been handled
    async fn ack(&mut self, sequence: u64) -> Result<(), TransportError>;

    /// Unsubscribe and close
    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError>;
}

/// Transport abstraction for durable, at-least-once consumption.
///
/// Each call to `subscribe` establishes its own broker connection, so a
/// failed call can simply be retried.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a durable subscription starting at the earliest unacknowledged message
    async fn subscribe(
        &self,
        consumer: &ConsumerConfig,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}
