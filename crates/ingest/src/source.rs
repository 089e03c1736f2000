//! Message Source Adapter: durable broker subscription with bounded connect
//! retry and lenient payload decoding.

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, warn};

use devstream_middleware::{ConsumerConfig, Subscription, Transport};

use crate::error::SourceError;
use crate::retry::{connect_with_retry, RetryFailure, RetryPolicy};

/// One delivery from the broker
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub subject: String,
    pub sequence: Option<u64>,
    /// `None` when the broker delivered an empty body
    pub payload: Option<Bytes>,
}

/// Result of decoding a payload. Never an error: one bad message must not
/// stop the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Value(Value),
    Undecodable,
}

/// Parse a payload as JSON, logging (not raising) on failure
pub fn decode(payload: &[u8]) -> Decoded {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => Decoded::Value(value),
        Err(e) => {
            warn!(
                payload = %String::from_utf8_lossy(payload),
                error = %e,
                "Invalid JSON received"
            );
            Decoded::Undecodable
        }
    }
}

pub struct MessageSource {
    subscription: Box<dyn Subscription>,
    consumer: ConsumerConfig,
    failed_attempts: u32,
}

impl MessageSource {
    /// Subscribe, retrying while no broker is reachable.
    ///
    /// Any other construction error is returned immediately.
    pub async fn connect(
        transport: &dyn Transport,
        consumer: &ConsumerConfig,
        retry: RetryPolicy,
    ) -> Result<Self, SourceError> {
        let connected = connect_with_retry(
            "broker",
            retry,
            |e: &devstream_middleware::TransportError| e.is_retryable(),
            || transport.subscribe(consumer),
        )
        .await
        .map_err(|failure| match failure {
            RetryFailure::Fatal(e) => SourceError::Connect(e),
            RetryFailure::Exhausted { attempts, last } => {
                SourceError::RetriesExhausted { attempts, last }
            }
        })?;

        info!(
            stream = %consumer.stream,
            consumer = %consumer.durable_name,
            subject = %consumer.subject,
            "Successfully connected to broker"
        );

        Ok(Self {
            subscription: connected.value,
            consumer: consumer.clone(),
            failed_attempts: connected.failed_attempts,
        })
    }

    /// Connection attempts that failed before this source came up
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Wait for the next delivery. `Ok(None)` is end of stream.
    pub async fn next_message(&mut self) -> Result<Option<RawMessage>, SourceError> {
        let msg = match self.subscription.next().await.map_err(SourceError::Receive)? {
            Some(msg) => msg,
            None => return Ok(None),
        };

        let payload = (!msg.payload.is_empty()).then_some(msg.payload);
        Ok(Some(RawMessage {
            subject: msg.subject,
            sequence: msg.sequence,
            payload,
        }))
    }

    /// Acknowledge a handled message so it is not redelivered
    pub async fn commit(&mut self, message: &RawMessage) -> Result<(), SourceError> {
        match message.sequence {
            Some(seq) => self
                .subscription
                .ack(seq)
                .await
                .map_err(SourceError::Commit),
            None => Ok(()),
        }
    }

    /// Release the broker connection
    pub async fn close(self) {
        let consumer = self.consumer.durable_name;
        match self.subscription.unsubscribe().await {
            Ok(()) => info!(consumer = %consumer, "Broker subscription closed"),
            Err(e) => warn!(consumer = %consumer, error = %e, "Error closing broker subscription"),
        }
        debug!(consumer = %consumer, "Message source released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstream_middleware::memory::InMemoryTransport;
    use std::time::Duration;

    fn consumer() -> ConsumerConfig {
        ConsumerConfig {
            stream: "TELEMETRY".to_string(),
            subject: "devices.telemetry".to_string(),
            durable_name: "ingest".to_string(),
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_decode_object() {
        let decoded = decode(br#"{"Device_ID": 1150, "Battery_Level": 3.7}"#);
        match decoded {
            Decoded::Value(Value::Object(map)) => assert_eq!(map["Device_ID"], 1150),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_non_object_is_still_a_value() {
        assert_eq!(decode(b"[1,2,3]"), Decoded::Value(serde_json::json!([1, 2, 3])));
    }

    #[test]
    fn test_decode_garbage_is_undecodable() {
        assert_eq!(decode(b"\xff\xfe not json"), Decoded::Undecodable);
        assert_eq!(decode(b"{\"Device_ID\": "), Decoded::Undecodable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_unreachable_broker() {
        let transport = InMemoryTransport::new();
        transport.fail_next_connects(3);

        let source = MessageSource::connect(&transport, &consumer(), fast_retry(5))
            .await
            .unwrap();
        assert_eq!(source.failed_attempts(), 3);
        assert_eq!(transport.connect_attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_gives_up_after_budget() {
        let transport = InMemoryTransport::new();
        transport.fail_next_connects(10);

        let result = MessageSource::connect(&transport, &consumer(), fast_retry(5)).await;
        assert!(matches!(
            result,
            Err(SourceError::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(transport.connect_attempts(), 5);
    }

    #[tokio::test]
    async fn test_connect_misconfiguration_is_fatal() {
        let transport = InMemoryTransport::new();
        transport.set_misconfigured(true);

        let result = MessageSource::connect(&transport, &consumer(), fast_retry(5)).await;
        assert!(matches!(result, Err(SourceError::Connect(_))));
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_empty_payload_is_none() {
        let transport = InMemoryTransport::new();
        transport.publish("devices.telemetry", Bytes::new());
        transport.publish("devices.telemetry", Bytes::from(r#"{"a":1}"#));

        let mut source = MessageSource::connect(&transport, &consumer(), fast_retry(1))
            .await
            .unwrap();
        let empty = source.next_message().await.unwrap().unwrap();
        assert!(empty.payload.is_none());
        let full = source.next_message().await.unwrap().unwrap();
        assert_eq!(full.payload, Some(Bytes::from(r#"{"a":1}"#)));
    }

    #[tokio::test]
    async fn test_commit_advances_durable_position() {
        let transport = InMemoryTransport::new();
        transport.publish("devices.telemetry", Bytes::from("{}"));

        let mut source = MessageSource::connect(&transport, &consumer(), fast_retry(1))
            .await
            .unwrap();
        let msg = source.next_message().await.unwrap().unwrap();
        source.commit(&msg).await.unwrap();
        source.close().await;

        assert_eq!(transport.committed("ingest"), 1);
    }
}
