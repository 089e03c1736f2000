use std::time::Duration;

use async_nats::jetstream::consumer::pull::MessagesErrorKind;
use async_nats::jetstream::consumer::{pull, AckPolicy, DeliverPolicy};
use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};
use async_nats::jetstream::{self, Context};
use async_nats::ConnectErrorKind;
use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{ConsumerConfig, Subscription, Transport, TransportMessage};

/// JetStream durable pull subscription.
///
/// Holds the message currently being handled so it can be acked by sequence.
struct NatsSubscription {
    client: async_nats::Client,
    messages: pull::Stream,
    in_flight: Option<(u64, jetstream::Message)>,
    durable_name: String,
}

/// A missed idle heartbeat is reported in-band; the pull stream keeps
/// delivering afterwards. Every other stream error ends the subscription.
fn is_transient(kind: &MessagesErrorKind) -> bool {
    matches!(kind, MessagesErrorKind::MissingHeartbeat)
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<TransportMessage>, TransportError> {
        let msg = loop {
            match self.messages.next().await {
                None => return Ok(None),
                Some(Ok(msg)) => break msg,
                Some(Err(e)) if is_transient(&e.kind()) => {
                    warn!(
                        consumer = %self.durable_name,
                        error = %e,
                        "JetStream heartbeat missed, still consuming"
                    );
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        };

        let seq = msg.info().map(|i| i.stream_sequence).unwrap_or(0);
        let transport_msg = TransportMessage {
            subject: msg.subject.to_string(),
            payload: msg.payload.clone(),
            sequence: Some(seq),
        };
        self.in_flight = Some((seq, msg));
        Ok(Some(transport_msg))
    }

    async fn ack(&mut self, sequence: u64) -> Result<(), TransportError> {
        match self.in_flight.take() {
            Some((seq, msg)) if seq == sequence => msg
                .ack()
                .await
                .map_err(|e| TransportError::AckFailed(e.to_string())),
            Some(other) => {
                // Not the message we were asked about; keep it for its own ack.
                self.in_flight = Some(other);
                Err(TransportError::AckFailed(format!(
                    "sequence {} is not in flight",
                    sequence
                )))
            }
            None => Err(TransportError::AckFailed(format!(
                "sequence {} is not in flight",
                sequence
            ))),
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError> {
        // Dropping the pull stream stops fetching; the durable consumer and its
        // ack floor stay on the server for the next subscriber. Acks are only
        // queued on the client, so flush before it goes away.
        debug!(consumer = %self.durable_name, "Closing JetStream subscription");
        self.client
            .flush()
            .await
            .map_err(|e| TransportError::AckFailed(format!("flush on close failed: {}", e)))
    }
}

/// NATS JetStream transport
pub struct NatsTransport {
    url: String,
}

impl NatsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Create or get the JetStream stream carrying telemetry
    async fn ensure_stream(
        jetstream: &Context,
        consumer: &ConsumerConfig,
    ) -> Result<jetstream::stream::Stream, TransportError> {
        let config = Config {
            name: consumer.stream.clone(),
            subjects: vec![consumer.subject.clone()],
            retention: RetentionPolicy::Limits,
            storage: StorageType::File,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            ..Default::default()
        };

        jetstream
            .get_or_create_stream(config)
            .await
            .map_err(|e| TransportError::SubscribeFailed(format!("stream creation failed: {}", e)))
    }
}

fn classify_connect_error(e: async_nats::ConnectError) -> TransportError {
    match e.kind() {
        ConnectErrorKind::Io | ConnectErrorKind::TimedOut | ConnectErrorKind::Dns => {
            TransportError::Unreachable(e.to_string())
        }
        _ => TransportError::Config(e.to_string()),
    }
}

#[async_trait]
impl Transport for NatsTransport {
    async fn subscribe(
        &self,
        consumer: &ConsumerConfig,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        let client = async_nats::connect(&self.url)
            .await
            .map_err(classify_connect_error)?;
        let jetstream = jetstream::new(client.clone());

        let stream = Self::ensure_stream(&jetstream, consumer).await?;
        let pull_consumer = stream
            .get_or_create_consumer(
                &consumer.durable_name,
                pull::Config {
                    durable_name: Some(consumer.durable_name.clone()),
                    filter_subject: consumer.subject.clone(),
                    deliver_policy: DeliverPolicy::All,
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::SubscribeFailed(format!("create consumer failed: {}", e)))?;

        // Heartbeat to detect stale connections
        let messages = pull_consumer
            .stream()
            .heartbeat(Duration::from_secs(5))
            .messages()
            .await
            .map_err(|e| TransportError::SubscribeFailed(format!("get messages failed: {}", e)))?;

        info!(
            url = %self.url,
            stream = %consumer.stream,
            consumer = %consumer.durable_name,
            subject = %consumer.subject,
            "Connected to NATS JetStream"
        );

        Ok(Box::new(NatsSubscription {
            client,
            messages,
            in_flight: None,
            durable_name: consumer.durable_name.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running NATS server with JetStream
    // Run: docker run -p 4222:4222 nats:latest -js

    fn consumer() -> ConsumerConfig {
        ConsumerConfig {
            stream: "TEST_TELEMETRY".to_string(),
            subject: "test.telemetry".to_string(),
            durable_name: "test-consumer".to_string(),
        }
    }

    #[test]
    fn test_only_missed_heartbeat_keeps_consuming() {
        assert!(is_transient(&MessagesErrorKind::MissingHeartbeat));
        assert!(!is_transient(&MessagesErrorKind::ConsumerDeleted));
        assert!(!is_transient(&MessagesErrorKind::Pull));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_retryable() {
        let transport = NatsTransport::new("nats://127.0.0.1:1");
        let err = match transport.subscribe(&consumer()).await {
            Err(e) => e,
            Ok(_) => panic!("nothing listens on port 1"),
        };
        assert!(err.is_retryable(), "unexpected error: {err}");
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_subscribe_receives_published_message() {
        let transport = NatsTransport::new("nats://localhost:4222");
        let mut sub = transport.subscribe(&consumer()).await.unwrap();

        let client = async_nats::connect("nats://localhost:4222").await.unwrap();
        let js = jetstream::new(client);
        js.publish("test.telemetry", r#"{"Device_ID":1150}"#.into())
            .await
            .unwrap()
            .await
            .unwrap();

        let msg = sub.next().await.unwrap().unwrap();
        sub.ack(msg.sequence.unwrap()).await.unwrap();
    }
}
