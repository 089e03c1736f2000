use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;

use crate::error::TransportError;
use crate::transport::{ConsumerConfig, Subscription, Transport, TransportMessage};

#[derive(Default)]
struct Shared {
    /// Append-only log per subject; sequence = index + 1
    logs: DashMap<String, Vec<TransportMessage>>,
    /// Last acknowledged sequence per durable consumer
    committed: DashMap<String, u64>,
    notify: Notify,
    /// Bumped to end every open subscription
    epoch: AtomicU64,
    connect_attempts: AtomicU32,
    unreachable_remaining: AtomicU32,
    misconfigured: AtomicBool,
    receive_faults: AtomicU32,
}

/// In-memory broker with durable-consumer semantics: a subscription resumes
/// after the last acknowledged message of its durable name, so unacknowledged
/// messages are redelivered.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to a subject's log
    pub fn publish(&self, subject: &str, payload: Bytes) -> u64 {
        let seq = {
            let mut log = self.shared.logs.entry(subject.to_string()).or_default();
            let seq = log.len() as u64 + 1;
            log.push(TransportMessage {
                subject: subject.to_string(),
                payload,
                sequence: Some(seq),
            });
            seq
        };
        self.shared.notify.notify_waiters();
        seq
    }

    /// Fail the next `attempts` subscribe calls as if no broker were reachable
    pub fn fail_next_connects(&self, attempts: u32) {
        self.shared
            .unreachable_remaining
            .store(attempts, Ordering::SeqCst);
    }

    /// Fail every subscribe call with a configuration error
    pub fn set_misconfigured(&self, misconfigured: bool) {
        self.shared.misconfigured.store(misconfigured, Ordering::SeqCst);
    }

    /// Make the next `count` receives fail with a transport error
    pub fn inject_receive_faults(&self, count: u32) {
        self.shared.receive_faults.store(count, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// End every open subscription, as a broker-side close would
    pub fn close_subscriptions(&self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Last acknowledged sequence for a durable consumer
    pub fn committed(&self, durable_name: &str) -> u64 {
        self.shared
            .committed
            .get(durable_name)
            .map(|c| *c)
            .unwrap_or(0)
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    subject: String,
    durable_name: String,
    cursor: usize,
    epoch: u64,
}

impl InMemorySubscription {
    fn take_receive_fault(&self) -> bool {
        self.shared
            .receive_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<Option<TransportMessage>, TransportError> {
        loop {
            // Register for wakeups before checking, so a publish between the
            // check and the await is not lost.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.take_receive_fault() {
                return Err(TransportError::ReceiveFailed(
                    "injected receive fault".to_string(),
                ));
            }
            if self.shared.epoch.load(Ordering::SeqCst) != self.epoch {
                return Ok(None);
            }

            let msg = self
                .shared
                .logs
                .get(&self.subject)
                .and_then(|log| log.get(self.cursor).cloned());
            if let Some(msg) = msg {
                self.cursor += 1;
                return Ok(Some(msg));
            }

            notified.await;
        }
    }

    async fn ack(&mut self, sequence: u64) -> Result<(), TransportError> {
        let mut committed = self
            .shared
            .committed
            .entry(self.durable_name.clone())
            .or_insert(0);
        if sequence > *committed {
            *committed = sequence;
        }
        Ok(())
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn subscribe(
        &self,
        consumer: &ConsumerConfig,
    ) -> Result<Box<dyn Subscription>, TransportError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.shared.misconfigured.load(Ordering::SeqCst) {
            return Err(TransportError::Config(
                "in-memory transport marked misconfigured".to_string(),
            ));
        }
        let unreachable = self
            .shared
            .unreachable_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if unreachable {
            return Err(TransportError::Unreachable("memory://broker".to_string()));
        }

        let cursor = self.committed(&consumer.durable_name) as usize;
        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            subject: consumer.subject.clone(),
            durable_name: consumer.durable_name.clone(),
            cursor,
            epoch: self.shared.epoch.load(Ordering::SeqCst),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer(name: &str) -> ConsumerConfig {
        ConsumerConfig {
            stream: "TELEMETRY".to_string(),
            subject: "devices.telemetry".to_string(),
            durable_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let transport = InMemoryTransport::new();
        let mut sub = transport.subscribe(&consumer("c1")).await.unwrap();
        transport.publish("devices.telemetry", Bytes::from("hello"));
        let msg = sub.next().await.unwrap().unwrap();
        assert_eq!(msg.subject, "devices.telemetry");
        assert_eq!(msg.payload, Bytes::from("hello"));
        assert_eq!(msg.sequence, Some(1));
    }

    #[tokio::test]
    async fn test_subscription_starts_at_earliest() {
        let transport = InMemoryTransport::new();
        transport.publish("devices.telemetry", Bytes::from("1"));
        transport.publish("devices.telemetry", Bytes::from("2"));

        let mut sub = transport.subscribe(&consumer("c1")).await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().payload, Bytes::from("1"));
        assert_eq!(sub.next().await.unwrap().unwrap().payload, Bytes::from("2"));
    }

    #[tokio::test]
    async fn test_resubscribe_redelivers_unacked() {
        let transport = InMemoryTransport::new();
        transport.publish("devices.telemetry", Bytes::from("1"));
        transport.publish("devices.telemetry", Bytes::from("2"));

        let mut sub = transport.subscribe(&consumer("c1")).await.unwrap();
        let first = sub.next().await.unwrap().unwrap();
        sub.ack(first.sequence.unwrap()).await.unwrap();
        let _second = sub.next().await.unwrap().unwrap();
        sub.unsubscribe().await.unwrap();

        let mut sub = transport.subscribe(&consumer("c1")).await.unwrap();
        let redelivered = sub.next().await.unwrap().unwrap();
        assert_eq!(redelivered.payload, Bytes::from("2"));
        assert_eq!(transport.committed("c1"), 1);
    }

    #[tokio::test]
    async fn test_durable_names_are_independent() {
        let transport = InMemoryTransport::new();
        transport.publish("devices.telemetry", Bytes::from("1"));

        let mut a = transport.subscribe(&consumer("a")).await.unwrap();
        let msg = a.next().await.unwrap().unwrap();
        a.ack(msg.sequence.unwrap()).await.unwrap();

        let mut b = transport.subscribe(&consumer("b")).await.unwrap();
        assert_eq!(b.next().await.unwrap().unwrap().payload, Bytes::from("1"));
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let transport = InMemoryTransport::new();
        transport.fail_next_connects(2);

        assert!(matches!(
            transport.subscribe(&consumer("c1")).await,
            Err(TransportError::Unreachable(_))
        ));
        assert!(transport.subscribe(&consumer("c1")).await.is_err());
        assert!(transport.subscribe(&consumer("c1")).await.is_ok());
        assert_eq!(transport.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_close_subscriptions_ends_stream() {
        let transport = InMemoryTransport::new();
        let mut sub = transport.subscribe(&consumer("c1")).await.unwrap();

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::task::yield_now().await;
        transport.close_subscriptions();

        let result = waiter.await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_injected_receive_fault() {
        let transport = InMemoryTransport::new();
        let mut sub = transport.subscribe(&consumer("c1")).await.unwrap();
        transport.inject_receive_faults(1);
        assert!(matches!(
            sub.next().await,
            Err(TransportError::ReceiveFailed(_))
        ));
    }
}
