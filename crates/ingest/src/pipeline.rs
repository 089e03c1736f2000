//! Ingestion pipeline: broker → decode → store, one message at a time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use devstream_middleware::{ConsumerConfig, DocumentStore, PersistedRecord, Transport};

use crate::error::PipelineError;
use crate::metrics::{self, MESSAGES_EMPTY, MESSAGES_RECEIVED, MESSAGES_UNDECODABLE};
use crate::retry::RetryPolicy;
use crate::sink::{InsertOutcome, StoreSink};
use crate::source::{decode, Decoded, MessageSource, RawMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Initializing,
    Running,
    Draining,
    Stopped,
    Crashed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Initializing => "initializing",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
            PipelineState::Crashed => "crashed",
        }
    }
}

/// How a run that did not crash came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineExit {
    /// The shutdown token was cancelled
    Shutdown,
    /// The broker closed the subscription
    StreamEnded,
}

/// Called for every document that reached the store
#[async_trait]
pub trait RecordListener: Send + Sync {
    async fn on_persisted(&self, record: &PersistedRecord);
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub consumer: ConsumerConfig,
    pub source_retry: RetryPolicy,
    pub sink_retry: RetryPolicy,
    /// Log running totals every this many messages (0 disables)
    pub stats_every: u64,
}

/// Everything a pipeline run needs. Cheap to clone; the supervisor builds a
/// fresh [`Pipeline`] from it on every restart.
#[derive(Clone)]
pub struct PipelineContext {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn DocumentStore>,
    pub settings: PipelineSettings,
    pub listener: Option<Arc<dyn RecordListener>>,
}

#[derive(Debug, Default)]
struct RunStats {
    received: u64,
    inserted: u64,
    dropped: u64,
    skipped: u64,
}

pub struct Pipeline {
    ctx: PipelineContext,
    status: Arc<watch::Sender<PipelineState>>,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        let (tx, _rx) = watch::channel(PipelineState::Initializing);
        Self::with_status(ctx, Arc::new(tx))
    }

    /// Publish state on an existing channel (shared across restarts)
    pub fn with_status(ctx: PipelineContext, status: Arc<watch::Sender<PipelineState>>) -> Self {
        Self { ctx, status }
    }

    pub fn state(&self) -> PipelineState {
        *self.status.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.status.subscribe()
    }

    fn set_state(&self, state: PipelineState) {
        self.status.send_replace(state);
        metrics::set_pipeline_state(state);
        debug!(state = state.as_str(), "Pipeline state changed");
    }

    /// Run until shutdown, end of stream, or a fault.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<PipelineExit, PipelineError> {
        self.set_state(PipelineState::Initializing);

        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before pipeline came up");
                self.set_state(PipelineState::Stopped);
                return Ok(PipelineExit::Shutdown);
            }
            result = self.connect() => result,
        };

        let (mut source, sink) = match connected {
            Ok(adapters) => adapters,
            Err(e) => {
                error!(error = %e, "Pipeline failed to start");
                self.set_state(PipelineState::Crashed);
                return Err(e);
            }
        };

        self.set_state(PipelineState::Running);
        info!(
            subject = %self.ctx.settings.consumer.subject,
            consumer = %self.ctx.settings.consumer.durable_name,
            "Pipeline running"
        );

        let mut stats = RunStats::default();
        let result = self.consume(&mut source, &sink, &shutdown, &mut stats).await;

        if result.is_ok() {
            self.set_state(PipelineState::Draining);
        }
        source.close().await;
        sink.release();

        info!(
            received = stats.received,
            inserted = stats.inserted,
            dropped = stats.dropped,
            skipped = stats.skipped,
            "Pipeline run finished"
        );

        match result {
            Ok(exit) => {
                self.set_state(PipelineState::Stopped);
                Ok(exit)
            }
            Err(e) => {
                error!(error = %e, "Pipeline crashed");
                self.set_state(PipelineState::Crashed);
                Err(e)
            }
        }
    }

    async fn connect(&self) -> Result<(MessageSource, StoreSink), PipelineError> {
        let settings = &self.ctx.settings;
        let source = MessageSource::connect(
            self.ctx.transport.as_ref(),
            &settings.consumer,
            settings.source_retry,
        )
        .await?;

        match StoreSink::connect(self.ctx.store.clone(), settings.sink_retry).await {
            Ok(sink) => Ok((source, sink)),
            Err(e) => {
                source.close().await;
                Err(e.into())
            }
        }
    }

    async fn consume(
        &self,
        source: &mut MessageSource,
        sink: &StoreSink,
        shutdown: &CancellationToken,
        stats: &mut RunStats,
    ) -> Result<PipelineExit, PipelineError> {
        loop {
            // Shutdown is only observed while waiting; a message already
            // received is always handled and acked first.
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, draining pipeline");
                    return Ok(PipelineExit::Shutdown);
                }
                next = source.next_message() => next?,
            };

            let Some(message) = next else {
                warn!("Broker closed the subscription");
                return Ok(PipelineExit::StreamEnded);
            };

            MESSAGES_RECEIVED.inc();
            stats.received += 1;
            self.handle(&message, sink, stats).await;
            source.commit(&message).await?;

            let every = self.ctx.settings.stats_every;
            if every > 0 && stats.received % every == 0 {
                info!(
                    received = stats.received,
                    inserted = stats.inserted,
                    dropped = stats.dropped,
                    skipped = stats.skipped,
                    "Pipeline stats"
                );
            }
        }
    }

    async fn handle(&self, message: &RawMessage, sink: &StoreSink, stats: &mut RunStats) {
        let Some(payload) = &message.payload else {
            debug!(subject = %message.subject, sequence = ?message.sequence, "Skipping empty message");
            MESSAGES_EMPTY.inc();
            stats.skipped += 1;
            return;
        };

        let value = match decode(payload) {
            Decoded::Value(value) => value,
            Decoded::Undecodable => {
                MESSAGES_UNDECODABLE.inc();
                stats.skipped += 1;
                return;
            }
        };

        match sink.insert(value).await {
            InsertOutcome::Inserted(record) => {
                stats.inserted += 1;
                if let Some(listener) = &self.ctx.listener {
                    listener.on_persisted(&record).await;
                }
            }
            InsertOutcome::Dropped(_) => stats.dropped += 1,
        }
    }
}
