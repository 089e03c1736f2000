use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::{self, PIPELINE_RESTARTS};
use crate::pipeline::{Pipeline, PipelineContext, PipelineExit, PipelineState};

/// Keeps a pipeline running: every crash or stream end is followed by a
/// cool-down and a fresh pipeline, until the shutdown token is cancelled.
pub struct Supervisor {
    ctx: PipelineContext,
    restart_delay: Duration,
    status: Arc<watch::Sender<PipelineState>>,
}

impl Supervisor {
    pub fn new(ctx: PipelineContext, restart_delay: Duration) -> Self {
        let (tx, _rx) = watch::channel(PipelineState::Initializing);
        Self {
            ctx,
            restart_delay,
            status: Arc::new(tx),
        }
    }

    /// State of the current (or most recent) pipeline run
    pub fn status(&self) -> watch::Receiver<PipelineState> {
        self.status.subscribe()
    }

    /// Run until shutdown. Returns the number of restarts performed.
    pub async fn run(&self, shutdown: CancellationToken) -> u64 {
        let mut restarts = 0u64;

        loop {
            let pipeline = Pipeline::with_status(self.ctx.clone(), self.status.clone());
            match pipeline.run(shutdown.clone()).await {
                Ok(PipelineExit::Shutdown) => break,
                Ok(PipelineExit::StreamEnded) => {
                    warn!(
                        delay_secs = self.restart_delay.as_secs(),
                        "Stream ended, restarting pipeline after cool-down"
                    );
                }
                Err(e) => {
                    error!(
                        error = %e,
                        delay_secs = self.restart_delay.as_secs(),
                        "Pipeline crashed, restarting after cool-down"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during restart cool-down");
                    break;
                }
                _ = tokio::time::sleep(self.restart_delay) => {}
            }

            restarts += 1;
            PIPELINE_RESTARTS.inc();
            info!(restarts, "Restarting pipeline");
        }

        self.status.send_replace(PipelineState::Stopped);
        metrics::set_pipeline_state(PipelineState::Stopped);
        info!(restarts, "Supervisor stopped");
        restarts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineSettings;
    use crate::retry::RetryPolicy;
    use devstream_middleware::memory::{InMemoryStore, InMemoryTransport};
    use devstream_middleware::ConsumerConfig;

    fn context(transport: &InMemoryTransport, store: &Arc<InMemoryStore>) -> PipelineContext {
        let retry = RetryPolicy {
            max_retries: 2,
            retry_interval: Duration::from_secs(5),
        };
        PipelineContext {
            transport: Arc::new(transport.clone()),
            store: store.clone(),
            settings: PipelineSettings {
                consumer: ConsumerConfig {
                    stream: "TELEMETRY".to_string(),
                    subject: "devices.telemetry".to_string(),
                    durable_name: "ingest".to_string(),
                },
                source_retry: retry,
                sink_retry: retry,
                stats_every: 0,
            },
            listener: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_cool_down_never_restarts() {
        let transport = InMemoryTransport::new();
        transport.set_misconfigured(true);
        let store = Arc::new(InMemoryStore::new());

        let supervisor = Supervisor::new(context(&transport, &store), Duration::from_secs(10));
        let mut status = supervisor.status();
        let shutdown = CancellationToken::new();

        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                status
                    .wait_for(|s| *s == PipelineState::Crashed)
                    .await
                    .map(|_| ())
                    .unwrap();
                shutdown.cancel();
            })
        };

        let restarts = supervisor.run(shutdown).await;
        canceller.await.unwrap();

        assert_eq!(restarts, 0);
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(*supervisor.status().borrow(), PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_cool_down() {
        let transport = InMemoryTransport::new();
        transport.set_misconfigured(true);
        let store = Arc::new(InMemoryStore::new());

        let supervisor = Supervisor::new(context(&transport, &store), Duration::from_secs(10));
        let shutdown = CancellationToken::new();

        let canceller = {
            let shutdown = shutdown.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                // Three failed runs: t=0, t=10, t=20
                tokio::time::sleep(Duration::from_secs(25)).await;
                assert_eq!(transport.connect_attempts(), 3);
                shutdown.cancel();
            })
        };

        let restarts = supervisor.run(shutdown).await;
        canceller.await.unwrap();
        assert_eq!(restarts, 2);
    }
}
