//! devstream binary entry point

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use devstream_ingest::{PipelineContext, Supervisor};
use devstream_middleware::memory::{InMemoryStore, InMemoryTransport};
use devstream_middleware::nats::NatsTransport;
use devstream_middleware::postgres::PostgresStore;
use devstream_middleware::{DocumentStore, Transport};
use devstream_server::notifier::BroadcastNotifier;
use devstream_server::{
    api, local, shutdown, AppState, Config, ConnectionRegistry, JwtAuthorizer, QueryService,
};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Broker and store handles. In memory mode the broker handle is also
/// returned so the local feed can publish into it.
type Backends = (
    Arc<dyn Transport>,
    Arc<dyn DocumentStore>,
    Option<InMemoryTransport>,
);

fn backends(config: &Config) -> anyhow::Result<Backends> {
    if config.memory {
        warn!("Running with in-memory broker and store; data is not persisted");
        let transport = InMemoryTransport::new();
        return Ok((
            Arc::new(transport.clone()),
            Arc::new(InMemoryStore::new()),
            Some(transport),
        ));
    }

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required")?;
    let store = PostgresStore::new(database_url, &config.store_table)
        .context("failed to configure document store")?;
    Ok((
        Arc::new(NatsTransport::new(&config.nats_url)),
        Arc::new(store),
        None,
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);
    config.validate()?;

    info!(
        nats_url = %config.nats_url,
        stream = %config.nats_stream,
        subject = %config.nats_subject,
        consumer = %config.consumer_name,
        listen_addr = %config.listen_addr,
        memory = config.memory,
        "devstream starting"
    );

    // One store handle shared by the pipeline and the query side
    let (transport, store, local_feed) = backends(&config)?;
    let registry = Arc::new(ConnectionRegistry::new());

    let supervisor = Supervisor::new(
        PipelineContext {
            transport,
            store: store.clone(),
            settings: config.pipeline_settings(),
            listener: Some(Arc::new(BroadcastNotifier::new(registry.clone()))),
        },
        config.restart_delay(),
    );

    let state = Arc::new(AppState {
        queries: QueryService::new(store, config.device_id_field.clone()),
        registry,
        authorizer: Arc::new(JwtAuthorizer::new(&config.jwt_secret_key)),
        pipeline_status: supervisor.status(),
    });

    let shutdown_token = CancellationToken::new();
    tokio::spawn(shutdown::cancel_on_signal(shutdown_token.clone()));

    if let Some(feed) = local_feed {
        let subject = config.nats_subject.clone();
        info!(subject = %subject, "Publishing JSON lines from stdin to the in-memory broker");
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = local::feed_lines(stdin, &feed, &subject).await {
                warn!(error = %e, "Local feed stopped");
            }
        });
    }

    let ingest = {
        let token = shutdown_token.clone();
        tokio::spawn(async move { supervisor.run(token).await })
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "API server listening");

    let server_token = shutdown_token.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
        .context("API server failed")?;

    // The server can also stop on its own; make sure ingestion follows
    shutdown_token.cancel();
    let restarts = ingest.await.context("ingestion task panicked")?;

    info!(restarts, "devstream stopped");
    Ok(())
}
