use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `token` on SIGTERM (pod termination) or ctrl-c.
///
/// If the signal handlers cannot be installed the token is cancelled
/// immediately rather than leaving the process unstoppable.
pub async fn cancel_on_signal(token: CancellationToken) {
    if let Err(e) = shutdown_signal().await {
        error!(error = %e, "Failed to listen for shutdown signals");
    }
    token.cancel();
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down gracefully"),
        _ = sigint.recv() => info!("SIGINT received, shutting down gracefully"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down gracefully");
    Ok(())
}
