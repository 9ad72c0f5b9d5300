mod aggregator;
mod orphan;
mod problem;
mod reconciler;
mod router;
mod signature;
mod telemetry;
mod webhook;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;

use tokio::sync::watch;
use tracing::{error, info, warn};

use outreach_storage::Database;
use outreach_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect_with(&config.database).await?;
    database.run_migrations().await?;
    info!(
        stage = "storage",
        isolation = database.isolation().as_str(),
        max_connections = config.database.max_connections,
        "database ready"
    );

    if config.webhooks.signature_bypass {
        warn!(
            stage = "app",
            env = %config.environment.as_str(),
            "webhook signature verification is bypassed"
        );
    }

    let state = router::AppState::new(metrics, database.clone(), &config.webhooks, &config.orphans);
    for (provider, verifier) in state.providers().enabled() {
        info!(stage = "app", provider = provider.as_str(), scheme = verifier.scheme(), "provider enabled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = reconciler::OrphanReconciler::new(state.orphans().clone(), state.orphan_config())
        .spawn(shutdown_rx);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    if let Err(err) = reconciler.await {
        error!(stage = "app", error = %err, "orphan reconciler task failed");
    }
    database.close().await;
    info!(stage = "app", "shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(stage = "app", error = %err, "failed to listen for shutdown signal");
    }
}
