use std::error::Error;

use anyhow::Context;
use tracing::info;

use keyrelay_core::bootstrap_from_env;
use keyrelay_router::app_router;

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("keyrelay failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let boot = bootstrap_from_env().await?;
    let state = boot.state;

    let (bind, config) = {
        let config = state.config();
        (format!("{}:{}", config.host, config.port), config)
    };
    info!(
        host = %config.host,
        port = config.port,
        dsn = %config.dsn,
        upstream = %config.upstream_base_url,
        proxy = %config.proxy.as_deref().unwrap_or(""),
        exhausted_policy = config.exhausted_policy.as_str(),
        health_check_interval_secs = config.health_check_interval_secs,
        "config loaded"
    );

    let snapshot = state.store.load_all().await.context("load credentials")?;
    info!(
        upstream_keys = snapshot.upstream_keys.len(),
        client_tokens = snapshot.client_tokens.len(),
        admin_password_set = snapshot.admin_hash.is_some(),
        "credentials loaded"
    );

    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keyrelay=info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
