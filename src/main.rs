//! model-switcher - keeps one vLLM backend awake on a shared GPU
//!
//! Loads the backend list, reconciles with what the backends report, and
//! serves the switching API until interrupted.

use anyhow::Context;
use clap::Parser as _;
use model_switcher::config::{Config, ConfigFile};
use model_switcher::{
    HttpBackendClient, Registry, Switcher, SystemRam, build_metrics_layer_and_handle,
    build_metrics_router, build_router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, instrument};
use tracing_subscriber::EnvFilter;

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    let default_directives = if config.verbose {
        "model_switcher=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = config.validate()?;
    info!("Starting model switcher with config: {:?}", config);

    let file = ConfigFile::from_file(&config.config).await?;
    info!(
        backends = ?file.backends.iter().map(|b| b.id.as_str()).collect::<Vec<_>>(),
        "Configuration loaded"
    );

    let registry = Arc::new(
        Registry::new(file.backends.clone()).context("Failed to build backend registry")?,
    );
    let client = Arc::new(HttpBackendClient::new(file.switching.request_timeout()));
    let switcher = Switcher::new(
        registry,
        client,
        Arc::new(SystemRam::new()),
        file.switching.switcher_config(),
    );
    switcher.start();

    let mut router = build_router(switcher.clone());

    if config.metrics {
        let (prometheus_layer, handle) =
            build_metrics_layer_and_handle(config.metrics_prefix.clone());
        router = router.layer(prometheus_layer);

        let metrics_router = build_metrics_router(handle);
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {metrics_addr}"))?;
        info!("Metrics server listening on {}", metrics_addr);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                tracing::error!(error = %e, "Metrics server error");
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!("Model switcher listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    switcher.shutdown().await;
    info!("Model switcher stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
