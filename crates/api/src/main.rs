use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use complyflow_analysis::{InMemoryInputLocator, simulated};
use complyflow_api::app::{self, AppServices, Backends};
use complyflow_api::config::ServerConfig;
use complyflow_auth::Hs256JwtValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    complyflow_observability::init(&config.log);

    let backends = Backends::from_config(&config).await?;
    let services = AppServices::new(
        backends,
        Arc::new(Hs256JwtValidator::new(&config.jwt_secret)),
        Arc::new(InMemoryInputLocator::accept_any()),
        config.jobs.clone(),
        config.instance_id.clone(),
    );

    let workers = if config.run_workers {
        let pool = services.spawn_workers(simulated::standard_pipeline(Duration::from_millis(500)));
        tracing::info!(workers = pool.len(), "analysis workers started");
        Some(pool)
    } else {
        tracing::info!("RUN_WORKERS disabled; this instance only serves HTTP");
        None
    };

    let app = app::build_app(services);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, instance_id = %config.instance_id, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(pool) = workers {
        pool.shutdown().await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
