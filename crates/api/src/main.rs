use aetos_infra::OrchestratorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    aetos_observability::init();

    let config = OrchestratorConfig::from_env();
    if config.database_url.is_none() {
        tracing::warn!("DATABASE_URL not set; using the in-memory store");
    }
    if config.redis_url.is_none() {
        tracing::warn!("REDIS_URL not set; using the in-memory broker");
    }

    let orchestrator = aetos_api::app::Orchestrator::start(&config).await?;
    let app = aetos_api::app::build_app(orchestrator.services());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}
