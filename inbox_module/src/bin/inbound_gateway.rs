use tracing::info;

use inbox_module::service::run_server;
use inbox_module::RouterConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config = RouterConfig::from_env()?;
    info!(
        "inbound gateway config host={} port={} db_path={} workers={}",
        config.server.host,
        config.server.port,
        config.storage.db_path.display(),
        config.dispatch.workers
    );

    run_server(config, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
