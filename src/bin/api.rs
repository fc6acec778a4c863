use forecast_retrain_orchestrator::{
    api::start_server, bootstrap::build_orchestrator, config::RetrainConfig,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RetrainConfig::from_env()?;

    info!("Forecast Retraining Orchestrator - API Server");
    info!(port = config.api_port, threshold = config.settings.threshold.value(), "Configuration loaded");

    let orchestrator = Arc::new(build_orchestrator(&config)?);

    info!("Orchestrator initialized");

    start_server(orchestrator, config.seed_model_ref.clone(), config.api_port).await?;

    Ok(())
}
