use forecast_retrain_orchestrator::{
    bootstrap::build_orchestrator, config::RetrainConfig, models::TriggerContext,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RetrainConfig::from_env()?;

    info!(
        threshold = config.settings.threshold.value(),
        max_run_secs = config.settings.max_run_duration.as_secs(),
        "Forecast retraining run starting"
    );

    let orchestrator = build_orchestrator(&config)?;

    let trigger = TriggerContext {
        data_snapshot_ref: std::env::var("RETRAIN_DATA_SNAPSHOT").ok(),
        requested_by: Some("retrainer".to_string()),
    };

    match orchestrator.run(trigger).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Retraining not run: {}", e);
            Err(Box::new(e) as Box<dyn std::error::Error>)
        }
    }
}
