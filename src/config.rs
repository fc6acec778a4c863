//! Environment configuration
//!
//! Binaries call `dotenv::dotenv().ok()` first so values may come from a
//! `.env` file as well.

use crate::error::OrchestrationError;
use crate::models::Threshold;
use crate::Result;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MAPE_THRESHOLD: f64 = 20.0;
pub const DEFAULT_MAX_RUN_SECS: u64 = 3600;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_LOCK_KEY: &str = "forecast-retrain-orchestrator";

/// Settings the orchestrator itself needs for a run
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub threshold: Threshold,
    pub max_run_duration: Duration,
    pub runtime_image_ref: String,
    pub lock_key: String,
    pub notify_on_promotion: bool,
    pub notify_on_training_failure: bool,
    pub skip_if_unchanged: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            threshold: Threshold::new(DEFAULT_MAPE_THRESHOLD),
            max_run_duration: Duration::from_secs(DEFAULT_MAX_RUN_SECS),
            runtime_image_ref: "forecast-trainer:latest".to_string(),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            notify_on_promotion: false,
            notify_on_training_failure: true,
            skip_if_unchanged: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrainConfig {
    pub settings: OrchestratorSettings,
    pub poll_interval: Duration,
    pub seed_model_ref: String,
    pub seed_model_metric: f64,
    pub data_snapshot_dir: Option<PathBuf>,
    pub data_snapshot_ref: Option<String>,
    pub training_api_url: Option<String>,
    pub deployer_api_url: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub database_url: Option<String>,
    pub api_port: u16,
}

impl RetrainConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let threshold: f64 = parse_or(&get, "MAPE_THRESHOLD", DEFAULT_MAPE_THRESHOLD)?;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(OrchestrationError::ConfigError(format!(
                "MAPE_THRESHOLD must be a finite non-negative number, got {}",
                threshold
            )));
        }

        let max_run_secs: u64 = parse_or(&get, "RETRAIN_MAX_RUN_SECS", DEFAULT_MAX_RUN_SECS)?;
        if max_run_secs == 0 {
            return Err(OrchestrationError::ConfigError(
                "RETRAIN_MAX_RUN_SECS must be positive".into(),
            ));
        }

        let defaults = OrchestratorSettings::default();
        let settings = OrchestratorSettings {
            threshold: Threshold::new(threshold),
            max_run_duration: Duration::from_secs(max_run_secs),
            runtime_image_ref: get("RUNTIME_IMAGE_REF").unwrap_or(defaults.runtime_image_ref),
            lock_key: get("RETRAIN_LOCK_KEY").unwrap_or(defaults.lock_key),
            notify_on_promotion: parse_bool(&get, "NOTIFY_ON_PROMOTION", defaults.notify_on_promotion)?,
            notify_on_training_failure: parse_bool(
                &get,
                "NOTIFY_ON_TRAINING_FAILURE",
                defaults.notify_on_training_failure,
            )?,
            skip_if_unchanged: parse_bool(&get, "SKIP_IF_UNCHANGED", defaults.skip_if_unchanged)?,
        };

        let port_key = if get("PORT").is_some() { "PORT" } else { "API_PORT" };

        Ok(Self {
            settings,
            poll_interval: Duration::from_secs(parse_or(
                &get,
                "RETRAIN_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            seed_model_ref: get("SEED_MODEL_REF").unwrap_or_else(|| "bootstrap-model".into()),
            seed_model_metric: parse_or(&get, "SEED_MODEL_METRIC", 100.0)?,
            data_snapshot_dir: get("DATA_SNAPSHOT_DIR").map(PathBuf::from),
            data_snapshot_ref: get("DATA_SNAPSHOT_REF"),
            training_api_url: get("TRAINING_API_URL"),
            deployer_api_url: get("DEPLOYER_API_URL"),
            alert_webhook_url: get("ALERT_WEBHOOK_URL"),
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
            api_port: parse_or(&get, port_key, 8080)?,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|e| {
            OrchestrationError::ConfigError(format!("{}='{}' is invalid: {}", key, raw, e))
        }),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(OrchestrationError::ConfigError(format!(
                "{}='{}' is not a boolean",
                key, v
            ))),
        },
    }
}
