//! Configuration module for statement-service.

use crate::services::extraction::HttpExtractionConfig;
use crate::workers::{IngestionConfig, QueueConfig};
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StatementServiceConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub extraction: ExtractionConfig,
    pub queue: QueueSettings,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub local_path: String,
}

#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub metrics_window_days: i64,
    pub recurring_lookback_days: i64,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl StatementServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "statement-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            storage: StorageConfig {
                local_path: env::var("STORAGE_LOCAL_PATH")
                    .unwrap_or_else(|_| "storage".to_string()),
            },
            extraction: ExtractionConfig {
                endpoint: env::var("EXTRACTION_ENDPOINT").unwrap_or_default(),
                api_key: env::var("EXTRACTION_API_KEY").ok(),
                model: env::var("EXTRACTION_MODEL").ok(),
                timeout_secs: env_or("EXTRACTION_TIMEOUT_SECS", 90),
            },
            queue: QueueSettings {
                max_concurrent: env_or("QUEUE_MAX_CONCURRENT", 3),
                poll_interval_ms: env_or("QUEUE_POLL_INTERVAL_MS", 2000),
                shutdown_grace_secs: env_or("QUEUE_SHUTDOWN_GRACE_SECS", 30),
            },
            pipeline: PipelineConfig {
                metrics_window_days: env_or("METRICS_WINDOW_DAYS", 30),
                recurring_lookback_days: env_or("RECURRING_LOOKBACK_DAYS", 730),
            },
        })
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction.timeout_secs)
    }

    pub fn http_extraction(&self) -> HttpExtractionConfig {
        HttpExtractionConfig {
            endpoint: self.extraction.endpoint.clone(),
            api_key: self.extraction.api_key.clone(),
            model: self.extraction.model.clone(),
            timeout: self.extraction_timeout(),
        }
    }

    pub fn ingestion(&self) -> IngestionConfig {
        IngestionConfig {
            extraction_timeout: self.extraction_timeout(),
            metrics_window_days: self.pipeline.metrics_window_days,
            recurring_lookback_days: self.pipeline.recurring_lookback_days,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.queue.max_concurrent,
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.queue.shutdown_grace_secs)
    }
}
