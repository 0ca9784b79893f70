// Configuration management for ZipCase
// Environment-driven; validated once at startup

use anyhow::{Context, Result};
use std::env;
use tracing::info;
use validator::{ValidationError, ValidationErrors};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub portal: PortalConfig,
    pub queues: QueueConfig,
    pub server: ServerConfig,
    pub database_url: String,
    /// Base64-encoded 32-byte AES-256-GCM key for credentials at rest.
    pub encryption_key: String,
    pub jwt_secret: String,
    /// Operational alert topic; alerts at ERROR and above are POSTed here.
    pub alert_topic_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    /// Path under the portal root that serves case detail pages.
    pub case_path: String,
    pub timeout_seconds: u64,
    pub requests_per_minute: u32,
    pub burst_limit: u32,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub search_queue: String,
    pub case_data_queue: String,
    pub visibility_timeout_seconds: i64,
    pub max_attempts: u32,
    pub batch_size: i64,
    pub poll_interval_ms: u64,
    pub worker_concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub store_timeout_seconds: u64,
    /// Failed cases older than this are re-queued by a new search.
    pub refresh_window_seconds: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            portal: PortalConfig {
                base_url: require_var("PORTAL_URL")?,
                case_path: var_or("PORTAL_CASE_URL", "Portal/Case/CaseDetail"),
                timeout_seconds: parse_var("PORTAL_TIMEOUT_SECS", 20)?,
                requests_per_minute: parse_var("PORTAL_REQUESTS_PER_MINUTE", 60)?,
                burst_limit: parse_var("PORTAL_BURST_LIMIT", 10)?,
            },
            queues: QueueConfig {
                search_queue: var_or("SEARCH_QUEUE_URL", "search"),
                case_data_queue: var_or("CASE_DATA_QUEUE_URL", "case-data"),
                visibility_timeout_seconds: parse_var("QUEUE_VISIBILITY_TIMEOUT_SECS", 60)?,
                max_attempts: parse_var("QUEUE_MAX_ATTEMPTS", 5)?,
                batch_size: parse_var("QUEUE_BATCH_SIZE", 10)?,
                poll_interval_ms: parse_var("QUEUE_POLL_INTERVAL_MS", 500)?,
                worker_concurrency: parse_var("WORKER_CONCURRENCY", 4)?,
            },
            server: ServerConfig {
                bind_addr: var_or("BIND_ADDR", "0.0.0.0:8080"),
                store_timeout_seconds: parse_var("STORE_TIMEOUT_SECS", 10)?,
                refresh_window_seconds: parse_var("REFRESH_WINDOW_SECS", 900)?,
            },
            database_url: var_or("DATABASE_URL", "sqlite://zipcase.db?mode=rwc"),
            encryption_key: require_var("ENCRYPTION_KEY")?,
            jwt_secret: require_var("JWT_SECRET")?,
            alert_topic_url: env::var("ALERT_TOPIC_URL").ok().filter(|v| !v.is_empty()),
        };

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("configuration validation failed: {}", e))?;

        info!(portal_url = %config.portal.base_url, "Configuration loaded");
        Ok(config)
    }

    /// Cases stuck in `processing` longer than this are eligible for reclaim.
    pub fn processing_stale_seconds(&self) -> i64 {
        self.queues.visibility_timeout_seconds * 10
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if url::Url::parse(&self.portal.base_url).is_err() {
            errors.add("portal_url", ValidationError::new("invalid_url"));
        }
        if self.portal.timeout_seconds == 0 {
            errors.add("portal_timeout_secs", ValidationError::new("min_value"));
        }
        if self.queues.visibility_timeout_seconds <= 0 {
            errors.add("visibility_timeout", ValidationError::new("min_value"));
        }
        if self.queues.max_attempts == 0 {
            errors.add("max_attempts", ValidationError::new("min_value"));
        }
        if self.queues.worker_concurrency == 0 {
            errors.add("worker_concurrency", ValidationError::new("min_value"));
        }
        if self.encryption_key.is_empty() {
            errors.add("encryption_key", ValidationError::new("required"));
        }
        if self.jwt_secret.is_empty() {
            errors.add("jwt_secret", ValidationError::new("required"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn require_var(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{} must be set", name))
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", name, e)),
        Err(_) => Ok(default),
    }
}
