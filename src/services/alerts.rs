// Operational alerting
// Structured log for every alert; ERROR and above also notify the topic

use chrono::Utc;
use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCategory {
    Auth,
    Portal,
    Database,
    System,
    Network,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertCategory::Auth => write!(f, "AUTH"),
            AlertCategory::Portal => write!(f, "PORTAL"),
            AlertCategory::Database => write!(f, "DATABASE"),
            AlertCategory::System => write!(f, "SYSTEM"),
            AlertCategory::Network => write!(f, "NETWORK"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "INFO"),
            AlertSeverity::Warning => write!(f, "WARNING"),
            AlertSeverity::Error => write!(f, "ERROR"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Entity context attached to every alert.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_id: Option<String>,
}

impl AlertContext {
    pub fn for_case(user_id: &str, case_number: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            case_number: Some(case_number.to_string()),
            search_id: None,
        }
    }

    pub fn for_search(user_id: &str, search_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            case_number: None,
            search_id: Some(search_id.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertEnvelope<'a> {
    id: String,
    severity: AlertSeverity,
    category: AlertCategory,
    message: &'a str,
    #[serde(flatten)]
    context: &'a AlertContext,
    timestamp: String,
}

pub struct Alerter {
    client: reqwest::Client,
    topic_url: Option<String>,
}

impl Alerter {
    pub fn new(topic_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            topic_url,
        }
    }

    /// Emit an alert. Everything is logged with its category and context;
    /// severity ERROR and above is also posted to the operational topic.
    pub async fn alert(
        &self,
        severity: AlertSeverity,
        category: AlertCategory,
        message: &str,
        context: AlertContext,
    ) {
        match severity {
            AlertSeverity::Info => info!(
                category = %category,
                user_id = context.user_id.as_deref().unwrap_or("-"),
                case_number = context.case_number.as_deref().unwrap_or("-"),
                search_id = context.search_id.as_deref().unwrap_or("-"),
                "{}",
                message
            ),
            AlertSeverity::Warning => warn!(
                category = %category,
                user_id = context.user_id.as_deref().unwrap_or("-"),
                case_number = context.case_number.as_deref().unwrap_or("-"),
                search_id = context.search_id.as_deref().unwrap_or("-"),
                "{}",
                message
            ),
            AlertSeverity::Error | AlertSeverity::Critical => error!(
                category = %category,
                severity = %severity,
                user_id = context.user_id.as_deref().unwrap_or("-"),
                case_number = context.case_number.as_deref().unwrap_or("-"),
                search_id = context.search_id.as_deref().unwrap_or("-"),
                "{}",
                message
            ),
        }

        if severity < AlertSeverity::Error {
            return;
        }

        let Some(topic_url) = &self.topic_url else {
            return;
        };

        let envelope = AlertEnvelope {
            id: Uuid::new_v4().to_string(),
            severity,
            category,
            message,
            context: &context,
            timestamp: Utc::now().to_rfc3339(),
        };

        if let Err(e) = self.client.post(topic_url).json(&envelope).send().await {
            warn!("Failed to publish alert to topic: {}", e);
        }
    }
}
