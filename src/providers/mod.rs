// Provider layer for ZipCase
// Handles the outbound integration with the court portal

pub mod parser;
pub mod portal;
pub mod rate_limiter;

use thiserror::Error;

// Portal error types
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Portal is busy")]
    Busy,

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Parsing error: {0}")]
    Parsing(String),
}

pub type PortalResult<T> = Result<T, PortalError>;

impl PortalError {
    /// Transient failures leave the queue message unacked so it is
    /// redelivered; everything else records a terminal status.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PortalError::Network(_) | PortalError::ServiceUnavailable(_)
        )
    }
}

/// Stable accept/language set sent with every portal request. The user-agent
/// is supplied separately from the per-user bank.
pub fn default_headers() -> [(&'static str, &'static str); 3] {
    [
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
        ("Accept-Language", "en-US,en;q=0.9"),
        ("Cache-Control", "no-cache"),
    ]
}

/// Process-wide fallback user-agent bank. Per-user assignments persist in the
/// credential store and rotate through this collection.
pub const USER_AGENT_COLLECTION: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
];
