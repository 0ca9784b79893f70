// Core domain models for the ZipCase fetch pipeline

pub mod case_number;
pub mod name;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Failure reasons surfaced to clients inside `FetchStatus::Failed` or the
/// API error envelope.
pub mod reason {
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NO_CREDENTIALS: &str = "no_credentials";
    pub const BAD_CREDENTIALS: &str = "bad_credentials";
    pub const PORTAL_UNAVAILABLE: &str = "portal_unavailable";
    pub const PORTAL_BUSY: &str = "portal_busy";
    pub const NOT_FOUND: &str = "not_found";
    pub const PERSISTENT_CORRUPTION: &str = "persistent_corruption";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
    pub const INTERNAL: &str = "internal";
}

/// Per-case lifecycle state. Polling clients stop on `Complete`, `Failed`
/// and `NotFound`; everything else means work is still in flight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum FetchStatus {
    Queued,
    Processing,
    Found,
    NotFound,
    Failed {
        message: String,
    },
    Complete,
    #[serde(rename_all = "camelCase")]
    Reprocessing {
        try_count: u32,
    },
}

impl FetchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FetchStatus::Complete | FetchStatus::Failed { .. } | FetchStatus::NotFound
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        FetchStatus::Failed {
            message: message.into(),
        }
    }

    /// Column discriminator used by the case store.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchStatus::Queued => "queued",
            FetchStatus::Processing => "processing",
            FetchStatus::Found => "found",
            FetchStatus::NotFound => "notFound",
            FetchStatus::Failed { .. } => "failed",
            FetchStatus::Complete => "complete",
            FetchStatus::Reprocessing { .. } => "reprocessing",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            FetchStatus::Failed { message } => Some(message),
            _ => None,
        }
    }

    /// Rebuild a status from its store columns. Unknown discriminators map to
    /// `Queued` so a partially migrated row never poisons a batch read.
    pub fn from_columns(kind: &str, message: Option<String>, try_count: u32) -> Self {
        match kind {
            "processing" => FetchStatus::Processing,
            "found" => FetchStatus::Found,
            "notFound" => FetchStatus::NotFound,
            "failed" => FetchStatus::Failed {
                message: message.unwrap_or_else(|| reason::INTERNAL.to_string()),
            },
            "complete" => FetchStatus::Complete,
            "reprocessing" => FetchStatus::Reprocessing { try_count },
            _ => FetchStatus::Queued,
        }
    }
}

/// Identity row for a case: the portal-facing state machine plus the resolved
/// portal identifier. The parsed summary lives under a separate key so a
/// corrupted summary cannot destroy the case identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ZipCase {
    pub case_number: String,
    pub fetch_status: FetchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
}

impl ZipCase {
    pub fn queued(case_number: impl Into<String>) -> Self {
        Self {
            case_number: case_number.into(),
            fetch_status: FetchStatus::Queued,
            last_updated: Some(Utc::now()),
            case_id: None,
        }
    }
}

/// Parsed case detail. All three fields are required: a stored summary that
/// fails to deserialize into this shape is treated as corrupted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseSummary {
    pub case_name: String,
    pub court: String,
    pub charges: Vec<Charge>,
}

impl CaseSummary {
    /// Well-formed predicate applied to the raw stored JSON: `caseName`,
    /// `court` and `charges` (an array, possibly empty) must all be present.
    pub fn parse_well_formed(raw: &str) -> Option<CaseSummary> {
        serde_json::from_str(raw).ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Charge {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offense_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filed_date: Option<NaiveDate>,
    pub description: String,
    pub statute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degree: Option<Degree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fine: Option<f64>,
    #[serde(default)]
    pub dispositions: Vec<Disposition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filing_agency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Degree {
    pub code: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Disposition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub description: String,
}

/// Name-search lifecycle. Created `Queued`, advanced by the name-search
/// worker, expired by TTL 24 h after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum NameSearchStatus {
    Queued,
    Processing,
    Complete,
    Failed { message: String },
}

impl NameSearchStatus {
    pub fn kind(&self) -> &'static str {
        match self {
            NameSearchStatus::Queued => "queued",
            NameSearchStatus::Processing => "processing",
            NameSearchStatus::Complete => "complete",
            NameSearchStatus::Failed { .. } => "failed",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            NameSearchStatus::Failed { message } => Some(message),
            _ => None,
        }
    }

    pub fn from_columns(kind: &str, message: Option<String>) -> Self {
        match kind {
            "processing" => NameSearchStatus::Processing,
            "complete" => NameSearchStatus::Complete,
            "failed" => NameSearchStatus::Failed {
                message: message.unwrap_or_else(|| reason::INTERNAL.to_string()),
            },
            _ => NameSearchStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NameSearchData {
    pub search_id: String,
    pub original_name: String,
    pub normalized_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_of_birth: Option<String>,
    pub sounds_like: bool,
    pub criminal_only: bool,
    pub cases: Vec<String>,
    #[serde(flatten)]
    pub status: NameSearchStatus,
}

/// One entry of the `results` map returned to polling clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub zip_case: ZipCase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case_summary: Option<CaseSummary>,
}
