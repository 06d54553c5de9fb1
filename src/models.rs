use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DIRECT_SOURCE: &str = "Direct";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Paused,
    Closed,
    Draft,
    Unknown,
}

impl JobStatus {
    /// Unrecognized labels map to `Unknown` instead of failing.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "paused" => Self::Paused,
            "closed" => Self::Closed,
            "draft" => Self::Draft,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Closed => "closed",
            Self::Draft => "draft",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    New,
    Reviewing,
    Interview,
    Hired,
    Rejected,
    Unknown,
}

impl ApplicationStatus {
    /// Known statuses in funnel order. `Unknown` is deliberately absent.
    pub const KNOWN: [ApplicationStatus; 5] = [
        Self::New,
        Self::Reviewing,
        Self::Interview,
        Self::Hired,
        Self::Rejected,
    ];

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "reviewing" => Self::Reviewing,
            "interview" => Self::Interview,
            "hired" => Self::Hired,
            "rejected" => Self::Rejected,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Reviewing => "reviewing",
            Self::Interview => "interview",
            Self::Hired => "hired",
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub title: String,
    pub status: JobStatus,
    pub view_count: u64,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewEvent {
    pub job_id: i64,
    pub viewed_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: i64,
    pub job_id: i64,
    pub status: ApplicationStatus,
    pub source: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    pub applicant_name: Option<String>,
    pub applicant_email: Option<String>,
}

impl ApplicationRecord {
    /// Source tag with absent or blank values folded into "Direct".
    pub fn source_label(&self) -> &str {
        normalize_source(self.source.as_deref())
    }
}

pub fn normalize_source(source: Option<&str>) -> &str {
    match source.map(str::trim) {
        Some(s) if !s.is_empty() => s,
        _ => DIRECT_SOURCE,
    }
}

/// Parses the timestamp formats found in storage: RFC 3339 and SQLite's
/// `datetime('now')` layout. Anything else yields `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
