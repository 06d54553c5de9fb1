use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::str::FromStr;

use crate::aggregate::AggregateSnapshot;
use crate::error::AnalyticsError;
use crate::models::{ApplicationRecord, Tenant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    /// Absent `format` means JSON; anything unrecognized is rejected.
    pub fn from_query(format: Option<&str>) -> Result<Self, AnalyticsError> {
        match format {
            None => Ok(Self::Json),
            Some(raw) => raw.parse(),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(AnalyticsError::UnsupportedExportFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredReport {
    pub company_id: i64,
    pub company: String,
    pub generated_at: String,
    #[serde(flatten)]
    pub snapshot: AggregateSnapshot,
}

#[derive(Debug, Clone)]
pub struct FlatReport {
    pub filename: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub enum Report {
    Structured(StructuredReport),
    Flat(FlatReport),
}

pub fn render_structured(
    tenant: &Tenant,
    snapshot: AggregateSnapshot,
    now: DateTime<Utc>,
) -> StructuredReport {
    StructuredReport {
        company_id: tenant.id,
        company: tenant.name.clone(),
        generated_at: iso_timestamp(now),
        snapshot,
    }
}

/// Quotes a value for delimited text when it contains a comma, a double
/// quote or a line break. Inner quotes are doubled.
pub fn escape_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

fn iso_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn day(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d").to_string()).unwrap_or_default()
}

fn row(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Renders the sectioned CSV export. Output depends only on the arguments.
pub fn render_flat(
    tenant: &Tenant,
    snapshot: &AggregateSnapshot,
    applications: &[ApplicationRecord],
    now: DateTime<Utc>,
) -> String {
    let overview = &snapshot.overview;
    let mut lines = vec![
        row(&["Analytics Report", tenant.name.as_str()]),
        row(&["Generated", iso_timestamp(now).as_str()]),
        String::new(),
        "SUMMARY".to_string(),
        format!("Total Views,{}", overview.total_views),
        format!("Total Applications,{}", overview.total_applications),
        format!("Conversion Rate,{:.1}%", overview.conversion_rate),
        format!("Hired,{}", overview.hired),
        format!("Active Jobs,{}", overview.active_jobs),
        String::new(),
        "APPLICATION STATUS BREAKDOWN".to_string(),
        "Status,Count".to_string(),
    ];
    for (status, count) in snapshot.status_breakdown.iter() {
        lines.push(format!("{},{}", status.as_str(), count));
    }
    lines.push(String::new());

    lines.push("JOB PERFORMANCE".to_string());
    lines.push("Job Title,Status,Views,Applications,Conversion Rate,Posted Date".to_string());
    for perf in &snapshot.job_performance {
        lines.push(row(&[
            perf.title.as_str(),
            perf.status.as_str(),
            perf.views.to_string().as_str(),
            perf.application_count.to_string().as_str(),
            format!("{:.1}%", perf.conversion_rate).as_str(),
            day(perf.posted_at).as_str(),
        ]));
    }
    lines.push(String::new());

    lines.push("APPLICANTS".to_string());
    lines.push("Name,Email,Status,Applied Date,Source".to_string());
    let mut ordered: Vec<&ApplicationRecord> = applications.iter().collect();
    ordered.sort_by(|a, b| b.applied_at.cmp(&a.applied_at).then(a.id.cmp(&b.id)));
    for app in ordered {
        lines.push(row(&[
            app.applicant_name.as_deref().unwrap_or(""),
            app.applicant_email.as_deref().unwrap_or(""),
            app.status.as_str(),
            day(app.applied_at).as_str(),
            app.source_label(),
        ]));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// `analytics-<company-slug>-<YYYY-MM-DD>.csv`
pub fn export_filename(tenant: &Tenant, now: DateTime<Utc>) -> String {
    let mut slug = String::new();
    for c in tenant.name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() {
        tenant.id.to_string()
    } else {
        slug.to_string()
    };
    format!("analytics-{}-{}.csv", slug, now.format("%Y-%m-%d"))
}
