use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

use crate::bucket::{DEFAULT_WINDOW_DAYS, DayCount, TrendWindow, bucket_by_day};
use crate::models::{ApplicationRecord, ApplicationStatus, JobRecord, JobStatus, ViewEvent};
use crate::rank::{DEFAULT_TOP_JOBS, JobPerformance, rank_job_performance};

/// `numerator / denominator * 100`, rounded to one decimal. Zero views is a
/// zero rate, not a division fault.
pub fn conversion_rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let pct = numerator as f64 / denominator as f64 * 100.0;
    (pct * 10.0).round() / 10.0
}

/// Serializes a rate as a fixed one-decimal string ("4.7", "0.0").
pub fn one_decimal<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("{:.1}", value))
}

#[derive(Debug, Clone, Copy)]
pub struct AggregateOptions {
    pub window_days: i64,
    pub top_jobs: usize,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_WINDOW_DAYS,
            top_jobs: DEFAULT_TOP_JOBS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub total_views: u64,
    pub total_applications: u64,
    #[serde(serialize_with = "one_decimal")]
    pub conversion_rate: f64,
    pub active_jobs: u64,
    pub hired: u64,
}

/// Per-status counts in funnel order. Every known status is present, even at
/// zero; `unknown` only shows up when some record needed the fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusBreakdown(Vec<(ApplicationStatus, u64)>);

impl StatusBreakdown {
    fn tally<'a>(applications: impl IntoIterator<Item = &'a ApplicationRecord>) -> Self {
        let mut counts: BTreeMap<ApplicationStatus, u64> = ApplicationStatus::KNOWN
            .iter()
            .map(|status| (*status, 0))
            .collect();
        for app in applications {
            if app.status == ApplicationStatus::Unknown {
                tracing::warn!(
                    application_id = app.id,
                    "application has unrecognized status, counting as unknown"
                );
            }
            *counts.entry(app.status).or_insert(0) += 1;
        }
        Self(counts.into_iter().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = (ApplicationStatus, u64)> + '_ {
        self.0.iter().copied()
    }

    pub fn get(&self, status: ApplicationStatus) -> u64 {
        self.0
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.iter().map(|(_, n)| n).sum()
    }
}

impl Serialize for StatusBreakdown {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (status, count) in &self.0 {
            map.serialize_entry(status.as_str(), count)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trends {
    pub views_by_day: Vec<DayCount>,
    pub applications_by_day: Vec<DayCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub overview: Overview,
    pub status_breakdown: StatusBreakdown,
    pub source_breakdown: BTreeMap<String, u64>,
    pub trends: Trends,
    pub job_performance: Vec<JobPerformance>,
}

/// Records that hang off a job.
pub trait JobScoped: Clone {
    const KIND: &'static str;
    fn job_id(&self) -> i64;
}

impl JobScoped for ApplicationRecord {
    const KIND: &'static str = "application";
    fn job_id(&self) -> i64 {
        self.job_id
    }
}

impl JobScoped for ViewEvent {
    const KIND: &'static str = "view";
    fn job_id(&self) -> i64 {
        self.job_id
    }
}

pub fn tenant_job_ids(jobs: &[JobRecord]) -> HashSet<i64> {
    jobs.iter().map(|job| job.id).collect()
}

/// Drops records that reference jobs outside the tenant. Borrows when nothing
/// has to go, which is the normal case.
pub fn scoped<'a, T: JobScoped>(items: &'a [T], job_ids: &HashSet<i64>) -> Cow<'a, [T]> {
    let foreign = items.iter().filter(|item| !job_ids.contains(&item.job_id())).count();
    if foreign == 0 {
        return Cow::Borrowed(items);
    }

    tracing::warn!(
        kind = T::KIND,
        dropped = foreign,
        "reader returned records for jobs outside the tenant, dropping them"
    );
    Cow::Owned(
        items
            .iter()
            .filter(|item| job_ids.contains(&item.job_id()))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
pub fn compute_snapshot(
    jobs: &[JobRecord],
    applications: &[ApplicationRecord],
    views: &[ViewEvent],
    now: DateTime<Utc>,
) -> AggregateSnapshot {
    compute_snapshot_with(jobs, applications, views, now, &AggregateOptions::default())
}

pub fn compute_snapshot_with(
    jobs: &[JobRecord],
    applications: &[ApplicationRecord],
    views: &[ViewEvent],
    now: DateTime<Utc>,
    options: &AggregateOptions,
) -> AggregateSnapshot {
    let job_ids = tenant_job_ids(jobs);
    let applications = scoped(applications, &job_ids);
    let views = scoped(views, &job_ids);

    let status_breakdown = StatusBreakdown::tally(applications.iter());

    let mut source_breakdown: BTreeMap<String, u64> = BTreeMap::new();
    for app in applications.iter() {
        *source_breakdown.entry(app.source_label().to_string()).or_insert(0) += 1;
    }

    let total_views: u64 = jobs.iter().map(|job| job.view_count).sum();
    let total_applications = status_breakdown.total();
    let overview = Overview {
        total_views,
        total_applications,
        conversion_rate: conversion_rate(total_applications, total_views),
        active_jobs: jobs.iter().filter(|job| job.status == JobStatus::Active).count() as u64,
        hired: status_breakdown.get(ApplicationStatus::Hired),
    };

    let window = TrendWindow::ending_at(now, options.window_days);
    let trends = Trends {
        views_by_day: bucket_by_day(views.iter(), window.start, window.end),
        applications_by_day: bucket_by_day(applications.iter(), window.start, window.end),
    };

    AggregateSnapshot {
        overview,
        status_breakdown,
        source_breakdown,
        trends,
        job_performance: rank_job_performance(jobs, &applications, options.top_jobs),
    }
}
