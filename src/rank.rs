use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::aggregate::{conversion_rate, one_decimal};
use crate::models::{ApplicationRecord, JobRecord, JobStatus};

pub const DEFAULT_TOP_JOBS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPerformance {
    pub job_id: i64,
    pub title: String,
    pub views: u64,
    pub application_count: u64,
    #[serde(serialize_with = "one_decimal")]
    pub conversion_rate: f64,
    pub status: JobStatus,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Every job, most applications first. Ties go to the lower job id.
pub fn rank_all(jobs: &[JobRecord], applications: &[ApplicationRecord]) -> Vec<JobPerformance> {
    let mut per_job: HashMap<i64, u64> = HashMap::new();
    for app in applications {
        *per_job.entry(app.job_id).or_insert(0) += 1;
    }

    let mut ranked: Vec<JobPerformance> = jobs
        .iter()
        .map(|job| {
            let application_count = per_job.get(&job.id).copied().unwrap_or(0);
            JobPerformance {
                job_id: job.id,
                title: job.title.clone(),
                views: job.view_count,
                application_count,
                conversion_rate: conversion_rate(application_count, job.view_count),
                status: job.status,
                posted_at: job.created_at,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.application_count
            .cmp(&a.application_count)
            .then(a.job_id.cmp(&b.job_id))
    });
    ranked
}

pub fn rank_job_performance(
    jobs: &[JobRecord],
    applications: &[ApplicationRecord],
    limit: usize,
) -> Vec<JobPerformance> {
    let mut ranked = rank_all(jobs, applications);
    ranked.truncate(limit);
    ranked
}
