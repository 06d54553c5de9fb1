use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::AnalyticsError;
use crate::models::{ApplicationRecord, JobRecord, Tenant, ViewEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// Read-only access to the facts the engine aggregates. Implementations are
/// blocking; the engine calls them from a blocking thread.
pub trait EntityReader: Send + Sync {
    fn find_tenant(&self, tenant_id: i64) -> Result<Option<Tenant>>;

    fn list_jobs(&self, tenant_id: i64, page: Page) -> Result<Vec<JobRecord>>;

    fn list_applications(&self, job_ids: &[i64], page: Page) -> Result<Vec<ApplicationRecord>>;

    fn list_views(
        &self,
        job_ids: &[i64],
        since: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<ViewEvent>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    pub page_size: usize,
    /// Upper bound on jobs + applications + views held for one report.
    pub max_records: usize,
}

/// Shared cancellation flag, checked between pages.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancels when dropped unless disarmed first.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop(Some(self.clone()))
    }

    fn check(&self) -> Result<(), AnalyticsError> {
        if self.is_cancelled() {
            Err(AnalyticsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct CancelOnDrop(Option<Cancellation>);

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.0.take();
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel.cancel();
        }
    }
}

#[derive(Debug, Clone)]
pub struct TenantData {
    pub tenant: Tenant,
    pub jobs: Vec<JobRecord>,
    pub applications: Vec<ApplicationRecord>,
    pub views: Vec<ViewEvent>,
}

struct Budget {
    used: usize,
    limit: usize,
}

fn read_pages<T>(
    mut fetch: impl FnMut(Page) -> Result<Vec<T>>,
    page_size: usize,
    budget: &mut Budget,
    cancel: &Cancellation,
) -> Result<Vec<T>, AnalyticsError> {
    let mut out = Vec::new();
    let mut page = Page::first(page_size.max(1));
    loop {
        cancel.check()?;
        let batch = fetch(page)?;
        let fetched = batch.len();

        budget.used += fetched;
        if budget.used > budget.limit {
            return Err(AnalyticsError::RecordLimitExceeded { limit: budget.limit });
        }
        out.extend(batch);

        if fetched < page.limit {
            return Ok(out);
        }
        page = page.next();
    }
}

/// Pulls everything one report needs for a tenant. Views are only read from
/// `views_since` onwards since older ones never reach a trend bucket.
pub fn load_tenant(
    reader: &dyn EntityReader,
    tenant_id: i64,
    views_since: DateTime<Utc>,
    limits: &ReadLimits,
    cancel: &Cancellation,
) -> Result<TenantData, AnalyticsError> {
    cancel.check()?;
    let tenant = reader
        .find_tenant(tenant_id)?
        .ok_or(AnalyticsError::NotFound(tenant_id))?;

    let mut budget = Budget {
        used: 0,
        limit: limits.max_records,
    };

    let jobs = read_pages(
        |page| reader.list_jobs(tenant_id, page),
        limits.page_size,
        &mut budget,
        cancel,
    )?;
    let job_ids: Vec<i64> = jobs.iter().map(|job| job.id).collect();

    let (applications, views) = if job_ids.is_empty() {
        (Vec::new(), Vec::new())
    } else {
        let applications = read_pages(
            |page| reader.list_applications(&job_ids, page),
            limits.page_size,
            &mut budget,
            cancel,
        )?;
        let views = read_pages(
            |page| reader.list_views(&job_ids, views_since, page),
            limits.page_size,
            &mut budget,
            cancel,
        )?;
        (applications, views)
    };

    tracing::debug!(
        tenant_id,
        jobs = jobs.len(),
        applications = applications.len(),
        views = views.len(),
        "loaded tenant data"
    );

    Ok(TenantData {
        tenant,
        jobs,
        applications,
        views,
    })
}
