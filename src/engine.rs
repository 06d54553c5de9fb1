use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::aggregate::{AggregateSnapshot, compute_snapshot_with, scoped, tenant_job_ids};
use crate::bucket::TrendWindow;
use crate::config::Settings;
use crate::error::{AnalyticsError, Result};
use crate::reader::{Cancellation, EntityReader, TenantData, load_tenant};
use crate::report::{
    ExportFormat, FlatReport, Report, StructuredReport, export_filename, render_flat,
    render_structured,
};

/// Reads a tenant's facts, aggregates them and renders the requested format.
///
/// The read phase runs on the blocking pool under `Settings::read_timeout`
/// and stops at the next page boundary when `cancel` fires. Compute only
/// starts once the read finished cleanly.
pub struct AnalyticsEngine {
    reader: Arc<dyn EntityReader>,
    settings: Settings,
}

impl AnalyticsEngine {
    pub fn new(reader: Arc<dyn EntityReader>, settings: Settings) -> Self {
        Self { reader, settings }
    }

    pub async fn load(
        &self,
        tenant_id: i64,
        now: DateTime<Utc>,
        cancel: &Cancellation,
    ) -> Result<TenantData> {
        let reader = Arc::clone(&self.reader);
        let limits = self.settings.read_limits();
        let views_since = TrendWindow::ending_at(now, self.settings.window_days).start;
        let task_cancel = cancel.clone();

        // A dropped request future cancels the blocking read as well.
        let guard = cancel.drop_guard();
        let task = tokio::task::spawn_blocking(move || {
            load_tenant(reader.as_ref(), tenant_id, views_since, &limits, &task_cancel)
        });

        let outcome = tokio::time::timeout(self.settings.read_timeout, task).await;
        guard.disarm();

        let data = match outcome {
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    tenant_id,
                    timeout = ?self.settings.read_timeout,
                    "tenant read timed out"
                );
                return Err(AnalyticsError::TimedOut);
            }
            Ok(Err(join_err)) => return Err(AnalyticsError::Storage(anyhow!(join_err))),
            Ok(Ok(result)) => result?,
        };

        if cancel.is_cancelled() {
            return Err(AnalyticsError::Cancelled);
        }
        Ok(data)
    }

    pub fn compute(&self, data: &TenantData, now: DateTime<Utc>) -> AggregateSnapshot {
        compute_snapshot_with(
            &data.jobs,
            &data.applications,
            &data.views,
            now,
            &self.settings.aggregate_options(),
        )
    }

    pub async fn structured(
        &self,
        tenant_id: i64,
        now: DateTime<Utc>,
        cancel: &Cancellation,
    ) -> Result<StructuredReport> {
        let data = self.load(tenant_id, now, cancel).await?;
        let snapshot = self.compute(&data, now);
        tracing::info!(
            tenant_id,
            applications = snapshot.overview.total_applications,
            "rendered structured analytics"
        );
        Ok(render_structured(&data.tenant, snapshot, now))
    }

    pub async fn report(
        &self,
        tenant_id: i64,
        format: ExportFormat,
        now: DateTime<Utc>,
        cancel: &Cancellation,
    ) -> Result<Report> {
        if format == ExportFormat::Json {
            return Ok(Report::Structured(self.structured(tenant_id, now, cancel).await?));
        }

        let data = self.load(tenant_id, now, cancel).await?;
        let snapshot = self.compute(&data, now);
        let applications = scoped(&data.applications, &tenant_job_ids(&data.jobs));
        tracing::info!(
            tenant_id,
            applications = snapshot.overview.total_applications,
            "rendered flat analytics export"
        );
        Ok(Report::Flat(FlatReport {
            filename: export_filename(&data.tenant, now),
            body: render_flat(&data.tenant, &snapshot, &applications, now),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Page;
    use crate::reader::tests::{MemoryReader, sample_reader};
    use crate::models::{ApplicationRecord, JobRecord, Tenant, ViewEvent};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    fn engine(reader: impl EntityReader + 'static, settings: Settings) -> AnalyticsEngine {
        AnalyticsEngine::new(Arc::new(reader), settings)
    }

    struct SlowReader;

    impl EntityReader for SlowReader {
        fn find_tenant(&self, tenant_id: i64) -> anyhow::Result<Option<Tenant>> {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Ok(Some(Tenant { id: tenant_id, name: "Slow".into() }))
        }

        fn list_jobs(&self, _: i64, _: Page) -> anyhow::Result<Vec<JobRecord>> {
            Ok(Vec::new())
        }

        fn list_applications(&self, _: &[i64], _: Page) -> anyhow::Result<Vec<ApplicationRecord>> {
            Ok(Vec::new())
        }

        fn list_views(
            &self,
            _: &[i64],
            _: DateTime<Utc>,
            _: Page,
        ) -> anyhow::Result<Vec<ViewEvent>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_report_json_scopes_to_tenant() {
        let engine = engine(sample_reader(), Settings::default());
        let report = engine
            .report(1, ExportFormat::Json, now(), &Cancellation::new())
            .await
            .unwrap();

        let Report::Structured(structured) = report else {
            panic!("expected structured report");
        };
        assert_eq!(structured.company, "Acme");
        assert_eq!(structured.snapshot.overview.total_views, 120);
        // Application #4 belongs to Globex's job and must not leak in.
        assert_eq!(structured.snapshot.overview.total_applications, 3);
        assert_eq!(structured.snapshot.job_performance[0].job_id, 10);
    }

    #[tokio::test]
    async fn test_report_csv_excludes_foreign_applicants() {
        let engine = engine(sample_reader(), Settings::default());
        let report = engine
            .report(1, ExportFormat::Csv, now(), &Cancellation::new())
            .await
            .unwrap();

        let Report::Flat(flat) = report else {
            panic!("expected flat report");
        };
        assert_eq!(flat.filename, "analytics-acme-2024-06-15.csv");
        assert!(flat.body.contains("Applicant 1"));
        assert!(!flat.body.contains("Applicant 4"));
    }

    #[tokio::test]
    async fn test_report_unknown_tenant() {
        let engine = engine(sample_reader(), Settings::default());
        let err = engine
            .report(77, ExportFormat::Json, now(), &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::NotFound(77)));
    }

    #[tokio::test]
    async fn test_empty_tenant_gets_zero_snapshot() {
        let reader = MemoryReader {
            tenants: vec![Tenant { id: 5, name: "Empty".into() }],
            ..Default::default()
        };
        let engine = engine(reader, Settings::default());
        let data = engine.load(5, now(), &Cancellation::new()).await.unwrap();
        let snapshot = engine.compute(&data, now());

        assert_eq!(snapshot.overview.total_views, 0);
        assert_eq!(snapshot.overview.conversion_rate, 0.0);
        assert!(snapshot.job_performance.is_empty());
    }

    #[tokio::test]
    async fn test_read_timeout_cancels() {
        let settings = Settings {
            read_timeout: std::time::Duration::from_millis(20),
            ..Settings::default()
        };
        let engine = engine(SlowReader, settings);
        let cancel = Cancellation::new();

        let err = engine.load(1, now(), &cancel).await.unwrap_err();
        assert!(matches!(err, AnalyticsError::TimedOut));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_pre_cancelled_request_never_computes() {
        let engine = engine(sample_reader(), Settings::default());
        let cancel = Cancellation::new();
        cancel.cancel();

        let err = engine
            .report(1, ExportFormat::Json, now(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::Cancelled));
    }
}
