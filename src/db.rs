use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::models::{
    ApplicationRecord, ApplicationStatus, JobRecord, JobStatus, Tenant, ViewEvent, parse_timestamp,
};
use crate::reader::{EntityReader, Page};

const TOKEN_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub api_token: String,
    pub created_at: String,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "funnel") {
            proj_dirs.data_dir().join("funnel.db")
        } else {
            PathBuf::from("funnel.db")
        }
    }

    /// Status, source and timestamp columns carry no CHECK constraints: the
    /// writers upstream own those rules and readers tolerate drift.
    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                api_token TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id),
                title TEXT NOT NULL,
                status TEXT,
                view_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS job_views (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id),
                viewed_at TEXT,
                source TEXT
            );

            CREATE TABLE IF NOT EXISTS applicants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT,
                email TEXT UNIQUE
            );

            CREATE TABLE IF NOT EXISTS applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id INTEGER NOT NULL REFERENCES jobs(id),
                applicant_id INTEGER REFERENCES applicants(id) ON DELETE SET NULL,
                status TEXT,
                source TEXT,
                applied_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_company ON jobs(company_id);
            CREATE INDEX IF NOT EXISTS idx_views_job ON job_views(job_id);
            CREATE INDEX IF NOT EXISTS idx_applications_job ON applications(job_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='applications'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'funnel init' first."));
        }
        Ok(())
    }

    // --- Company operations ---

    pub fn add_company(&self, name: &str) -> Result<Company> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        self.conn
            .execute(
                "INSERT INTO companies (name, api_token) VALUES (?1, ?2)",
                params![name, token],
            )
            .with_context(|| format!("Failed to add company '{}'", name))?;
        let id = self.conn.last_insert_rowid();
        self.get_company(id)?
            .ok_or_else(|| anyhow!("Company #{} vanished after insert", id))
    }

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, api_token, created_at FROM companies ORDER BY name")?;
        let rows = stmt.query_map([], Self::row_to_company)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list companies")
    }

    pub fn get_company(&self, id: i64) -> Result<Option<Company>> {
        let result = self.conn.query_row(
            "SELECT id, name, api_token, created_at FROM companies WHERE id = ?1",
            [id],
            Self::row_to_company,
        );
        match result {
            Ok(company) => Ok(Some(company)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn company_for_token(&self, token: &str) -> Result<Option<i64>> {
        let result = self.conn.query_row(
            "SELECT id FROM companies WHERE api_token = ?1",
            [token],
            |row| row.get(0),
        );
        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn row_to_company(row: &rusqlite::Row) -> rusqlite::Result<Company> {
        Ok(Company {
            id: row.get(0)?,
            name: row.get(1)?,
            api_token: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    // --- Job operations ---

    pub fn add_job(&self, company_id: i64, title: &str, status: &str) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO jobs (company_id, title, status) VALUES (?1, ?2, ?3)",
                params![company_id, title, status],
            )
            .with_context(|| format!("Failed to add job for company #{}", company_id))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Appends a view event and bumps the job's cumulative counter.
    pub fn record_view(&self, job_id: i64, source: Option<&str>, at: DateTime<Utc>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let updated = tx.execute(
            "UPDATE jobs SET view_count = view_count + 1 WHERE id = ?1",
            [job_id],
        )?;
        if updated == 0 {
            return Err(anyhow!("Job #{} not found", job_id));
        }
        tx.execute(
            "INSERT INTO job_views (job_id, viewed_at, source) VALUES (?1, ?2, ?3)",
            params![job_id, stamp(at), source],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- Application operations ---

    pub fn get_or_create_applicant(&self, name: &str, email: &str) -> Result<i64> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM applicants WHERE LOWER(email) = LOWER(?1)",
                [email],
                |row| row.get(0),
            )
            .ok();

        if let Some(id) = existing {
            return Ok(id);
        }

        self.conn.execute(
            "INSERT INTO applicants (name, email) VALUES (?1, ?2)",
            params![name, email],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_application(
        &self,
        job_id: i64,
        applicant_id: i64,
        status: &str,
        source: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO applications (job_id, applicant_id, status, source, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job_id, applicant_id, status, source, stamp(at)],
            )
            .with_context(|| format!("Failed to add application for job #{}", job_id))?;
        Ok(self.conn.last_insert_rowid())
    }

    // --- Read projections ---

    pub fn find_tenant(&self, tenant_id: i64) -> Result<Option<Tenant>> {
        Ok(self.get_company(tenant_id)?.map(|c| Tenant {
            id: c.id,
            name: c.name,
        }))
    }

    pub fn list_jobs(&self, company_id: i64, page: Page) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, status, view_count, created_at
             FROM jobs WHERE company_id = ?1
             ORDER BY id LIMIT ?2 OFFSET ?3",
        )?;
        let (limit, offset) = page_bounds(page);
        let rows = stmt.query_map(params![company_id, limit, offset], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs")
    }

    pub fn list_applications(&self, job_ids: &[i64], page: Page) -> Result<Vec<ApplicationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, a.job_id, a.status, a.source, a.applied_at, p.name, p.email
             FROM applications a
             LEFT JOIN applicants p ON a.applicant_id = p.id
             WHERE a.job_id IN (SELECT value FROM json_each(?1))
             ORDER BY a.id LIMIT ?2 OFFSET ?3",
        )?;
        let (limit, offset) = page_bounds(page);
        let rows = stmt.query_map(
            params![id_list(job_ids)?, limit, offset],
            Self::row_to_application,
        )?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list applications")
    }

    /// Views are compared through `julianday` so both RFC 3339 and
    /// `datetime('now')` layouts filter correctly.
    pub fn list_views(
        &self,
        job_ids: &[i64],
        since: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<ViewEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_id, viewed_at, source FROM job_views
             WHERE job_id IN (SELECT value FROM json_each(?1))
               AND julianday(viewed_at) >= julianday(?2)
             ORDER BY id LIMIT ?3 OFFSET ?4",
        )?;
        let (limit, offset) = page_bounds(page);
        let rows = stmt.query_map(
            params![id_list(job_ids)?, stamp(since), limit, offset],
            Self::row_to_view,
        )?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list views")
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
        let id: i64 = row.get(0)?;
        let status: Option<String> = row.get(2)?;
        let view_count: i64 = row.get(3)?;
        let created_at: Option<String> = row.get(4)?;
        Ok(JobRecord {
            id,
            title: row.get(1)?,
            status: JobStatus::from_label(status.as_deref().unwrap_or_default()),
            view_count: view_count.max(0) as u64,
            created_at: timestamp_column("jobs", id, created_at),
        })
    }

    fn row_to_application(row: &rusqlite::Row) -> rusqlite::Result<ApplicationRecord> {
        let id: i64 = row.get(0)?;
        let status: Option<String> = row.get(2)?;
        let applied_at: Option<String> = row.get(4)?;
        Ok(ApplicationRecord {
            id,
            job_id: row.get(1)?,
            status: ApplicationStatus::from_label(status.as_deref().unwrap_or_default()),
            source: row.get(3)?,
            applied_at: timestamp_column("applications", id, applied_at),
            applicant_name: row.get(5)?,
            applicant_email: row.get(6)?,
        })
    }

    fn row_to_view(row: &rusqlite::Row) -> rusqlite::Result<ViewEvent> {
        let id: i64 = row.get(0)?;
        let viewed_at: Option<String> = row.get(2)?;
        Ok(ViewEvent {
            job_id: row.get(1)?,
            viewed_at: timestamp_column("job_views", id, viewed_at),
            source: row.get(3)?,
        })
    }
}

fn stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Binds job ids as one JSON array parameter. A company can own more jobs than
/// SQLite allows bound variables.
fn id_list(ids: &[i64]) -> Result<String> {
    serde_json::to_string(ids).context("Failed to encode job ids")
}

/// SQLite treats a negative LIMIT as unbounded.
fn page_bounds(page: Page) -> (i64, i64) {
    let limit = i64::try_from(page.limit).unwrap_or(-1);
    let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);
    (limit, offset)
}

fn timestamp_column(table: &str, id: i64, raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    let parsed = parse_timestamp(&raw);
    if parsed.is_none() {
        tracing::warn!(table, id, value = %raw, "unparseable timestamp, leaving it out of trends");
    }
    parsed
}

/// `EntityReader` over a single SQLite connection.
pub struct SqliteReader {
    db: Mutex<Database>,
}

impl SqliteReader {
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        db.ensure_initialized()?;
        Ok(Self::new(db))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self
            .db
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        f(&*db)
    }

    pub fn company_for_token(&self, token: &str) -> Result<Option<i64>> {
        self.with_db(|db| db.company_for_token(token))
    }
}

impl EntityReader for SqliteReader {
    fn find_tenant(&self, tenant_id: i64) -> Result<Option<Tenant>> {
        self.with_db(|db| db.find_tenant(tenant_id))
    }

    fn list_jobs(&self, tenant_id: i64, page: Page) -> Result<Vec<JobRecord>> {
        self.with_db(|db| db.list_jobs(tenant_id, page))
    }

    fn list_applications(&self, job_ids: &[i64], page: Page) -> Result<Vec<ApplicationRecord>> {
        self.with_db(|db| db.list_applications(job_ids, page))
    }

    fn list_views(
        &self,
        job_ids: &[i64],
        since: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<ViewEvent>> {
        self.with_db(|db| db.list_views(job_ids, since, page))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    pub(crate) fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    /// Two companies; Acme has two jobs, one of them with views and applicants.
    pub(crate) fn seeded() -> (Database, Company, Company) {
        let db = Database::open_in_memory().unwrap();
        let acme = db.add_company("Acme").unwrap();
        let globex = db.add_company("Globex").unwrap();

        let engineer = db.add_job(acme.id, "Engineer", "active").unwrap();
        let designer = db.add_job(acme.id, "Designer", "paused").unwrap();
        let other = db.add_job(globex.id, "Spy", "active").unwrap();

        for days_ago in [0, 1, 1, 40] {
            db.record_view(engineer, Some("LinkedIn"), now() - Duration::days(days_ago))
                .unwrap();
        }
        db.record_view(other, None, now()).unwrap();

        let jane = db.get_or_create_applicant("Doe, Jane", "jane@example.com").unwrap();
        let bob = db.get_or_create_applicant("Bob", "bob@example.com").unwrap();
        db.add_application(engineer, jane, "interview", None, now() - Duration::days(2))
            .unwrap();
        db.add_application(engineer, bob, "hired", Some("Referral"), now() - Duration::days(1))
            .unwrap();
        db.add_application(designer, bob, "new", Some("Indeed"), now()).unwrap();
        db.add_application(other, bob, "new", None, now()).unwrap();

        (db, acme, globex)
    }

    #[test]
    fn test_init_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db.ensure_initialized().unwrap();
    }

    #[test]
    fn test_ensure_initialized_fails_on_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("nested").join("funnel.db")).unwrap();
        let err = db.ensure_initialized().unwrap_err();
        assert!(err.to_string().contains("funnel init"));
    }

    #[test]
    fn test_company_tokens_resolve() {
        let (db, acme, globex) = seeded();
        assert_eq!(acme.api_token.len(), TOKEN_LEN);
        assert_ne!(acme.api_token, globex.api_token);
        assert_eq!(db.company_for_token(&acme.api_token).unwrap(), Some(acme.id));
        assert_eq!(db.company_for_token("nope").unwrap(), None);
    }

    #[test]
    fn test_record_view_bumps_counter() {
        let (db, acme, _) = seeded();
        let jobs = db.list_jobs(acme.id, Page::first(10)).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].title, "Engineer");
        assert_eq!(jobs[0].view_count, 4);
        assert_eq!(jobs[0].status, JobStatus::Active);
        assert_eq!(jobs[1].view_count, 0);
        assert!(db.record_view(9999, None, now()).is_err());
    }

    #[test]
    fn test_list_views_filters_by_since() {
        let (db, acme, _) = seeded();
        let ids: Vec<i64> = db
            .list_jobs(acme.id, Page::first(10))
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();

        let recent = db
            .list_views(&ids, now() - Duration::days(30), Page::first(100))
            .unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent.iter().all(|v| v.source.as_deref() == Some("LinkedIn")));
    }

    #[test]
    fn test_list_views_accepts_sqlite_datetime_layout() {
        let (db, acme, _) = seeded();
        let job = db.list_jobs(acme.id, Page::first(1)).unwrap()[0].id;
        db.conn
            .execute(
                "INSERT INTO job_views (job_id, viewed_at) VALUES (?1, '2024-06-15 08:00:00')",
                [job],
            )
            .unwrap();

        let views = db.list_views(&[job], now() - Duration::days(1), Page::first(100)).unwrap();
        assert_eq!(views.len(), 4);
        assert!(views.iter().all(|v| v.viewed_at.is_some()));
    }

    #[test]
    fn test_list_applications_pages_and_joins_applicant() {
        let (db, acme, _) = seeded();
        let ids: Vec<i64> = db
            .list_jobs(acme.id, Page::first(10))
            .unwrap()
            .iter()
            .map(|j| j.id)
            .collect();

        let first = db.list_applications(&ids, Page::first(2)).unwrap();
        let second = db.list_applications(&ids, Page::first(2).next()).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].applicant_name.as_deref(), Some("Doe, Jane"));
        assert_eq!(first[0].status, ApplicationStatus::Interview);
        assert_eq!(first[0].source, None);
        assert_eq!(first[1].status, ApplicationStatus::Hired);
    }

    #[test]
    fn test_malformed_columns_fall_back() {
        let (db, acme, _) = seeded();
        let job = db.add_job(acme.id, "Odd", "archived").unwrap();
        db.conn
            .execute(
                "INSERT INTO applications (job_id, applicant_id, status, applied_at)
                 VALUES (?1, NULL, NULL, 'last tuesday')",
                [job],
            )
            .unwrap();

        let jobs = db.list_jobs(acme.id, Page::first(10)).unwrap();
        assert_eq!(jobs.last().unwrap().status, JobStatus::Unknown);

        let apps = db.list_applications(&[job], Page::first(10)).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].status, ApplicationStatus::Unknown);
        assert!(apps[0].applied_at.is_none());
        assert!(apps[0].applicant_name.is_none());
    }

    #[test]
    fn test_list_views_reports_owning_job() {
        let (db, _, globex) = seeded();
        let spy = db.list_jobs(globex.id, Page::first(10)).unwrap()[0].id;
        let views = db
            .list_views(&[spy], now() - Duration::days(30), Page::first(100))
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].job_id, spy);
        assert_eq!(views[0].viewed_at, Some(now()));
    }

    #[test]
    fn test_tenant_with_more_jobs_than_sqlite_variables() {
        let (db, acme, _) = seeded();
        db.conn.execute_batch("BEGIN").unwrap();
        let mut last = 0;
        for n in 0..33_000 {
            last = db.add_job(acme.id, &format!("Opening {}", n), "draft").unwrap();
        }
        db.conn.execute_batch("COMMIT").unwrap();

        let carol = db.get_or_create_applicant("Carol", "carol@example.com").unwrap();
        db.add_application(last, carol, "new", None, now()).unwrap();
        db.record_view(last, None, now()).unwrap();

        let reader = SqliteReader::new(db);
        let limits = crate::reader::ReadLimits {
            page_size: 5_000,
            max_records: 200_000,
        };
        let data = crate::reader::load_tenant(
            &reader,
            acme.id,
            now() - Duration::days(30),
            &limits,
            &crate::reader::Cancellation::new(),
        )
        .unwrap();

        assert_eq!(data.jobs.len(), 33_002);
        assert_eq!(data.applications.len(), 4);
        assert!(data.applications.iter().any(|a| a.job_id == last));
        assert_eq!(data.views.len(), 4);
    }

    #[test]
    fn test_sqlite_reader_find_tenant() {
        let (db, acme, _) = seeded();
        let reader = SqliteReader::new(db);
        assert_eq!(reader.find_tenant(acme.id).unwrap().unwrap().name, "Acme");
        assert!(reader.find_tenant(404).unwrap().is_none());
        assert_eq!(reader.company_for_token(&acme.api_token).unwrap(), Some(acme.id));
    }
}
