mod aggregate;
mod bucket;
mod clock;
mod config;
mod db;
mod engine;
mod error;
mod models;
mod rank;
mod reader;
mod report;
mod server;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use clock::{Clock, FixedClock, SystemClock};
use config::Settings;
use db::{Database, SqliteReader};
use engine::AnalyticsEngine;
use reader::Cancellation;
use report::{ExportFormat, Report};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "funnel")]
#[command(about = "Hiring-funnel analytics - aggregate jobs, views and applications into reports")]
struct Cli {
    /// Path to the SQLite database (overrides FUNNEL_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage companies (report tenants)
    Company {
        #[command(subcommand)]
        command: CompanyCommands,
    },

    /// Manage job postings
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },

    /// Record a view of a job posting
    View {
        /// Job ID
        job_id: i64,

        /// Where the visitor came from
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Record an application to a job
    Apply {
        /// Job ID
        job_id: i64,

        /// Applicant display name
        #[arg(long)]
        name: String,

        /// Applicant email
        #[arg(long)]
        email: String,

        /// Where the applicant came from (defaults to Direct in reports)
        #[arg(short, long)]
        source: Option<String>,

        /// Application status (new, reviewing, interview, hired, rejected)
        #[arg(long, default_value = "new")]
        status: String,
    },

    /// Render an analytics report for a company
    Report {
        /// Company ID
        company: i64,

        /// Output format (csv, json)
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Write the report to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Report as of this RFC 3339 instant instead of the current time
        #[arg(long)]
        now: Option<String>,
    },

    /// Serve the analytics HTTP API
    Serve {
        /// Address to listen on (overrides FUNNEL_LISTEN)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
}

#[derive(Subcommand)]
enum CompanyCommands {
    /// Add a company and print its API token
    Add {
        /// Company name
        name: String,
    },

    /// List companies
    List,
}

#[derive(Subcommand)]
enum JobCommands {
    /// Add a job posting
    Add {
        /// Company ID
        company: i64,

        /// Job title
        title: String,

        /// Lifecycle status (active, paused, closed, draft)
        #[arg(short, long, default_value = "active")]
        status: String,
    },

    /// List a company's jobs
    List {
        /// Company ID
        company: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;
    if let Some(path) = cli.db {
        settings.db_path = path;
    }

    match cli.command {
        Commands::Init => {
            let db = Database::open(&settings.db_path)?;
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Company { command } => {
            let db = open_initialized(&settings)?;
            match command {
                CompanyCommands::Add { name } => {
                    let company = db.add_company(&name)?;
                    println!("Added company #{} '{}'", company.id, company.name);
                    println!("API token: {}", company.api_token);
                }

                CompanyCommands::List => {
                    let companies = db.list_companies()?;
                    if companies.is_empty() {
                        println!("No companies found.");
                    } else {
                        println!("{:<6} {:<30} {:<34} {:<20}", "ID", "NAME", "TOKEN", "CREATED");
                        println!("{}", "-".repeat(92));
                        for company in companies {
                            println!(
                                "{:<6} {:<30} {:<34} {:<20}",
                                company.id,
                                truncate(&company.name, 28),
                                company.api_token,
                                company.created_at
                            );
                        }
                    }
                }
            }
        }

        Commands::Job { command } => {
            let db = open_initialized(&settings)?;
            match command {
                JobCommands::Add {
                    company,
                    title,
                    status,
                } => {
                    db.get_company(company)?
                        .ok_or_else(|| anyhow!("Company #{} not found", company))?;
                    let job_id = db.add_job(company, &title, &status)?;
                    println!("Added job #{}", job_id);
                }

                JobCommands::List { company } => {
                    let jobs = db.list_jobs(company, reader::Page::first(usize::MAX))?;
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<6} {:<10} {:<36} {:>8} {:<12}",
                            "ID", "STATUS", "TITLE", "VIEWS", "POSTED"
                        );
                        println!("{}", "-".repeat(76));
                        for job in jobs {
                            println!(
                                "{:<6} {:<10} {:<36} {:>8} {:<12}",
                                job.id,
                                job.status.as_str(),
                                truncate(&job.title, 34),
                                job.view_count,
                                job.created_at
                                    .map(|t| t.format("%Y-%m-%d").to_string())
                                    .unwrap_or_else(|| "-".to_string())
                            );
                        }
                    }
                }
            }
        }

        Commands::View { job_id, source } => {
            let db = open_initialized(&settings)?;
            db.record_view(job_id, source.as_deref(), Utc::now())?;
            println!("Recorded view of job #{}", job_id);
        }

        Commands::Apply {
            job_id,
            name,
            email,
            source,
            status,
        } => {
            let db = open_initialized(&settings)?;
            let applicant_id = db.get_or_create_applicant(&name, &email)?;
            let application_id =
                db.add_application(job_id, applicant_id, &status, source.as_deref(), Utc::now())?;
            println!("Added application #{} to job #{}", application_id, job_id);
        }

        Commands::Report {
            company,
            format,
            output,
            now,
        } => {
            let format: ExportFormat = format.parse()?;
            let clock: Box<dyn Clock> = match now {
                Some(raw) => Box::new(FixedClock(parse_now(&raw)?)),
                None => Box::new(SystemClock),
            };

            let reader = Arc::new(SqliteReader::open(&settings.db_path)?);
            let engine = AnalyticsEngine::new(reader, settings.clone());
            let report = engine
                .report(company, format, clock.now(), &Cancellation::new())
                .await?;

            let (body, default_name) = match report {
                Report::Structured(structured) => {
                    (serde_json::to_string_pretty(&structured)?, None)
                }
                Report::Flat(flat) => (flat.body, Some(flat.filename)),
            };

            match output {
                Some(path) => {
                    std::fs::write(&path, &body)
                        .with_context(|| format!("Failed to write to {}", path.display()))?;
                    println!("Report saved to: {}", path.display());
                }
                None => {
                    if let Some(name) = default_name {
                        tracing::debug!(filename = %name, "suggested export filename");
                    }
                    print!("{}", body);
                    if !body.ends_with('\n') {
                        println!();
                    }
                }
            }
        }

        Commands::Serve { listen } => {
            let addr = listen.unwrap_or(settings.listen);
            let reader = Arc::new(SqliteReader::open(&settings.db_path)?);
            let state = server::AppState {
                engine: Arc::new(AnalyticsEngine::new(reader.clone(), settings.clone())),
                auth: reader,
                clock: Arc::new(SystemClock),
            };
            server::serve(state, addr).await?;
        }
    }

    Ok(())
}

fn open_initialized(settings: &Settings) -> Result<Database> {
    let db = Database::open(&settings.db_path)?;
    db.ensure_initialized()?;
    Ok(db)
}

fn parse_now(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("Invalid --now value '{}', expected RFC 3339", raw))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
