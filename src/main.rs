use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod ingest;
mod leaderboard;
mod models;
mod normalize;
mod queries;
mod report;
mod roster;
mod snapshots;
mod store;
mod trend;

use config::{Config, GlobalArgs};
use ingest::{Ingestor, UploadRequest};
use leaderboard::Leaderboards;
use models::TermKey;
use queries::Queries;
use roster::Roster;
use snapshots::SnapshotStore;
use store::postgres::PgDocumentStore;
use store::DocumentStore;

#[derive(Parser)]
#[command(name = "attendance-leaderboard")]
#[command(about = "Weekly attendance snapshots, trend badges and roll class leaderboards", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Replace the roster from a CSV export
    ImportRoster {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Ingest one week of attendance
    Upload {
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        year: i64,
        #[arg(long)]
        term: i64,
        #[arg(long)]
        week: i64,
        #[arg(long, default_value = "cli")]
        uploaded_by: String,
    },
    /// Relabel the latest week and rebuild a term leaderboard
    Recompute {
        #[arg(long)]
        year: i64,
        #[arg(long)]
        term: i64,
    },
    /// Print a term leaderboard
    Leaderboard {
        #[arg(long)]
        year: i64,
        #[arg(long)]
        term: i64,
    },
    /// List terms with uploaded weeks
    Terms,
    /// List roll classes seen in a term
    Classes {
        #[arg(long)]
        year: i64,
        #[arg(long)]
        term: i64,
    },
    /// Weekly attendance of one roll class across a term
    Rollup {
        #[arg(long)]
        year: i64,
        #[arg(long)]
        term: i64,
        #[arg(long)]
        roll_class: String,
    },
    /// Latest snapshot metadata, or one class of it with trends
    Latest {
        #[arg(long)]
        roll_class: Option<String>,
    },
    /// A student's summary, or their weekly values for a term
    Student {
        #[arg(long)]
        id: String,
        #[arg(long, requires = "term")]
        year: Option<i64>,
        #[arg(long, requires = "year")]
        term: Option<i64>,
    },
    /// Generate a markdown leaderboard report
    Report {
        #[arg(long)]
        year: i64,
        #[arg(long)]
        term: i64,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.global.log_json);
    let config = Config::from_args(&cli.global)?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let pg = PgDocumentStore::new(pool);
    let store: Arc<dyn DocumentStore> = Arc::new(pg.clone());

    let paths = config.paths();
    let snapshots = SnapshotStore::new(store.clone(), paths.clone());
    let roster = Roster::new(store.clone(), paths.clone());
    let leaderboards = Leaderboards::new(store.clone(), paths.clone(), config.exclusions.clone());
    let queries = Queries::new(snapshots, leaderboards.clone(), roster.clone());

    match cli.command {
        Commands::InitDb => {
            pg.migrate().await?;
            println!("Schema ready.");
        }
        Commands::ImportRoster { csv } => {
            let bytes = std::fs::read(&csv)
                .with_context(|| format!("failed to read {}", csv.display()))?;
            let entries = roster::parse_roster(&bytes)?;
            let stored = roster.replace(&entries).await?;
            println!("Imported {stored} roster entries from {}.", csv.display());
        }
        Commands::Upload {
            csv,
            year,
            term,
            week,
            uploaded_by,
        } => {
            let (filename, bytes) = match csv {
                Some(path) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    (path.display().to_string(), Some(bytes))
                }
                None => (String::new(), None),
            };
            let ingestor = Ingestor::new(store.clone(), paths, config.exclusions.clone());
            let request = UploadRequest {
                filename,
                bytes,
                year,
                term,
                week,
                uploaded_by,
            };
            match ingestor.ingest(request).await {
                Ok(outcome) => {
                    if outcome.deduplicated {
                        info!(upload_id = %outcome.upload_id, "file already processed");
                    }
                    if let Some(compared) = outcome.compared_weeks {
                        info!(from = compared.from, to = compared.to, "weeks compared");
                    }
                    print_json(&outcome)?;
                }
                Err(err) => {
                    let class = err.class();
                    error!(status = class.status(), retryable = class.retryable(), "upload rejected");
                    print_json(&err.body())?;
                    std::process::exit(class.exit_code());
                }
            }
        }
        Commands::Recompute { year, term } => {
            let term = TermKey::new(year, term)?;
            let ingestor = Ingestor::new(store.clone(), paths, config.exclusions.clone());
            let board = ingestor.recompute_term(term).await?;
            println!(
                "Leaderboard for {} T{} rebuilt across {} weeks ({} classes).",
                board.year,
                board.term,
                board.weeks.len(),
                board.leaderboard.len()
            );
        }
        Commands::Leaderboard { year, term } => {
            let term = TermKey::new(year, term)?;
            print_json(&queries.leaderboard(term).await?)?;
        }
        Commands::Terms => {
            print_json(&queries.list_terms().await?)?;
        }
        Commands::Classes { year, term } => {
            let term = TermKey::new(year, term)?;
            print_json(&queries.term_classes(term).await?)?;
        }
        Commands::Rollup {
            year,
            term,
            roll_class,
        } => {
            let term = TermKey::new(year, term)?;
            print_json(&queries.class_rollup(term, &roll_class).await?)?;
        }
        Commands::Latest { roll_class } => match roll_class {
            Some(roll_class) => print_json(&queries.latest_class_rows(&roll_class).await?)?,
            None => print_json(&queries.latest_meta().await?)?,
        },
        Commands::Student { id, year, term } => match (year, term) {
            (Some(year), Some(term)) => {
                let term = TermKey::new(year, term)?;
                print_json(&queries.student_term(&id, term).await?)?;
            }
            _ => print_json(&queries.student_summary(&id).await?)?,
        },
        Commands::Report { year, term, out } => {
            let term = TermKey::new(year, term)?;
            let board = leaderboards.fetch(term).await?;
            let report = report::build_report(term, board.as_ref(), Utc::now());
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
