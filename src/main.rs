use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod command;
mod config;
mod credentials;
mod db;
mod error;
mod models;
mod query;
mod reports;
mod risk;
mod summary;
mod warehouse;

use crate::config::Config;
use crate::credentials::CredentialResolver;
use crate::models::Severity;
use crate::query::QuerySet;
use crate::reports::{ReportDeps, ReportKind};
use crate::warehouse::{Warehouse, WarehouseClient};

#[derive(Parser)]
#[command(name = "breathcode-reports")]
#[command(about = "Churn analytics reports over the activity warehouse", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the report tables
    InitDb,
    /// Generate a report for one date or a range of dates
    GenerateReport {
        #[arg(value_enum)]
        report_type: ReportKind,
        /// Report date (YYYY-MM-DD), defaults to yesterday
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Only score users of this academy
        #[arg(long)]
        academy: Option<i64>,
        /// Generate one report per day for the N days ending yesterday
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        days_back: Option<u32>,
        /// Fetch and process but do not save
        #[arg(long)]
        dry_run: bool,
        /// Write the would-be rows of a dry run to this CSV file
        #[arg(long, requires = "dry_run")]
        out: Option<PathBuf>,
        /// Exit non-zero when any date failed
        #[arg(long)]
        strict: bool,
    },
    /// List the highest churn risk users for a date
    Top {
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        academy: Option<i64>,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// List recent churn alerts for an academy or a user
    #[command(group(
        ArgGroup::new("scope")
            .args(["academy", "user"])
            .required(true)
            .multiple(false)
    ))]
    Alerts {
        #[arg(long)]
        academy: Option<i64>,
        #[arg(long, requires = "academy")]
        severity: Option<Severity>,
        #[arg(long)]
        user: Option<i64>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Run a JSON query against a warehouse table and print rows as JSON lines
    Query {
        table: String,
        /// e.g. '{"filter": {"user_id__gte": 5}, "fields": ["kind"], "limit": 10}'
        spec: String,
    },
}

const DEFAULT_LOG_FILTER: &str = "breathcode_reports=info";

/// `RUST_LOG` when it parses, otherwise the crate at info.
fn log_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}

fn init_tracing() {
    let filter = log_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect(cfg: &Config) -> anyhow::Result<PgPool> {
    let database_url = cfg.database_url().map_err(anyhow::Error::msg)?;
    PgPoolOptions::new()
        .max_connections(cfg.database_max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

fn warehouse(cfg: &Config) -> anyhow::Result<Arc<dyn Warehouse>> {
    let handle = WarehouseClient::new(cfg.warehouse.clone(), Arc::new(CredentialResolver::new()));
    let client: Arc<dyn Warehouse> = handle
        .client()
        .context("failed to set up warehouse client")?;
    Ok(client)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let cfg = Config::from_env().map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&cfg).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::GenerateReport {
            report_type,
            date,
            academy,
            days_back,
            dry_run,
            out,
            strict,
        } => {
            let pool = connect(&cfg).await?;
            let store = Arc::new(db::PgStore::new(pool));
            let deps = ReportDeps {
                warehouse: warehouse(&cfg)?,
                subscriptions: store.clone(),
                store,
                activity_table: cfg.warehouse.activity_table.clone(),
            };

            let dates = command::select_dates(Utc::now(), date, days_back);
            info!(report = report_type.name(), dates = dates.len(), "starting report run");
            let (run, preview) =
                command::run_dates(report_type, &deps, &dates, academy, dry_run).await;

            if let Some(out) = out {
                let written = summary::write_preview_csv(&out, &preview)?;
                println!("Preview of {written} rows written to {}.", out.display());
            }

            print!("{}", summary::build_summary(&run));

            if strict && run.has_errors() {
                anyhow::bail!("{} of {} dates failed", run.errors.len(), run.dates.len());
            }
        }
        Commands::Top {
            date,
            academy,
            limit,
        } => {
            let pool = connect(&cfg).await?;
            let date = date.unwrap_or_else(|| reports::yesterday(Utc::now()));
            let rows = db::top_reports(&pool, date, academy, limit).await?;

            if rows.is_empty() {
                println!("No churn reports for {date}.");
                return Ok(());
            }

            println!("Top users by churn risk on {date}:");
            for row in rows {
                println!(
                    "- user {} (academy {}) score {:.2} [{}], {} days inactive",
                    row.user_id,
                    row.academy_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    row.churn_risk_score,
                    row.risk_level,
                    row.days_since_last_activity
                );
            }
        }
        Commands::Alerts {
            academy,
            severity,
            user,
            limit,
        } => {
            let pool = connect(&cfg).await?;
            let alerts = match (academy, user) {
                (Some(academy), _) => db::academy_alerts(&pool, academy, severity, limit).await?,
                (None, Some(user)) => db::user_alerts(&pool, user, limit).await?,
                (None, None) => Vec::new(),
            };

            if alerts.is_empty() {
                println!("No churn alerts found.");
                return Ok(());
            }

            for alert in alerts {
                println!("- {alert}");
            }
        }
        Commands::Query { table, spec } => {
            let spec: serde_json::Value =
                serde_json::from_str(&spec).context("query spec is not valid JSON")?;
            let mut qs = QuerySet::new(warehouse(&cfg)?, table);
            let output = qs.json_query(&spec).await?;
            for row in output.into_rows() {
                println!("{}", serde_json::to_string(&row)?);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_log_is_not_overridden() {
        assert_eq!(
            log_filter(Some("breathcode_reports=debug")).to_string(),
            "breathcode_reports=debug"
        );
    }

    #[test]
    fn default_filter_applies_without_rust_log() {
        assert_eq!(log_filter(None).to_string(), DEFAULT_LOG_FILTER);
    }
}
