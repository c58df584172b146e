use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use oubo_analytics::{site_rows_csv, AggregationEngine, TimeBucketer};
use oubo_channel::{ChannelRegistry, ChannelResolver};
use oubo_core::{MonthFilter, Scope};
use oubo_ingest::{FeedClient, FeedConfig};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "oubo-cli")]
#[command(about = "Applicant source analytics command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest once and print the full analytics report as JSON.
    Report {
        /// Restrict to one company id.
        #[arg(long)]
        company: Option<String>,
        /// Restrict to one calendar month, `YYYY-MM`.
        #[arg(long)]
        ym: Option<String>,
    },
    /// Ingest once and emit the per-channel rows as CSV.
    Csv {
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        ym: Option<String>,
        /// Write to a file instead of stdout.
        #[arg(long)]
        out: Option<std::path::PathBuf>,
    },
    /// Serve the JSON API.
    Serve,
}

fn scope(company: Option<String>, month: Option<String>) -> Scope {
    Scope {
        company_id: company.filter(|c| !c.is_empty()),
        month: match month.as_deref() {
            None | Some("") | Some("all") => MonthFilter::All,
            Some(ym) => MonthFilter::Month(ym.to_string()),
        },
    }
}

fn build_engine() -> Result<AggregationEngine<chrono::Local>> {
    let registry = ChannelRegistry::with_overlay("channels.yaml")?;
    Ok(AggregationEngine::new(
        ChannelResolver::new(registry),
        TimeBucketer::local(Utc::now()),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Report {
        company: None,
        ym: None,
    }) {
        Commands::Report { company, ym } => {
            let client = FeedClient::new(FeedConfig::from_env())?;
            let snapshot = client.fetch_snapshot(Uuid::new_v4()).await;
            let report = build_engine()?.run_pass(&snapshot, &scope(company, ym));
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing report")?
            );
        }
        Commands::Csv { company, ym, out } => {
            let client = FeedClient::new(FeedConfig::from_env())?;
            let snapshot = client.fetch_snapshot(Uuid::new_v4()).await;
            let rows = build_engine()?.site_rows(&snapshot, &scope(company, ym));
            let csv = site_rows_csv(&rows);
            match out {
                Some(path) => std::fs::write(&path, csv)
                    .with_context(|| format!("writing {}", path.display()))?,
                None => print!("{csv}"),
            }
        }
        Commands::Serve => {
            oubo_web::serve_from_env().await?;
        }
    }

    Ok(())
}
