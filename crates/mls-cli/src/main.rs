use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mls_core::ImportResult;
use mls_sync::ImportConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mls-cli")]
#[command(about = "MLS listing import command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one connection from connections.yaml.
    Import {
        #[arg(long)]
        connection: String,
    },
    /// Import every enabled connection.
    ImportAll,
    /// Print listings already imported for an agent.
    Listings {
        #[arg(long)]
        agent: String,
    },
    /// Summarize recent import runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run the cron scheduler until Ctrl-C.
    Schedule,
}

fn print_result(connection_id: &str, reports_dir: &str, result: &ImportResult) {
    println!(
        "import complete: connection={} total={} imported={} failed={} photos_degraded={} reports={}",
        connection_id,
        result.total_listings,
        result.successful_imports,
        result.failed_imports,
        result.photos_degraded,
        reports_dir
    );
    for failure in &result.errors {
        println!(
            "  failed {} after {} attempt(s): {}",
            failure.mls_number, failure.attempts_made, failure.error
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mls_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::ImportAll) {
        Commands::Import { connection } => {
            let summary = mls_sync::run_import_once_from_env(&connection).await?;
            print_result(&connection, &summary.reports_dir, &summary.result);
        }
        Commands::ImportAll => {
            let summaries = mls_sync::run_all_imports_from_env().await?;
            if summaries.is_empty() {
                println!("no connections imported");
            }
            for summary in &summaries {
                print_result(
                    &summary.job.external_connection_id,
                    &summary.reports_dir,
                    &summary.result,
                );
            }
        }
        Commands::Listings { agent } => {
            let listings = mls_sync::list_listings_from_env(&agent).await?;
            for listing in &listings {
                println!(
                    "{}  {:>12.0}  {:?}  {}  photos={}",
                    listing.mls_number,
                    listing.price,
                    listing.status,
                    listing.address.one_line(),
                    listing.photos.len()
                );
            }
            println!("{} listing(s) for {}", listings.len(), agent);
        }
        Commands::Report { runs } => {
            println!("{}", mls_sync::report_recent_markdown(runs, None)?);
        }
        Commands::Schedule => {
            let config = ImportConfig::from_env();
            let Some(mut sched) = mls_sync::maybe_build_scheduler(&config).await? else {
                eprintln!("scheduler disabled; set MLS_SCHEDULER_ENABLED=true");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %config.sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
