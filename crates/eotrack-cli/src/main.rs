use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use eotrack_sync::SyncConfig;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "eotrack")]
#[command(about = "Track newly published executive orders")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the listing once and persist any new orders.
    Sync {
        #[arg(long)]
        listing_url: Option<String>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Show row counts and the latest stored orders.
    Status {
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        recent: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        listing_url: None,
        output_dir: None,
    }) {
        Commands::Sync {
            listing_url,
            output_dir,
        } => {
            if let Some(url) = listing_url {
                config.listing_url = url;
            }
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            let summary = eotrack_sync::run_sync_once(&config).await?;
            println!(
                "sync complete: run_id={} candidates={} new_orders={} analyses={} posts={} content_skipped={} enrichment_failures={}",
                summary.run_id,
                summary.candidates,
                summary.new_orders,
                summary.analyses,
                summary.posts,
                summary.content_skipped,
                summary.enrichment_failures
            );
        }
        Commands::Status { output_dir, recent } => {
            if let Some(dir) = output_dir {
                config.output_dir = dir;
            }
            let overview = eotrack_sync::table_overview(&config, recent).await?;
            println!(
                "orders={} analyses={} posts={} ({})",
                overview.orders,
                overview.analyses,
                overview.posts,
                config.output_dir.display()
            );
            for order in &overview.latest_orders {
                println!("{}  {}  {}", order.id, order.date, order.title);
            }
        }
    }

    Ok(())
}
