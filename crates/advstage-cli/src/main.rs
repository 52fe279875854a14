use std::path::PathBuf;
use std::sync::Arc;

use advstage_core::RunReport;
use advstage_storage::{MemoryStagingStore, PgStagingStore};
use advstage_sync::{StagingConfig, StagingPipeline, VendorRegistry};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "advstage")]
#[command(about = "Stage vendor security advisories for downstream normalization")]
struct Cli {
    /// Vendor registry file; overrides ADVSTAGE_REGISTRY.
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the named vendors, or every enabled vendor.
    Run {
        #[arg(long = "vendor", value_name = "NAME")]
        vendors: Vec<String>,
        /// Stage into an in-memory table instead of Postgres.
        #[arg(long)]
        dry_run: bool,
        /// Print the run reports as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List registered vendors.
    Vendors,
    /// Create the staging table.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "advstage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = StagingConfig::from_env();
    if let Some(registry) = cli.registry {
        config.registry_path = registry;
    }

    let command = cli.command.unwrap_or(Commands::Run {
        vendors: Vec::new(),
        dry_run: false,
        json: false,
    });
    match command {
        Commands::Run {
            vendors,
            dry_run,
            json,
        } => {
            let reports = run(config, &vendors, dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for report in &reports {
                    println!("{}", report.log_line());
                }
            }
            let failed = reports.iter().filter(|r| !r.is_success()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} vendor runs did not succeed", reports.len());
            }
        }
        Commands::Vendors => {
            let registry = VendorRegistry::load(&config.registry_path).await?;
            for vendor in &registry.vendors {
                println!(
                    "{:<20} adapter={:<12} enabled={:<5} listing={:?} detail={:?} policy={:?}",
                    vendor.name,
                    vendor.adapter.as_str(),
                    vendor.enabled,
                    vendor.listing_strategy,
                    vendor.detail_strategy,
                    vendor.write_policy
                );
            }
        }
        Commands::Migrate => {
            let store = postgres_store(&config)?;
            store.migrate().await?;
            store.close().await;
            println!("staging table ready: {}", store.table());
        }
    }

    Ok(())
}

async fn run(config: StagingConfig, vendors: &[String], dry_run: bool) -> Result<Vec<RunReport>> {
    let registry = VendorRegistry::load(&config.registry_path).await?;
    let sources = registry.select(vendors)?;
    let cancel = shutdown_token();

    if dry_run {
        let store = Arc::new(MemoryStagingStore::new());
        let pipeline = StagingPipeline::new(config, store.clone())?;
        let reports = pipeline.run_all(&sources, &cancel).await;
        tracing::info!(rows = store.len().await, "dry run finished");
        return Ok(reports);
    }

    let store = Arc::new(postgres_store(&config)?);
    let pipeline = StagingPipeline::new(config, store.clone())?;
    let reports = pipeline.run_all(&sources, &cancel).await;
    store.close().await;
    Ok(reports)
}

fn postgres_store(config: &StagingConfig) -> Result<PgStagingStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    PgStagingStore::connect_lazy(url, &config.staging_table)
}

/// Cancelled on the first Ctrl-C; in-flight documents drain, nothing more
/// is dispatched and the current vendor run is reported aborted.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing in-flight documents");
            token.cancel();
        }
    });
    cancel
}
