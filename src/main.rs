use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod config;
mod datasets;
mod error;
mod freshness;
mod ingestion;
mod output;
mod pipeline;
mod telemetry;
mod util;
mod warehouse;

use config::PipelineConfig;
use ingestion::fetch::{ApiClient, ReqwestTransport, Transport};
use warehouse::postgres::PgWarehouse;
use warehouse::Warehouse;

#[derive(Parser)]
#[command(name = "ingest", about = "Incremental BMRS dataset ingestion into a Postgres warehouse")]
struct Cli {
    #[arg(global = true, short, long)]
    dsn: Option<String>,
    /// Pipeline config (JSON); the built-in dataset catalog is used when absent
    #[arg(global = true, long, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,
    /// Emit a single JSON envelope to stdout; logs go to stderr
    #[arg(global = true, long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured datasets
    Datasets(datasets::DatasetsCmd),
    /// Find missing windows and (with --apply) fetch and load them
    Backfill(pipeline::BackfillCmd),
    /// Report how current each dataset's table is
    Freshness(freshness::FreshnessCmd),
}

const MAX_DB_CONNECTIONS: u32 = 8;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    telemetry::config::set_json_mode(cli.json);

    // stderr logging; respects RUST_LOG and INGEST_LOG_FORMAT
    telemetry::config::init_tracing();

    let cfg = PipelineConfig::load(cli.config.as_deref()).context("load pipeline config")?;

    match cli.command {
        Commands::Datasets(args) => datasets::run(&cfg, args)?,
        Commands::Backfill(args) => {
            let pg = connect(cli.dsn, &cfg).await?;
            pg.ensure_dataset(&cfg.warehouse.dataset).await.context("create warehouse dataset schema")?;
            let warehouse: Arc<dyn Warehouse> = Arc::new(pg);
            let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(cfg.api.timeout()).context("build HTTP client")?);
            let client = Arc::new(ApiClient::new(transport, &cfg.api, &cfg.datasets));

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight windows");
                    on_signal.cancel();
                }
            });
            pipeline::run(&cfg, warehouse, client, args, cancel).await?
        }
        Commands::Freshness(args) => {
            let warehouse: Arc<dyn Warehouse> = Arc::new(connect(cli.dsn, &cfg).await?);
            freshness::run(&cfg, warehouse, args).await?
        }
    }

    Ok(())
}

async fn connect(dsn: Option<String>, cfg: &PipelineConfig) -> Result<PgWarehouse> {
    let dsn = dsn
        .or_else(|| env::var("DATABASE_URL").ok())
        .context("provide --dsn or set DATABASE_URL in .env")?;
    let pool = PgPoolOptions::new()
        .max_connections(MAX_DB_CONNECTIONS.max(cfg.workers as u32 + 1))
        .connect(&dsn)
        .await
        .context("connect to warehouse")?;
    Ok(PgWarehouse::new(pool))
}
