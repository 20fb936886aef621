use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tdp_core::{SchemaFamily, TableRef};
use tdp_loader::{
    connect_store, load_batch_file, AppendLoader, LoaderConfig, TableProvisioner,
    UpsertOrchestrator, UpsertOutcome,
};
use tdp_storage::{create_table_sql, MergePlan};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tdp-cli")]
#[command(about = "Travel data platform loader")]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// YAML file overriding the TDP_* environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Destination as container.dataset.table.
    #[arg(long, global = true)]
    table: Option<String>,
    #[arg(long, global = true)]
    family: Option<SchemaFamily>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge a batch file into the destination by natural key.
    Upsert {
        #[arg(long)]
        file: PathBuf,
    },
    /// Append a batch file to the destination as-is.
    Append {
        #[arg(long)]
        file: PathBuf,
    },
    /// Create the destination dataset and table if missing.
    Provision,
    /// Print the DDL and merge statement for the destination.
    Plan,
}

fn resolve_config(target: &TargetArgs) -> Result<LoaderConfig> {
    let mut config = LoaderConfig::from_env()?;
    if let Some(path) = &target.config {
        config = config.apply_yaml_file(path)?;
    }
    if let Some(family) = target.family {
        config.schema_family = family;
        config.custom_schema = None;
    }
    if let Some(raw) = &target.table {
        let table = TableRef::parse(raw).with_context(|| format!("parsing --table {raw}"))?;
        config.project_id = table.container;
        config.dataset_id = table.dataset;
        config.table_id = table.table;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli.target)?;
    let destination = config.destination()?;

    match cli.command {
        Commands::Upsert { file } => {
            let store = connect_store(&config).await?;
            let loader = UpsertOrchestrator::from_config(store, &config)?;
            let batch = load_batch_file(&file, Arc::clone(loader.schema())).await?;
            let deadline = config.options().default_deadline();
            match loader.try_upsert(&batch, deadline).await {
                Ok(UpsertOutcome::EmptyBatch) => {
                    println!("no records in {}; nothing to upsert", file.display());
                }
                Ok(UpsertOutcome::Merged(report)) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                Err(err) => bail!("upsert into {destination} failed in {} phase: {err}", err.phase()),
            }
        }
        Commands::Append { file } => {
            let store = connect_store(&config).await?;
            let loader = AppendLoader::from_config(store, &config)?;
            let batch = load_batch_file(&file, Arc::clone(loader.schema())).await?;
            let rows = loader
                .try_append(&batch, config.options().default_deadline())
                .await
                .with_context(|| format!("appending {} into {destination}", file.display()))?;
            println!("append complete: destination={destination} rows={rows}");
        }
        Commands::Provision => {
            let store = connect_store(&config).await?;
            let provisioner = TableProvisioner::new(store, config.location.clone());
            provisioner
                .ensure(&destination, &config.schema(), config.options().default_deadline())
                .await?;
            info!(%destination, "destination ready");
            println!("provisioned {destination}");
        }
        Commands::Plan => {
            let schema = config.schema();
            let staging = config.staging_naming.staging_table(&destination)?;
            println!("{};", create_table_sql(&destination, &schema));
            println!();
            println!(
                "{};",
                MergePlan::for_schema(destination.clone(), staging, &schema).to_postgres_sql()
            );
        }
    }

    Ok(())
}
