use anyhow::Context;
use clap::{Parser, Subcommand};
use distributed_tables::clock::SystemClock;
use distributed_tables::cluster::{self, Cluster, ClusterRegistry};
use distributed_tables::config::NodeConfig;
use distributed_tables::value::Document;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "dtables-node")]
#[command(about = "Replicated table store node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured tables and replicate them with the cluster
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "node.toml")]
        config: PathBuf,
    },
    /// Write an incremental backup of every configured table and exit
    Backup {
        #[arg(short, long, default_value = "node.toml")]
        config: PathBuf,

        /// Backup root; defaults to `backup_dir` from the config
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Restore the tables from a backup while the node is stopped
    Restore {
        #[arg(short, long, default_value = "node.toml")]
        config: PathBuf,

        /// Backup root; defaults to `backup_dir` from the config
        #[arg(long)]
        source: Option<PathBuf>,

        /// Increment to restore; the latest one when absent
        #[arg(long)]
        increment: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "distributed_tables=info,dtables_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config } => serve(&config).await,
        Commands::Backup { config, target } => {
            let config = NodeConfig::from_file(&config)?;
            let root = backup_root(&config, target)?;
            let registry = open_offline(&config)?;
            let report = registry.backup_all(&root).await?;
            tracing::info!(
                "Backup {} complete: {} entries, {} copied, {} files copied",
                report.increment,
                report.entries_total,
                report.entries_copied,
                report.files_copied
            );
            Ok(())
        }
        Commands::Restore {
            config,
            source,
            increment,
        } => {
            let config = NodeConfig::from_file(&config)?;
            let root = backup_root(&config, source)?;
            let registry = open_offline(&config)?;
            let report = registry.restore_all(&root, increment.as_deref()).await?;
            tracing::info!(
                "Restored increment {}: {} entries restored, {} unchanged, {} removed, {} files restored, {} files removed",
                report.increment,
                report.entries_restored,
                report.entries_unchanged,
                report.entries_removed,
                report.files_restored,
                report.files_removed
            );
            Ok(())
        }
    }
}

fn backup_root(config: &NodeConfig, explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    explicit
        .or_else(|| config.backup_dir.clone())
        .context("No backup directory: pass one or set `backup_dir`")
}

fn open_tables(registry: &ClusterRegistry, config: &NodeConfig) -> anyhow::Result<()> {
    for table in &config.tables {
        let opened = registry.open_table::<Document>(&table.name, table.min_version)?;
        tracing::info!("Table {} loaded with {} entries", table.name, opened.len());
    }
    Ok(())
}

/// Tables without any peer traffic, for backup and restore runs.
fn open_offline(config: &NodeConfig) -> anyhow::Result<Arc<ClusterRegistry>> {
    let registry = ClusterRegistry::new(Cluster::standalone(), &config.data_dir);
    open_tables(&registry, config)?;
    Ok(registry)
}

async fn serve(path: &Path) -> anyhow::Result<()> {
    let config = NodeConfig::from_file(path)?;
    tracing::info!("Starting node {} with data in {}", config.self_host, config.data_dir.display());

    // 1. Cluster context and tables:
    let cluster = Cluster::new(
        config.cluster_settings()?,
        config.node_descriptors()?,
        Arc::new(SystemClock),
    )?;
    let registry = ClusterRegistry::new(cluster, &config.data_dir);
    open_tables(&registry, &config)?;

    // 2. HTTP server, which has to answer `/node-id` before `mark_self`:
    let app = cluster::router(registry.clone());
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);

    let shutdown_registry = registry.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl+C: {}", e);
                }
                tracing::info!("Shutting down");
                shutdown_registry.shutdown().await;
            })
            .await
    });

    // 3. Self identification, liveness monitors, maintenance:
    registry.mark_self().await;
    registry.start_monitors();
    registry.spawn_maintenance(config.maintenance_interval(), config.backup_dir.clone());

    tracing::info!("Press Ctrl+C to shutdown");
    server.await??;
    Ok(())
}
