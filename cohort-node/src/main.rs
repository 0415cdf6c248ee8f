use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use cohort::{
    describe_local_node, AddressResolver, Cluster, ClusterConfig, FileTransferService,
    LocalFabric, TransferLink,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "cohort-node")]
#[command(about = "Cohort cluster node")]
#[command(version)]
struct Cli {
    /// Configuration file path, created with defaults when missing
    #[arg(short, long, default_value = "cohort.toml", global = true)]
    config: PathBuf,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true)]
    metrics_addr: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a single-node cluster, stage a file and print its link
    Serve {
        /// File to stage for one fetch
        file: PathBuf,
    },

    /// Fetch a file from a transfer link
    Fetch {
        /// Link printed by `serve`, host:port/handle
        link: String,

        /// Where to put the file (defaults to a temp file)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the resolved node identity and configuration as JSON
    Info,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,cohort=debug".into()),
    );
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn init_metrics(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    tracing::info!("Metrics listening on {}", addr);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Some(addr) = cli.metrics_addr {
        init_metrics(addr)?;
    }

    let config = ClusterConfig::load_or_create(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve { file } => serve(config, &file).await,
        Commands::Fetch { link, output } => fetch(config, &link, output.as_deref()).await,
        Commands::Info => info(&config),
    }
}

async fn serve(config: ClusterConfig, file: &Path) -> Result<()> {
    let fabric = LocalFabric::new();
    let cluster = Cluster::start_local(&fabric, config).await?;

    let link = cluster.transfers().add_transfer_file(file).await?;
    tracing::info!(file = %file.display(), "Staged file");
    println!("{}", link);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    cluster.close().await?;
    Ok(())
}

async fn fetch(config: ClusterConfig, link: &str, output: Option<&Path>) -> Result<()> {
    let link: TransferLink = link.parse()?;
    let resolver = AddressResolver::new(&config.address_resolver);
    let transfers =
        FileTransferService::start(&config.transfer, &config.tls, &resolver, &config.bind_host)
            .await?;

    let fetched = transfers.get_transfer_file(&link).await;
    transfers.close().await;
    let received = fetched?;

    let path = match output {
        Some(output) => {
            if tokio::fs::rename(&received, output).await.is_err() {
                // Different filesystem
                tokio::fs::copy(&received, output).await?;
                tokio::fs::remove_file(&received).await?;
            }
            output.to_path_buf()
        }
        None => received,
    };
    println!("{}", path.display());
    Ok(())
}

fn info(config: &ClusterConfig) -> Result<()> {
    let node = describe_local_node(config);
    let report = serde_json::json!({
        "node": node,
        "cache_mode": config.cache_mode(),
        "backups": config.backups(),
        "discovery": config.discovery.mode_name(),
        "config": config,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
