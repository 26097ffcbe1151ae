use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "prism")]
#[command(about = "Prism CLI - collection provisioning tools")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a collection on a simulated in-process cluster
    CreateCollection {
        /// Command parameters as key=value (name=foo, numShards=2, collection.owner=x, ...)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Number of live nodes
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Spread nodes across this many zones (0 for none)
        #[arg(long, default_value = "0")]
        zones: usize,

        /// Config sets to upload before creating (comma-separated)
        #[arg(long, value_delimiter = ',', default_value = "_default")]
        config_sets: Vec<String>,

        /// Provisioning config file (TOML)
        #[arg(short, long, env = "PRISM_PROVISION_CONFIG")]
        config: Option<PathBuf>,

        /// Route core-admin calls through tarpc
        #[arg(long)]
        rpc: bool,
    },

    /// Ping a core-admin server
    Ping {
        /// Server address
        #[arg(short, long)]
        addr: SocketAddr,

        /// Request timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,prism_provision=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CreateCollection {
            params,
            nodes,
            zones,
            config_sets,
            config,
            rpc,
        } => {
            tracing::info!("Creating collection on {} simulated nodes", nodes);
            commands::run_create(commands::CreateOptions {
                params: &params,
                nodes,
                zones,
                config_sets: &config_sets,
                config_file: config.as_deref(),
                rpc,
            })
            .await?;
        }
        Commands::Ping { addr, timeout_ms } => {
            commands::run_ping(addr, Duration::from_millis(timeout_ms)).await?;
        }
    }

    Ok(())
}
