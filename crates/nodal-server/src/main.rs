use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nodal_server::{ServerConfig, server};

#[derive(Parser, Debug)]
#[command(author, version, about = "Node graph code execution server")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/nodal/config.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Address to listen on, overriding the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// Root directory for per-user storage, overriding the config file.
    #[arg(long)]
    storage_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nodal_server=info,libnodal=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(storage_dir) = cli.storage_dir {
        config.storage_dir = storage_dir;
    }

    server::run(config).await
}
