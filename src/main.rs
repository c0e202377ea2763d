use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use sspool::app::{App, AppConfig};

#[derive(Parser)]
#[command(
    name = "sspool",
    version,
    about = "Multi-tenant shadowsocks AEAD proxy server"
)]
struct Cli {
    /// Control API listen address
    #[arg(long, default_value = "127.0.0.1:50899")]
    rpc_listen: String,

    /// User store path (JSON document)
    #[arg(long, default_value = "users.json")]
    store: PathBuf,

    /// Redirect address for blocked sessions, e.g. "203.0.113.9:80"
    #[arg(long)]
    hijack: Option<String>,

    /// Additional blocklist source URL (repeatable)
    #[arg(long = "filter-url")]
    filter_urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("sspool starting");

    let app = App::new(AppConfig {
        rpc_listen: cli.rpc_listen,
        store_path: cli.store,
        hijack: cli.hijack,
        filter_urls: cli.filter_urls,
    })?;
    app.run().await
}
